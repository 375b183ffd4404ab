//! Case-insensitive name search over the working tree.

use crate::error::AgentError;
use crate::files::EntryKind;
use crate::sandbox::PathSandbox;
use serde::Serialize;
use std::path::Path;

pub const DEFAULT_MAX_DEPTH: usize = 5;
pub const DEFAULT_MAX_RESULTS: usize = 200;

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub path: Option<String>,
    pub max_depth: usize,
    pub max_results: usize,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            path: None,
            max_depth: DEFAULT_MAX_DEPTH,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
}

/// Directories matched by name but never descended into.
fn is_opaque_dir(name: &str) -> bool {
    name.starts_with('.') || name == "node_modules"
}

pub async fn search(
    sandbox: &PathSandbox,
    query: SearchQuery,
) -> Result<Vec<SearchHit>, AgentError> {
    let needle = query.query.trim().to_lowercase();
    if needle.is_empty() {
        return Err(AgentError::InvalidRequest("search query is empty".to_string()));
    }
    let start = sandbox.resolve_or_root(query.path.as_deref())?;
    let is_dir = tokio::fs::metadata(&start)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(AgentError::NotFound(format!(
            "{} is not a directory",
            query.path.as_deref().unwrap_or(".")
        )));
    }

    let sandbox = sandbox.clone();
    tokio::task::spawn_blocking(move || {
        let mut hits = Vec::new();
        walk(&sandbox, &start, 0, &needle, &query, &mut hits);
        hits
    })
    .await
    .map_err(|e| AgentError::Internal(e.to_string()))
}

/// List the children of `dir` (which sit at `depth + 1`) and recurse.
/// Symlinked directories are reported but not followed.
fn walk(
    sandbox: &PathSandbox,
    dir: &Path,
    depth: usize,
    needle: &str,
    query: &SearchQuery,
    hits: &mut Vec<SearchHit>,
) {
    if depth >= query.max_depth {
        return;
    }
    let Ok(read) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = read.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if hits.len() >= query.max_results {
            return;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        if name.to_lowercase().contains(needle) {
            hits.push(SearchHit {
                name: name.clone(),
                path: sandbox.relative(&path),
                kind: EntryKind::of(file_type),
            });
        }
        if file_type.is_dir() && !is_opaque_dir(&name) {
            walk(sandbox, &path, depth + 1, needle, query, hits);
        }
    }
}
