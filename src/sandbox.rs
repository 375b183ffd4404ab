//! Path confinement for every filesystem-touching operation.
//!
//! All client-supplied paths go through [`PathSandbox::resolve`], which joins
//! them onto the working root, follows symbolic links, and rejects anything
//! that lands outside the root. Nothing else in the crate derives filesystem
//! paths from request data.

use crate::error::AgentError;
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Upper bound on symlink hops while resolving a single path.
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: Arc<Path>,
}

impl PathSandbox {
    /// Create a sandbox rooted at `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, AgentError> {
        let root = root.as_ref();
        let canonical = root
            .canonicalize()
            .map_err(|e| AgentError::io(root.display(), e))?;
        if !canonical.is_dir() {
            return Err(AgentError::InvalidPath(format!(
                "working root {} is not a directory",
                canonical.display()
            )));
        }
        Ok(Self {
            root: canonical.into(),
        })
    }

    /// The canonical working root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `candidate` against the root.
    ///
    /// The result is absolute, has every existing component canonicalized
    /// (symlinks followed), and always has the root as a prefix.
    pub fn resolve(&self, candidate: &str) -> Result<PathBuf, AgentError> {
        if candidate.trim().is_empty() {
            return Err(AgentError::InvalidPath("path is required".to_string()));
        }

        let joined = normalize(&self.root.join(candidate));
        let resolved = canonicalize_lenient(&joined).map_err(|e| {
            AgentError::InvalidPath(format!("{candidate}: {e}"))
        })?;

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(AgentError::InvalidPath(format!(
                "{candidate} resolves outside the working directory"
            )))
        }
    }

    /// Resolve `candidate` without following its final component.
    ///
    /// The parent is resolved like [`resolve`](Self::resolve) and must lie
    /// inside the root; the last name is kept as written, so a symlink names
    /// the link itself rather than its target.
    pub fn resolve_entry(&self, candidate: &str) -> Result<PathBuf, AgentError> {
        if candidate.trim().is_empty() {
            return Err(AgentError::InvalidPath("path is required".to_string()));
        }

        let joined = normalize(&self.root.join(candidate));
        if joined == *self.root {
            return Ok(joined);
        }
        let (Some(parent), Some(name)) = (joined.parent(), joined.file_name()) else {
            return Err(AgentError::InvalidPath(format!(
                "{candidate} resolves outside the working directory"
            )));
        };
        let parent = canonicalize_lenient(parent).map_err(|e| {
            AgentError::InvalidPath(format!("{candidate}: {e}"))
        })?;

        if parent.starts_with(&self.root) {
            Ok(parent.join(name))
        } else {
            Err(AgentError::InvalidPath(format!(
                "{candidate} resolves outside the working directory"
            )))
        }
    }

    /// Resolve an optional path, treating `None` as the root itself.
    pub fn resolve_or_root(&self, candidate: Option<&str>) -> Result<PathBuf, AgentError> {
        match candidate {
            Some(path) => self.resolve(path),
            None => Ok(self.root.to_path_buf()),
        }
    }

    /// Render a resolved path relative to the root, using `/` separators.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let rendered = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rendered.is_empty() {
            ".".to_string()
        } else {
            rendered
        }
    }

    pub fn is_root(&self, path: &Path) -> bool {
        path == &*self.root
    }
}

/// Lexically collapse `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Canonicalize the longest existing prefix of `path` and re-append the
/// missing tail. Dangling symlinks are followed to their target.
fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let mut current = path.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();
    let mut hops = 0;

    loop {
        match current.canonicalize() {
            Ok(mut base) => {
                for part in tail.iter().rev() {
                    base.push(part);
                }
                return Ok(base);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let is_link = current
                    .symlink_metadata()
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false);
                if is_link {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(io::Error::other("too many levels of symbolic links"));
                    }
                    let target = current.read_link()?;
                    let parent = current.parent().map(Path::to_path_buf).unwrap_or_default();
                    current = normalize(&parent.join(target));
                    continue;
                }
                match current.file_name() {
                    Some(name) => {
                        tail.push(name.to_os_string());
                        current.pop();
                    }
                    None => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
}
