//! Sandboxed file operations.
//!
//! Every entry point resolves its paths through [`PathSandbox`] before any
//! filesystem call. Blocking tree walks run on the blocking pool.

use crate::error::AgentError;
use crate::sandbox::PathSandbox;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

/// Directories never reported by listings.
pub const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl EntryKind {
    pub(crate) fn of(file_type: fs::FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_ms: Option<u64>,
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub encoding: Encoding,
    pub size: u64,
    pub modified_ms: Option<u64>,
}

/// One item of a batch read; failures are reported per item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    #[serde(flatten)]
    pub info: FileInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub recursive: bool,
    pub include_content: bool,
}

#[derive(Debug, Clone)]
pub struct FileService {
    sandbox: PathSandbox,
    max_file_size: u64,
    allowed_extensions: Option<Arc<[String]>>,
}

impl FileService {
    pub fn new(
        sandbox: PathSandbox,
        max_file_size: u64,
        allowed_extensions: Option<Vec<String>>,
    ) -> Self {
        Self {
            sandbox,
            max_file_size,
            allowed_extensions: allowed_extensions.map(Arc::from),
        }
    }

    pub fn sandbox(&self) -> &PathSandbox {
        &self.sandbox
    }

    pub async fn read(&self, path: &str, encoding: Encoding) -> Result<FileContent, AgentError> {
        let full = self.sandbox.resolve(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| AgentError::io(path, e))?;
        if meta.is_dir() {
            return Err(AgentError::Conflict(format!("{path} is a directory")));
        }
        self.check_size(meta.len())?;

        let bytes = tokio::fs::read(&full)
            .await
            .map_err(|e| AgentError::io(path, e))?;
        Ok(FileContent {
            path: self.sandbox.relative(&full),
            content: encode(path, bytes, encoding)?,
            encoding,
            size: meta.len(),
            modified_ms: modified_ms(&meta),
        })
    }

    pub async fn read_batch(&self, paths: &[String]) -> Vec<BatchItem> {
        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let item = match self.read(path, Encoding::Utf8).await {
                Ok(file) => BatchItem {
                    path: path.clone(),
                    success: true,
                    content: Some(file.content),
                    size: Some(file.size),
                    error: None,
                },
                Err(err) => BatchItem {
                    path: path.clone(),
                    success: false,
                    content: None,
                    size: None,
                    error: Some(err.to_string()),
                },
            };
            items.push(item);
        }
        items
    }

    /// Create or replace a file. Returns the number of bytes written.
    pub async fn write(
        &self,
        path: &str,
        content: &str,
        encoding: Encoding,
        create_dirs: bool,
    ) -> Result<u64, AgentError> {
        let full = self.sandbox.resolve(path)?;
        self.check_extension(&full)?;
        let bytes = decode(content, encoding)?;
        self.check_size(bytes.len() as u64)?;

        if is_dir(&full).await {
            return Err(AgentError::Conflict(format!("{path} is a directory")));
        }
        if let Some(parent) = full.parent() {
            if create_dirs {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AgentError::io(path, e))?;
            } else if !is_dir(parent).await {
                return Err(AgentError::NotFound(format!(
                    "parent directory of {path} does not exist"
                )));
            }
        }

        tokio::fs::write(&full, &bytes)
            .await
            .map_err(|e| AgentError::io(path, e))?;
        info!(path = %self.sandbox.relative(&full), bytes = bytes.len(), "wrote file");
        Ok(bytes.len() as u64)
    }

    /// Replace the content of an existing file.
    pub async fn update(
        &self,
        path: &str,
        content: &str,
        encoding: Encoding,
    ) -> Result<u64, AgentError> {
        let full = self.sandbox.resolve(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(AgentError::Conflict(format!("{path} is not a file"))),
            Err(e) => return Err(AgentError::io(path, e)),
        }
        self.write(path, content, encoding, false).await
    }

    /// Remove a file, link or directory. A symlink is removed itself, never
    /// its target.
    pub async fn delete(&self, path: &str, recursive: bool) -> Result<(), AgentError> {
        let full = self.sandbox.resolve_entry(path)?;
        if self.sandbox.is_root(&full) {
            return Err(AgentError::InvalidPath(
                "the working directory itself cannot be deleted".to_string(),
            ));
        }
        let meta = tokio::fs::symlink_metadata(&full)
            .await
            .map_err(|e| AgentError::io(path, e))?;

        let removed = if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&full).await
            } else {
                let mut entries = tokio::fs::read_dir(&full)
                    .await
                    .map_err(|e| AgentError::io(path, e))?;
                let non_empty = entries
                    .next_entry()
                    .await
                    .map_err(|e| AgentError::io(path, e))?
                    .is_some();
                if non_empty {
                    return Err(AgentError::Conflict(format!(
                        "{path} is not empty; set recursive to delete it"
                    )));
                }
                tokio::fs::remove_dir(&full).await
            }
        } else {
            tokio::fs::remove_file(&full).await
        };
        removed.map_err(|e| AgentError::io(path, e))?;

        info!(path = %self.sandbox.relative(&full), recursive, "deleted");
        Ok(())
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo, AgentError> {
        let full = self.sandbox.resolve(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| AgentError::io(path, e))?;
        Ok(self.info(&full, &meta))
    }

    pub async fn exists(&self, path: &str) -> Result<bool, AgentError> {
        let full = self.sandbox.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await.unwrap_or(false))
    }

    pub async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), AgentError> {
        let full = self.sandbox.resolve(path)?;
        let is_file = tokio::fs::metadata(&full)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if is_file {
            return Err(AgentError::Conflict(format!("{path} is a file")));
        }
        let created = if recursive {
            tokio::fs::create_dir_all(&full).await
        } else {
            tokio::fs::create_dir(&full).await
        };
        created.map_err(|e| AgentError::io(path, e))
    }

    pub async fn list(
        &self,
        path: Option<&str>,
        options: ListOptions,
    ) -> Result<Vec<ListEntry>, AgentError> {
        let full = self.sandbox.resolve_or_root(path)?;
        let label = path.unwrap_or(".").to_string();
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| AgentError::io(&label, e))?;
        if !meta.is_dir() {
            return Err(AgentError::Conflict(format!("{label} is not a directory")));
        }

        let service = self.clone();
        tokio::task::spawn_blocking(move || service.walk(&full, options))
            .await
            .map_err(|e| AgentError::Internal(e.to_string()))?
    }

    pub async fn copy(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<(), AgentError> {
        let (from, to) = self.transfer_paths(source, destination, overwrite).await?;
        let label = source.to_string();
        tokio::task::spawn_blocking(move || copy_recursive(&from, &to))
            .await
            .map_err(|e| AgentError::Internal(e.to_string()))?
            .map_err(|e| AgentError::io(label, e))?;
        info!(source, destination, "copied");
        Ok(())
    }

    pub async fn rename(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<(), AgentError> {
        let (from, to) = self.transfer_paths(source, destination, overwrite).await?;
        if self.sandbox.is_root(&from) {
            return Err(AgentError::InvalidPath(
                "the working directory itself cannot be moved".to_string(),
            ));
        }
        if overwrite && is_real_dir(&to).await {
            tokio::fs::remove_dir_all(&to)
                .await
                .map_err(|e| AgentError::io(destination, e))?;
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| AgentError::io(source, e))?;
        info!(source, destination, "moved");
        Ok(())
    }

    /// Validate both ends of a copy or move and prepare the destination parent.
    ///
    /// Neither end follows a trailing symlink: moving or copying a link acts
    /// on the link.
    async fn transfer_paths(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<(PathBuf, PathBuf), AgentError> {
        let from = self.sandbox.resolve_entry(source)?;
        let to = self.sandbox.resolve_entry(destination)?;
        let meta = tokio::fs::symlink_metadata(&from)
            .await
            .map_err(|e| AgentError::io(source, e))?;
        if !meta.is_dir() {
            self.check_extension(&to)?;
        }
        if to.starts_with(&from) && meta.is_dir() {
            return Err(AgentError::InvalidRequest(format!(
                "cannot place {source} inside itself"
            )));
        }
        if tokio::fs::symlink_metadata(&to).await.is_ok() && !overwrite {
            return Err(AgentError::Conflict(format!(
                "{destination} already exists; set overwrite to replace it"
            )));
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::io(destination, e))?;
        }
        Ok((from, to))
    }

    fn walk(&self, dir: &Path, options: ListOptions) -> Result<Vec<ListEntry>, AgentError> {
        let mut builder = ignore::WalkBuilder::new(dir);
        builder
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .parents(true)
            .follow_links(false)
            .max_depth(if options.recursive { None } else { Some(1) })
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(|entry| {
                !(entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                    && EXCLUDED_DIRS.iter().any(|d| entry.file_name() == *d))
            });

        let mut entries = Vec::new();
        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let meta = match entry.path().symlink_metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let info = self.info(entry.path(), &meta);
            let content = if options.include_content
                && info.kind == EntryKind::File
                && info.size <= self.max_file_size
            {
                fs::read(entry.path())
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            } else {
                None
            };
            entries.push(ListEntry { info, content });
        }
        Ok(entries)
    }

    fn info(&self, path: &Path, meta: &fs::Metadata) -> FileInfo {
        FileInfo {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| ".".to_string()),
            path: self.sandbox.relative(path),
            kind: EntryKind::of(meta.file_type()),
            size: meta.len(),
            modified_ms: modified_ms(meta),
            readonly: meta.permissions().readonly(),
        }
    }

    fn check_size(&self, size: u64) -> Result<(), AgentError> {
        if size > self.max_file_size {
            return Err(AgentError::PayloadTooLarge {
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }

    fn check_extension(&self, path: &Path) -> Result<(), AgentError> {
        let Some(allowed) = &self.allowed_extensions else {
            return Ok(());
        };
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if allowed.iter().any(|a| *a == extension) {
            Ok(())
        } else {
            Err(AgentError::Forbidden(format!(
                "writing files with extension {:?} is not allowed",
                extension
            )))
        }
    }
}

fn encode(path: &str, bytes: Vec<u8>, encoding: Encoding) -> Result<String, AgentError> {
    match encoding {
        Encoding::Base64 => Ok(BASE64.encode(bytes)),
        Encoding::Utf8 => String::from_utf8(bytes).map_err(|_| {
            AgentError::Conflict(format!("{path} is not valid UTF-8; read it as base64"))
        }),
    }
}

fn decode(content: &str, encoding: Encoding) -> Result<Vec<u8>, AgentError> {
    match encoding {
        Encoding::Utf8 => Ok(content.as_bytes().to_vec()),
        Encoding::Base64 => BASE64
            .decode(content)
            .map_err(|e| AgentError::InvalidRequest(format!("invalid base64 content: {e}"))),
    }
}

fn modified_ms(meta: &fs::Metadata) -> Option<u64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn is_link(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// A directory that is not reached through a symlink.
async fn is_real_dir(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Copy a tree without traversing symlinks; links are recreated as links.
fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    let file_type = from.symlink_metadata()?.file_type();
    if is_link(to) {
        fs::remove_file(to)?;
    }
    if file_type.is_symlink() {
        copy_link(from, to)
    } else if file_type.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(from, to).map(|_| ())
    }
}

#[cfg(unix)]
fn copy_link(from: &Path, to: &Path) -> std::io::Result<()> {
    let target = fs::read_link(from)?;
    if to.is_file() {
        fs::remove_file(to)?;
    }
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_link(from: &Path, _to: &Path) -> std::io::Result<()> {
    debug!(path = %from.display(), "skipping symlink");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(max: u64, extensions: Option<Vec<&str>>) -> (TempDir, FileService) {
        let dir = TempDir::new().unwrap();
        let sandbox = PathSandbox::new(dir.path()).unwrap();
        let extensions = extensions.map(|list| list.into_iter().map(String::from).collect());
        (dir, FileService::new(sandbox, max, extensions))
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, files) = service(1024, None);
        let content = "fn main() {\n    println!(\"héllo\");\n}\n";
        files
            .write("src/main.rs", content, Encoding::Utf8, true)
            .await
            .unwrap();

        let read = files.read("src/main.rs", Encoding::Utf8).await.unwrap();
        assert_eq!(read.content, content);
        assert_eq!(read.path, "src/main.rs");
        assert_eq!(read.size, content.len() as u64);
    }

    #[tokio::test]
    async fn base64_round_trip_for_binary_content() {
        let (_dir, files) = service(1024, None);
        let raw = [0u8, 159, 146, 150, 255];
        let encoded = BASE64.encode(raw);
        files
            .write("blob.bin", &encoded, Encoding::Base64, false)
            .await
            .unwrap();

        assert!(matches!(
            files.read("blob.bin", Encoding::Utf8).await,
            Err(AgentError::Conflict(_))
        ));
        let read = files.read("blob.bin", Encoding::Base64).await.unwrap();
        assert_eq!(read.content, encoded);
    }

    #[tokio::test]
    async fn disallowed_extension_is_forbidden_and_creates_nothing() {
        let (dir, files) = service(1024, Some(vec!["js", "md"]));
        files
            .write("ok.JS", "x", Encoding::Utf8, false)
            .await
            .unwrap();

        let err = files
            .write("nested/evil.sh", "rm -rf /", Encoding::Utf8, true)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Forbidden(_)));
        assert!(!dir.path().join("nested/evil.sh").exists());
        assert!(!dir.path().join("nested").exists());

        assert!(matches!(
            files.write("Makefile", "all:", Encoding::Utf8, false).await,
            Err(AgentError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn write_without_parent_requires_create_dirs() {
        let (_dir, files) = service(1024, None);
        assert!(matches!(
            files.write("a/b/c.txt", "x", Encoding::Utf8, false).await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn size_ceiling_applies_to_reads_and_writes() {
        let (dir, files) = service(4, None);
        assert!(matches!(
            files.write("big.txt", "12345", Encoding::Utf8, false).await,
            Err(AgentError::PayloadTooLarge { size: 5, limit: 4 })
        ));

        fs::write(dir.path().join("big.txt"), "123456").unwrap();
        assert!(matches!(
            files.read("big.txt", Encoding::Utf8).await,
            Err(AgentError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn update_requires_existing_file() {
        let (_dir, files) = service(1024, None);
        assert!(matches!(
            files.update("missing.txt", "x", Encoding::Utf8).await,
            Err(AgentError::NotFound(_))
        ));

        files.write("here.txt", "old", Encoding::Utf8, false).await.unwrap();
        files.update("here.txt", "new", Encoding::Utf8).await.unwrap();
        assert_eq!(files.read("here.txt", Encoding::Utf8).await.unwrap().content, "new");

        files.mkdir("dir", false).await.unwrap();
        assert!(matches!(
            files.update("dir", "x", Encoding::Utf8).await,
            Err(AgentError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn delete_non_empty_directory_needs_recursive() {
        let (_dir, files) = service(1024, None);
        files
            .write("pkg/lib/mod.rs", "", Encoding::Utf8, true)
            .await
            .unwrap();

        assert!(matches!(
            files.delete("pkg", false).await,
            Err(AgentError::Conflict(_))
        ));
        assert!(files.exists("pkg").await.unwrap());

        files.delete("pkg", true).await.unwrap();
        assert!(!files.exists("pkg").await.unwrap());
    }

    #[tokio::test]
    async fn delete_refuses_root_and_missing_paths() {
        let (_dir, files) = service(1024, None);
        assert!(matches!(
            files.delete(".", true).await,
            Err(AgentError::InvalidPath(_))
        ));
        assert!(matches!(
            files.delete("nope", false).await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mkdir_over_a_file_is_a_conflict() {
        let (_dir, files) = service(1024, None);
        files.write("x.txt", "", Encoding::Utf8, false).await.unwrap();
        assert!(matches!(
            files.mkdir("x.txt", true).await,
            Err(AgentError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn reading_a_directory_is_a_conflict() {
        let (_dir, files) = service(1024, None);
        files.mkdir("d", false).await.unwrap();
        assert!(matches!(
            files.read("d", Encoding::Utf8).await,
            Err(AgentError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn batch_read_reports_failures_per_item() {
        let (_dir, files) = service(1024, None);
        files.write("a.txt", "A", Encoding::Utf8, false).await.unwrap();

        let items = files
            .read_batch(&["a.txt".into(), "missing.txt".into(), "../escape".into()])
            .await;
        assert_eq!(items.len(), 3);
        assert!(items[0].success);
        assert_eq!(items[0].content.as_deref(), Some("A"));
        assert!(!items[1].success);
        assert!(items[1].error.as_deref().unwrap().contains("not found"));
        assert!(!items[2].success);
        assert!(items[2].error.as_deref().unwrap().contains("invalid path"));
    }

    #[tokio::test]
    async fn listing_omits_infrastructure_and_ignored_entries() {
        let (dir, files) = service(1024, None);
        let root = dir.path();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::create_dir_all(root.join("node_modules/left-pad")).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("target")).unwrap();
        fs::write(root.join(".gitignore"), "target/\n*.log\n").unwrap();
        fs::write(root.join("src/lib.rs"), "pub fn f() {}").unwrap();
        fs::write(root.join("debug.log"), "noise").unwrap();
        fs::write(root.join(".env"), "A=1").unwrap();
        fs::write(root.join("node_modules/left-pad/index.js"), "").unwrap();

        let top = files.list(None, ListOptions::default()).await.unwrap();
        let names: Vec<_> = top.iter().map(|e| e.info.path.as_str()).collect();
        assert_eq!(names, vec![".env", ".gitignore", "src"]);

        let all = files
            .list(
                None,
                ListOptions {
                    recursive: true,
                    include_content: true,
                },
            )
            .await
            .unwrap();
        let lib = all.iter().find(|e| e.info.path == "src/lib.rs").unwrap();
        assert_eq!(lib.content.as_deref(), Some("pub fn f() {}"));
        assert!(all.iter().all(|e| !e.info.path.starts_with("node_modules")));
        assert!(all.iter().all(|e| !e.info.path.starts_with(".git/")));
    }

    #[tokio::test]
    async fn listing_a_file_is_a_conflict() {
        let (_dir, files) = service(1024, None);
        files.write("f.txt", "", Encoding::Utf8, false).await.unwrap();
        assert!(matches!(
            files.list(Some("f.txt"), ListOptions::default()).await,
            Err(AgentError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn copy_and_move_respect_overwrite() {
        let (_dir, files) = service(1024, None);
        files.write("a/one.txt", "1", Encoding::Utf8, true).await.unwrap();
        files.write("b.txt", "b", Encoding::Utf8, false).await.unwrap();

        files.copy("a", "copy/of/a", false).await.unwrap();
        assert_eq!(
            files.read("copy/of/a/one.txt", Encoding::Utf8).await.unwrap().content,
            "1"
        );

        assert!(matches!(
            files.rename("b.txt", "a/one.txt", false).await,
            Err(AgentError::Conflict(_))
        ));
        files.rename("b.txt", "a/one.txt", true).await.unwrap();
        assert_eq!(files.read("a/one.txt", Encoding::Utf8).await.unwrap().content, "b");
        assert!(!files.exists("b.txt").await.unwrap());

        assert!(matches!(
            files.copy("a", "a/inner", false).await,
            Err(AgentError::InvalidRequest(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copy_recreates_links_instead_of_following_them() {
        let (dir, files) = service(1024, None);
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "TOP-SECRET").unwrap();
        files.write("proj/a.txt", "A", Encoding::Utf8, true).await.unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("proj/link")).unwrap();

        files.copy("proj", "stolen", false).await.unwrap();
        assert_eq!(files.read("stolen/a.txt", Encoding::Utf8).await.unwrap().content, "A");
        let copied = dir.path().join("stolen/link").symlink_metadata().unwrap();
        assert!(copied.file_type().is_symlink());
        assert!(matches!(
            files.read("stolen/link/secret.txt", Encoding::Utf8).await,
            Err(AgentError::InvalidPath(_))
        ));

        std::os::unix::fs::symlink(outside.path(), dir.path().join("out")).unwrap();
        files.write("note.txt", "n", Encoding::Utf8, false).await.unwrap();
        files.copy("note.txt", "out", true).await.unwrap();
        assert!(!outside.path().join("note.txt").exists());
        assert!(dir.path().join("out").symlink_metadata().unwrap().is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_and_move_act_on_the_link_itself() {
        let (dir, files) = service(1024, None);
        files.write("real/keep.txt", "k", Encoding::Utf8, true).await.unwrap();
        let alias = dir.path().join("alias");
        std::os::unix::fs::symlink(dir.path().join("real"), &alias).unwrap();

        files.delete("alias", true).await.unwrap();
        assert!(alias.symlink_metadata().is_err());
        assert!(dir.path().join("real/keep.txt").exists());

        std::os::unix::fs::symlink(dir.path().join("real"), &alias).unwrap();
        files.rename("alias", "moved", false).await.unwrap();
        let moved = dir.path().join("moved").symlink_metadata().unwrap();
        assert!(moved.file_type().is_symlink());
        assert!(alias.symlink_metadata().is_err());
        assert!(dir.path().join("real/keep.txt").exists());
    }

    #[tokio::test]
    async fn stat_reports_kind_and_size() {
        let (_dir, files) = service(1024, None);
        files.write("x.txt", "hello", Encoding::Utf8, false).await.unwrap();
        let info = files.stat("x.txt").await.unwrap();
        assert_eq!(info.kind, EntryKind::File);
        assert_eq!(info.size, 5);
        assert_eq!(info.name, "x.txt");
        assert!(info.modified_ms.is_some());

        let root = files.stat(".").await.unwrap();
        assert_eq!(root.kind, EntryKind::Directory);
        assert_eq!(root.path, ".");
    }
}
