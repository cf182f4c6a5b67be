//! The file-graph collaborator the engine reads from and fixes write to.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ignore::WalkBuilder;
use triage_types::SnapshotVersion;

/// A file's content and the hash it is versioned by.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub content: Arc<str>,
    pub version: SnapshotVersion,
}

impl FileContent {
    pub fn new(content: impl Into<Arc<str>>) -> Self {
        let content = content.into();
        Self {
            version: SnapshotVersion::of(&content),
            content,
        }
    }
}

/// Read/write access to the files under analysis. Paths are workspace-relative.
pub trait Workspace: Send + Sync {
    fn root(&self) -> &Path;

    fn list_files(&self) -> io::Result<Vec<PathBuf>>;

    fn read_file(&self, path: &Path) -> io::Result<FileContent>;

    fn write_file(&self, path: &Path, content: &str) -> io::Result<()>;
}

/// Reject absolute paths and `..` so every access stays under the root.
fn checked_relative(path: &Path) -> io::Result<&Path> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.as_os_str().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path escapes workspace: {}", path.display()),
        ));
    }
    Ok(path)
}

/// The real filesystem, walked with `.gitignore` rules applied.
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
}

impl FsWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Workspace for FsWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list_files(&self) -> io::Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("workspace root {} is not a directory", self.root.display()),
            ));
        }
        let mut files = Vec::new();
        for entry in WalkBuilder::new(&self.root).build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable workspace entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                files.push(relative.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_file(&self, path: &Path) -> io::Result<FileContent> {
        let path = checked_relative(path)?;
        let content = std::fs::read_to_string(self.root.join(path))?;
        Ok(FileContent::new(content))
    }

    fn write_file(&self, path: &Path, content: &str) -> io::Result<()> {
        let path = checked_relative(path)?;
        triage_utils::atomic_write(self.root.join(path), content.as_bytes())
    }
}

/// Files held in memory.
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    root: PathBuf,
    files: Mutex<BTreeMap<PathBuf, Arc<str>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn insert(&self, path: impl Into<PathBuf>, content: &str) {
        self.lock().insert(path.into(), Arc::from(content));
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.lock().remove(path).is_some()
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<Arc<str>> {
        self.lock().get(path).cloned()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Arc<str>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Workspace for MemoryWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list_files(&self) -> io::Result<Vec<PathBuf>> {
        Ok(self.lock().keys().cloned().collect())
    }

    fn read_file(&self, path: &Path) -> io::Result<FileContent> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let path = checked_relative(path)?;
        self.lock()
            .get(path)
            .map(|content| FileContent::new(Arc::clone(content)))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not in workspace", path.display()),
                )
            })
    }

    fn write_file(&self, path: &Path, content: &str) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let path = checked_relative(path)?;
        self.lock().insert(path.to_path_buf(), Arc::from(content));
        Ok(())
    }
}
