// src/fs/mock.rs

use super::FileSystem;
use anyhow::{Result, anyhow};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
struct MockFile {
    content: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct MockState {
    files: BTreeMap<PathBuf, MockFile>,
    /// Logical clock; every write advances it by one second.
    clock: u64,
    writes: usize,
    /// Paths whose removal fails, as if another process had them mapped.
    locked: Vec<PathBuf>,
}

/// In-memory filesystem with a deterministic clock.
///
/// Directories are implicit: any prefix of a stored file path is a directory.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    state: Arc<Mutex<MockState>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tick(state: &mut MockState) -> SystemTime {
        state.clock += 1;
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + state.clock)
    }

    /// Add (or overwrite) a file, stamping it with the next clock tick.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        let modified = Self::tick(&mut state);
        state.files.insert(
            path.as_ref().to_path_buf(),
            MockFile {
                content: content.into(),
                modified,
            },
        );
    }

    /// Advance a file's modification time to the next clock tick, making it
    /// newer than everything written before.
    pub fn touch(&self, path: impl AsRef<Path>) {
        let mut state = self.lock();
        let modified = Self::tick(&mut state);
        if let Some(file) = state.files.get_mut(path.as_ref()) {
            file.modified = modified;
        }
    }

    pub fn delete(&self, path: impl AsRef<Path>) {
        self.lock().files.remove(path.as_ref());
    }

    /// Make removal of `path` fail until it is renamed away.
    pub fn lock_file(&self, path: impl AsRef<Path>) {
        self.lock().locked.push(path.as_ref().to_path_buf());
    }

    /// Number of `write` / `copy` / `rename` / `remove_file` calls so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().files.keys().cloned().collect()
    }
}

impl FileSystem for MockFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let state = self.lock();
        match state.files.get(path) {
            Some(file) => String::from_utf8(file.content.clone())
                .map_err(|e| anyhow!("Invalid UTF-8: {}", e)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut state = self.lock();
        state.writes += 1;
        let modified = Self::tick(&mut state);
        state.files.insert(
            path.to_path_buf(),
            MockFile {
                content: contents.to_vec(),
                modified,
            },
        );
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.lock();
        let content = match state.files.get(from) {
            Some(file) => file.content.clone(),
            None => return Err(anyhow!("File not found: {:?}", from)),
        };
        state.writes += 1;
        let modified = Self::tick(&mut state);
        state
            .files
            .insert(to.to_path_buf(), MockFile { content, modified });
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.is_file(path) || self.lock().files.keys().any(|p| p.starts_with(path))
    }

    fn is_file(&self, path: &Path) -> bool {
        self.lock().files.contains_key(path)
    }

    fn modified(&self, path: &Path) -> Result<SystemTime> {
        self.lock()
            .files
            .get(path)
            .map(|f| f.modified)
            .ok_or_else(|| anyhow!("File not found: {:?}", path))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();
        if state.locked.iter().any(|p| p == path) {
            return Err(anyhow!("File is locked: {:?}", path));
        }
        state.writes += 1;
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| anyhow!("File not found: {:?}", path))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.lock();
        let file = state
            .files
            .remove(from)
            .ok_or_else(|| anyhow!("File not found: {:?}", from))?;
        state.writes += 1;
        state.locked.retain(|p| p != from);
        state.files.insert(to.to_path_buf(), file);
        Ok(())
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        // Tests use absolute paths throughout.
        Ok(path.to_path_buf())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let state = self.lock();
        let mut children: Vec<PathBuf> = state
            .files
            .keys()
            .filter_map(|p| {
                let rest = p.strip_prefix(path).ok()?;
                let first = rest.components().next()?;
                Some(path.join(first))
            })
            .collect();
        children.dedup();
        if children.is_empty() {
            return Err(anyhow!("Not a directory or not found: {:?}", path));
        }
        Ok(children)
    }
}
