// src/cache/store.rs

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cache::artifact::sweep_stale;
use crate::cache::record::{CacheRecord, parse_line};
use crate::cache::stamp::EnvironmentStamp;
use crate::fs::FileSystem;
use crate::types::SourceUnitId;

/// File name of the store inside the cache directory.
pub const STORE_FILE_NAME: &str = "fingerprints";

/// Line-oriented store mapping each built unit to its [`CacheRecord`].
///
/// ```text
/// <environment stamp>
/// <id><descriptor>
/// <id><descriptor>
/// ```
///
/// The file is read once when the store is opened and rewritten as a whole on
/// every change. Nothing about a broken file is ever an error: it just means
/// fewer cached records.
pub struct FingerprintStore {
    path: PathBuf,
    cache_dir: PathBuf,
    workspace_root: PathBuf,
    stamp: EnvironmentStamp,
    records: BTreeMap<SourceUnitId, CacheRecord>,
    fs: Arc<dyn FileSystem>,
}

impl fmt::Debug for FingerprintStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintStore")
            .field("path", &self.path)
            .field("stamp", &self.stamp)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl FingerprintStore {
    /// Open (load) the store in `cache_dir`.
    ///
    /// - A store written under a different stamp is discarded and its file
    ///   removed.
    /// - Lines for ids that `is_live` rejects, and lines that fail to decode,
    ///   are dropped.
    /// - After a successful load, renamed-aside artifacts are swept.
    pub fn open(
        cache_dir: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        stamp: EnvironmentStamp,
        fs: Arc<dyn FileSystem>,
        is_live: impl Fn(SourceUnitId) -> bool,
    ) -> Self {
        let cache_dir = cache_dir.into();
        let mut store = Self {
            path: cache_dir.join(STORE_FILE_NAME),
            cache_dir,
            workspace_root: workspace_root.into(),
            stamp,
            records: BTreeMap::new(),
            fs,
        };
        store.load(is_live);
        store
    }

    fn load(&mut self, is_live: impl Fn(SourceUnitId) -> bool) {
        let contents = match self.fs.read_to_string(&self.path) {
            Ok(c) => c,
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "no readable fingerprint store; starting empty");
                return;
            }
        };

        let mut lines = contents.lines();
        if lines.next() != Some(self.stamp.as_str()) {
            info!(
                path = %self.path.display(),
                "environment stamp changed; discarding fingerprint store"
            );
            if let Err(err) = self.fs.remove_file(&self.path) {
                debug!(error = %err, "could not remove outdated fingerprint store");
            }
            return;
        }

        let mut dropped = 0usize;
        for line in lines.filter(|l| !l.is_empty()) {
            match parse_line(line) {
                Some((id, Ok(record))) if is_live(id) => {
                    self.records.insert(id, record);
                }
                Some((id, Err(err))) => {
                    debug!(unit = %id, error = %err, "dropping undecodable cache record");
                    dropped += 1;
                }
                _ => dropped += 1,
            }
        }

        debug!(
            path = %self.path.display(),
            records = self.records.len(),
            dropped,
            "loaded fingerprint store"
        );

        sweep_stale(self.fs.as_ref(), &self.cache_dir);
    }

    pub fn get(&self, id: SourceUnitId) -> Option<&CacheRecord> {
        self.records.get(&id)
    }

    /// Upsert a record and persist the whole store. A record identical to the
    /// stored one is not rewritten.
    pub fn put(&mut self, id: SourceUnitId, record: CacheRecord) -> Result<()> {
        if self.records.get(&id) == Some(&record) {
            debug!(unit = %id, "cache record unchanged; not rewriting store");
            return Ok(());
        }

        // Refuse records that could not be written back.
        record
            .encode()
            .with_context(|| format!("encoding cache record for unit {id}"))?;

        self.records.insert(id, record);
        self.save()?;
        debug!(unit = %id, "stored cache record");
        Ok(())
    }

    /// Remove a record (persisting the change) and optionally delete its
    /// artifact. Returns whether a record existed.
    pub fn remove(&mut self, id: SourceUnitId, delete_artifact: bool) -> Result<bool> {
        let removed = self.records.remove(&id);

        if delete_artifact {
            let artifact = match &removed {
                Some(record) => self.resolve_artifact(id, record),
                None => self.default_artifact_path(id),
            };
            if self.fs.is_file(&artifact) {
                self.fs.remove_file(&artifact)?;
                info!(unit = %id, path = %artifact.display(), "deleted artifact");
            }
        }

        if removed.is_some() {
            self.save()?;
            debug!(unit = %id, "removed cache record");
        }
        Ok(removed.is_some())
    }

    /// Convention path of an artifact without an explicit output.
    pub fn default_artifact_path(&self, id: SourceUnitId) -> PathBuf {
        self.cache_dir.join(format!("{id}.bin"))
    }

    /// Artifact path of a record: the explicit output (relative paths resolve
    /// against the workspace root) or the convention path.
    pub fn resolve_artifact(&self, id: SourceUnitId, record: &CacheRecord) -> PathBuf {
        match &record.output {
            Some(out) if out.is_absolute() => out.clone(),
            Some(out) => self.workspace_root.join(out),
            None => self.default_artifact_path(id),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn save(&self) -> Result<()> {
        let mut out = String::new();
        out.push_str(self.stamp.as_str());
        out.push('\n');

        for (id, record) in self.records.iter() {
            match record.encode() {
                Ok(descriptor) => {
                    out.push_str(&id.to_string());
                    out.push_str(&descriptor);
                    out.push('\n');
                }
                Err(err) => warn!(unit = %id, error = %err, "skipping unencodable cache record"),
            }
        }

        self.fs
            .write(&self.path, out.as_bytes())
            .with_context(|| format!("writing fingerprint store {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::record::DependencyRef;
    use crate::fs::mock::MockFileSystem;

    fn open(fs: &MockFileSystem, stamp: &str) -> FingerprintStore {
        FingerprintStore::open(
            "/ws/.compiled",
            "/ws",
            EnvironmentStamp::new(stamp),
            Arc::new(fs.clone()),
            |id| id.get() < 100,
        )
    }

    #[test]
    fn put_writes_stamp_then_sorted_lines() {
        let fs = MockFileSystem::new();
        let mut store = open(&fs, "S1");

        store.put(SourceUnitId(5), CacheRecord::default()).unwrap();
        let lib = CacheRecord {
            dependencies: vec![DependencyRef::Library(SourceUnitId(5))],
            ..CacheRecord::default()
        };
        store.put(SourceUnitId(2), lib).unwrap();

        let text = fs.read_to_string(store.path()).unwrap();
        assert_eq!(text, "S1\n2|bnative|l5\n5|bnative\n");
    }

    #[test]
    fn identical_put_does_not_touch_disk() {
        let fs = MockFileSystem::new();
        let mut store = open(&fs, "S1");
        store.put(SourceUnitId(1), CacheRecord::default()).unwrap();
        let writes = fs.write_count();

        store.put(SourceUnitId(1), CacheRecord::default()).unwrap();
        assert_eq!(fs.write_count(), writes);
    }

    #[test]
    fn load_drops_dead_and_malformed_lines() {
        let fs = MockFileSystem::new();
        fs.add_file(
            "/ws/.compiled/fingerprints",
            "S1\n1|bnative\n500|bnative\n2|bnative|?x\ngarbage\n3|bx86\n",
        );

        let store = open(&fs, "S1");
        assert_eq!(store.len(), 2);
        assert!(store.get(SourceUnitId(1)).is_some());
        assert!(store.get(SourceUnitId(2)).is_none());
        assert!(store.get(SourceUnitId(500)).is_none());
        assert!(store.get(SourceUnitId(3)).is_some());
    }

    #[test]
    fn stamp_mismatch_discards_everything() {
        let fs = MockFileSystem::new();
        fs.add_file("/ws/.compiled/fingerprints", "S1\n1|bnative\n2|bnative\n");

        let store = open(&fs, "S2");
        assert!(store.is_empty());
        assert!(store.get(SourceUnitId(1)).is_none());
        assert!(!fs.is_file(Path::new("/ws/.compiled/fingerprints")));
    }

    #[test]
    fn remove_deletes_resolved_artifact() {
        let fs = MockFileSystem::new();
        let mut store = open(&fs, "S1");
        let record = CacheRecord {
            output: Some(PathBuf::from("bin/tool")),
            ..CacheRecord::default()
        };
        store.put(SourceUnitId(1), record).unwrap();
        fs.add_file("/ws/bin/tool", "elf");

        assert!(store.remove(SourceUnitId(1), true).unwrap());
        assert!(!fs.is_file(Path::new("/ws/bin/tool")));
        assert!(!store.remove(SourceUnitId(1), true).unwrap());
    }
}
