// src/cache/stamp.rs

use std::fmt;
use std::path::Path;

use sysinfo::System;

use crate::fs::FileSystem;

/// Bumped whenever the descriptor format changes; an old store then fails
/// the stamp comparison and is discarded as a whole.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Identifies the host + workspace a fingerprint store was written for.
///
/// Stored as the first line of the store file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentStamp(String);

impl EnvironmentStamp {
    /// Wrap an arbitrary stamp string. Line breaks are replaced so the stamp
    /// always fits on the first line of the store.
    pub fn new(stamp: impl Into<String>) -> Self {
        let stamp: String = stamp.into();
        Self(stamp.replace(['\r', '\n'], " "))
    }

    /// Stamp for the running host and the given workspace root.
    pub fn current(fs: &dyn FileSystem, workspace_root: &Path) -> Self {
        let os = System::long_os_version().unwrap_or_else(|| "unknown os".to_string());
        let root = fs
            .canonicalize(workspace_root)
            .unwrap_or_else(|_| workspace_root.to_path_buf());
        Self::new(format!(
            "v{STORE_FORMAT_VERSION}|{os} {}|{}",
            std::env::consts::ARCH,
            root.display()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn current_stamp_names_version_and_root() {
        let fs = MockFileSystem::new();
        let stamp = EnvironmentStamp::current(&fs, Path::new("/work/space"));
        assert!(stamp.as_str().starts_with("v1|"));
        assert!(stamp.as_str().ends_with("|/work/space"));
    }

    #[test]
    fn line_breaks_never_reach_the_store() {
        assert_eq!(EnvironmentStamp::new("a\nb").as_str(), "a b");
    }
}
