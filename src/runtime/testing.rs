//! Helpers shared by the runtime tests.

use std::path::PathBuf;
use tempfile::TempDir;

/// Deterministic, non-repeating-looking test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Temporary directory of served files, removed when dropped.
///
/// Keep it alive until the server has finished with every file in it.
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn new() -> Self {
        let dir = tempfile::Builder::new()
            .prefix("fetchd-test-")
            .tempdir()
            .unwrap();
        Self { dir }
    }

    /// Write `data` to a new file named `name` and return its path.
    pub fn file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.dir.path().join(format!("{name}.bin"));
        assert!(!path.exists(), "scratch file {name} written twice");
        std::fs::write(&path, data).unwrap();
        path
    }
}
