//! Scratch build roots for tests, gated behind the `project-util` feature.
//!
//! A thin `tempfile::TempDir` wrapper used across integration tests to
//! build a throwaway project layout, write source files into it, and point
//! a graph or installer at it. Each root gets a random suffix (`rand`) so
//! concurrently-running tests never collide.

use std::path::{Path, PathBuf};

use rand::Rng;

/// A randomly-named scratch directory under the system temp root, removed
/// on drop. Tests build a small on-disk layout inside it (source files,
/// an install root, a persisted graph) and point a [`crate::BuildGraph`]
/// or [`crate::Installer`] at paths within it.
pub struct ScratchRoot {
    dir: tempfile::TempDir,
}

impl ScratchRoot {
    pub fn new() -> std::io::Result<Self> {
        let suffix: u64 = rand::thread_rng().gen();
        let dir = tempfile::Builder::new().prefix(&format!("build-graph-core-{suffix:016x}-")).tempdir()?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Writes `contents` to `relative`, creating parent directories as
    /// needed.
    pub fn write_file(&self, relative: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> std::io::Result<PathBuf> {
        let path = self.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Sets a file's modification time, for tests exercising the up-to-date
    /// check deterministically instead of racing the real clock.
    pub fn set_mtime(&self, relative: impl AsRef<Path>, seconds_since_epoch: u64) -> std::io::Result<()> {
        let path = self.join(relative);
        let time = std::time::UNIX_EPOCH + std::time::Duration::from_secs(seconds_since_epoch);
        std::fs::File::open(&path)?.set_modified(time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_roots_are_independent() {
        let a = ScratchRoot::new().unwrap();
        let b = ScratchRoot::new().unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn write_file_creates_parent_directories() {
        let root = ScratchRoot::new().unwrap();
        let path = root.write_file("nested/dir/in.txt", b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }
}
