//! Staged storage for updates.
//!
//! Decompressed bytes stream into a staging directory next to the live app
//! root, split back into files in manifest order. `commit` swaps the staged
//! tree in with renames, so the running image stays intact until the full
//! payload is on disk; an uncommitted staging is removed on drop.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use otalink_proto::TransferError;
use otalink_proto::manifest::{FileEntry, Manifest};

/// The device's executable storage, modeled as a directory with a fixed
/// capacity.
#[derive(Debug, Clone)]
pub struct Storage {
    app_root: PathBuf,
    capacity_bytes: u64,
}

impl Storage {
    pub fn new(app_root: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Self {
            app_root: app_root.into(),
            capacity_bytes,
        }
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    /// Space check against the declared uncompressed total. Runs before any
    /// staging byte is written.
    pub fn check_space(&self, needed: u64) -> Result<(), TransferError> {
        if needed > self.capacity_bytes {
            warn!(
                needed,
                capacity = self.capacity_bytes,
                "update larger than available storage"
            );
            return Err(TransferError::InsufficientSpace);
        }
        Ok(())
    }

    /// Open a staging tree for the manifest. Leftovers from an earlier
    /// aborted session are discarded first.
    pub fn begin_staging(&self, manifest: &Manifest) -> io::Result<StagedTree> {
        let staging_dir = sibling(&self.app_root, ".staging");
        if staging_dir.exists() {
            fs::remove_dir_all(&staging_dir)?;
        }
        fs::create_dir_all(&staging_dir)?;
        Ok(StagedTree {
            staging_dir,
            app_root: self.app_root.clone(),
            entries: manifest.files.clone(),
            next: 0,
            current: None,
            committed: false,
        })
    }
}

/// `<path><suffix>` next to `path`, never inside it.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.to_path_buf().into_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

struct OpenEntry {
    file: File,
    remaining: u64,
}

/// Write sink that splits the decompressed stream back into files in
/// manifest order.
pub struct StagedTree {
    staging_dir: PathBuf,
    app_root: PathBuf,
    entries: Vec<FileEntry>,
    next: usize,
    current: Option<OpenEntry>,
    committed: bool,
}

impl StagedTree {
    /// Open the next entry with bytes still owed. Zero-length entries are
    /// created as empty files along the way.
    fn open_next(&mut self) -> io::Result<()> {
        while self.next < self.entries.len() {
            let entry = &self.entries[self.next];
            let path = self.staging_dir.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(&path)?;
            self.next += 1;
            if entry.size > 0 {
                self.current = Some(OpenEntry {
                    file,
                    remaining: entry.size,
                });
                return Ok(());
            }
        }
        Ok(())
    }

    /// Swap the staged tree into the live app root. The previous tree is
    /// only removed once the staged one is in place. Each rename is
    /// atomic but the pair is not: a crash between them leaves no live
    /// root, with the previous image recoverable under `<root>.old`.
    pub fn commit(mut self) -> io::Result<()> {
        if self.current.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "staged tree is missing bytes",
            ));
        }
        // Entries past the last written byte must all be zero-length.
        while self.next < self.entries.len() {
            self.open_next()?;
            if self.current.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "staged tree is missing bytes",
                ));
            }
        }

        let old = sibling(&self.app_root, ".old");
        if old.exists() {
            fs::remove_dir_all(&old)?;
        }
        let had_previous = self.app_root.exists();
        if had_previous {
            fs::rename(&self.app_root, &old)?;
        }
        if let Err(e) = fs::rename(&self.staging_dir, &self.app_root) {
            // Put the previous tree back before failing.
            if had_previous {
                let _ = fs::rename(&old, &self.app_root);
            }
            return Err(e);
        }
        if had_previous {
            let _ = fs::remove_dir_all(&old);
        }
        self.committed = true;
        info!(root = %self.app_root.display(), files = self.entries.len(), "staged tree applied");
        Ok(())
    }
}

impl Write for StagedTree {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.current.is_none() {
                self.open_next()?;
            }
            let Some(open) = self.current.as_mut() else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "decompressed stream longer than manifest total",
                ));
            };
            let take = ((buf.len() - written) as u64).min(open.remaining) as usize;
            open.file.write_all(&buf[written..written + take])?;
            open.remaining -= take as u64;
            written += take;
            if open.remaining == 0 {
                self.current = None;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(open) => open.file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StagedTree {
    fn drop(&mut self) {
        if !self.committed && self.staging_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.staging_dir) {
                warn!("could not clean staging dir: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(entries: &[(&str, &[u8])]) -> Manifest {
        Manifest::new(
            entries
                .iter()
                .map(|(path, data)| FileEntry {
                    path: (*path).into(),
                    size: data.len() as u64,
                })
                .collect(),
        )
    }

    #[test]
    fn commit_splits_stream_into_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        let storage = Storage::new(&root, 1024);

        let manifest = manifest(&[("main.py", b"hello"), ("lib/util.py", b"world!")]);
        let mut staged = storage.begin_staging(&manifest).unwrap();
        staged.write_all(b"helloworld!").unwrap();
        staged.commit().unwrap();

        assert_eq!(fs::read(root.join("main.py")).unwrap(), b"hello");
        assert_eq!(fs::read(root.join("lib/util.py")).unwrap(), b"world!");
        assert!(!dir.path().join("app.staging").exists());
    }

    #[test]
    fn commit_replaces_previous_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("old.py"), b"previous image").unwrap();

        let storage = Storage::new(&root, 1024);
        let manifest = manifest(&[("new.py", b"new image")]);
        let mut staged = storage.begin_staging(&manifest).unwrap();
        staged.write_all(b"new image").unwrap();
        staged.commit().unwrap();

        assert_eq!(fs::read(root.join("new.py")).unwrap(), b"new image");
        assert!(!root.join("old.py").exists());
        assert!(!dir.path().join("app.old").exists());
    }

    #[test]
    fn drop_without_commit_leaves_live_tree_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("main.py"), b"running code").unwrap();

        let storage = Storage::new(&root, 1024);
        let manifest = manifest(&[("main.py", b"half an update....")]);
        let mut staged = storage.begin_staging(&manifest).unwrap();
        staged.write_all(b"half an up").unwrap();
        drop(staged);

        assert_eq!(fs::read(root.join("main.py")).unwrap(), b"running code");
        assert!(!dir.path().join("app.staging").exists());
    }

    #[test]
    fn zero_length_entries_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        let storage = Storage::new(&root, 1024);

        let manifest = manifest(&[("a.py", b"x"), ("empty/__init__.py", b""), ("tail.py", b"")]);
        let mut staged = storage.begin_staging(&manifest).unwrap();
        staged.write_all(b"x").unwrap();
        staged.commit().unwrap();

        assert_eq!(fs::read(root.join("a.py")).unwrap(), b"x");
        assert_eq!(fs::read(root.join("empty/__init__.py")).unwrap(), b"");
        assert_eq!(fs::read(root.join("tail.py")).unwrap(), b"");
    }

    #[test]
    fn commit_with_missing_bytes_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("app"), 1024);

        let manifest = manifest(&[("main.py", b"expected bytes")]);
        let mut staged = storage.begin_staging(&manifest).unwrap();
        staged.write_all(b"exp").unwrap();
        assert!(staged.commit().is_err());
        assert!(!dir.path().join("app").exists());
    }

    #[test]
    fn space_check_uses_declared_total() {
        let storage = Storage::new("/tmp/unused", 100);
        assert!(storage.check_space(100).is_ok());
        assert!(matches!(
            storage.check_space(101),
            Err(TransferError::InsufficientSpace)
        ));
    }
}
