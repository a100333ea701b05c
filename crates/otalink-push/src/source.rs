//! Source tree walk and ignore filtering.
//!
//! Ignore globs come from `ota.conf` in the source root (JSON,
//! `{"ignore": ["*.pyc", "build/"]}`). Filtering happens before the
//! manifest is built, so excluded files never enter the compressed stream.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::Pattern;
use serde::Deserialize;
use tracing::debug;

use otalink_proto::manifest::{FileEntry, Manifest};

/// Project config file read from the source root.
pub const CONFIG_FILE: &str = "ota.conf";

#[derive(Debug, Default, Deserialize)]
struct ProjectConfig {
    #[serde(default)]
    ignore: Vec<String>,
}

enum IgnoreRule {
    /// `build/` style: exclude the whole subtree.
    Prefix(String),
    /// Glob matched against the relative path and the file name.
    Glob(Pattern),
}

/// A source directory plus its compiled ignore rules.
pub struct SourceTree {
    root: PathBuf,
    ignore: Vec<IgnoreRule>,
}

impl SourceTree {
    /// Open a source tree, reading ignore globs from `ota.conf` if present.
    /// A missing config means no ignores; a malformed one is an error.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root
            .as_ref()
            .canonicalize()
            .with_context(|| format!("source directory not found: {}", root.as_ref().display()))?;

        let config_path = root.join(CONFIG_FILE);
        let patterns = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("cannot read {}", config_path.display()))?;
            let config: ProjectConfig = serde_json::from_str(&raw)
                .with_context(|| format!("malformed {}", config_path.display()))?;
            debug!(?config.ignore, "loaded ignore patterns");
            config.ignore
        } else {
            Vec::new()
        };

        Self::with_ignore(root, patterns)
    }

    /// Build a tree with explicit ignore patterns (no config file read).
    pub fn with_ignore(root: impl Into<PathBuf>, patterns: Vec<String>) -> Result<Self> {
        let mut ignore = Vec::with_capacity(patterns.len());
        for raw in patterns {
            if let Some(prefix) = raw.strip_suffix('/') {
                ignore.push(IgnoreRule::Prefix(format!("{prefix}/")));
            } else {
                let pattern =
                    Pattern::new(&raw).with_context(|| format!("bad ignore pattern {raw:?}"))?;
                ignore.push(IgnoreRule::Glob(pattern));
            }
        }
        Ok(Self {
            root: root.into(),
            ignore,
        })
    }

    fn is_ignored(&self, rel: &str, file_name: &str) -> bool {
        self.ignore.iter().any(|rule| match rule {
            IgnoreRule::Prefix(prefix) => rel.starts_with(prefix),
            IgnoreRule::Glob(pattern) => pattern.matches(rel) || pattern.matches(file_name),
        })
    }

    /// Walk the tree and build the manifest. Entries are sorted by relative
    /// path so the stream order is deterministic; `paths` is aligned with
    /// the manifest entries.
    pub fn collect(&self) -> Result<(Manifest, Vec<PathBuf>)> {
        let mut found: Vec<(String, PathBuf, u64)> = Vec::new();
        self.walk(&self.root, &mut found)?;
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entries = Vec::with_capacity(found.len());
        let mut paths = Vec::with_capacity(found.len());
        for (rel, full, size) in found {
            debug!(path = %rel, size, "adding file");
            entries.push(FileEntry { path: rel, size });
            paths.push(full);
        }
        Ok((Manifest::new(entries), paths))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<(String, PathBuf, u64)>) -> Result<()> {
        for entry in
            fs::read_dir(dir).with_context(|| format!("cannot read {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            let rel = path
                .strip_prefix(&self.root)
                .expect("walk stays under root")
                .to_string_lossy()
                .replace('\\', "/");
            let name = entry.file_name().to_string_lossy().into_owned();

            if meta.is_dir() {
                if self.is_ignored(&format!("{rel}/"), &name) {
                    debug!(path = %rel, "ignoring subtree");
                } else {
                    self.walk(&path, out)?;
                }
            } else if meta.is_file() {
                if self.is_ignored(&rel, &name) {
                    debug!(path = %rel, "ignoring file");
                } else {
                    out.push((rel, path, meta.len()));
                }
            }
            // Symlinks and special files are skipped.
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn ignore_patterns_filter_before_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", b"print()");
        write(dir.path(), "a.pyc", b"\x00\x01");
        write(dir.path(), "build/out.bin", b"\xDE\xAD");

        let tree = SourceTree::with_ignore(
            dir.path(),
            vec!["*.pyc".into(), "build/".into()],
        )
        .unwrap();
        let (manifest, paths) = tree.collect().unwrap();

        assert_eq!(manifest.total_files, 1);
        assert_eq!(manifest.files[0].path, "a.py");
        assert_eq!(paths, vec![dir.path().join("a.py")]);
    }

    #[test]
    fn nested_files_match_name_globs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkg/mod.py", b"x = 1");
        write(dir.path(), "pkg/mod.pyc", b"\x00");

        let tree = SourceTree::with_ignore(dir.path(), vec!["*.pyc".into()]).unwrap();
        let (manifest, _) = tree.collect().unwrap();
        assert_eq!(manifest.total_files, 1);
        assert_eq!(manifest.files[0].path, "pkg/mod.py");
    }

    #[test]
    fn entries_sorted_and_totals_correct() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "z.py", b"zz");
        write(dir.path(), "a/b.py", b"bbb");
        write(dir.path(), "m.py", b"");

        let tree = SourceTree::with_ignore(dir.path(), Vec::new()).unwrap();
        let (manifest, _) = tree.collect().unwrap();

        let order: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(order, ["a/b.py", "m.py", "z.py"]);
        assert_eq!(manifest.total_size_bytes, 5);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn config_file_patterns_honored() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.py", b"ok");
        write(dir.path(), "notes.txt", b"skip me");
        write(dir.path(), CONFIG_FILE, br#"{"ignore": ["*.txt"]}"#);

        let tree = SourceTree::open(dir.path()).unwrap();
        let (manifest, _) = tree.collect().unwrap();
        let names: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert!(names.contains(&"main.py"));
        assert!(!names.contains(&"notes.txt"));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), CONFIG_FILE, b"not json");
        assert!(SourceTree::open(dir.path()).is_err());
    }
}
