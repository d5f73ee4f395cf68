//! Filesystem view used by fingerprinting: pattern-scoped file enumeration
//! plus raw reads, behind a trait so tests and remote checkouts can swap the
//! backend.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

use crate::errors::Error;

/// Directories that never contribute to a unit's content.
const IGNORED_DIRS: [&str; 3] = [".git", "node_modules", "target"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub size: u64,
}

pub trait FileSystemView: Send + Sync {
    /// Enumerate files under `root` matching any of `patterns`, as sorted
    /// root-relative paths. Matching is case-sensitive and `*` never crosses
    /// a path separator.
    fn list_files(&self, root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, Error>;

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, Error>;

    fn stat(&self, path: &Path) -> Result<FileStat, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

impl FileSystemView for LocalFileSystem {
    fn list_files(&self, root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, Error> {
        let compiled: Vec<Pattern> = patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| Error::input(format!("bad file pattern {p:?}: {e}")))
            })
            .collect::<Result<_, _>>()?;
        let options = match_options();

        let mut matched = BTreeSet::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| IGNORED_DIRS.contains(&name)))
        });

        for entry in walker {
            let entry = entry.map_err(|e| {
                Error::input(format!("failed to walk {}: {e}", root.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| Error::input(format!("path outside root: {e}")))?;
            let candidate = relative.to_string_lossy().replace('\\', "/");
            if compiled
                .iter()
                .any(|p| p.matches_with(&candidate, options))
            {
                matched.insert(PathBuf::from(candidate));
            }
        }

        Ok(matched.into_iter().collect())
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, Error> {
        fs::read(path).map_err(|e| Error::io(format!("failed to read {}", path.display()), e))
    }

    fn stat(&self, path: &Path) -> Result<FileStat, Error> {
        let meta = fs::metadata(path)
            .map_err(|e| Error::io(format!("failed to stat {}", path.display()), e))?;
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = 0;
        Ok(FileStat {
            mode,
            size: meta.len(),
        })
    }
}
