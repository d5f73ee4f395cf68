//! Content fingerprinting for deployable units.
//!
//! A fingerprint covers, in fixed order: the unit's dependency tokens (one
//! per local dependency, sorted by dependency name), the serialized file
//! list, then every file's raw bytes in list order. Identical inputs always
//! produce the same digest; any changed byte, added or removed file, or
//! bumped dependency version changes it.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::errors::Error;
use crate::fsview::FileSystemView;

/// Token embedding a local dependency's resolved version and fingerprint.
/// The framing is not load-bearing but must stay stable across runs.
pub fn dependency_token(name: &str, version: &str, fingerprint: &str) -> String {
    format!("<<dependency:{name}@{version}:{fingerprint}>>\n")
}

/// Hash a unit's content. `files` must already be sorted (lexical path
/// order) and relative to `root`; a missing or unreadable file is fatal, not
/// skipped, since a silently shrunk file set would corrupt the digest.
pub fn fingerprint(
    fs: &dyn FileSystemView,
    root: &Path,
    files: &[PathBuf],
    dependency_tokens: &[String],
) -> Result<String, Error> {
    let mut hasher = Sha256::new();

    for token in dependency_tokens {
        hasher.update(token.as_bytes());
    }

    let listing: Vec<String> = files
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let listing_json = serde_json::to_string(&listing)
        .map_err(|e| Error::input(format!("failed to serialize file list: {e}")))?;
    hasher.update(listing_json.as_bytes());

    for file in files {
        let bytes = fs.read_file(&root.join(file))?;
        hasher.update(&bytes);
    }

    Ok(hex::encode(hasher.finalize()))
}
