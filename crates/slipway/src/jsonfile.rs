//! Small durable-JSON helpers shared by the record store, status sink and
//! artifact store.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::Error;

/// Best-effort fsync of the parent directory after a rename, ensuring the
/// directory entry update is durable on crash. Errors are silently ignored
/// because not all platforms support opening a directory for sync.
pub(crate) fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::input(format!("failed to serialize JSON for {}: {e}", path.display())))?;

    {
        let mut f = fs::File::create(&tmp)
            .map_err(|e| Error::io(format!("failed to create tmp file {}", tmp.display()), e))?;
        f.write_all(&data)
            .map_err(|e| Error::io(format!("failed to write tmp file {}", tmp.display()), e))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).map_err(|e| {
        Error::io(
            format!(
                "failed to rename tmp file {} to {}",
                tmp.display(),
                path.display()
            ),
            e,
        )
    })?;

    fsync_parent_dir(path);

    Ok(())
}

/// Load a JSON file, treating a missing file as "not yet written".
pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    let value = serde_json::from_str(&content)
        .map_err(|e| Error::input(format!("failed to parse JSON {}: {e}", path.display())))?;
    Ok(Some(value))
}
