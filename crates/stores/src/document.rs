//! Whole-document YAML persistence with crash-safe replacement.
//!
//! Readers must see either the pre-write or post-write complete document,
//! never a partial one, so every save goes temp file → fsync → rename.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use wr_domain::{Error, Result};

/// Load a document, falling back to the default on a missing or corrupt
/// file. Corruption is logged; the on-disk file is left untouched until the
/// next successful save replaces it.
pub fn load_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return T::default();
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to read store file");
            return T::default();
        }
    };

    match serde_yaml::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "corrupted store file, resetting to empty document"
            );
            T::default()
        }
    }
}

/// Atomically replace the document at `path`.
pub fn save_atomic<T>(path: &Path, doc: &T) -> Result<()>
where
    T: Serialize,
{
    let yaml = serde_yaml::to_string(doc)
        .map_err(|e| Error::Store(format!("serializing {}: {e}", path.display())))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Store(format!("store path has no parent: {}", path.display())))?;
    std::fs::create_dir_all(dir).map_err(Error::Io)?;

    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp).map_err(Error::Io)?;
        file.write_all(yaml.as_bytes()).map_err(Error::Io)?;
        file.sync_all().map_err(Error::Io)?;
    }
    std::fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}
