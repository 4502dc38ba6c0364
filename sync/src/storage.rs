//! File-backed storage for the engine's store document.
//!
//! One JSON file per tenant, written atomically (temp file + rename) so a
//! crash mid-save leaves either the old or the new document, never a torn
//! one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tether_engine::{Error, StorageBackend};

/// JSON file backend, namespaced by tenant.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    /// Backend for a tenant's store file under the given data directory.
    ///
    /// The tenant id is sanitized into the file name, so two tenants can
    /// never collide on the same file.
    pub fn for_tenant(data_dir: impl AsRef<Path>, tenant_id: &str) -> Self {
        let file = format!("{}.json", sanitize(tenant_id));
        Self {
            path: data_dir.as_ref().join(file),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<serde_json::Value>, Error> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Storage(e.to_string())),
        };
        let value = serde_json::from_str(&raw).map_err(|e| Error::Corrupt(e.to_string()))?;
        Ok(Some(value))
    }

    fn save(&mut self, document: &serde_json::Value) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
        }

        let raw = serde_json::to_vec(document).map_err(|e| Error::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw).map_err(|e| Error::Storage(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }
}

fn sanitize(tenant_id: &str) -> String {
    tenant_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
