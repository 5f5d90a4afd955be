//! Crash-safe JSON array file.
//!
//! Writes go to a uniquely named temp file in the target directory, are
//! fsynced, and then renamed over the target, so readers only ever see the
//! previous or the next complete document.

use crate::core::{Result, StockError};
use crate::model::InventoryRecord;
use log::{debug, warn};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone)]
pub struct AtomicFileStore {
    path: PathBuf,
}

impl AtomicFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record in the file.
    ///
    /// An absent, empty or unparsable file yields an empty collection; the
    /// condition is logged but never returned to the caller.
    pub async fn read(&self) -> Vec<InventoryRecord> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("data file '{}' does not exist yet", self.path.display());
                return Vec::new();
            }
            Err(err) => {
                warn!(
                    "failed to read data file '{}', serving no records: {}",
                    self.path.display(),
                    err
                );
                return Vec::new();
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Vec::new();
        }

        match serde_json::from_slice::<Vec<InventoryRecord>>(&bytes) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    "data file '{}' is not a record array, serving no records: {}",
                    self.path.display(),
                    err
                );
                Vec::new()
            }
        }
    }

    /// Reads every record for a read-modify-write cycle.
    ///
    /// Unlike [`read`](Self::read), only an absent or blank file counts as
    /// empty. Any other read failure or an undecodable document is an error,
    /// so a mutation never replaces content it could not see.
    pub async fn read_for_update(&self) -> Result<Vec<InventoryRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StockError::io("read", &self.path, err)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&bytes).map_err(|err| {
            StockError::data(
                self.path.display(),
                format!("refusing to rewrite undecodable data file: {err}"),
            )
        })
    }

    /// Replaces the file content with `records` in one rename.
    pub async fn write(&self, records: &[InventoryRecord]) -> Result<()> {
        let bytes = encode(records).map_err(|err| {
            StockError::data(self.path.display(), format!("failed to encode records: {err}"))
        })?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes)).await?
    }

    /// Creates the file with an empty array if it does not exist.
    ///
    /// Returns `true` when a new file was written.
    pub async fn ensure_exists(&self) -> Result<bool> {
        match tokio::fs::metadata(&self.path).await {
            Ok(_) => Ok(false),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.write(&[]).await?;
                Ok(true)
            }
            Err(err) => Err(StockError::io("inspect", &self.path, err)),
        }
    }
}

fn encode(records: &[InventoryRecord]) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(records.len() * 160 + 2);
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    records.serialize(&mut serializer)?;
    Ok(out)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn write_and_sync(temp: &mut NamedTempFile, bytes: &[u8]) -> std::io::Result<()> {
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|err| StockError::io("create directory", &dir, err))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(&dir)
        .map_err(|err| StockError::io("create temp file in", &dir, err))?;

    if let Err(err) = write_and_sync(&mut temp, bytes) {
        return Err(StockError::io("write temp file", temp.path(), err));
    }

    // Keep the previous generation next to the target until the swap is done.
    let backup = sibling_with_suffix(path, ".backup");
    let kept_previous = match fs::copy(path, &backup) {
        Ok(_) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            warn!(
                "could not keep previous generation of '{}': {}",
                path.display(),
                err
            );
            false
        }
    };

    temp.persist(path)
        .map_err(|err| StockError::io("replace", path, err.error))?;

    if kept_previous {
        if let Err(err) = fs::remove_file(&backup) {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    "write of '{}' succeeded but '{}' could not be removed: {}",
                    path.display(),
                    backup.display(),
                    err
                );
            }
        }
    }

    debug!("wrote {} bytes to '{}'", bytes.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = AtomicFileStore::new(temp_dir.path().join("inventory.json"));
        assert!(store.read().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_and_empty_files_read_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("inventory.json");
        let store = AtomicFileStore::new(&path);

        std::fs::write(&path, "").unwrap();
        assert!(store.read().await.is_empty());

        std::fs::write(&path, "[{\"id\": 1, \"product_family\": ").unwrap();
        assert!(store.read().await.is_empty());

        std::fs::write(&path, "{\"not\": \"an array\"}").unwrap();
        assert!(store.read().await.is_empty());
    }

    #[tokio::test]
    async fn write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = AtomicFileStore::new(temp_dir.path().join("nested/inventory.json"));
        let records = vec![
            InventoryRecord::new("Pump", "Seal", 3).with_id(1),
            InventoryRecord::new("Valve", "Spring", 12).with_id(2).with_brand("Acme"),
        ];
        store.write(&records).await.unwrap();
        assert_eq!(store.read().await, records);
    }

    #[tokio::test]
    async fn write_leaves_no_temp_or_backup_files() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("inventory.json");
        let store = AtomicFileStore::new(&path);
        store.write(&[InventoryRecord::new("Pump", "Seal", 1).with_id(1)]).await.unwrap();
        store.write(&[InventoryRecord::new("Pump", "Seal", 2).with_id(1)]).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["inventory.json".to_string()]);
    }

    #[tokio::test]
    async fn persisted_layout_uses_historical_field_names() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("inventory.json");
        let store = AtomicFileStore::new(&path);
        store
            .write(&[InventoryRecord::new("Pump", "Seal", 1).with_id(1).with_brand("Acme")])
            .await
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let first = &raw.as_array().unwrap()[0];
        for field in [
            "id",
            "Brand",
            "product_family",
            "spare_part",
            "quantity",
            "low_status",
            "high_status",
        ] {
            assert!(first.get(field).is_some(), "missing field {field}");
        }
    }

    #[tokio::test]
    async fn strict_read_rejects_what_lenient_read_hides() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("inventory.json");
        let store = AtomicFileStore::new(&path);
        assert!(store.read_for_update().await.unwrap().is_empty());

        std::fs::write(&path, "  \n").unwrap();
        assert!(store.read_for_update().await.unwrap().is_empty());

        std::fs::write(&path, "[{\"id\": 1, \"product_family\": ").unwrap();
        assert!(store.read().await.is_empty());
        let err = store.read_for_update().await.unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Data);
    }

    #[tokio::test]
    async fn strict_read_reports_unreadable_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("inventory.json");
        std::fs::create_dir(&path).unwrap();
        let store = AtomicFileStore::new(&path);

        assert!(store.read().await.is_empty());
        let err = store.read_for_update().await.unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Resource);
    }

    #[tokio::test]
    async fn ensure_exists_creates_empty_array_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("inventory.json");
        let store = AtomicFileStore::new(&path);
        assert!(store.ensure_exists().await.unwrap());
        assert!(!store.ensure_exists().await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "[]");
    }
}
