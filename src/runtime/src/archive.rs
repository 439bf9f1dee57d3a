//! Tar helpers for packaging an OCI layout directory.
//!
//! Archives are uncompressed, with entry paths relative to the layout root.

use std::io::{Read, Write};
use std::path::Path;

use a3s_relay_core::error::{RelayError, Result};

/// Write `dir` as an uncompressed tar stream and hand the writer back.
pub fn tar_directory<W: Write>(dir: &Path, writer: W) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.append_dir_all(".", dir).map_err(|e| {
        RelayError::Archive(format!(
            "Failed to create tar archive from directory {}: {}",
            dir.display(),
            e
        ))
    })?;
    builder
        .into_inner()
        .map_err(|e| RelayError::Archive(format!("Failed to finalize archive: {}", e)))
}

/// Extract a tar stream into `dir`.
pub fn unpack<R: Read>(reader: R, dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive
        .unpack(dir)
        .map_err(|e| RelayError::Archive(format!("Failed to extract archive: {}", e)))
}

/// Calculate total size of a directory recursively.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path);
            } else if let Ok(meta) = path.metadata() {
                total += meta.len();
            }
        }
    }
    total
}
