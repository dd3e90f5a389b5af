//! Spool directory handling for the uploader
//!
//! The proxy's sink leaves `bits_*.json` files behind; this module finds
//! them, parses them, and re-persists sub-word remainders so no captured
//! bit ever exists only in uploader memory.

use chrono::Utc;
use qbits_core::record::BitRecord;
use qbits_core::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Pending spool files, oldest first
///
/// Filenames embed their flush timestamp, so lexicographic order is
/// chronological order.
pub fn scan_pending(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("bits_") && name.ends_with(".json"))
                .unwrap_or(false)
        })
        .collect();

    files.sort();
    Ok(files)
}

/// Parse one spool file
pub fn read_bit_file(path: &Path) -> Result<Vec<BitRecord>> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write records back as a fresh pending file
///
/// Used for the sub-word remainder of a packed upload, before the source
/// files it came from are deleted.
pub fn write_pending(dir: &Path, records: &[BitRecord]) -> Result<PathBuf> {
    let filename = format!("bits_{}_rem.json", Utc::now().format("%Y%m%d_%H%M%S%f"));
    let path = dir.join(filename);
    fs::write(&path, serde_json::to_vec_pretty(records)?)?;
    Ok(path)
}
