// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Orchestrator
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # State snapshot files (spec.md §4.8, §6)
//!
//! Aggregates every component's [`StateSnapshot`] into one JSON document
//! per shutdown, compresses and checksums each payload, and manages the
//! on-disk retention of old files. Snapshot files are owned exclusively
//! by the kill switch; concurrent writers are not supported (spec.md
//! §5).

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bb_pipeline_domain::error::CoreError;
use bb_pipeline_domain::value_objects::StateSnapshot;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

pub const SNAPSHOT_FILE_VERSION: &str = "1.0";

/// One on-disk snapshot entry. Mirrors [`StateSnapshot`] but carries
/// `state_data` already compressed (when compression is enabled) and the
/// checksum of the *uncompressed* bytes, matching spec.md §6's file
/// schema field-for-field.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotEntry {
    pub component_id: String,
    pub operation_id: String,
    pub timestamp: u64,
    pub state_type: String,
    pub state_data: Vec<u8>,
    pub metadata: std::collections::HashMap<String, String>,
    pub data_size: u64,
    pub checksum: u32,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<u64>,
}

/// Top-level document written by phase 2 ("saving state").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotFile {
    pub version: String,
    pub timestamp: u64,
    pub trigger: String,
    pub trigger_details: String,
    pub snapshots: Vec<SnapshotEntry>,
}

/// Builds a [`SnapshotEntry`] from a freshly-collected [`StateSnapshot`],
/// optionally deflating `state_data` before it is embedded. The checksum
/// is always computed over the *uncompressed* bytes so loaders can
/// verify integrity regardless of whether compression was used.
pub fn entry_from_snapshot(snapshot: StateSnapshot, compress: bool) -> SnapshotEntry {
    let checksum = crc32fast::hash(&snapshot.state_data);
    let data_size = snapshot.state_data.len() as u64;
    let state_data = if compress { deflate(&snapshot.state_data) } else { snapshot.state_data };
    SnapshotEntry {
        component_id: snapshot.component_id,
        operation_id: snapshot.operation_id,
        timestamp: snapshot.timestamp_secs,
        state_type: snapshot.state_type,
        state_data,
        metadata: snapshot.metadata,
        data_size,
        checksum,
        priority: snapshot.priority,
        expiry_time: snapshot.expiry.map(|d| d.as_secs()),
    }
}

/// Recovers the original payload bytes from a loaded entry, trying
/// deflate first and falling back to the raw bytes when the file was
/// written without compression. Returns an error if the checksum of the
/// recovered bytes does not match the stored one.
pub fn decode_entry(entry: &SnapshotEntry) -> Result<Vec<u8>, CoreError> {
    let candidate = inflate(&entry.state_data).unwrap_or_else(|| entry.state_data.clone());
    if crc32fast::hash(&candidate) != entry.checksum {
        return Err(CoreError::InternalError(format!(
            "checksum mismatch for snapshot component '{}' (operation '{}')",
            entry.component_id, entry.operation_id
        )));
    }
    Ok(candidate)
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    // In-memory writers never fail.
    encoder.write_all(data).expect("in-memory deflate write");
    encoder.finish().expect("in-memory deflate finish")
}

fn inflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Builds the filename `<prefix><tag>_<YYYYMMDD_HHMMSS>_<ms>.json`
/// (spec.md §4.8) for a snapshot taken at `now`.
pub fn build_filename(prefix: &str, tag: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    format!("{prefix}{tag}_{}_{:03}.json", now.format("%Y%m%d_%H%M%S"), now.timestamp_subsec_millis())
}

/// Writes `file` to `dir/name`, creating `dir` if it does not exist.
pub fn write_file(dir: &Path, name: &str, file: &SnapshotFile) -> Result<PathBuf, CoreError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    let json = serde_json::to_vec_pretty(file)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

/// Loads and parses one snapshot file.
pub fn load_file(path: &Path) -> Result<SnapshotFile, CoreError> {
    let bytes = std::fs::read(path)?;
    let file: SnapshotFile = serde_json::from_slice(&bytes)?;
    Ok(file)
}

/// Enumerates every `*.json` snapshot file in `dir`, decodes it, and
/// returns the concatenated entry list sorted by priority ascending
/// (spec.md §4.8 "Load"). Unreadable or corrupt files are skipped; the
/// directory not existing yet is treated as empty rather than an error.
pub fn load_all(dir: &Path) -> Result<Vec<SnapshotEntry>, CoreError> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        match load_file(&path) {
            Ok(file) => out.extend(file.snapshots),
            Err(err) => tracing::warn!(path = %path.display(), %err, "skipping unreadable snapshot file"),
        }
    }
    out.sort_by_key(|e| e.priority);
    Ok(out)
}

/// Removes the oldest snapshot files (by modification time) beyond
/// `max_files`, keeping the most recently modified `max_files` files.
pub fn prune_old_files(dir: &Path, max_files: usize) -> Result<(), CoreError> {
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((e.path(), modified))
            })
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if files.len() <= max_files {
        return Ok(());
    }
    files.sort_by_key(|(_, modified)| *modified);
    let excess = files.len() - max_files;
    for (path, _) in files.into_iter().take(excess) {
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), %err, "failed to prune old snapshot file");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_snapshot() -> StateSnapshot {
        StateSnapshot {
            component_id: "X".into(),
            operation_id: "op-1".into(),
            timestamp_secs: 1_700_000_000,
            state_type: "json".into(),
            state_data: br#"{"k":"v"}"#.to_vec(),
            metadata: HashMap::new(),
            data_size: 9,
            checksum: 0,
            priority: 0,
            expiry: None,
        }
    }

    #[test]
    fn uncompressed_round_trip_through_decode() {
        let entry = entry_from_snapshot(sample_snapshot(), false);
        let recovered = decode_entry(&entry).unwrap();
        assert_eq!(recovered, br#"{"k":"v"}"#);
    }

    #[test]
    fn compressed_round_trip_through_decode() {
        let entry = entry_from_snapshot(sample_snapshot(), true);
        assert_ne!(entry.state_data, br#"{"k":"v"}"#);
        let recovered = decode_entry(&entry).unwrap();
        assert_eq!(recovered, br#"{"k":"v"}"#);
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let mut entry = entry_from_snapshot(sample_snapshot(), false);
        entry.state_data[0] ^= 0xFF;
        assert!(decode_entry(&entry).is_err());
    }

    #[test]
    fn orchestrator_checksum_agrees_with_domain_checksum() {
        let data = b"123456789";
        assert_eq!(crc32fast::hash(data), StateSnapshot::checksum_of(data));
    }

    #[test]
    fn filename_matches_configured_shape() {
        let now = chrono::DateTime::parse_from_rfc3339("2026-01-02T03:04:05.678Z").unwrap().with_timezone(&chrono::Utc);
        let name = build_filename("bb_", "shutdown", now);
        assert_eq!(name, "bb_shutdown_20260102_030405_678.json");
    }

    #[test]
    fn write_and_load_round_trips_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_from_snapshot(sample_snapshot(), false);
        let file = SnapshotFile {
            version: SNAPSHOT_FILE_VERSION.to_string(),
            timestamp: 1_700_000_000,
            trigger: "USER_REQUEST".into(),
            trigger_details: "manual test".into(),
            snapshots: vec![entry],
        };
        let path = write_file(dir.path(), "snap.json", &file).unwrap();
        let loaded = load_file(&path).unwrap();
        assert_eq!(loaded.snapshots.len(), 1);
        assert_eq!(loaded.snapshots[0].component_id, "X");
    }

    #[test]
    fn prune_keeps_only_the_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.json")), b"{}").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        prune_old_files(dir.path(), 2).unwrap();
        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(remaining.len(), 2);
        assert!(dir.path().join("f3.json").exists());
        assert!(dir.path().join("f4.json").exists());
    }

    #[test]
    fn load_all_sorts_by_priority_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let mut high = sample_snapshot();
        high.priority = 5;
        high.component_id = "low-prio".into();
        let mut low = sample_snapshot();
        low.priority = 1;
        low.component_id = "high-prio".into();
        let file = SnapshotFile {
            version: SNAPSHOT_FILE_VERSION.to_string(),
            timestamp: 0,
            trigger: "TIMEOUT".into(),
            trigger_details: String::new(),
            snapshots: vec![entry_from_snapshot(high, false), entry_from_snapshot(low, false)],
        };
        write_file(dir.path(), "snap.json", &file).unwrap();
        let loaded = load_all(dir.path()).unwrap();
        assert_eq!(loaded[0].component_id, "high-prio");
        assert_eq!(loaded[1].component_id, "low-prio");
    }

    #[test]
    fn load_all_on_missing_directory_is_empty() {
        let loaded = load_all(Path::new("/nonexistent/does/not/exist")).unwrap();
        assert!(loaded.is_empty());
    }
}
