// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! State snapshot value object (spec.md §3, §4.8, §6).

use std::collections::HashMap;
use std::time::Duration;

/// One component's serialized state, produced by a
/// `SnapshotSource::snapshot()` hook during kill-switch phase 2.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StateSnapshot {
    pub component_id: String,
    pub operation_id: String,
    pub timestamp_secs: u64,
    pub state_type: String,
    /// Raw payload bytes, possibly zlib-deflated by the orchestrator
    /// before being embedded in the snapshot file (base64-encoded on the
    /// wire; see `bb_pipeline_orchestrator::snapshot_file`).
    pub state_data: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub data_size: u64,
    /// CRC-32 (polynomial 0xEDB88320) of `state_data` *before*
    /// compression. Recomputed on load; a mismatch rejects the snapshot.
    pub checksum: u32,
    /// Lower value = higher recovery priority.
    pub priority: i32,
    pub expiry: Option<Duration>,
}

impl StateSnapshot {
    pub fn checksum_of(data: &[u8]) -> u32 {
        crc32fast_checksum(data)
    }
}

/// Minimal CRC-32 (reflected, polynomial 0xEDB88320) so the domain crate
/// has no infrastructure dependency on a compression/checksum crate; the
/// orchestrator uses the faster `crc32fast` crate for the same
/// polynomial and the two must agree (pinned by the cross-crate test in
/// `bb_pipeline_orchestrator`).
fn crc32fast_checksum(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}
