// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! Correlation identifier propagated by the logger (spec.md §3).

use std::fmt;
use uuid::Uuid;

/// Opaque 32-character lowercase hexadecimal value assigned per top-level
/// operation and threaded into every log record it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CorrelationId([u8; 32]);

impl CorrelationId {
    /// Generates a fresh correlation id: 32 lowercase hex digits, the same
    /// shape `uuid`'s "simple" rendering produces for a v4 UUID.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self::from_str_exact(&hex).expect("uuid simple() is always 32 hex chars")
    }

    /// Parses a correlation id from an existing 32-hex-digit string
    /// (e.g. one read back from a log line).
    pub fn from_str_exact(s: &str) -> Option<Self> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut buf = [0u8; 32];
        buf.copy_from_slice(s.to_ascii_lowercase().as_bytes());
        Some(Self(buf))
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: constructed only from ASCII hex digits.
        std::str::from_utf8(&self.0).expect("correlation id is always ASCII hex")
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
