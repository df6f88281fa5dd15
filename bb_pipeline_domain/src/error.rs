// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Core Error Taxonomy
//!
//! A single closed error enum shared by every core component, grounded in
//! the same `thiserror`-derived, category-tagged shape the rest of the
//! pipeline uses for its own errors. Components report errors through
//! their idiomatic channel (returned `Result`, callback, or severity-tagged
//! record) and keep operating — only the error-recovery executor retries.

use thiserror::Error;

/// Severity used by schema validation records (spec.md §4.7, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

/// The kinds of errors the error-recovery executor (C4) is able to
/// classify as recoverable (spec.md §4.4, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RecoverableErrorKind {
    NetworkTimeout,
    ConnectionRefused,
    DnsResolution,
    SslHandshake,
    Http5xx,
    Http429,
    SocketError,
    TemporaryFailure,
    Custom,
}

impl RecoverableErrorKind {
    /// All built-in (non-custom) kinds, used to seed a classifier's
    /// default recoverable set.
    pub const ALL: [RecoverableErrorKind; 9] = [
        RecoverableErrorKind::NetworkTimeout,
        RecoverableErrorKind::ConnectionRefused,
        RecoverableErrorKind::DnsResolution,
        RecoverableErrorKind::SslHandshake,
        RecoverableErrorKind::Http5xx,
        RecoverableErrorKind::Http429,
        RecoverableErrorKind::SocketError,
        RecoverableErrorKind::TemporaryFailure,
        RecoverableErrorKind::Custom,
    ];
}

/// Domain-wide error type for the BB-Pipeline core.
///
/// Each variant maps to one row of the taxonomy in spec.md §7. Parser
/// errors, recoverable-error classifications, and terminal
/// error-recovery outcomes all live in the same enum so that a tenant
/// catching `CoreError` at a boundary sees one type regardless of which
/// component raised it.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    // --- CSV parser (C6) ---
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("file read error: {0}")]
    FileReadError(String),
    #[error("encoding error: {0}")]
    EncodingError(String),
    #[error("malformed row {row}: {message}")]
    MalformedRow { row: u64, message: String },
    #[error("buffer overflow: {0}")]
    BufferOverflow(String),
    #[error("allocation failure: {0}")]
    AllocationFailure(String),
    #[error("callback error: {0}")]
    CallbackError(String),
    #[error("thread error: {0}")]
    ThreadError(String),

    // --- error-recovery executor (C4) ---
    #[error("recoverable error ({kind:?}): {message}")]
    Recoverable {
        kind: RecoverableErrorKind,
        message: String,
    },
    #[error("non-recoverable: {0}")]
    NonRecoverable(String),
    #[error("retry exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },

    // --- schema validator (C7) ---
    #[error("validation error on field '{field}' (row {row}, col {col}): {message}")]
    Validation {
        severity: Severity,
        field: String,
        row: u64,
        col: u64,
        message: String,
    },

    // --- logger (C1) ---
    #[error("could not open log file: {0}")]
    OpenFileError(String),

    // --- pool allocator (C2) ---
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    // --- generic ---
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl CoreError {
    /// Returns a short, stable category tag, mirroring the teacher's
    /// `PipelineError::category()` classifier.
    pub fn category(&self) -> &'static str {
        match self {
            CoreError::FileNotFound(_) => "csv.file_not_found",
            CoreError::FileReadError(_) => "csv.file_read",
            CoreError::EncodingError(_) => "csv.encoding",
            CoreError::MalformedRow { .. } => "csv.malformed_row",
            CoreError::BufferOverflow(_) => "csv.buffer_overflow",
            CoreError::AllocationFailure(_) => "memory.allocation_failure",
            CoreError::CallbackError(_) => "csv.callback",
            CoreError::ThreadError(_) => "csv.thread",
            CoreError::Recoverable { .. } => "recovery.recoverable",
            CoreError::NonRecoverable(_) => "recovery.non_recoverable",
            CoreError::RetryExhausted { .. } => "recovery.retry_exhausted",
            CoreError::Validation { .. } => "schema.validation",
            CoreError::OpenFileError(_) => "logging.open_file",
            CoreError::PoolExhausted(_) => "memory.pool_exhausted",
            CoreError::InvalidHandle(_) => "memory.invalid_handle",
            CoreError::InvalidConfiguration(_) => "config.invalid",
            CoreError::InternalError(_) => "internal",
        }
    }

    /// Whether the error, if raised again, is worth a retry. Only the
    /// error-recovery executor consults this; other components never
    /// retry on their own (spec.md §7 propagation policy).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::Recoverable { .. })
    }

    pub fn malformed_row(row: u64, message: impl Into<String>) -> Self {
        Self::MalformedRow { row, message: message.into() }
    }

    pub fn validation(severity: Severity, field: impl Into<String>, row: u64, col: u64, message: impl Into<String>) -> Self {
        Self::Validation {
            severity,
            field: field.into(),
            row,
            col,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => CoreError::FileNotFound(err.to_string()),
            _ => CoreError::FileReadError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InternalError(format!("serialization error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_is_stable_per_variant() {
        assert_eq!(CoreError::FileNotFound("x".into()).category(), "csv.file_not_found");
        assert_eq!(
            CoreError::Recoverable {
                kind: RecoverableErrorKind::Http429,
                message: "rate limited".into()
            }
            .category(),
            "recovery.recoverable"
        );
    }

    #[test]
    fn only_recoverable_variant_is_recoverable() {
        assert!(CoreError::Recoverable {
            kind: RecoverableErrorKind::NetworkTimeout,
            message: "timeout".into()
        }
        .is_recoverable());
        assert!(!CoreError::NonRecoverable("nope".into()).is_recoverable());
    }

    #[test]
    fn io_not_found_maps_to_file_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CoreError = io_err.into();
        assert!(matches!(err, CoreError::FileNotFound(_)));
    }
}
