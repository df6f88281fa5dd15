// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! Structured log record entity (spec.md §3, §4.1).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::value_objects::correlation_id::CorrelationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One emitted log line. Has identity (a timestamp + thread + message are
/// never deduplicated against each other), which is why this lives under
/// `entities` rather than `value_objects`.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub module: String,
    pub thread_id: String,
    pub correlation_id: Option<CorrelationId>,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

impl LogRecord {
    pub fn new(severity: Severity, module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            module: module.into(),
            thread_id: format!("{:?}", std::thread::current().id()),
            correlation_id: None,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Renders one NDJSON line (no trailing newline; the sink appends it).
    pub fn to_ndjson(&self) -> String {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "timestamp".into(),
            serde_json::Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        // spec.md §6: the key is `level`, values uppercase DEBUG/INFO/WARN/ERROR.
        obj.insert("level".into(), serde_json::Value::String(self.severity.to_string().to_uppercase()));
        obj.insert("module".into(), serde_json::Value::String(self.module.clone()));
        obj.insert("thread_id".into(), serde_json::Value::String(self.thread_id.clone()));
        if let Some(id) = &self.correlation_id {
            obj.insert("correlation_id".into(), serde_json::Value::String(id.as_str().to_string()));
        }
        obj.insert("message".into(), serde_json::Value::String(self.message.clone()));
        if !self.metadata.is_empty() {
            let meta = self.metadata.iter().map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()))).collect();
            obj.insert("metadata".into(), serde_json::Value::Object(meta));
        }
        serde_json::Value::Object(obj).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_line_is_single_line_valid_json() {
        let record = LogRecord::new(Severity::Info, "rate_limiter", "token bucket refilled").with_metadata("domain", "example.com");
        let line = record.to_ndjson();
        assert!(!line.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["level"], "INFO");
        assert_eq!(parsed["metadata"]["domain"], "example.com");
    }

    #[test]
    fn correlation_id_omitted_when_absent() {
        let record = LogRecord::new(Severity::Debug, "m", "msg");
        let line = record.to_ndjson();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(parsed.get("correlation_id").is_none());
    }
}
