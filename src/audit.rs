//! The append-only audit log.
//!
//! Every noteworthy event of a run is appended to a JSON-lines file: one
//! object per line with a fixed field set, so the log can be consumed by
//! anything that reads JSON without knowing our types.

use std::fs;
use std::io::Write;
use std::path::Path;
use chrono::{DateTime, Utc};
use log::{error, warn};
use crate::asn::Asn;
use crate::error::Failed;
use crate::utils::sync::Mutex;


//------------ AuditEvent ----------------------------------------------------

/// A single audit event.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct AuditEvent {
    /// When the event happened.
    pub ts: DateTime<Utc>,

    /// The event name, dotted hierarchical, e.g. `apply.confirmed`.
    pub event: String,

    /// The router concerned, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "router")]
    pub router: Option<String>,

    /// The AS number concerned, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "as")]
    pub as_number: Option<Asn>,

    /// The outcome: `ok`, `failed`, `blocked`, `skipped`.
    pub outcome: String,

    /// Free-form detail.
    pub detail: String,
}

impl AuditEvent {
    /// Creates an event happening now.
    pub fn new(event: &str, outcome: &str, detail: String) -> Self {
        AuditEvent {
            ts: Utc::now(),
            event: event.into(),
            router: None,
            as_number: None,
            outcome: outcome.into(),
            detail,
        }
    }

    /// Sets the router of the event.
    pub fn router(mut self, hostname: &str) -> Self {
        self.router = Some(hostname.into());
        self
    }

    /// Sets the AS number of the event.
    pub fn as_number(mut self, asn: Asn) -> Self {
        self.as_number = Some(asn);
        self
    }
}


//------------ AuditLog ------------------------------------------------------

/// The audit log writer.
///
/// Events are serialized and appended under a mutex so concurrent
/// workers never interleave partial lines. A failed write is logged but
/// never fails the operation that produced the event.
#[derive(Debug)]
pub struct AuditLog {
    file: Mutex<fs::File>,
}

impl AuditLog {
    /// Opens the audit log for appending, creating it if necessary.
    pub fn open(path: &Path) -> Result<Self, Failed> {
        if let Some(parent) = path.parent() {
            crate::utils::fatal::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true).append(true)
            .open(path)
            .map_err(|err| {
                error!(
                    "Failed to open audit log {}: {}",
                    path.display(), err
                );
                Failed
            })?;
        Ok(AuditLog { file: Mutex::new(file) })
    }

    /// Appends an event.
    pub fn record(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                warn!("Failed to serialize audit event: {}", err);
                return
            }
        };
        let mut file = self.file.lock();
        if let Err(err) = writeln!(file, "{}", line) {
            warn!("Failed to write audit event: {}", err);
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_are_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        log.record(
            AuditEvent::new("apply.confirmed", "ok", "committed".into())
                .router("edge1")
                .as_number(Asn::from_u32(13335))
        );
        log.record(
            AuditEvent::new("rpki.preflight.failed", "failed",
                "cache stale".into())
        );

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value =
            serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "apply.confirmed");
        assert_eq!(first["router"], "edge1");
        assert_eq!(first["as"], 13335);
        assert_eq!(first["outcome"], "ok");

        let second: serde_json::Value =
            serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "rpki.preflight.failed");
        assert!(second.get("router").is_none());
    }
}
