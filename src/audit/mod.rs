//! Audit Recording
//!
//! Append-only log of script submissions. Every submission produces exactly
//! one record, whether it was blocked before dispatch, failed on the
//! instance, or completed. Records accumulate in memory for the lifetime of
//! the process and can additionally be mirrored to a JSONL file.
//!
//! Recording never fails the operation being audited: a mirror write error
//! is logged and swallowed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::safety::ExecutionMode;

/// Maximum script text carried verbatim in a record; longer scripts keep
/// a prefix plus the content hash
const PREVIEW_MAX_CHARS: usize = 200;

/// Terminal status of one script submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// Dispatched and completed
    Success,
    /// Dispatched but the instance reported an error or timeout
    Failure,
    /// Rejected by safety analysis; never reached the transport
    Blocked,
}

impl AuditStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Blocked => "blocked",
        }
    }
}

/// One audit record per script submission
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// User name of the session that submitted the script
    pub actor: String,
    /// Normalized instance URL the submission targeted
    pub instance: String,
    /// Script text, truncated to a preview for long scripts
    pub script_preview: String,
    /// FNV-1a hash of the full script text, for correlating truncated previews
    pub script_hash: String,
    pub mode: ExecutionMode,
    pub status: AuditStatus,
    /// Wall-clock duration of the dispatch; absent for blocked submissions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    pub mutations_blocked: u32,
}

impl AuditRecord {
    /// Build a record for a submission, hashing and previewing the script
    #[must_use]
    pub fn new(
        actor: &str,
        instance: &str,
        script: &str,
        mode: ExecutionMode,
        status: AuditStatus,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            instance: instance.to_string(),
            script_preview: preview(script),
            script_hash: format!("{:016x}", fnv1a(script)),
            mode,
            status,
            duration_ms: None,
            blocked_reason: None,
            mutations_blocked: 0,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    #[must_use]
    pub fn with_block(mut self, reason: String, mutations_blocked: u32) -> Self {
        self.blocked_reason = Some(reason);
        self.mutations_blocked = mutations_blocked;
        self
    }
}

fn preview(script: &str) -> String {
    if script.chars().count() <= PREVIEW_MAX_CHARS {
        script.to_string()
    } else {
        let mut p: String = script.chars().take(PREVIEW_MAX_CHARS).collect();
        p.push_str("...");
        p
    }
}

/// FNV-1a, 64-bit
fn fnv1a(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Append-only recorder with an optional JSONL file mirror
pub struct AuditRecorder {
    records: Mutex<Vec<AuditRecord>>,
    mirror: Option<PathBuf>,
}

impl AuditRecorder {
    /// In-memory only
    #[must_use]
    pub fn new() -> Self {
        Self { records: Mutex::new(Vec::new()), mirror: None }
    }

    /// In-memory plus a JSONL file appended to on every record
    #[must_use]
    pub fn with_mirror(path: PathBuf) -> Self {
        Self { records: Mutex::new(Vec::new()), mirror: Some(path) }
    }

    /// Append a record
    ///
    /// Infallible by contract: an audit failure must not break the audited
    /// operation. Mirror write errors are logged at warn and dropped.
    pub fn record(&self, record: AuditRecord) {
        if let Some(path) = &self.mirror {
            if let Err(e) = append_jsonl(path, &record) {
                tracing::warn!(path = %path.display(), error = %e, "audit mirror write failed");
            }
        }
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            // A poisoned lock means a panic mid-push; keep recording
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    /// Snapshot of all records, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self.records.lock() {
            Ok(records) => records.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn append_jsonl(path: &PathBuf, record: &AuditRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let recorder = AuditRecorder::new();
        assert!(recorder.is_empty());

        recorder.record(AuditRecord::new(
            "admin",
            "https://dev.service-now.com",
            "gs.info('hi');",
            ExecutionMode::Execute,
            AuditStatus::Success,
        ));
        recorder.record(
            AuditRecord::new(
                "admin",
                "https://dev.service-now.com",
                "gr.deleteMultiple();",
                ExecutionMode::Execute,
                AuditStatus::Blocked,
            )
            .with_block("record deletion".into(), 1),
        );

        let records = recorder.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, AuditStatus::Success);
        assert_eq!(records[1].status, AuditStatus::Blocked);
        assert_eq!(records[1].blocked_reason.as_deref(), Some("record deletion"));
        assert_eq!(records[1].mutations_blocked, 1);
    }

    #[test]
    fn test_preview_truncates_long_scripts() {
        let long = "x".repeat(500);
        let record = AuditRecord::new(
            "admin",
            "https://dev.service-now.com",
            &long,
            ExecutionMode::ReadOnly,
            AuditStatus::Success,
        );
        assert_eq!(record.script_preview.chars().count(), PREVIEW_MAX_CHARS + 3);
        assert!(record.script_preview.ends_with("..."));
    }

    #[test]
    fn test_hash_is_stable_and_content_sensitive() {
        let a = AuditRecord::new("u", "i", "gs.info(1);", ExecutionMode::Execute, AuditStatus::Success);
        let b = AuditRecord::new("u", "i", "gs.info(1);", ExecutionMode::Execute, AuditStatus::Success);
        let c = AuditRecord::new("u", "i", "gs.info(2);", ExecutionMode::Execute, AuditStatus::Success);
        assert_eq!(a.script_hash, b.script_hash);
        assert_ne!(a.script_hash, c.script_hash);
        assert_ne!(a.execution_id, b.execution_id);
    }

    #[test]
    fn test_mirror_appends_jsonl() {
        let dir = std::env::temp_dir().join(format!("nowgate-audit-{}", Uuid::new_v4()));
        let path = dir.join("audit.jsonl");
        let recorder = AuditRecorder::with_mirror(path.clone());

        recorder.record(AuditRecord::new(
            "admin",
            "https://dev.service-now.com",
            "gs.info('one');",
            ExecutionMode::Execute,
            AuditStatus::Success,
        ));
        recorder.record(AuditRecord::new(
            "admin",
            "https://dev.service-now.com",
            "gs.info('two');",
            ExecutionMode::Execute,
            AuditStatus::Failure,
        ));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["status"], "failure");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_mirror_failure_does_not_panic_or_drop_record() {
        // Unwritable path: parent is a file, not a directory
        let dir = std::env::temp_dir().join(format!("nowgate-audit-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let blocker = dir.join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let recorder = AuditRecorder::with_mirror(blocker.join("audit.jsonl"));
        recorder.record(AuditRecord::new(
            "admin",
            "https://dev.service-now.com",
            "gs.info('hi');",
            ExecutionMode::Execute,
            AuditStatus::Success,
        ));
        assert_eq!(recorder.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
