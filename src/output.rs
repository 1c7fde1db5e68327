//! JSON Output Envelope Types
//!
//! This module defines the structured JSON output format for all Nowgate
//! operations. All operations return either a SuccessEnvelope or an
//! ErrorEnvelope.
//!
//! # Output Contract
//! - Success: `{"ok": true, "instance": "...", "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "instance": "...", "command": "...", "error": {"code": "...", "message": "...", "suggestion": "..."}}`
//!
//! Output is stable and suitable for programmatic parsing by agents.
//! Credentials never appear in any envelope.

use serde::{Deserialize, Serialize};

use crate::error::NowgateError;

/// Success envelope for operation results
///
/// Generic over the data type to support different operation return values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Normalized instance URL the operation ran against (empty string for
    /// operations with no instance, e.g. listing profiles)
    pub instance: String,

    /// Command that was executed (connect, disconnect, status, query, script)
    pub command: String,

    /// Operation-specific data
    pub data: T,

    /// Execution metadata
    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    /// Create a new success envelope
    pub fn new(
        instance: impl Into<String>,
        command: impl Into<String>,
        data: T,
        meta: Metadata,
    ) -> Self {
        Self {
            ok: true,
            instance: instance.into(),
            command: command.into(),
            data,
            meta,
        }
    }
}

/// Error envelope for operation failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    /// Instance URL (empty string when the failure precedes instance
    /// resolution)
    pub instance: String,

    /// Command that was attempted
    pub command: String,

    /// Error information
    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    /// Create a new error envelope
    pub fn new(
        instance: impl Into<String>,
        command: impl Into<String>,
        error: ErrorInfo,
    ) -> Self {
        Self {
            ok: false,
            instance: instance.into(),
            command: command.into(),
            error,
        }
    }

    /// Create error envelope from a NowgateError
    ///
    /// Blocked-script errors additionally carry the audit record id and
    /// the blocked-construct count as structured details, so agents can
    /// correlate the block with its audit entry without log access.
    pub fn from_error(
        instance: impl Into<String>,
        command: impl Into<String>,
        err: &NowgateError,
    ) -> Self {
        let details = match err {
            NowgateError::ScriptBlocked { execution_id, mutations_blocked, .. }
                if !execution_id.is_empty() =>
            {
                Some(serde_json::json!({
                    "audit_record": execution_id,
                    "mutations_blocked": mutations_blocked,
                }))
            }
            _ => None,
        };
        Self::new(
            instance,
            command,
            ErrorInfo {
                code: err.error_code().to_string(),
                message: err.message(),
                suggestion: err.suggestion().map(str::to_string),
                details,
            },
        )
    }
}

/// Error information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "SCRIPT_BLOCKED", "CONNECTION_FAILED")
    pub code: String,

    /// Human-readable error message (agent-appropriate, no sensitive data)
    pub message: String,

    /// Remediation hint, when one exists for the code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,

    /// Structured, code-specific detail (e.g. the audit record reference
    /// on blocked scripts)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    /// Create a new error info
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            suggestion: None,
            details: None,
        }
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Execution time in milliseconds
    pub execution_ms: u64,

    /// Number of records returned (for query results, None otherwise)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_returned: Option<usize>,
}

impl Metadata {
    /// Create new metadata with just execution time
    pub fn new(execution_ms: u64) -> Self {
        Self {
            execution_ms,
            records_returned: None,
        }
    }

    /// Create new metadata with execution time and record count
    pub fn with_records(execution_ms: u64, records_returned: usize) -> Self {
        Self {
            execution_ms,
            records_returned: Some(records_returned),
        }
    }
}
