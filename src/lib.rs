//! Nowgate - Agent-First ServiceNow Instance Control CLI
//!
//! Nowgate is a lightweight, agent-first control surface for ServiceNow
//! instances, designed for autonomous AI coding agents. It manages
//! authenticated sessions, reads table data, and runs background scripts
//! behind a safety guardrail.
//!
//! # Core Principles
//! - Agent-first, machine-only interface (JSON-only output)
//! - Sessions are explicit: connect once, act many times, disconnect
//! - Least privilege by default (scripts run readonly unless asked otherwise)
//! - Dangerous script constructs are blocked in every mode
//! - Every script submission is audited, blocked or not
//!
//! # Architecture
//! This library provides the core functionality for both CLI and MCP
//! interfaces. Both interfaces are thin wrappers that call the same
//! internal library functions.
//!
//! # Module Organization
//! - [`error`] - Error types and handling
//! - [`output`] - JSON output envelope types
//! - [`auth`] - Credential resolution
//! - [`config`] - Credential profile store
//! - [`client`] - HTTP transport: URL normalization, auth headers, retry
//! - [`session`] - Session registry and connection manager
//! - [`safety`] - Script safety analysis
//! - [`audit`] - Append-only audit log
//! - [`script`] - Script execution pipeline
//! - [`mcp`] - MCP server - manual JSON-RPC 2.0 implementation

pub mod error;   // Error taxonomy with stable codes
pub mod output;  // JSON output envelopes
pub mod auth;    // Credential resolution
pub mod config;  // Credential profile store
pub mod client;  // Instance transport with retry
pub mod session; // Session registry and connection manager
pub mod safety;  // Script safety analysis
pub mod audit;   // Append-only audit log
pub mod script;  // Script execution pipeline
pub mod mcp;     // MCP server - manual JSON-RPC 2.0 implementation

// Re-export commonly used types for convenience
pub use error::{NowgateError, Result};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use auth::{resolve_auth, AuthConfig, AuthParams, AuthType};
pub use client::{
    map_status, normalize_instance_url, InstanceClient, InstanceIdentity, RetryPolicy, ScriptOutput,
};
pub use session::{ConnectionManager, ConnectionSession, ConnectionStatus, SessionRegistry};
pub use safety::{ExecutionMode, SafetyAnalyzer, SafetyVerdict};
pub use audit::{AuditRecord, AuditRecorder, AuditStatus};
pub use script::{ScriptExecutionRequest, ScriptRun, ScriptRunner};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_exports() {
        // Verify that key types are accessible
        let _retry = RetryPolicy::default();
        let _mode = ExecutionMode::ReadOnly;
        let _recorder = AuditRecorder::new();

        // This test ensures the public API is properly exported
        let normalized = normalize_instance_url("dev12345").unwrap();
        assert_eq!(normalized, "https://dev12345.service-now.com");
    }
}
