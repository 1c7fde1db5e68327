//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout Nowgate.
//! Error kinds form a closed taxonomy: transport failures are classified
//! exactly once at the HTTP boundary and are never re-wrapped further up
//! the call chain.
//!
//! # Error Categories
//! - Connection/auth: `ConnectionFailed`, `AuthenticationFailed`, `TokenExpired`
//! - Instance reachability: `InstanceUnavailable`, `InvalidInstance`
//! - Authorization: `AclDenied`, `RoleRequired`, `TableNotAccessible`
//! - Script execution: `ScriptTimeout`, `ScriptError`, `ScriptBlocked`
//! - Query/limits: `QueryError`, `RateLimited`, `QuotaExceeded`
//! - Guardrail: `DangerousOperation`, `SensitiveData`
//! - Fallback: `UnknownError`
//!
//! The retryable subset (`InstanceUnavailable`, `TokenExpired`, `RateLimited`)
//! is retried transparently inside the transport client; everything else
//! surfaces immediately.

use thiserror::Error;

/// Main error type for Nowgate operations
#[derive(Error, Debug, Clone)]
pub enum NowgateError {
    /// Could not establish a connection to the instance
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Credentials were rejected or incomplete
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// OAuth access token has expired
    #[error("Token expired: {0}")]
    TokenExpired(String),

    /// Instance is unreachable or returned a server error
    #[error("Instance unavailable: {0}")]
    InstanceUnavailable(String),

    /// Instance URL or name could not be interpreted
    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    /// Instance-side access control denied the request
    #[error("Access denied by instance ACL: {0}")]
    AclDenied(String),

    /// Operation requires a role the connected user lacks
    #[error("Role required: {0}")]
    RoleRequired(String),

    /// Table does not exist or is not visible to the connected user
    #[error("Table not accessible: {0}")]
    TableNotAccessible(String),

    /// Script execution exceeded its timeout
    #[error("Script timed out: {0}")]
    ScriptTimeout(String),

    /// Script execution failed on the instance
    #[error("Script error: {0}")]
    ScriptError(String),

    /// Script was blocked by the safety analyzer before dispatch
    ///
    /// Carries the audit record id so callers can correlate the block with
    /// its audit entry, and the count of blocked mutating constructs.
    #[error("Script blocked ({category}): {reason}")]
    ScriptBlocked {
        category: String,
        reason: String,
        execution_id: String,
        mutations_blocked: u32,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryError(String),

    /// Instance rate limit hit (HTTP 429)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Instance-side quota exhausted
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Operation is categorically dangerous and not permitted
    #[error("Dangerous operation: {0}")]
    DangerousOperation(String),

    /// Payload contains sensitive data that must not transit
    #[error("Sensitive data detected: {0}")]
    SensitiveData(String),

    /// Anything that does not map to a known kind
    #[error("Unknown error: {0}")]
    UnknownError(String),
}

impl NowgateError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling by agents.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::TokenExpired(_) => "TOKEN_EXPIRED",
            Self::InstanceUnavailable(_) => "INSTANCE_UNAVAILABLE",
            Self::InvalidInstance(_) => "INVALID_INSTANCE",
            Self::AclDenied(_) => "ACL_DENIED",
            Self::RoleRequired(_) => "ROLE_REQUIRED",
            Self::TableNotAccessible(_) => "TABLE_NOT_ACCESSIBLE",
            Self::ScriptTimeout(_) => "SCRIPT_TIMEOUT",
            Self::ScriptError(_) => "SCRIPT_ERROR",
            Self::ScriptBlocked { .. } => "SCRIPT_BLOCKED",
            Self::QueryError(_) => "QUERY_ERROR",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::DangerousOperation(_) => "DANGEROUS_OPERATION",
            Self::SensitiveData(_) => "SENSITIVE_DATA",
            Self::UnknownError(_) => "UNKNOWN_ERROR",
        }
    }

    /// Get human-readable error message (agent-appropriate, no sensitive data)
    ///
    /// This message is safe to include in JSON output.
    /// It does not contain credentials or other sensitive information.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Remediation suggestion for the caller, where one exists
    ///
    /// Suggestions are static, agent-actionable hints; kinds without an
    /// obvious remediation return `None`.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ConnectionFailed(_) | Self::InstanceUnavailable(_) => Some(
                "Check that the instance is awake and reachable. Developer instances hibernate after inactivity and need to be woken from the developer portal.",
            ),
            Self::AuthenticationFailed(_) => {
                Some("Verify the username/password or token, or re-run connect with a valid profile.")
            }
            Self::TokenExpired(_) => Some("Obtain a fresh access token and reconnect."),
            Self::InvalidInstance(_) => Some(
                "Pass either a full https:// URL or a bare instance name like 'dev123456'.",
            ),
            Self::AclDenied(_) | Self::RoleRequired(_) => {
                Some("The connected user lacks the required role. Ask an instance admin to grant it.")
            }
            Self::TableNotAccessible(_) => {
                Some("Check the table name spelling and the connected user's read access to it.")
            }
            Self::RateLimited(_) => {
                Some("Reduce request frequency; the client already backs off automatically.")
            }
            Self::ScriptBlocked { .. } | Self::DangerousOperation(_) => Some(
                "Rewrite the script without the flagged operation, or run it manually through the instance UI where instance-side controls apply.",
            ),
            _ => None,
        }
    }

    /// Whether the transport client may transparently retry this error
    ///
    /// Only transient kinds are retryable; guardrail blocks and auth
    /// failures always surface immediately.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InstanceUnavailable(_) | Self::TokenExpired(_) | Self::RateLimited(_)
        )
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create an authentication failed error
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed(message.into())
    }

    /// Create an instance unavailable error
    pub fn instance_unavailable(message: impl Into<String>) -> Self {
        Self::InstanceUnavailable(message.into())
    }

    /// Create an invalid instance error
    pub fn invalid_instance(message: impl Into<String>) -> Self {
        Self::InvalidInstance(message.into())
    }

    /// Create a script blocked error with the matched rule category
    ///
    /// The audit reference fields start empty; the script pipeline fills
    /// them when it has minted the record.
    pub fn script_blocked(category: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ScriptBlocked {
            category: category.into(),
            reason: reason.into(),
            execution_id: String::new(),
            mutations_blocked: 0,
        }
    }

    /// Create a query error
    pub fn query_error(message: impl Into<String>) -> Self {
        Self::QueryError(message.into())
    }

    /// Create an unknown error
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::UnknownError(message.into())
    }
}

/// Result type alias for Nowgate operations
pub type Result<T> = std::result::Result<T, NowgateError>;
