//! Credential Resolution
//!
//! This module turns explicit connection parameters or a named stored
//! profile into a concrete [`AuthConfig`]. It is pure data transformation:
//! no network access happens here, and validation failures surface as
//! `AUTHENTICATION_FAILED` before any transport is constructed.
//!
//! # Auth Variants
//! - `basic` - username + password, sent as an HTTP Basic header
//! - `oauth` - client id + secret, with an access token obtained out of band
//! - `token` - a raw bearer token
//!
//! `AuthConfig` is a tagged union; every consumption site matches it
//! exhaustively so a new variant is a compile-time gap, not a silent default.

use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::{NowgateError, Result};

/// Supported authentication modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// Username + password
    Basic,
    /// OAuth client credentials with a bearer access token
    OAuth,
    /// Raw API token
    Token,
}

impl AuthType {
    /// Get the auth type name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::OAuth => "oauth",
            Self::Token => "token",
        }
    }
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AuthType {
    type Err = NowgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "oauth" => Ok(Self::OAuth),
            "token" => Ok(Self::Token),
            other => Err(NowgateError::authentication_failed(format!(
                "Unknown auth type '{other}'. Expected one of: basic, oauth, token"
            ))),
        }
    }
}

/// Concrete authentication configuration
///
/// Fields present always match the variant's tag; a partially populated
/// config cannot be constructed.
///
/// WARNING: Contains credentials. Never serialize into logs or tool output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// HTTP Basic authentication
    Basic { username: String, password: String },

    /// OAuth client credentials
    ///
    /// The access token is obtained out of band (or via a stored profile);
    /// header construction fails with `AUTHENTICATION_FAILED` when it is
    /// absent rather than sending an unauthenticated request.
    OAuth {
        client_id: String,
        client_secret: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        /// Access token expiry, RFC 3339
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// Raw bearer token
    Token { token: String },
}

impl AuthConfig {
    /// The tag of this variant
    #[must_use]
    pub const fn auth_type(&self) -> AuthType {
        match self {
            Self::Basic { .. } => AuthType::Basic,
            Self::OAuth { .. } => AuthType::OAuth,
            Self::Token { .. } => AuthType::Token,
        }
    }
}

/// Input parameters for credential resolution
///
/// Callers supply either `profile` (looked up in the profile store) or an
/// explicit `auth_type` with the matching credential fields.
#[derive(Debug, Clone, Default)]
pub struct AuthParams {
    pub auth_type: Option<AuthType>,
    pub profile: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Resolution result: the auth config plus the instance a profile points at
///
/// Explicit-parameter resolution carries no instance; profile resolution
/// returns the instance stored with the profile so callers can omit it.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub config: AuthConfig,
    pub profile_instance: Option<String>,
}

/// Resolve authentication parameters into a concrete [`AuthConfig`]
///
/// Resolution order:
/// 1. If `profile` is set, load the named profile from the store (explicit
///    fields are ignored).
/// 2. Otherwise require `auth_type` and its matching credential fields:
///    basic needs username + password, token needs token, oauth needs
///    client id + client secret.
///
/// # Errors
/// `AUTHENTICATION_FAILED` when the profile is unknown or required fields
/// for the chosen variant are missing.
pub fn resolve_auth(params: &AuthParams) -> Result<ResolvedAuth> {
    if let Some(name) = &params.profile {
        let profile = config::resolve_profile(name)?;
        let instance = profile.instance.clone();
        let auth = profile.into_auth_config()?;
        return Ok(ResolvedAuth { config: auth, profile_instance: Some(instance) });
    }

    let auth_type = params.auth_type.ok_or_else(|| {
        NowgateError::authentication_failed(
            "No credentials given. Pass --profile, or --auth-type with matching credentials",
        )
    })?;

    let config = match auth_type {
        AuthType::Basic => {
            let username = require(params.username.as_deref(), "basic", "username")?;
            let password = require(params.password.as_deref(), "basic", "password")?;
            AuthConfig::Basic { username, password }
        }
        AuthType::Token => {
            let token = require(params.token.as_deref(), "token", "token")?;
            AuthConfig::Token { token }
        }
        AuthType::OAuth => {
            let client_id = require(params.client_id.as_deref(), "oauth", "client_id")?;
            let client_secret = require(params.client_secret.as_deref(), "oauth", "client_secret")?;
            AuthConfig::OAuth {
                client_id,
                client_secret,
                access_token: params.token.clone(),
                refresh_token: None,
                expires_at: None,
            }
        }
    };

    Ok(ResolvedAuth { config, profile_instance: None })
}

fn require(value: Option<&str>, variant: &str, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(NowgateError::authentication_failed(format!(
            "Auth type '{variant}' requires '{field}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_type_parsing() {
        assert_eq!("basic".parse::<AuthType>().unwrap(), AuthType::Basic);
        assert_eq!("OAuth".parse::<AuthType>().unwrap(), AuthType::OAuth);
        assert_eq!("TOKEN".parse::<AuthType>().unwrap(), AuthType::Token);
        assert!("kerberos".parse::<AuthType>().is_err());
    }

    #[test]
    fn test_resolve_basic() {
        let params = AuthParams {
            auth_type: Some(AuthType::Basic),
            username: Some("admin".into()),
            password: Some("secret".into()),
            ..Default::default()
        };
        let resolved = resolve_auth(&params).unwrap();
        assert!(matches!(
            resolved.config,
            AuthConfig::Basic { ref username, .. } if username == "admin"
        ));
        assert!(resolved.profile_instance.is_none());
    }

    #[test]
    fn test_resolve_basic_missing_password() {
        let params = AuthParams {
            auth_type: Some(AuthType::Basic),
            username: Some("admin".into()),
            ..Default::default()
        };
        let err = resolve_auth(&params).unwrap_err();
        assert_eq!(err.error_code(), "AUTHENTICATION_FAILED");
        assert!(err.message().contains("password"));
    }

    #[test]
    fn test_resolve_token() {
        let params = AuthParams {
            auth_type: Some(AuthType::Token),
            token: Some("abc123".into()),
            ..Default::default()
        };
        let resolved = resolve_auth(&params).unwrap();
        assert!(matches!(resolved.config, AuthConfig::Token { ref token } if token == "abc123"));
    }

    #[test]
    fn test_resolve_token_empty_rejected() {
        let params = AuthParams {
            auth_type: Some(AuthType::Token),
            token: Some(String::new()),
            ..Default::default()
        };
        assert!(resolve_auth(&params).is_err());
    }

    #[test]
    fn test_resolve_oauth_requires_client_pair() {
        let params = AuthParams {
            auth_type: Some(AuthType::OAuth),
            client_id: Some("cid".into()),
            ..Default::default()
        };
        let err = resolve_auth(&params).unwrap_err();
        assert!(err.message().contains("client_secret"));

        let params = AuthParams {
            auth_type: Some(AuthType::OAuth),
            client_id: Some("cid".into()),
            client_secret: Some("shh".into()),
            ..Default::default()
        };
        let resolved = resolve_auth(&params).unwrap();
        assert_eq!(resolved.config.auth_type(), AuthType::OAuth);
    }

    #[test]
    fn test_resolve_nothing_given() {
        let err = resolve_auth(&AuthParams::default()).unwrap_err();
        assert_eq!(err.error_code(), "AUTHENTICATION_FAILED");
    }

    #[test]
    fn test_auth_config_serde_tag() {
        let cfg = AuthConfig::Basic { username: "u".into(), password: "p".into() };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains(r#""type":"basic""#));

        let cfg: AuthConfig = serde_json::from_str(r#"{"type":"token","token":"t"}"#).unwrap();
        assert_eq!(cfg.auth_type(), AuthType::Token);
    }
}
