//! Credential Profile Store
//!
//! This module handles loading and saving named credential profiles.
//!
//! # Store Location
//! - Default: `~/.config/nowgate/profiles.json` (per-user)
//! - Override: `NOWGATE_PROFILES` environment variable (absolute path)
//!
//! # Named Profiles
//! Profiles are stored by name (e.g., "dev", "prod") and bundle an instance
//! URL with one auth variant's fields. At most one profile name is marked as
//! the store's `default`. Secrets may be stored indirectly through
//! `password_env` / `token_env` so the JSON file never holds them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::auth::{AuthConfig, AuthType};
use crate::error::{NowgateError, Result};

/// A named, persisted credential bundle
///
/// Only the fields matching `auth_type` are consulted; the rest stay `None`.
/// Secrets can be referenced via environment variables instead of being
/// written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialProfile {
    /// Instance URL or bare instance name this profile connects to
    pub instance: String,

    /// Which auth variant this profile carries
    #[serde(rename = "type")]
    pub auth_type: AuthType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password stored directly (discouraged; prefer `password_env`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable holding the password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Environment variable holding the token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl CredentialProfile {
    /// Resolve env-var indirection and build the matching [`AuthConfig`]
    ///
    /// # Errors
    /// `AUTHENTICATION_FAILED` when fields required by `auth_type` are
    /// missing or a referenced environment variable is unset.
    pub fn into_auth_config(self) -> Result<AuthConfig> {
        match self.auth_type {
            AuthType::Basic => {
                let username = self.username.ok_or_else(|| {
                    NowgateError::authentication_failed("Profile is 'basic' but has no username")
                })?;
                let password = resolve_secret(self.password, self.password_env.as_deref())
                    .ok_or_else(|| {
                        NowgateError::authentication_failed(
                            "Profile is 'basic' but has no password (set 'password' or 'password_env')",
                        )
                    })?;
                Ok(AuthConfig::Basic { username, password })
            }
            AuthType::Token => {
                let token =
                    resolve_secret(self.token, self.token_env.as_deref()).ok_or_else(|| {
                        NowgateError::authentication_failed(
                            "Profile is 'token' but has no token (set 'token' or 'token_env')",
                        )
                    })?;
                Ok(AuthConfig::Token { token })
            }
            AuthType::OAuth => {
                let client_id = self.client_id.ok_or_else(|| {
                    NowgateError::authentication_failed("Profile is 'oauth' but has no client_id")
                })?;
                let client_secret = self.client_secret.ok_or_else(|| {
                    NowgateError::authentication_failed(
                        "Profile is 'oauth' but has no client_secret",
                    )
                })?;
                Ok(AuthConfig::OAuth {
                    client_id,
                    client_secret,
                    access_token: resolve_secret(self.token, self.token_env.as_deref()),
                    refresh_token: self.refresh_token,
                    expires_at: None,
                })
            }
        }
    }
}

fn resolve_secret(direct: Option<String>, env_var: Option<&str>) -> Option<String> {
    // Direct value wins; env indirection is the fallback
    if direct.is_some() {
        return direct;
    }
    env_var.and_then(|v| std::env::var(v).ok())
}

/// On-disk registry of credential profiles
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileRegistry {
    /// Named profiles
    pub profiles: HashMap<String, CredentialProfile>,

    /// Name of the default profile (must exist in `profiles`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Get the path to the profile store
///
/// `NOWGATE_PROFILES` overrides the default
/// `~/.config/nowgate/profiles.json`.
pub fn profiles_path() -> Result<PathBuf> {
    if let Ok(custom) = std::env::var("NOWGATE_PROFILES") {
        return Ok(PathBuf::from(custom));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| NowgateError::unknown("Could not determine user config directory"))?;

    Ok(config_dir.join("nowgate").join("profiles.json"))
}

/// Load the profile registry from a store file
///
/// A missing file yields an empty registry, not an error.
pub fn load_registry(path: &Path) -> Result<ProfileRegistry> {
    if !path.exists() {
        return Ok(ProfileRegistry::default());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| NowgateError::unknown(format!("Could not read profile store: {e}")))?;

    serde_json::from_str::<ProfileRegistry>(&contents)
        .map_err(|e| NowgateError::unknown(format!("Invalid profile store format: {e}")))
}

/// Save the profile registry to a store file
///
/// Creates parent directories as needed. On Unix the file is written with
/// mode 0o600 since it may contain secrets.
pub fn save_registry(path: &Path, registry: &ProfileRegistry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| NowgateError::unknown(format!("Could not create config directory: {e}")))?;
    }

    let contents = serde_json::to_string_pretty(registry)
        .map_err(|e| NowgateError::unknown(format!("Could not serialize profile store: {e}")))?;

    fs::write(path, contents)
        .map_err(|e| NowgateError::unknown(format!("Could not write profile store: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .map_err(|e| NowgateError::unknown(format!("Could not restrict store permissions: {e}")))?;
    }

    Ok(())
}

/// Resolve a profile by name from the store
///
/// # Errors
/// `AUTHENTICATION_FAILED` when no profile with that name exists; the
/// message lists the available names.
pub fn resolve_profile(name: &str) -> Result<CredentialProfile> {
    let registry = load_registry(&profiles_path()?)?;

    registry.profiles.get(name).cloned().ok_or_else(|| {
        let mut available: Vec<_> = registry.profiles.keys().cloned().collect();
        available.sort();
        NowgateError::authentication_failed(format!(
            "Profile '{name}' not found. Available profiles: {available:?}"
        ))
    })
}

/// Resolve the store's default profile
///
/// # Errors
/// `AUTHENTICATION_FAILED` when no default is set or the pointer is stale.
pub fn resolve_default_profile() -> Result<(String, CredentialProfile)> {
    let registry = load_registry(&profiles_path()?)?;

    let name = registry.default.clone().ok_or_else(|| {
        NowgateError::authentication_failed(
            "No default profile set. Save one with 'nowgate connect --save <name>'",
        )
    })?;

    let profile = registry.profiles.get(&name).cloned().ok_or_else(|| {
        NowgateError::authentication_failed(format!(
            "Default profile '{name}' points at a profile that no longer exists"
        ))
    })?;

    Ok((name, profile))
}

/// Save (or replace) a named profile
///
/// The first profile saved into an empty store becomes the default.
pub fn save_profile(name: &str, profile: CredentialProfile) -> Result<()> {
    let path = profiles_path()?;
    let mut registry = load_registry(&path)?;

    let is_first = registry.profiles.is_empty();
    registry.profiles.insert(name.to_string(), profile);
    if is_first {
        registry.default = Some(name.to_string());
    }

    save_registry(&path, &registry)
}

/// A profile listing entry with secrets stripped
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSummary {
    pub name: String,
    pub instance: String,
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    pub is_default: bool,
}

/// List stored profiles without exposing any secret material
pub fn list_profiles() -> Result<Vec<ProfileSummary>> {
    let registry = load_registry(&profiles_path()?)?;

    let mut summaries: Vec<ProfileSummary> = registry
        .profiles
        .iter()
        .map(|(name, profile)| ProfileSummary {
            name: name.clone(),
            instance: profile.instance.clone(),
            auth_type: profile.auth_type,
            is_default: registry.default.as_deref() == Some(name),
        })
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(summaries)
}
