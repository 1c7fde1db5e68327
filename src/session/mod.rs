//! Connection and Session Management
//!
//! This module owns the registry of live instance sessions. Sessions are
//! keyed by normalized host (the same rule the transport client uses), so
//! `DEV.service-now.com`, `https://dev.service-now.com/` and
//! `dev.service-now.com` all resolve to one session.
//!
//! # Ownership
//! The registry is an explicit object injected into whatever drives it
//! (CLI command, MCP tool context) - never a module-level singleton. All
//! reads and writes go through one async mutex, so racing `connect` and
//! `disconnect` calls serialize instead of losing updates.
//!
//! # Active Session
//! "Active" is a single pointer with last-writer-wins semantics: when two
//! `connect` calls to different hosts race, whichever finishes last is
//! active. That is documented behavior, not an accident.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::auth::{resolve_auth, AuthParams, AuthType};
use crate::client::{normalize_instance_url, InstanceClient, RetryPolicy};
use crate::error::{NowgateError, Result};

/// An in-memory record binding one instance, one auth mode, and the
/// identity fetched at connect time
///
/// The session's credentials live in the bound [`InstanceClient`], not
/// here, so a session can be serialized into status output safely.
/// Sessions are replaced wholesale on re-connect to the same host; the
/// only in-place mutation is the touch-on-use `last_used` timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSession {
    pub instance_url: String,
    pub auth_type: AuthType,
    pub user_id: String,
    pub user_name: String,
    pub roles: Vec<String>,
    pub instance_version: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Connection status snapshot for observability; never fails to produce
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub session_count: usize,
}

struct SessionEntry {
    session: ConnectionSession,
    client: Arc<InstanceClient>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, SessionEntry>,
    active: Option<String>,
}

/// Registry of live sessions, keyed by normalized instance URL
#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session, replacing any existing one for the same host, and
    /// mark it active (last writer wins)
    pub async fn insert(&self, session: ConnectionSession, client: Arc<InstanceClient>) {
        let key = session.instance_url.clone();
        let mut state = self.state.lock().await;
        state.sessions.insert(key.clone(), SessionEntry { session, client });
        state.active = Some(key);
    }

    /// Remove the session for the given host (or the active one)
    ///
    /// Returns `false` - not an error - when there was nothing to remove.
    /// If the removed session was active, an arbitrary remaining session
    /// is promoted; an empty registry leaves no session active.
    pub async fn remove(&self, instance: Option<&str>) -> Result<bool> {
        let mut state = self.state.lock().await;

        let key = match instance {
            Some(raw) => normalize_instance_url(raw)?,
            None => match &state.active {
                Some(active) => active.clone(),
                None => return Ok(false),
            },
        };

        if state.sessions.remove(&key).is_none() {
            return Ok(false);
        }

        if state.active.as_deref() == Some(key.as_str()) {
            state.active = state.sessions.keys().next().cloned();
        }

        tracing::info!(instance = %key, "Disconnected");
        Ok(true)
    }

    /// Look up the client for the given host (or the active session),
    /// touching the session's `last_used` timestamp
    pub async fn client_for(&self, instance: Option<&str>) -> Result<Arc<InstanceClient>> {
        let mut state = self.state.lock().await;

        let key = match instance {
            Some(raw) => normalize_instance_url(raw)?,
            None => state.active.clone().ok_or_else(|| {
                NowgateError::connection_failed(
                    "Not connected to any instance. Run connect first",
                )
            })?,
        };

        let entry = state.sessions.get_mut(&key).ok_or_else(|| {
            NowgateError::connection_failed(format!("Not connected to '{key}'. Run connect first"))
        })?;

        entry.session.last_used = Utc::now();
        Ok(Arc::clone(&entry.client))
    }

    /// Fetch a copy of the session for the given host (or the active one)
    pub async fn session_for(&self, instance: Option<&str>) -> Option<ConnectionSession> {
        let state = self.state.lock().await;
        let key = match instance {
            Some(raw) => normalize_instance_url(raw).ok()?,
            None => state.active.clone()?,
        };
        state.sessions.get(&key).map(|e| e.session.clone())
    }

    /// Observability snapshot; infallible by design
    pub async fn status(&self) -> ConnectionStatus {
        let state = self.state.lock().await;
        let active = state.active.as_ref().and_then(|key| state.sessions.get(key));

        ConnectionStatus {
            connected: active.is_some(),
            active_instance: active.map(|e| e.session.instance_url.clone()),
            user: active.map(|e| e.session.user_name.clone()),
            version: active.map(|e| e.session.instance_version.clone()),
            session_count: state.sessions.len(),
        }
    }
}

/// Drives connect/disconnect against the registry
///
/// Construction of the transport client, the connectivity test, and the
/// identity fetch all happen here; on any failure no session is stored.
pub struct ConnectionManager {
    registry: SessionRegistry,
    retry: RetryPolicy,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(retry: RetryPolicy) -> Self {
        Self { registry: SessionRegistry::new(), retry }
    }

    /// The underlying session registry
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Connect to an instance and store the session
    ///
    /// Resolves credentials (explicit params or profile), builds a
    /// transport client, verifies connectivity by fetching the identity,
    /// then stores the session keyed by normalized host and marks it
    /// active. The instance may come from the profile when not given
    /// explicitly.
    pub async fn connect(
        &self,
        instance: Option<&str>,
        params: &AuthParams,
    ) -> Result<ConnectionSession> {
        let resolved = resolve_auth(params)?;

        let instance = match (instance, resolved.profile_instance.as_deref()) {
            (Some(explicit), _) => explicit.to_string(),
            (None, Some(from_profile)) => from_profile.to_string(),
            (None, None) => {
                return Err(NowgateError::invalid_instance(
                    "No instance given and the credentials carry none",
                ))
            }
        };

        let auth_type = resolved.config.auth_type();
        let client =
            Arc::new(InstanceClient::with_retry(&instance, resolved.config, self.retry.clone())?);

        // Connectivity test + identity fetch; any failure stores nothing
        let identity = client.fetch_identity().await?;

        let now = Utc::now();
        let session = ConnectionSession {
            instance_url: client.instance_url().to_string(),
            auth_type,
            user_id: identity.user_id,
            user_name: identity.user_name,
            roles: identity.roles,
            instance_version: identity.instance_version,
            created_at: now,
            last_used: now,
        };

        tracing::info!(
            instance = %session.instance_url,
            user = %session.user_name,
            roles = session.roles.len(),
            "Connected"
        );

        self.registry.insert(session.clone(), client).await;
        Ok(session)
    }

    /// Disconnect the given (or active) session; `false` when none existed
    pub async fn disconnect(&self, instance: Option<&str>) -> Result<bool> {
        self.registry.remove(instance).await
    }

    /// Status snapshot; never fails
    pub async fn status(&self) -> ConnectionStatus {
        self.registry.status().await
    }
}
