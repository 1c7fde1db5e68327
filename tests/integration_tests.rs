//! Cross-Surface Integration Tests
//!
//! This module tests the library seams the CLI and MCP surfaces share:
//! session registry semantics, the script pipeline with its guardrail and
//! audit trail, and the credential profile store. It validates:
//! - Reconnecting replaces sessions instead of duplicating them
//! - The most recent connection is the active one
//! - Blocked scripts never dispatch and are always audited
//! - Profile round-trips preserve credentials without leaking them in
//!   listings
//!
//! These tests help ensure that agents can rely on deterministic behavior
//! regardless of which surface they drive Nowgate through.

use std::sync::Arc;

use chrono::Utc;
use nowgate::audit::{AuditRecorder, AuditStatus};
use nowgate::auth::{AuthConfig, AuthType};
use nowgate::client::InstanceClient;
use nowgate::safety::ExecutionMode;
use nowgate::script::{ScriptExecutionRequest, ScriptRunner};
use nowgate::session::{ConnectionSession, SessionRegistry};
use pretty_assertions::assert_eq;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_client(instance: &str) -> Arc<InstanceClient> {
    Arc::new(
        InstanceClient::new(
            instance,
            AuthConfig::Basic { username: "admin".into(), password: "secret".into() },
        )
        .expect("client construction should succeed"),
    )
}

fn test_session(instance_url: &str, user: &str) -> ConnectionSession {
    ConnectionSession {
        instance_url: instance_url.into(),
        auth_type: AuthType::Basic,
        user_id: format!("{user}-sys-id"),
        user_name: user.into(),
        roles: vec!["admin".into(), "itil".into()],
        instance_version: "glide-vancouver".into(),
        created_at: Utc::now(),
        last_used: Utc::now(),
    }
}

// ============================================================================
// Session Registry Semantics
// ============================================================================

#[tokio::test]
async fn test_reconnect_replaces_instead_of_duplicating() {
    let registry = SessionRegistry::new();
    let url = "https://dev00001.service-now.com";

    registry.insert(test_session(url, "alice"), test_client(url)).await;
    registry.insert(test_session(url, "bob"), test_client(url)).await;

    let status = registry.status().await;
    assert_eq!(status.session_count, 1, "same host must not duplicate");
    assert_eq!(status.user.as_deref(), Some("bob"), "replacement wins");
}

#[tokio::test]
async fn test_most_recent_connection_is_active() {
    let registry = SessionRegistry::new();
    let first = "https://dev00001.service-now.com";
    let second = "https://dev00002.service-now.com";

    registry.insert(test_session(first, "alice"), test_client(first)).await;
    registry.insert(test_session(second, "alice"), test_client(second)).await;

    let status = registry.status().await;
    assert_eq!(status.session_count, 2);
    assert_eq!(status.active_instance.as_deref(), Some(second));
}

#[tokio::test]
async fn test_disconnect_empty_registry_is_false_not_error() {
    let registry = SessionRegistry::new();
    let disconnected = registry.remove(None).await.expect("must not error");
    assert!(!disconnected);
}

#[tokio::test]
async fn test_lookup_accepts_unnormalized_host() {
    let registry = SessionRegistry::new();
    let url = "https://dev00001.service-now.com";
    registry.insert(test_session(url, "alice"), test_client(url)).await;

    // Same host, spelled three other ways
    for spelling in ["dev00001", "DEV00001.service-now.com", "https://dev00001.service-now.com/"] {
        let client = registry.client_for(Some(spelling)).await;
        assert!(client.is_ok(), "spelling '{spelling}' should resolve");
    }
}

#[tokio::test]
async fn test_lookup_without_session_is_typed_error() {
    let registry = SessionRegistry::new();
    let err = registry.client_for(None).await.unwrap_err();
    assert_eq!(err.error_code(), "CONNECTION_FAILED");
}

// ============================================================================
// Script Pipeline: Guardrail and Audit
// ============================================================================

#[tokio::test]
async fn test_blocked_script_is_audited_and_never_dispatched() {
    let recorder = Arc::new(AuditRecorder::new());
    let runner = ScriptRunner::new(recorder.clone()).expect("rule table compiles");

    let url = "https://dev00001.service-now.com";
    let client = test_client(url);
    let session = test_session(url, "alice");

    let request = ScriptExecutionRequest::new(
        "var gr = new GlideRecord('incident'); gr.deleteMultiple();",
        ExecutionMode::ReadOnly,
    );
    let err = runner.run(&client, &session, &request).await.unwrap_err();
    assert_eq!(err.error_code(), "SCRIPT_BLOCKED");

    let records = recorder.records();
    assert_eq!(records.len(), 1, "exactly one record per submission");
    assert_eq!(records[0].status, AuditStatus::Blocked);
    assert_eq!(records[0].actor, "alice");
    assert_eq!(records[0].instance, url);
    assert!(records[0].mutations_blocked >= 1);
    assert!(records[0].duration_ms.is_none(), "blocked scripts never reach the transport");
}

#[tokio::test]
async fn test_block_is_mode_independent() {
    let recorder = Arc::new(AuditRecorder::new());
    let runner = ScriptRunner::new(recorder.clone()).expect("rule table compiles");
    let url = "https://dev00001.service-now.com";
    let client = test_client(url);
    let session = test_session(url, "alice");

    for mode in [ExecutionMode::ReadOnly, ExecutionMode::DryRun, ExecutionMode::Execute] {
        let request = ScriptExecutionRequest::new("gs.setProperty('a', 'b');", mode);
        let err = runner.run(&client, &session, &request).await.unwrap_err();
        assert_eq!(err.error_code(), "SCRIPT_BLOCKED", "mode: {mode}");
    }

    // One audit record per submission, three submissions
    assert_eq!(recorder.len(), 3);
    for record in recorder.records() {
        assert_eq!(record.status, AuditStatus::Blocked);
    }
}

#[tokio::test]
async fn test_readonly_layer_blocks_without_rule_match() {
    let recorder = Arc::new(AuditRecorder::new());
    let runner = ScriptRunner::new(recorder.clone()).expect("rule table compiles");
    let url = "https://dev00001.service-now.com";
    let client = test_client(url);
    let session = test_session(url, "alice");

    // 'gr.update()' is legal in execute mode but not in readonly
    let request = ScriptExecutionRequest::new("gr.update();", ExecutionMode::ReadOnly);
    let err = runner.run(&client, &session, &request).await.unwrap_err();
    assert_eq!(err.error_code(), "SCRIPT_BLOCKED");
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.records()[0].mode, ExecutionMode::ReadOnly);
}

// ============================================================================
// Profile Store Round-Trips
// ============================================================================

#[test]
fn test_profile_registry_round_trip() {
    use nowgate::config::{load_registry, save_registry, CredentialProfile, ProfileRegistry};

    let dir = std::env::temp_dir().join(format!("nowgate-it-{}", uuid::Uuid::new_v4()));
    let path = dir.join("profiles.json");

    let mut registry = ProfileRegistry::default();
    registry.profiles.insert(
        "dev".into(),
        CredentialProfile {
            instance: "https://dev00001.service-now.com".into(),
            auth_type: AuthType::Basic,
            username: Some("admin".into()),
            password: Some("secret".into()),
            password_env: None,
            token: None,
            token_env: None,
            client_id: None,
            client_secret: None,
            refresh_token: None,
        },
    );
    registry.default = Some("dev".into());

    save_registry(&path, &registry).expect("save should succeed");
    let loaded = load_registry(&path).expect("load should succeed");
    assert_eq!(loaded.default.as_deref(), Some("dev"));
    let profile = loaded.profiles.get("dev").expect("profile persisted");
    assert_eq!(profile.username.as_deref(), Some("admin"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600, "profile store must not be world-readable");
    }

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_missing_profile_store_loads_empty() {
    use nowgate::config::load_registry;
    let path = std::env::temp_dir().join(format!("nowgate-none-{}.json", uuid::Uuid::new_v4()));
    let registry = load_registry(&path).expect("missing file is not an error");
    assert!(registry.profiles.is_empty());
    assert!(registry.default.is_none());
}
