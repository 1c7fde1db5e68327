//! Output Validation Tests
//!
//! This module validates that all Nowgate output conforms to the defined
//! JSON schemas. It ensures:
//! - Success envelopes match the expected schema
//! - Error envelopes match the expected schema
//! - Error codes are stable strings agents can dispatch on
//! - Metadata is consistent across commands
//! - Credentials never appear in any envelope

use nowgate::{ErrorEnvelope, ErrorInfo, Metadata, NowgateError, SuccessEnvelope};
use pretty_assertions::assert_eq;

// ============================================================================
// Success Envelope Structure Tests
// ============================================================================

#[test]
fn test_success_envelope_structure() {
    // Create a simple success envelope and validate its JSON structure
    let data = serde_json::json!({"test": "value"});
    let envelope: SuccessEnvelope<serde_json::Value> =
        SuccessEnvelope::new("https://dev00001.service-now.com", "status", data, Metadata::new(42));

    // Serialize to JSON
    let json_str = serde_json::to_string(&envelope).expect("Should serialize");
    let json_value: serde_json::Value =
        serde_json::from_str(&json_str).expect("Should deserialize");

    // Verify required fields
    assert!(json_value.is_object(), "Should be JSON object");
    assert_eq!(json_value["ok"], true, "ok should be true");
    assert_eq!(json_value["instance"], "https://dev00001.service-now.com");
    assert_eq!(json_value["command"], "status", "command should be status");
    assert!(json_value["data"].is_object(), "data should be object");
    assert!(json_value["meta"].is_object(), "meta should be object");

    // Verify metadata structure
    assert_eq!(json_value["meta"]["execution_ms"], 42, "execution_ms should be 42");

    // Verify no extra fields (should match schema exactly)
    let top_level_keys: Vec<&str> =
        json_value.as_object().unwrap().keys().map(|s| s.as_str()).collect();
    assert_eq!(top_level_keys.len(), 5, "Should have exactly 5 top-level fields");
    assert!(top_level_keys.contains(&"ok"));
    assert!(top_level_keys.contains(&"instance"));
    assert!(top_level_keys.contains(&"command"));
    assert!(top_level_keys.contains(&"data"));
    assert!(top_level_keys.contains(&"meta"));
}

#[test]
fn test_error_envelope_structure() {
    let envelope = ErrorEnvelope::new(
        "https://dev00001.service-now.com",
        "query",
        ErrorInfo::new("QUERY_ERROR", "Malformed encoded query"),
    );

    let json_str = serde_json::to_string(&envelope).expect("Should serialize");
    let json_value: serde_json::Value =
        serde_json::from_str(&json_str).expect("Should deserialize");

    assert!(json_value.is_object(), "Should be JSON object");
    assert_eq!(json_value["ok"], false, "ok should be false");
    assert_eq!(json_value["command"], "query");
    assert!(json_value["error"].is_object(), "error should be object");
    assert_eq!(json_value["error"]["code"], "QUERY_ERROR");
    assert_eq!(json_value["error"]["message"], "Malformed encoded query");

    let top_level_keys: Vec<&str> =
        json_value.as_object().unwrap().keys().map(|s| s.as_str()).collect();
    assert_eq!(top_level_keys.len(), 4, "Should have exactly 4 top-level fields");
    assert!(top_level_keys.contains(&"ok"));
    assert!(top_level_keys.contains(&"instance"));
    assert!(top_level_keys.contains(&"command"));
    assert!(top_level_keys.contains(&"error"));
}

// ============================================================================
// Error Code Stability Tests
// ============================================================================

#[test]
fn test_error_codes_are_stable() {
    // Agents dispatch on these strings; changing one is a breaking change
    let cases = [
        (NowgateError::connection_failed("x"), "CONNECTION_FAILED"),
        (NowgateError::authentication_failed("x"), "AUTHENTICATION_FAILED"),
        (NowgateError::instance_unavailable("x"), "INSTANCE_UNAVAILABLE"),
        (NowgateError::invalid_instance("x"), "INVALID_INSTANCE"),
        (NowgateError::query_error("x"), "QUERY_ERROR"),
        (NowgateError::unknown("x"), "UNKNOWN_ERROR"),
        (NowgateError::script_blocked("record_deletion", "x"), "SCRIPT_BLOCKED"),
    ];

    for (err, code) in cases {
        let envelope = ErrorEnvelope::from_error("", "test", &err);
        assert_eq!(envelope.error.code, code);
    }
}

#[test]
fn test_suggestion_present_only_when_known() {
    let with_hint = ErrorEnvelope::from_error("", "connect", &NowgateError::authentication_failed("x"));
    assert!(with_hint.error.suggestion.is_some());

    let without_hint = ErrorEnvelope::from_error("", "query", &NowgateError::unknown("x"));
    let json = serde_json::to_string(&without_hint).unwrap();
    if without_hint.error.suggestion.is_none() {
        assert!(!json.contains("suggestion"), "omitted suggestion must not serialize");
    }
}

// ============================================================================
// Metadata Consistency Tests
// ============================================================================

#[test]
fn test_metadata_records_field_optional() {
    let without = serde_json::to_string(&Metadata::new(7)).unwrap();
    assert!(!without.contains("records_returned"));

    let with = serde_json::to_string(&Metadata::with_records(7, 3)).unwrap();
    assert!(with.contains(r#""records_returned":3"#));
}

#[test]
fn test_envelope_round_trip() {
    let envelope: SuccessEnvelope<serde_json::Value> = SuccessEnvelope::new(
        "https://dev00001.service-now.com",
        "query",
        serde_json::json!({"records": []}),
        Metadata::with_records(12, 0),
    );
    let json = serde_json::to_string(&envelope).unwrap();
    let parsed: SuccessEnvelope<serde_json::Value> = serde_json::from_str(&json).unwrap();
    assert!(parsed.ok);
    assert_eq!(parsed.command, "query");
    assert_eq!(parsed.meta.records_returned, Some(0));
}

// ============================================================================
// Credential Hygiene Tests
// ============================================================================

#[test]
fn test_session_serialization_has_no_credentials() {
    use chrono::Utc;
    use nowgate::{AuthType, ConnectionSession};

    let session = ConnectionSession {
        instance_url: "https://dev00001.service-now.com".into(),
        auth_type: AuthType::Basic,
        user_id: "abc".into(),
        user_name: "admin".into(),
        roles: vec!["admin".into()],
        instance_version: "glide-x".into(),
        created_at: Utc::now(),
        last_used: Utc::now(),
    };

    let json = serde_json::to_string(&session).unwrap();
    assert!(!json.contains("password"));
    assert!(!json.contains("token"));
    assert!(!json.contains("client_secret"));
}
