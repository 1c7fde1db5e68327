//! Instance Transport Client
//!
//! One [`InstanceClient`] per session, bound to one normalized instance URL
//! and one auth configuration. The client owns everything between "call the
//! instance" and "typed result": URL normalization, authorization header
//! construction, per-request timeouts, the fixed status-to-error mapping,
//! and bounded retry with exponential backoff.
//!
//! # Classification Contract
//! Transport failures are classified here exactly once and never re-wrapped
//! by callers:
//!
//! | Status | Error kind |
//! |---|---|
//! | 401 | `AuthenticationFailed` |
//! | 403 | `AclDenied` |
//! | 404 | `TableNotAccessible` |
//! | 429 | `RateLimited` |
//! | 500/502/503/504 | `InstanceUnavailable` |
//! | other non-2xx | `UnknownError` |
//!
//! Network-level failures (DNS, refused connections) and request timeouts
//! map to `InstanceUnavailable`.
//!
//! # Retry
//! [`InstanceClient::request_with_retry`] retries only errors in the
//! retryable set, waiting with `tokio::time::sleep` so concurrent tasks in
//! the same process are never stalled by a backoff. A retry loop runs to
//! its own completion or bound; cancelling the caller does not cancel an
//! in-flight retry sequence.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

use crate::auth::AuthConfig;
use crate::error::{NowgateError, Result};

/// Default per-request timeout
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Suffix appended to bare instance names (e.g. `dev123456`)
const INSTANCE_DOMAIN_SUFFIX: &str = ".service-now.com";

// ============================================================================
// URL Normalization
// ============================================================================

/// Normalize an instance URL into its canonical form
///
/// Rules, applied in order:
/// 1. Trim whitespace, lower-case
/// 2. Bare instance names (no dot, no scheme) get `.service-now.com` appended
/// 3. Default to `https://` when no scheme is given
/// 4. Upgrade `http://` to `https://` (credentials never transit plaintext)
/// 5. Strip trailing slashes
///
/// The result is canonical: normalizing twice yields the same string, and
/// session keying uses the same rule so spelling variants of one host
/// resolve to one session.
///
/// # Errors
/// `INVALID_INSTANCE` for empty input or input that still has an
/// unsupported scheme after normalization.
pub fn normalize_instance_url(input: &str) -> Result<String> {
    let trimmed = input.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err(NowgateError::invalid_instance("Instance must not be empty"));
    }

    let without_scheme = if let Some(rest) = trimmed.strip_prefix("https://") {
        rest.to_string()
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        rest.to_string()
    } else if trimmed.contains("://") {
        return Err(NowgateError::invalid_instance(format!(
            "Unsupported scheme in '{trimmed}'. Only https:// instances are reachable"
        )));
    } else {
        trimmed
    };

    let without_slash = without_scheme.trim_end_matches('/');
    if without_slash.is_empty() {
        return Err(NowgateError::invalid_instance("Instance must contain a host"));
    }

    // Bare developer instance names get the well-known domain
    let host = if without_slash.contains('.') {
        without_slash.to_string()
    } else {
        format!("{without_slash}{INSTANCE_DOMAIN_SUFFIX}")
    };

    Ok(format!("https://{host}"))
}

// ============================================================================
// Status Mapping
// ============================================================================

/// Map an HTTP status code to the error taxonomy
///
/// The table is fixed; `context` lands in the error message so the caller
/// can tell which request failed.
#[must_use]
pub fn map_status(status: u16, context: &str) -> NowgateError {
    match status {
        401 => NowgateError::authentication_failed(format!(
            "Instance rejected the credentials (HTTP 401) for {context}"
        )),
        403 => NowgateError::AclDenied(format!(
            "Instance denied access (HTTP 403) for {context}"
        )),
        404 => NowgateError::TableNotAccessible(format!(
            "Resource not found or not visible (HTTP 404) for {context}"
        )),
        429 => NowgateError::RateLimited(format!(
            "Instance rate limit hit (HTTP 429) for {context}"
        )),
        500 | 502 | 503 | 504 => NowgateError::instance_unavailable(format!(
            "Instance returned HTTP {status} for {context}"
        )),
        other => NowgateError::unknown(format!("Unexpected HTTP {other} for {context}")),
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Bounded exponential backoff configuration
///
/// Delay for attempt `n` (0-indexed) is
/// `min(initial_delay_ms * backoff_factor^n, max_delay_ms)` plus an
/// additive jitter in `[0, delay * jitter_fraction)`. Jitter only ever
/// lengthens a delay, so cumulative-backoff lower bounds hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Validate configuration bounds
    pub fn validate(&self) -> Result<()> {
        if !(1.0..=10.0).contains(&self.backoff_factor) {
            return Err(NowgateError::unknown("Backoff factor must be between 1.0 and 10.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(NowgateError::unknown("Jitter fraction must be between 0.0 and 1.0"));
        }
        Ok(())
    }

    /// Calculate the delay before retry `attempt` (0-indexed)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = (self.initial_delay_ms as f64) * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let jitter_range = capped * self.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(0.0..jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter) as u64)
    }
}

// ============================================================================
// Instance Client
// ============================================================================

/// Identity and environment information fetched at connect time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceIdentity {
    /// sys_id of the connected user
    pub user_id: String,
    /// Login name of the connected user
    pub user_name: String,
    /// Role names granted to the user
    pub roles: Vec<String>,
    /// Instance build tag, or "unknown" when not readable
    pub instance_version: String,
}

/// Result of a background script dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptOutput {
    /// Script stdout/log output as returned by the instance
    pub output: String,
    /// Milliseconds the instance reported for execution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// HTTP transport bound to one instance and one auth configuration
#[derive(Debug)]
pub struct InstanceClient {
    instance_url: String,
    auth: AuthConfig,
    retry: RetryPolicy,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl InstanceClient {
    /// Create a client for the given instance (normalized here) and auth
    pub fn new(instance: &str, auth: AuthConfig) -> Result<Self> {
        Self::with_retry(instance, auth, RetryPolicy::default())
    }

    /// Create a client with an explicit retry policy
    pub fn with_retry(instance: &str, auth: AuthConfig, retry: RetryPolicy) -> Result<Self> {
        retry.validate()?;
        let instance_url = normalize_instance_url(instance)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| NowgateError::connection_failed(format!("HTTP client init: {e}")))?;

        Ok(Self { instance_url, auth, retry, request_timeout: DEFAULT_REQUEST_TIMEOUT, http })
    }

    /// The normalized instance URL this client is bound to
    #[must_use]
    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    /// The auth configuration this client is bound to
    #[must_use]
    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    /// Build the Authorization header value for this client's auth variant
    ///
    /// # Errors
    /// `AUTHENTICATION_FAILED` for an OAuth config without an access token;
    /// requests are never sent unauthenticated.
    pub fn authorization_header(&self) -> Result<String> {
        match &self.auth {
            AuthConfig::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                Ok(format!("Basic {encoded}"))
            }
            AuthConfig::OAuth { access_token, .. } => match access_token {
                Some(token) => Ok(format!("Bearer {token}")),
                None => Err(NowgateError::authentication_failed(
                    "OAuth config has no access token. Obtain one before connecting",
                )),
            },
            AuthConfig::Token { token } => Ok(format!("Bearer {token}")),
        }
    }

    /// Execute an operation with bounded retry
    ///
    /// Performs at most `max_retries + 1` attempts. Retries happen if and
    /// only if the returned error kind is retryable; the last error is
    /// surfaced verbatim on exhaustion. Backoff waits use a non-blocking
    /// async sleep.
    pub async fn request_with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.retry.max_retries {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        code = err.error_code(),
                        "Retrying transient instance error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Issue a single request and classify the outcome
    ///
    /// `query` pairs become URL parameters; `body` (when present) is sent
    /// as JSON. `context` labels the request in error messages.
    async fn execute(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        timeout: Duration,
        context: &str,
    ) -> Result<Value> {
        let url = format!("{}/{}", self.instance_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .header("Authorization", self.authorization_header()?)
            .header("Accept", "application/json")
            .query(query)
            .timeout(timeout);

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                NowgateError::instance_unavailable(format!(
                    "Request timed out after {}s for {context}",
                    timeout.as_secs()
                ))
            } else if e.is_connect() {
                NowgateError::instance_unavailable(format!(
                    "Could not reach instance for {context}: {e}"
                ))
            } else {
                NowgateError::connection_failed(format!("Request failed for {context}: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status.as_u16(), context));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| NowgateError::unknown(format!("Invalid JSON from instance: {e}")))
    }

    /// Query records from a table via the Table API
    ///
    /// Read-only by construction (GET); the safety analyzer does not gate
    /// this path.
    pub async fn get_records(
        &self,
        table: &str,
        query: Option<&str>,
        fields: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let limit_str = limit.to_string();
        let mut params: Vec<(&str, &str)> = vec![("sysparm_limit", limit_str.as_str())];
        if let Some(q) = query {
            params.push(("sysparm_query", q));
        }
        if let Some(f) = fields {
            params.push(("sysparm_fields", f));
        }

        let context = format!("table query on '{table}'");
        let path = format!("api/now/table/{table}");

        let body = self
            .request_with_retry(|| {
                self.execute(
                    reqwest::Method::GET,
                    &path,
                    &params,
                    None,
                    self.request_timeout,
                    &context,
                )
            })
            .await?;

        match body.get("result") {
            Some(Value::Array(records)) => Ok(records.clone()),
            _ => Err(NowgateError::query_error(format!(
                "Instance response for '{table}' had no result array"
            ))),
        }
    }

    /// Fetch the connected user's identity, roles, and the instance version
    ///
    /// Serves double duty as the connectivity test at connect time: a
    /// failure here means no session is stored.
    pub async fn fetch_identity(&self) -> Result<InstanceIdentity> {
        // Who am I: the query resolves server-side to the authenticated user
        let users = self
            .get_records(
                "sys_user",
                Some("user_name=javascript:gs.getUserName()"),
                Some("sys_id,user_name,name"),
                1,
            )
            .await?;

        let user = users.first().ok_or_else(|| {
            NowgateError::authentication_failed(
                "Instance accepted the request but returned no identity record",
            )
        })?;
        let user_id = string_field(user, "sys_id");
        let user_name = string_field(user, "user_name");

        let roles = self.fetch_roles(&user_id).await?;

        // Version is informational only; an unreadable property is not fatal
        let instance_version = self.fetch_version().await.unwrap_or_else(|_| "unknown".into());

        Ok(InstanceIdentity { user_id, user_name, roles, instance_version })
    }

    async fn fetch_roles(&self, user_sys_id: &str) -> Result<Vec<String>> {
        let query = format!("user={user_sys_id}");
        let records = self
            .get_records("sys_user_has_role", Some(&query), Some("role.name"), 100)
            .await?;

        let mut roles: Vec<String> = records
            .iter()
            .map(|r| string_field(r, "role.name"))
            .filter(|r| !r.is_empty())
            .collect();
        roles.sort();
        roles.dedup();
        Ok(roles)
    }

    async fn fetch_version(&self) -> Result<String> {
        let records = self
            .get_records(
                "sys_properties",
                Some("name=glide.buildtag.latest"),
                Some("value"),
                1,
            )
            .await?;

        Ok(records.first().map(|r| string_field(r, "value")).unwrap_or_default())
    }

    /// Dispatch an approved script to the instance for execution
    ///
    /// Only the script pipeline calls this, after analysis; the script text
    /// arrives here exactly as it will run (including any dryrun wrapper).
    /// The per-request timeout is the script timeout plus dispatch margin.
    pub async fn run_script(
        &self,
        script: &str,
        scope: Option<&str>,
        timeout_seconds: u64,
    ) -> Result<ScriptOutput> {
        let body = serde_json::json!({
            "script": script,
            "scope": scope.unwrap_or("global"),
            "timeout": timeout_seconds,
        });
        let timeout = Duration::from_secs(timeout_seconds.saturating_add(10));
        let context = "background script execution";

        let response = self
            .request_with_retry(|| {
                self.execute(
                    reqwest::Method::POST,
                    "api/now/script/background",
                    &[],
                    Some(&body),
                    timeout,
                    context,
                )
            })
            .await?;

        let result = response.get("result").cloned().unwrap_or(response);
        let status = result.get("status").and_then(Value::as_str).unwrap_or("success");

        match status {
            "timeout" => Err(NowgateError::ScriptTimeout(format!(
                "Instance aborted the script after {timeout_seconds}s"
            ))),
            "error" => {
                let detail = result
                    .get("error_message")
                    .and_then(Value::as_str)
                    .unwrap_or("no detail returned");
                Err(NowgateError::ScriptError(detail.to_string()))
            }
            _ => Ok(ScriptOutput {
                output: result.get("output").and_then(Value::as_str).unwrap_or("").to_string(),
                elapsed_ms: result.get("elapsed_ms").and_then(Value::as_u64),
            }),
        }
    }
}

fn string_field(record: &Value, field: &str) -> String {
    record.get(field).and_then(Value::as_str).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;

    fn basic_auth() -> AuthConfig {
        AuthConfig::Basic { username: "admin".into(), password: "secret".into() }
    }

    // Normalization tests

    #[test]
    fn test_normalize_variants_collapse() {
        for input in
            ["dev.example.com", "http://dev.example.com", "https://dev.example.com/", "DEV.EXAMPLE.COM"]
        {
            assert_eq!(
                normalize_instance_url(input).unwrap(),
                "https://dev.example.com",
                "input: {input}"
            );
        }
    }

    #[test]
    fn test_normalize_idempotent() {
        let once = normalize_instance_url("HTTP://Dev123.Service-Now.com//").unwrap();
        let twice = normalize_instance_url(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, "https://dev123.service-now.com");
    }

    #[test]
    fn test_normalize_bare_instance_name() {
        assert_eq!(
            normalize_instance_url("dev123456").unwrap(),
            "https://dev123456.service-now.com"
        );
    }

    #[test]
    fn test_normalize_rejects_empty_and_bad_scheme() {
        assert!(normalize_instance_url("").is_err());
        assert!(normalize_instance_url("   ").is_err());
        assert!(normalize_instance_url("ftp://dev.example.com").is_err());
        assert!(normalize_instance_url("https:///").is_err());
    }

    // Status mapping tests

    #[test]
    fn test_status_mapping_table() {
        assert_eq!(map_status(401, "t").error_code(), "AUTHENTICATION_FAILED");
        assert_eq!(map_status(403, "t").error_code(), "ACL_DENIED");
        assert_eq!(map_status(404, "t").error_code(), "TABLE_NOT_ACCESSIBLE");
        assert_eq!(map_status(429, "t").error_code(), "RATE_LIMITED");
        for server_error in [500, 502, 503, 504] {
            assert_eq!(map_status(server_error, "t").error_code(), "INSTANCE_UNAVAILABLE");
        }
        assert_eq!(map_status(418, "t").error_code(), "UNKNOWN_ERROR");
        assert_eq!(map_status(301, "t").error_code(), "UNKNOWN_ERROR");
    }

    #[test]
    fn test_status_mapping_retryability_alignment() {
        assert!(map_status(429, "t").is_retryable());
        assert!(map_status(503, "t").is_retryable());
        assert!(!map_status(401, "t").is_retryable());
        assert!(!map_status(403, "t").is_retryable());
        assert!(!map_status(404, "t").is_retryable());
    }

    // Authorization header tests

    #[test]
    fn test_basic_header_encoding() {
        let client = InstanceClient::new("dev123", basic_auth()).unwrap();
        // base64("admin:secret")
        assert_eq!(client.authorization_header().unwrap(), "Basic YWRtaW46c2VjcmV0");
    }

    #[test]
    fn test_token_header() {
        let auth = AuthConfig::Token { token: "tok123".into() };
        let client = InstanceClient::new("dev123", auth).unwrap();
        assert_eq!(client.authorization_header().unwrap(), "Bearer tok123");
    }

    #[test]
    fn test_oauth_header_requires_access_token() {
        let auth = AuthConfig::OAuth {
            client_id: "cid".into(),
            client_secret: "shh".into(),
            access_token: None,
            refresh_token: None,
            expires_at: None,
        };
        let client = InstanceClient::new("dev123", auth).unwrap();
        let err = client.authorization_header().unwrap_err();
        assert_eq!(err.error_code(), "AUTHENTICATION_FAILED");

        let auth = AuthConfig::OAuth {
            client_id: "cid".into(),
            client_secret: "shh".into(),
            access_token: Some("at".into()),
            refresh_token: None,
            expires_at: None,
        };
        let client = InstanceClient::new("dev123", auth).unwrap();
        assert_eq!(client.authorization_header().unwrap(), "Bearer at");
    }

    // Retry policy tests

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 350,
            jitter_fraction: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        // 400 would exceed the cap
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_only_lengthens() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter_fraction: 0.5,
        };
        for attempt in 0..4 {
            let base = 100.0 * 2.0_f64.powi(attempt);
            let delay = policy.delay_for_attempt(attempt as u32);
            assert!(delay >= Duration::from_millis(base as u64));
            assert!(delay < Duration::from_millis((base * 1.5) as u64 + 1));
        }
    }

    #[test]
    fn test_policy_validation() {
        let mut policy = RetryPolicy::default();
        assert!(policy.validate().is_ok());

        policy.backoff_factor = 0.5;
        assert!(policy.validate().is_err());

        policy.backoff_factor = 2.0;
        policy.jitter_fraction = 1.5;
        assert!(policy.validate().is_err());
    }

    // request_with_retry tests (closures stand in for HTTP calls)

    fn test_client(policy: RetryPolicy) -> InstanceClient {
        InstanceClient::with_retry("dev123", basic_auth(), policy).unwrap()
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms: 5,
            backoff_factor: 2.0,
            max_delay_ms: 50,
            jitter_fraction: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let client = test_client(fast_policy(3));
        let calls = AtomicU32::new(0);

        let started = std::time::Instant::now();
        let result: Result<&str> = client
            .request_with_retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(NowgateError::RateLimited("429".into()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two backoffs: 5ms + 10ms minimum cumulative wait
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_retry_bound_is_max_retries_plus_one() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let client = test_client(fast_policy(2));
        let calls = AtomicU32::new(0);

        let result: Result<()> = client
            .request_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NowgateError::instance_unavailable("down")) }
            })
            .await;

        // Last error surfaced verbatim after max_retries + 1 attempts
        assert_eq!(result.unwrap_err().error_code(), "INSTANCE_UNAVAILABLE");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let client = test_client(fast_policy(3));
        let calls = AtomicU32::new(0);

        let result: Result<()> = client
            .request_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NowgateError::authentication_failed("bad password")) }
            })
            .await;

        assert_eq!(result.unwrap_err().error_code(), "AUTHENTICATION_FAILED");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_immediate_success_no_delay() {
        let client = test_client(fast_policy(3));
        let started = std::time::Instant::now();
        let result: Result<u8> = client.request_with_retry(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
