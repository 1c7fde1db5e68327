//! MCP (Model Context Protocol) Server
//!
//! This module implements an MCP server using manual JSON-RPC 2.0 over stdio.
//! We implement the protocol directly rather than using the unstable rmcp crate.
//!
//! # Architecture
//!
//! - **Transport**: JSON-RPC 2.0 over stdio (line-based)
//! - **Dependencies**: Only `serde_json` and anyhow (no MCP-specific crates)
//! - **Protocol**: Implements MCP specification manually
//!
//! # Design Principles
//!
//! 1. **Stateful sessions**: connections persist across tool calls in a
//!    per-process registry; credentials are sent once at connect time
//! 2. **Simple**: Direct JSON-RPC implementation, no macro magic
//! 3. **Debuggable**: Easy to understand and troubleshoot
//! 4. **Reusable**: All tools call existing library functions
//!
//! # MCP Tools
//!
//! - `connect` - Authenticate against an instance and open a session
//! - `disconnect` - Close a session
//! - `status` - Report current session state
//! - `query` - Read records from a table
//! - `script` - Run a background script through safety analysis
//! - `profiles` - List saved credential profiles
//!
//! # Usage
//!
//! Start the MCP server with: `nowgate mcp`
//!
//! Configure in Claude Desktop:
//! ```json
//! {
//!   "mcpServers": {
//!     "nowgate": {
//!       "command": "nowgate",
//!       "args": ["mcp"]
//!     }
//!   }
//! }
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use crate::audit::AuditRecorder;
use crate::auth::{AuthParams, AuthType};
use crate::client::RetryPolicy;
use crate::config::CredentialProfile;
use crate::error::NowgateError;
use crate::output::ErrorEnvelope;
use crate::safety::ExecutionMode;
use crate::script::{ScriptExecutionRequest, ScriptRunner};
use crate::session::ConnectionManager;

// ============================================================================
// JSON-RPC 2.0 Structures
// ============================================================================

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

// ============================================================================
// MCP Tool Result Structures
// ============================================================================

/// Text content block for MCP tool results
#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    content_type: String,
    text: String,
}

impl TextContent {
    /// Create a new text content block
    fn new(text: String) -> Self {
        Self { content_type: "text".to_string(), text }
    }
}

/// MCP tool call result
#[derive(Debug, Serialize)]
struct CallToolResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl CallToolResult {
    /// Create a successful tool result with JSON data
    fn success(data: impl Serialize) -> Result<Value> {
        let json_text = serde_json::to_string_pretty(&data)?;

        let result = Self { content: vec![TextContent::new(json_text)], is_error: false };

        Ok(serde_json::to_value(result)?)
    }

    /// Create a failed tool result carrying a stable error envelope
    ///
    /// Domain failures (blocked scripts, auth failures, unreachable
    /// instances) are tool results the agent can parse, not protocol
    /// errors.
    fn failure(instance: &str, command: &str, err: &NowgateError) -> Result<Value> {
        let envelope = ErrorEnvelope::from_error(instance, command, err);
        let json_text = serde_json::to_string_pretty(&envelope)?;

        let result = Self { content: vec![TextContent::new(json_text)], is_error: true };

        Ok(serde_json::to_value(result)?)
    }
}

// ============================================================================
// Tool Context
// ============================================================================

/// Shared state behind every tool invocation
///
/// Owns the session registry, the script pipeline, and the audit log for
/// the lifetime of the server process.
pub struct ToolContext {
    manager: ConnectionManager,
    runner: ScriptRunner,
}

impl ToolContext {
    pub fn new(retry: RetryPolicy) -> crate::error::Result<Self> {
        let recorder = Arc::new(AuditRecorder::new());
        Ok(Self {
            manager: ConnectionManager::new(retry),
            runner: ScriptRunner::new(recorder)?,
        })
    }

    pub fn with_recorder(retry: RetryPolicy, recorder: Arc<AuditRecorder>) -> crate::error::Result<Self> {
        Ok(Self {
            manager: ConnectionManager::new(retry),
            runner: ScriptRunner::new(recorder)?,
        })
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    #[must_use]
    pub fn runner(&self) -> &ScriptRunner {
        &self.runner
    }
}

// ============================================================================
// MCP Server
// ============================================================================

/// Start the MCP server
///
/// This function runs the main MCP server loop, reading JSON-RPC requests
/// from stdin and writing JSON-RPC responses to stdout.
///
/// # Protocol
///
/// The server implements JSON-RPC 2.0 over stdio:
/// - Each request is a single line of JSON
/// - Each response is a single line of JSON
/// - Errors are returned as JSON-RPC error responses
///
/// # Errors
///
/// Returns an error if stdio communication fails or if there's a fatal error.
#[allow(clippy::future_not_send)]
pub async fn serve(context: ToolContext) -> Result<()> {
    let stdin = io::stdin();
    let reader = stdin.lock();
    let mut stdout = io::stdout();

    for line in reader.lines() {
        let line = line?;

        // Skip empty lines
        if line.trim().is_empty() {
            continue;
        }

        // Parse JSON-RPC request
        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                // Send parse error response
                let error_response = JsonRpcResponse {
                    jsonrpc: "2.0".to_string(),
                    id: None,
                    result: None,
                    error: Some(JsonRpcError {
                        code: -32700, // Parse error
                        message: format!("Parse error: {e}"),
                        data: None,
                    }),
                };
                let response_json = serde_json::to_string(&error_response)?;
                writeln!(stdout, "{response_json}")?;
                stdout.flush()?;
                continue;
            }
        };

        // Handle request
        let response = handle_request(&context, request).await;

        // Write response
        let response_json = serde_json::to_string(&response)?;
        writeln!(stdout, "{response_json}")?;
        stdout.flush()?;
    }

    Ok(())
}

/// Handle a JSON-RPC request
///
/// Routes the request to the appropriate handler based on the method name.
async fn handle_request(context: &ToolContext, request: JsonRpcRequest) -> JsonRpcResponse {
    let result = match request.method.as_str() {
        "initialize" => handle_initialize(request.params),
        "tools/list" => handle_list_tools(),
        "tools/call" => handle_call_tool(context, request.params).await,
        _ => Err(anyhow!("Unknown method: {}", request.method)),
    };

    match result {
        Ok(value) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: Some(value),
            error: None,
        },
        Err(e) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: None,
            error: Some(JsonRpcError {
                code: -32603, // Internal error
                message: e.to_string(),
                data: None,
            }),
        },
    }
}

// ============================================================================
// MCP Protocol Handlers
// ============================================================================

/// Handle MCP initialize request
///
/// Returns server capabilities and metadata.
fn handle_initialize(_params: Option<Value>) -> Result<Value> {
    Ok(serde_json::json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": "nowgate",
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

/// Handle tools/list request
///
/// Returns the list of available MCP tools with their schemas.
fn handle_list_tools() -> Result<Value> {
    Ok(serde_json::json!({
        "tools": [
            {
                "name": "connect",
                "description": "Open an authenticated session against a ServiceNow instance. IMPORTANT: (1) NEVER guess or invent credentials. If the user hasn't provided credentials, ASK the user for them. (2) Call this ONCE per instance - the session persists for the whole server process, so do NOT pass credentials on every query/script call. (3) PREFER a saved profile ('profile' param) over explicit credentials; profiles live in ~/.config/nowgate/profiles.json and carry instance + credentials together. The connection is verified by fetching the authenticated user's identity and roles; nothing is stored on failure. Reconnecting to the same instance replaces the existing session rather than duplicating it, and the most recent connection becomes the active one. Instance names normalize: 'dev12345' means 'https://dev12345.service-now.com'. Possible error codes: AUTHENTICATION_FAILED, INVALID_INSTANCE, INSTANCE_UNAVAILABLE, CONNECTION_FAILED.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "instance": {
                            "type": "string",
                            "description": "Instance hostname or URL. Optional when 'profile' is given (the profile stores its instance). A bare name like 'dev12345' expands to https://dev12345.service-now.com."
                        },
                        "profile": {
                            "type": "string",
                            "description": "RECOMMENDED: Name of a saved credential profile. When given, explicit credential fields are ignored."
                        },
                        "auth_type": {
                            "type": "string",
                            "enum": ["basic", "oauth", "token"],
                            "description": "Authentication mode for explicit credentials. basic needs username+password, token needs token, oauth needs client_id+client_secret."
                        },
                        "username": {
                            "type": "string",
                            "description": "Username (basic auth). NEVER guess or invent - if not provided by user, ASK for it."
                        },
                        "password": {
                            "type": "string",
                            "description": "Password (basic auth). NEVER guess or invent - if not provided by user, ASK for it."
                        },
                        "token": {
                            "type": "string",
                            "description": "Bearer token (token auth), or a pre-obtained access token for oauth."
                        },
                        "client_id": {
                            "type": "string",
                            "description": "OAuth client id."
                        },
                        "client_secret": {
                            "type": "string",
                            "description": "OAuth client secret."
                        },
                        "save_profile": {
                            "type": "string",
                            "description": "Optional: save the explicit credentials under this profile name after a successful connect, so future sessions can use 'profile' instead of raw credentials."
                        }
                    }
                }
            },
            {
                "name": "disconnect",
                "description": "Close a session. With no 'instance', closes the active session. Returns disconnected=false (not an error) when there was nothing to disconnect. When the active session is closed and others remain, one of them becomes active.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "instance": {
                            "type": "string",
                            "description": "Instance to disconnect. Omit for the active session."
                        }
                    }
                }
            },
            {
                "name": "status",
                "description": "Report session state: whether connected, the active instance, the authenticated user, the instance version, and the total session count. Never fails and never requires arguments. Credentials are never included.",
                "inputSchema": {
                    "type": "object",
                    "properties": {}
                }
            },
            {
                "name": "query",
                "description": "Read records from a table on the connected instance via the Table API. Requires an open session (call 'connect' first). CRITICAL MCP TOKEN LIMITS: MCP responses are limited to 25,000 tokens; large result sets will cause complete tool failure. ALWAYS set 'limit' small (10 for exploration) and use 'fields' to restrict columns. The encoded query syntax is ServiceNow's (e.g. 'active=true^priority=1'). Possible error codes: CONNECTION_FAILED (no session), TABLE_NOT_ACCESSIBLE, ACL_DENIED, QUERY_ERROR, RATE_LIMITED, INSTANCE_UNAVAILABLE.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "table": {
                            "type": "string",
                            "description": "Table name, e.g. 'incident'. REQUIRED."
                        },
                        "query": {
                            "type": "string",
                            "description": "Encoded query string, e.g. 'active=true^priority=1'. Omit for all records (bounded by limit)."
                        },
                        "fields": {
                            "type": "string",
                            "description": "Comma-separated field list to return, e.g. 'number,short_description,state'. Strongly recommended to keep responses small."
                        },
                        "limit": {
                            "type": "number",
                            "description": "Maximum records to return. Default 10. Keep small - see token limits above."
                        },
                        "instance": {
                            "type": "string",
                            "description": "Target a specific connected instance. Omit for the active session."
                        }
                    },
                    "required": ["table"]
                }
            },
            {
                "name": "script",
                "description": "Run a background script on the connected instance, gated by safety analysis. Scripts containing record deletion, bulk writes, system property writes, role/credential manipulation, or outbound network calls are BLOCKED in every mode (error code SCRIPT_BLOCKED) - do not retry a blocked script with a different mode, it will fail the same way. Modes: 'readonly' (default; additionally rejects any script that can mutate, and dispatches inside the rollback transaction), 'dryrun' (runs inside a transaction that is always rolled back, so output reflects real data with no persistent effect), 'execute' (runs and commits). Blocked results carry the audit record id and blocked-construct count under error.details. The analysis is a guardrail, not a security boundary - the instance's own ACLs still apply. Every submission is audited. Possible error codes: SCRIPT_BLOCKED, SCRIPT_TIMEOUT, SCRIPT_ERROR, CONNECTION_FAILED.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "script": {
                            "type": "string",
                            "description": "Script body to run. REQUIRED."
                        },
                        "mode": {
                            "type": "string",
                            "enum": ["readonly", "dryrun", "execute"],
                            "description": "Execution mode. Default: readonly. Use 'dryrun' to preview write effects safely; only use 'execute' when the user has confirmed the mutation."
                        },
                        "timeout_seconds": {
                            "type": "number",
                            "description": "Server-side script timeout. Default 30, maximum 600."
                        },
                        "scope": {
                            "type": "string",
                            "description": "Application scope to run in. Default: global."
                        },
                        "description": {
                            "type": "string",
                            "description": "Free-text purpose of the script, carried into the audit trail."
                        },
                        "instance": {
                            "type": "string",
                            "description": "Target a specific connected instance. Omit for the active session."
                        }
                    },
                    "required": ["script"]
                }
            },
            {
                "name": "profiles",
                "description": "List saved credential profiles by name, with their instance and auth type. Secrets are never included. Use a profile name with the 'connect' tool instead of passing raw credentials.",
                "inputSchema": {
                    "type": "object",
                    "properties": {}
                }
            }
        ]
    }))
}

/// Handle tools/call request
///
/// Routes the tool call to the appropriate tool implementation.
async fn handle_call_tool(context: &ToolContext, params: Option<Value>) -> Result<Value> {
    let params = params.ok_or_else(|| anyhow!("Missing params"))?;
    let name = params["name"].as_str().ok_or_else(|| anyhow!("Missing tool name"))?;
    let arguments = &params["arguments"];

    match name {
        "connect" => tool_connect(context, arguments).await,
        "disconnect" => tool_disconnect(context, arguments).await,
        "status" => tool_status(context).await,
        "query" => tool_query(context, arguments).await,
        "script" => tool_script(context, arguments).await,
        "profiles" => tool_profiles(),
        _ => Err(anyhow!("Unknown tool: {name}")),
    }
}

// ============================================================================
// Tool Implementations
// ============================================================================

/// MCP Tool: connect
///
/// Resolves credentials, verifies them against the instance, and stores
/// the session in the registry.
async fn tool_connect(context: &ToolContext, args: &Value) -> Result<Value> {
    let instance = args.get("instance").and_then(|v| v.as_str());
    let params = auth_params_from_args(args)?;

    let session = match context.manager.connect(instance, &params).await {
        Ok(session) => session,
        Err(e) => return CallToolResult::failure(instance.unwrap_or(""), "connect", &e),
    };

    // Save-on-connect: only after the credentials proved themselves
    let saved_profile = match args.get("save_profile").and_then(|v| v.as_str()) {
        Some(name) => {
            let profile = profile_from_args(args, &session.instance_url)?;
            match crate::config::save_profile(name, profile) {
                Ok(()) => Some(name.to_string()),
                Err(e) => return CallToolResult::failure(&session.instance_url, "connect", &e),
            }
        }
        None => None,
    };

    let mut response = serde_json::json!({
        "ok": true,
        "instance": session.instance_url,
        "auth_type": session.auth_type.as_str(),
        "user": session.user_name,
        "roles": session.roles,
        "version": session.instance_version,
        "message": format!("Connected to {} as {}", session.instance_url, session.user_name)
    });
    if let Some(name) = saved_profile {
        response["saved_profile"] = Value::String(name);
    }

    CallToolResult::success(response)
}

/// MCP Tool: disconnect
async fn tool_disconnect(context: &ToolContext, args: &Value) -> Result<Value> {
    let instance = args.get("instance").and_then(|v| v.as_str());

    match context.manager.disconnect(instance).await {
        Ok(disconnected) => {
            let message = if disconnected {
                "Session closed"
            } else {
                "No matching session to disconnect"
            };
            CallToolResult::success(serde_json::json!({
                "ok": true,
                "disconnected": disconnected,
                "message": message
            }))
        }
        Err(e) => CallToolResult::failure(instance.unwrap_or(""), "disconnect", &e),
    }
}

/// MCP Tool: status
async fn tool_status(context: &ToolContext) -> Result<Value> {
    let status = context.manager.status().await;
    CallToolResult::success(status)
}

/// MCP Tool: query
///
/// Reads records from a table through the active (or named) session.
async fn tool_query(context: &ToolContext, args: &Value) -> Result<Value> {
    let table = args["table"].as_str().ok_or_else(|| anyhow!("Missing required field: table"))?;
    let query = args.get("query").and_then(|v| v.as_str());
    let fields = args.get("fields").and_then(|v| v.as_str());
    let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(10) as usize;
    let instance = args.get("instance").and_then(|v| v.as_str());

    let client = match context.manager.registry().client_for(instance).await {
        Ok(client) => client,
        Err(e) => return CallToolResult::failure(instance.unwrap_or(""), "query", &e),
    };

    match client.get_records(table, query, fields, limit).await {
        Ok(records) => CallToolResult::success(serde_json::json!({
            "ok": true,
            "table": table,
            "count": records.len(),
            "records": records
        })),
        Err(e) => CallToolResult::failure(client.instance_url(), "query", &e),
    }
}

/// MCP Tool: script
///
/// Submits a script to the execution pipeline: analysis, dispatch, audit.
async fn tool_script(context: &ToolContext, args: &Value) -> Result<Value> {
    let script = args["script"].as_str().ok_or_else(|| anyhow!("Missing required field: script"))?;
    let instance = args.get("instance").and_then(|v| v.as_str());

    let mode = match args.get("mode").and_then(|v| v.as_str()) {
        Some(raw) => match raw.parse::<ExecutionMode>() {
            Ok(mode) => mode,
            Err(e) => return CallToolResult::failure(instance.unwrap_or(""), "script", &e),
        },
        None => ExecutionMode::ReadOnly,
    };

    let mut request = ScriptExecutionRequest::new(script, mode);
    if let Some(timeout) = args.get("timeout_seconds").and_then(Value::as_u64) {
        request.timeout_seconds = timeout;
    }
    request.scope = args.get("scope").and_then(|v| v.as_str()).map(String::from);
    request.description = args.get("description").and_then(|v| v.as_str()).map(String::from);

    let registry = context.manager.registry();
    let client = match registry.client_for(instance).await {
        Ok(client) => client,
        Err(e) => return CallToolResult::failure(instance.unwrap_or(""), "script", &e),
    };
    let session = match registry.session_for(instance).await {
        Some(session) => session,
        None => {
            let e = NowgateError::connection_failed("Session disappeared during dispatch");
            return CallToolResult::failure(client.instance_url(), "script", &e);
        }
    };

    match context.runner.run(&client, &session, &request).await {
        Ok(run) => CallToolResult::success(serde_json::json!({
            "ok": true,
            "instance": session.instance_url,
            "result": run
        })),
        Err(e) => CallToolResult::failure(&session.instance_url, "script", &e),
    }
}

/// MCP Tool: profiles
///
/// Lists stored credential profiles with secrets stripped.
fn tool_profiles() -> Result<Value> {
    match crate::config::list_profiles() {
        Ok(profiles) => CallToolResult::success(serde_json::json!({
            "ok": true,
            "count": profiles.len(),
            "profiles": profiles
        })),
        Err(e) => CallToolResult::failure("", "profiles", &e),
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Build [`AuthParams`] from JSON arguments
fn auth_params_from_args(args: &Value) -> Result<AuthParams> {
    let auth_type = match args.get("auth_type").and_then(|v| v.as_str()) {
        Some(raw) => Some(raw.parse::<AuthType>().map_err(|e| anyhow!(e.message()))?),
        None => None,
    };

    Ok(AuthParams {
        auth_type,
        profile: args.get("profile").and_then(|v| v.as_str()).map(String::from),
        username: args.get("username").and_then(|v| v.as_str()).map(String::from),
        password: args.get("password").and_then(|v| v.as_str()).map(String::from),
        token: args.get("token").and_then(|v| v.as_str()).map(String::from),
        client_id: args.get("client_id").and_then(|v| v.as_str()).map(String::from),
        client_secret: args.get("client_secret").and_then(|v| v.as_str()).map(String::from),
    })
}

/// Build a [`CredentialProfile`] for save-on-connect from explicit arguments
fn profile_from_args(args: &Value, instance_url: &str) -> Result<CredentialProfile> {
    let auth_type = args
        .get("auth_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("save_profile requires explicit credentials, not a profile"))?
        .parse::<AuthType>()
        .map_err(|e| anyhow!(e.message()))?;

    Ok(CredentialProfile {
        instance: instance_url.to_string(),
        auth_type,
        username: args.get("username").and_then(|v| v.as_str()).map(String::from),
        password: args.get("password").and_then(|v| v.as_str()).map(String::from),
        password_env: None,
        token: args.get("token").and_then(|v| v.as_str()).map(String::from),
        token_env: None,
        client_id: args.get("client_id").and_then(|v| v.as_str()).map(String::from),
        client_secret: args.get("client_secret").and_then(|v| v.as_str()).map(String::from),
        refresh_token: None,
    })
}
