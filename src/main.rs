//! Nowgate CLI Entry Point
//!
//! This is the main binary entry point for the Nowgate CLI.
//! It provides these subcommands:
//! - `connect` - Verify credentials against an instance, optionally saving a profile
//! - `disconnect` - Close a session
//! - `status` - Report session state
//! - `query` - Read records from a table
//! - `script` - Run a background script through safety analysis
//! - `profiles` - List saved credential profiles
//! - `mcp` - MCP server mode (hidden, for AI agent integration)
//!
//! All output to stdout is JSON-only. Logs go to stderr.
//!
//! Sessions live for the duration of the process: `query` and `script`
//! accept connection arguments and open their session themselves, while
//! the long-lived `mcp` mode keeps sessions across tool calls.

use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use nowgate::audit::AuditRecorder;
use nowgate::auth::{AuthParams, AuthType};
use nowgate::client::RetryPolicy;
use nowgate::error::{NowgateError, Result};
use nowgate::mcp::{self, ToolContext};
use nowgate::output::{ErrorEnvelope, Metadata, SuccessEnvelope};
use nowgate::safety::ExecutionMode;
use nowgate::script::ScriptExecutionRequest;

/// Nowgate - Agent-First ServiceNow Instance Control CLI
#[derive(Parser)]
#[command(name = "nowgate")]
#[command(about = "Agent-first ServiceNow instance control CLI with script-safety guardrails")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Connection arguments shared by every instance-touching subcommand
#[derive(Args, Clone)]
struct ConnArgs {
    /// Instance hostname or URL (bare names expand to *.service-now.com)
    #[arg(long)]
    instance: Option<String>,

    /// Saved credential profile to use
    #[arg(long)]
    profile: Option<String>,

    /// Authentication mode: basic, oauth, or token
    #[arg(long)]
    auth_type: Option<String>,

    /// Username (basic auth)
    #[arg(long)]
    username: Option<String>,

    /// Password (basic auth); prompted for interactively when omitted
    #[arg(long)]
    password: Option<String>,

    /// Bearer token (token auth) or pre-obtained OAuth access token
    #[arg(long)]
    token: Option<String>,

    /// OAuth client id
    #[arg(long)]
    client_id: Option<String>,

    /// OAuth client secret
    #[arg(long)]
    client_secret: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify credentials against an instance and report the identity
    Connect {
        #[command(flatten)]
        conn: ConnArgs,

        /// Save the verified credentials under this profile name
        #[arg(long)]
        save_profile: Option<String>,
    },

    /// Close a session
    Disconnect {
        /// Instance to disconnect; the active session when omitted
        #[arg(long)]
        instance: Option<String>,
    },

    /// Report session state
    Status,

    /// Read records from a table
    Query {
        #[command(flatten)]
        conn: ConnArgs,

        /// Table name, e.g. incident
        #[arg(long)]
        table: String,

        /// Encoded query string, e.g. 'active=true^priority=1'
        #[arg(long)]
        query: Option<String>,

        /// Comma-separated field list to return
        #[arg(long)]
        fields: Option<String>,

        /// Maximum records to return
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Run a background script through safety analysis
    Script {
        #[command(flatten)]
        conn: ConnArgs,

        /// Script body; use @path to read from a file
        #[arg(long)]
        script: String,

        /// Execution mode: readonly, dryrun, or execute
        #[arg(long, default_value = "readonly")]
        mode: String,

        /// Server-side script timeout in seconds
        #[arg(long, default_value_t = nowgate::script::DEFAULT_SCRIPT_TIMEOUT_SECS)]
        timeout_seconds: u64,

        /// Application scope; global when omitted
        #[arg(long)]
        scope: Option<String>,

        /// Free-text purpose, carried into the audit trail
        #[arg(long)]
        description: Option<String>,
    },

    /// List saved credential profiles (secrets are never shown)
    Profiles,

    /// Start MCP server (hidden from help, for AI agent integration)
    #[command(hide = true)]
    Mcp,
}

#[tokio::main]
async fn main() {
    // Logs to stderr so stdout stays machine-parseable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit = run(cli.command).await;
    std::process::exit(exit);
}

async fn run(command: Commands) -> i32 {
    match command {
        Commands::Mcp => {
            let context = match tool_context() {
                Ok(context) => context,
                Err(e) => {
                    print_error("", "mcp", &e);
                    return 1;
                }
            };
            if let Err(e) = mcp::serve(context).await {
                tracing::error!(error = %e, "mcp server terminated");
                return 1;
            }
            0
        }
        Commands::Connect { conn, save_profile } => {
            emit("connect", cmd_connect(conn, save_profile).await)
        }
        Commands::Disconnect { instance } => emit("disconnect", cmd_disconnect(instance).await),
        Commands::Status => emit("status", cmd_status().await),
        Commands::Query { conn, table, query, fields, limit } => {
            emit("query", cmd_query(conn, &table, query, fields, limit).await)
        }
        Commands::Script { conn, script, mode, timeout_seconds, scope, description } => emit(
            "script",
            cmd_script(conn, script, &mode, timeout_seconds, scope, description).await,
        ),
        Commands::Profiles => emit("profiles", cmd_profiles()),
    }
}

/// Per-command result: instance, data, and an optional record count
struct CommandOutput {
    instance: String,
    data: Value,
    records: Option<usize>,
}

/// Print the envelope for a command result and map it to an exit code
fn emit(command: &str, outcome: std::result::Result<(CommandOutput, Instant), NowgateError>) -> i32 {
    match outcome {
        Ok((output, started)) => {
            let execution_ms = started.elapsed().as_millis() as u64;
            let meta = match output.records {
                Some(n) => Metadata::with_records(execution_ms, n),
                None => Metadata::new(execution_ms),
            };
            let envelope = SuccessEnvelope::new(output.instance, command, output.data, meta);
            print_json(&envelope);
            0
        }
        Err(e) => {
            print_error("", command, &e);
            1
        }
    }
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize output");
            println!(r#"{{"ok": false, "error": {{"code": "UNKNOWN_ERROR", "message": "output serialization failed"}}}}"#);
        }
    }
}

fn print_error(instance: &str, command: &str, err: &NowgateError) {
    print_json(&ErrorEnvelope::from_error(instance, command, err));
}

fn tool_context() -> Result<ToolContext> {
    match audit_mirror_path() {
        Some(path) => {
            ToolContext::with_recorder(RetryPolicy::default(), Arc::new(AuditRecorder::with_mirror(path)))
        }
        None => ToolContext::new(RetryPolicy::default()),
    }
}

/// Optional JSONL audit mirror, enabled via NOWGATE_AUDIT_LOG
fn audit_mirror_path() -> Option<std::path::PathBuf> {
    std::env::var("NOWGATE_AUDIT_LOG").ok().filter(|p| !p.is_empty()).map(Into::into)
}

/// Turn CLI connection arguments into [`AuthParams`], prompting for a
/// missing basic-auth password on a terminal
fn auth_params(conn: &ConnArgs) -> Result<AuthParams> {
    let auth_type = match conn.auth_type.as_deref() {
        Some(raw) => Some(raw.parse::<AuthType>()?),
        None => None,
    };

    let mut password = conn.password.clone();
    if auth_type == Some(AuthType::Basic)
        && password.is_none()
        && conn.username.is_some()
        && std::io::IsTerminal::is_terminal(&std::io::stdin())
    {
        let prompted = dialoguer::Password::new()
            .with_prompt(format!("Password for {}", conn.username.as_deref().unwrap_or("")))
            .interact()
            .map_err(|e| NowgateError::authentication_failed(format!("Password prompt failed: {e}")))?;
        password = Some(prompted);
    }

    Ok(AuthParams {
        auth_type,
        profile: conn.profile.clone(),
        username: conn.username.clone(),
        password,
        token: conn.token.clone(),
        client_id: conn.client_id.clone(),
        client_secret: conn.client_secret.clone(),
    })
}

async fn cmd_connect(
    conn: ConnArgs,
    save_profile: Option<String>,
) -> std::result::Result<(CommandOutput, Instant), NowgateError> {
    let started = Instant::now();
    let context = tool_context()?;
    let params = auth_params(&conn)?;

    let session = context.manager().connect(conn.instance.as_deref(), &params).await?;

    let saved = match save_profile {
        Some(name) => {
            let auth_type = params.auth_type.ok_or_else(|| {
                NowgateError::authentication_failed(
                    "--save-profile requires explicit credentials, not --profile",
                )
            })?;
            let profile = nowgate::config::CredentialProfile {
                instance: session.instance_url.clone(),
                auth_type,
                username: params.username.clone(),
                password: params.password.clone(),
                password_env: None,
                token: params.token.clone(),
                token_env: None,
                client_id: params.client_id.clone(),
                client_secret: params.client_secret.clone(),
                refresh_token: None,
            };
            nowgate::config::save_profile(&name, profile)?;
            Some(name)
        }
        None => None,
    };

    let mut data = json!({
        "user": session.user_name,
        "roles": session.roles,
        "version": session.instance_version,
        "auth_type": session.auth_type.as_str(),
    });
    if let Some(name) = saved {
        data["saved_profile"] = Value::String(name);
    }

    Ok((CommandOutput { instance: session.instance_url, data, records: None }, started))
}

async fn cmd_disconnect(
    instance: Option<String>,
) -> std::result::Result<(CommandOutput, Instant), NowgateError> {
    let started = Instant::now();
    let context = tool_context()?;
    let disconnected = context.manager().disconnect(instance.as_deref()).await?;
    Ok((
        CommandOutput {
            instance: instance.unwrap_or_default(),
            data: json!({ "disconnected": disconnected }),
            records: None,
        },
        started,
    ))
}

async fn cmd_status() -> std::result::Result<(CommandOutput, Instant), NowgateError> {
    let started = Instant::now();
    let context = tool_context()?;
    let status = context.manager().status().await;
    let instance = status.active_instance.clone().unwrap_or_default();
    Ok((
        CommandOutput {
            instance,
            data: serde_json::to_value(&status).map_err(|e| NowgateError::unknown(e.to_string()))?,
            records: None,
        },
        started,
    ))
}

async fn cmd_query(
    conn: ConnArgs,
    table: &str,
    query: Option<String>,
    fields: Option<String>,
    limit: usize,
) -> std::result::Result<(CommandOutput, Instant), NowgateError> {
    let started = Instant::now();
    let context = tool_context()?;
    let params = auth_params(&conn)?;

    let session = context.manager().connect(conn.instance.as_deref(), &params).await?;
    let client = context.manager().registry().client_for(Some(&session.instance_url)).await?;

    let records = client.get_records(table, query.as_deref(), fields.as_deref(), limit).await?;
    let count = records.len();

    Ok((
        CommandOutput {
            instance: session.instance_url,
            data: json!({ "table": table, "records": records }),
            records: Some(count),
        },
        started,
    ))
}

async fn cmd_script(
    conn: ConnArgs,
    script: String,
    mode: &str,
    timeout_seconds: u64,
    scope: Option<String>,
    description: Option<String>,
) -> std::result::Result<(CommandOutput, Instant), NowgateError> {
    let started = Instant::now();
    let context = tool_context()?;
    let params = auth_params(&conn)?;

    // @path reads the script body from a file
    let script = match script.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| NowgateError::unknown(format!("Cannot read script file '{path}': {e}")))?,
        None => script,
    };

    let mode = mode.parse::<ExecutionMode>()?;
    let mut request = ScriptExecutionRequest::new(script, mode);
    request.timeout_seconds = timeout_seconds;
    request.scope = scope;
    request.description = description;

    let session = context.manager().connect(conn.instance.as_deref(), &params).await?;
    let client = context.manager().registry().client_for(Some(&session.instance_url)).await?;

    let run = context.runner().run(&client, &session, &request).await?;

    Ok((
        CommandOutput {
            instance: session.instance_url,
            data: serde_json::to_value(&run).map_err(|e| NowgateError::unknown(e.to_string()))?,
            records: None,
        },
        started,
    ))
}

fn cmd_profiles() -> std::result::Result<(CommandOutput, Instant), NowgateError> {
    let started = Instant::now();
    let profiles = nowgate::config::list_profiles()?;
    let count = profiles.len();
    Ok((
        CommandOutput {
            instance: String::new(),
            data: json!({ "profiles": profiles }),
            records: Some(count),
        },
        started,
    ))
}
