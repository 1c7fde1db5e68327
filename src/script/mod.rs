//! Script Execution Pipeline
//!
//! Drives a submission through analysis, dispatch, and audit:
//! submitted -> analyzed -> blocked, or approved -> dispatched ->
//! completed/failed. A blocked script never touches the transport, and
//! every submission lands in the audit log exactly once regardless of
//! which way it exits the pipeline.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditRecorder, AuditStatus};
use crate::client::InstanceClient;
use crate::error::{NowgateError, Result};
use crate::safety::{ExecutionMode, SafetyAnalyzer};
use crate::session::ConnectionSession;

pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 30;
pub const MAX_SCRIPT_TIMEOUT_SECS: u64 = 600;

/// One script submission
#[derive(Debug, Clone)]
pub struct ScriptExecutionRequest {
    pub script: String,
    pub mode: ExecutionMode,
    pub timeout_seconds: u64,
    /// Application scope; `None` runs in global
    pub scope: Option<String>,
    /// Free-text purpose, carried into logs
    pub description: Option<String>,
}

impl ScriptExecutionRequest {
    #[must_use]
    pub fn new(script: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            script: script.into(),
            mode,
            timeout_seconds: DEFAULT_SCRIPT_TIMEOUT_SECS,
            scope: None,
            description: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 || self.timeout_seconds > MAX_SCRIPT_TIMEOUT_SECS {
            return Err(NowgateError::unknown(format!(
                "timeout_seconds must be between 1 and {MAX_SCRIPT_TIMEOUT_SECS}, got {}",
                self.timeout_seconds
            )));
        }
        Ok(())
    }
}

/// Outcome of a dispatched (not blocked) submission
#[derive(Debug, Clone, Serialize)]
pub struct ScriptRun {
    pub execution_id: Uuid,
    pub mode: ExecutionMode,
    pub output: String,
    pub duration_ms: u64,
    /// True when the instance rolled the transaction back (readonly and
    /// dryrun both dispatch inside the rollback wrapper)
    pub rolled_back: bool,
    /// Warn-rule matches surfaced alongside the result
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Analysis + dispatch + audit, behind one entry point
pub struct ScriptRunner {
    analyzer: SafetyAnalyzer,
    recorder: Arc<AuditRecorder>,
}

impl ScriptRunner {
    pub fn new(recorder: Arc<AuditRecorder>) -> Result<Self> {
        Ok(Self { analyzer: SafetyAnalyzer::new()?, recorder })
    }

    #[must_use]
    pub fn recorder(&self) -> &Arc<AuditRecorder> {
        &self.recorder
    }

    /// Run one submission against the given session's instance
    ///
    /// # Errors
    /// `SCRIPT_BLOCKED` when analysis rejects the script (audited, never
    /// dispatched); transport and instance errors pass through after the
    /// failure is audited.
    pub async fn run(
        &self,
        client: &InstanceClient,
        session: &ConnectionSession,
        request: &ScriptExecutionRequest,
    ) -> Result<ScriptRun> {
        request.validate()?;

        let verdict = self.analyzer.analyze(&request.script, request.mode);
        if !verdict.approved {
            let reason = verdict
                .reason
                .clone()
                .unwrap_or_else(|| "Script rejected by safety analysis".to_string());
            let category = verdict
                .matched_category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "mode_enforcement".to_string());

            let record = AuditRecord::new(
                &session.user_name,
                &session.instance_url,
                &request.script,
                request.mode,
                AuditStatus::Blocked,
            )
            .with_block(reason.clone(), verdict.mutations_blocked);
            let execution_id = record.execution_id.to_string();
            tracing::warn!(
                execution_id = %record.execution_id,
                category = %category,
                "script blocked before dispatch"
            );
            self.recorder.record(record);

            return Err(NowgateError::ScriptBlocked {
                category,
                reason,
                execution_id,
                mutations_blocked: verdict.mutations_blocked,
            });
        }

        let dispatched = dispatched_text(&request.script, request.mode);

        // Minted before dispatch: the record's timestamp is submission
        // time, so audit ordering matches submission order even when
        // dispatches overlap or run long.
        let mut record = AuditRecord::new(
            &session.user_name,
            &session.instance_url,
            &request.script,
            request.mode,
            AuditStatus::Success,
        );
        let execution_id = record.execution_id;

        let started = Instant::now();
        let outcome = client
            .run_script(&dispatched, request.scope.as_deref(), request.timeout_seconds)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let status = if outcome.is_ok() { AuditStatus::Success } else { AuditStatus::Failure };
        record.status = status;
        record.duration_ms = Some(duration_ms);
        tracing::info!(
            execution_id = %execution_id,
            mode = %request.mode,
            status = status.as_str(),
            duration_ms,
            description = request.description.as_deref().unwrap_or(""),
            "script dispatch finished"
        );
        self.recorder.record(record);

        let output = outcome?;
        Ok(ScriptRun {
            execution_id,
            mode: request.mode,
            output: output.output,
            duration_ms: output.elapsed_ms.unwrap_or(duration_ms),
            rolled_back: request.mode != ExecutionMode::Execute,
            warnings: verdict.warnings,
        })
    }
}

/// The script text actually sent to the instance for a given mode
///
/// Only `execute` dispatches raw. `readonly` scripts that reach dispatch
/// have already passed the mutation scan, but they still run inside the
/// rollback wrapper so a scan gap cannot turn into a committed write.
fn dispatched_text(script: &str, mode: ExecutionMode) -> String {
    match mode {
        ExecutionMode::Execute => script.to_string(),
        ExecutionMode::ReadOnly | ExecutionMode::DryRun => wrap_dryrun(script),
    }
}

/// Wrap a script in a transaction that always rolls back
///
/// The wrapper runs server-side: the script executes with real data
/// visible to it, then every write is undone before the transaction
/// commits.
fn wrap_dryrun(script: &str) -> String {
    format!(
        "var __tx = GlideTransaction.get();\n\
         try {{\n{script}\n}} finally {{\n    __tx.rollback();\n    gs.info('dryrun: transaction rolled back');\n}}"
    )
}
