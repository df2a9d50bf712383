// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Shell execution under the safety policy.
//!
//! The result is a JSON object `{rc, out, err, truncated, warnings?}` so
//! the model can branch on the exit code without parsing prose.  Children
//! run in their own session (`setsid`) with stdin closed; on abort or
//! timeout the whole process group receives SIGKILL.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use idlehands_config::ApprovalMode;

use crate::env::ToolEnv;
use crate::safety::{command_scope_violations, has_background_intent, screen_command, SafetyVerdict};
use crate::tool::{OutputCategory, Tool, ToolCall, ToolError, ToolErrorCode, ToolOutput};

/// Byte ceiling per captured stream before head/tail truncation.
const STREAM_LIMIT: usize = 20_000;
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

pub struct ExecTool {
    env: Arc<ToolEnv>,
}

impl ExecTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Run a shell command and return {rc, out, err, truncated, warnings?} as JSON.\n\
         rc=0 with empty out is normal for many commands — do not retry just to see\n\
         output. Output is capped; pipe large results through tail/grep. Background\n\
         execution (trailing &) is rejected. Prefer read_file/search_files for file\n\
         access — they are cheaper and cacheable."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command (bash -c)" },
                "workdir": { "type": "string", "description": "Working directory (default: session cwd)" },
                "timeout_secs": { "type": "integer", "description": "Override the exec timeout" }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(command) = call.str_arg("command") else {
            return ToolError::invalid_args("missing 'command'").output(&call.id);
        };
        let timeout = call
            .u64_arg("timeout_secs")
            .unwrap_or(self.env.exec_timeout)
            .min(self.env.exec_timeout);

        // ── Safety gate ───────────────────────────────────────────────────────
        if has_background_intent(command) {
            return ToolError::new(
                ToolErrorCode::Validation,
                "background execution (trailing &) is not supported",
            )
            .with_hint("run the command in the foreground; long jobs can raise timeout_secs")
            .output(&call.id);
        }

        let mut warnings: Vec<String> = Vec::new();
        match screen_command(command) {
            SafetyVerdict::Forbidden { reason } => {
                return ToolError::new(ToolErrorCode::Forbidden, format!("command blocked: {reason}"))
                    .output(&call.id);
            }
            SafetyVerdict::Cautious { reason } => {
                let mode = self.env.approval_mode();
                let allowed = self.env.no_confirm
                    || mode == ApprovalMode::Yolo
                    || self.env.confirmer.confirm("exec", &reason).await;
                if !allowed {
                    return ToolError::new(
                        ToolErrorCode::CautiousDenied,
                        format!("command denied: {reason}"),
                    )
                    .output(&call.id);
                }
            }
            SafetyVerdict::Ok => {}
        }

        // ── Scope gate ────────────────────────────────────────────────────────
        let violations =
            command_scope_violations(command, &self.env.cwd, &self.env.allowed_write_roots);
        if !violations.is_empty() {
            let mode = self.env.approval_mode();
            if matches!(mode, ApprovalMode::Yolo | ApprovalMode::AutoEdit) {
                warnings.push(format!(
                    "command leaves the session scope: {}",
                    violations.join(", ")
                ));
            } else {
                return ToolError::new(
                    ToolErrorCode::PathEscape,
                    format!("command leaves the session scope: {}", violations.join(", ")),
                )
                .with_hint("work inside the project directory, or ask for the path to be allowed")
                .output(&call.id);
            }
        }

        // ── Spawn ─────────────────────────────────────────────────────────────
        let workdir = call
            .str_arg("workdir")
            .map(|w| self.env.resolve_path(w))
            .unwrap_or_else(|| self.env.cwd.clone());

        debug!(command, workdir = %workdir.display(), timeout, "exec");

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // New session detaches the child from any controlling terminal and
        // gives it its own process group, so the whole pipeline can be
        // killed with one signal.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return ToolError::new(ToolErrorCode::Io, format!("spawn error: {e}"))
                    .output(&call.id)
            }
        };
        let child_id = child.id();

        let abort = self.env.abort.clone();
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        enum Ended {
            Output(std::io::Result<std::process::Output>),
            Timeout,
            Cancelled,
        }

        let ended = tokio::select! {
            r = &mut wait => Ended::Output(r),
            _ = tokio::time::sleep(Duration::from_secs(timeout)) => Ended::Timeout,
            _ = abort.cancelled() => Ended::Cancelled,
        };

        let output = match ended {
            Ended::Output(Ok(o)) => o,
            Ended::Output(Err(e)) => {
                return ToolError::new(ToolErrorCode::Io, format!("wait error: {e}"))
                    .output(&call.id)
            }
            Ended::Timeout => {
                kill_group(child_id);
                let _ = wait.await;
                return ToolError::new(
                    ToolErrorCode::Timeout,
                    format!("command timed out after {timeout}s"),
                )
                .with_hint("narrow the command or raise timeout_secs")
                .output(&call.id);
            }
            Ended::Cancelled => {
                kill_group(child_id);
                let _ = wait.await;
                return ToolError::new(ToolErrorCode::Cancelled, "command cancelled")
                    .output(&call.id);
            }
        };

        // ── Result shaping ────────────────────────────────────────────────────
        let rc = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let truncated = stdout.len() > STREAM_LIMIT || stderr.len() > STREAM_LIMIT;
        let out_text = head_tail_truncate(&stdout);
        let err_text = head_tail_truncate(&stderr);

        if rc == 0 && out_text.is_empty() && err_text.is_empty() {
            warnings.push("command produced no output; rc=0 means it succeeded — do not retry".into());
        } else if rc == 1 && out_text.is_empty() {
            warnings.push("rc=1 with no output usually means no matches, not a failure".into());
        } else if rc > 1 {
            warnings.push(format!(
                "rc={rc} is a hard failure; read err before retrying"
            ));
        }

        let mut body = json!({
            "rc": rc,
            "out": out_text,
            "err": err_text,
            "truncated": truncated,
        });
        if !warnings.is_empty() {
            body["warnings"] = json!(warnings);
        }
        let rendered = body.to_string();
        if rc == 0 || rc == 1 {
            ToolOutput::ok(&call.id, rendered)
        } else {
            // The JSON body still reaches the model; is_error drives the
            // orchestrator's fail-fast for batches.
            ToolOutput {
                call_id: call.id.clone(),
                content: rendered,
                is_error: true,
            }
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // Negative pid addresses the process group created by setsid.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// Keep the first and last lines of oversized output; errors and summaries
/// cluster at the end, preambles at the start.
fn head_tail_truncate(s: &str) -> String {
    if s.len() <= STREAM_LIMIT {
        return s.to_string();
    }
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= HEAD_LINES + TAIL_LINES {
        let head = &s[..STREAM_LIMIT / 2];
        let tail = &s[s.len() - STREAM_LIMIT / 2..];
        return format!(
            "{head}\n...[{} bytes omitted]...\n{tail}",
            s.len() - head.len() - tail.len()
        );
    }
    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[lines.len() - TAIL_LINES..].join("\n");
    let omitted = lines.len() - HEAD_LINES - TAIL_LINES;
    format!("{head}\n...[{omitted} lines omitted]...\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
