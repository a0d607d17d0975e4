use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use grantops_types::{ActionKind, ActionOutcome, ErrorInfo, GrantOpsError, Result, TargetRef};
use tokio::io::AsyncWriteExt;

use crate::action::{ActionContext, ActionInterface};

const MAX_ERROR_OUTPUT: usize = 4096;

const PLACEHOLDERS: [(&str, &str); 5] = [
    ("{target}", "GRANTOPS_TARGET"),
    ("{step}", "GRANTOPS_STEP"),
    ("{run_id}", "GRANTOPS_RUN_ID"),
    ("{action}", "GRANTOPS_ACTION"),
    ("{attempt}", "GRANTOPS_ATTEMPT"),
];

// ---------------------------------------------------------------------------
// CommandAction: runs a configured shell command
// ---------------------------------------------------------------------------

/// Runs `sh -c <template>` for an action.
///
/// The values are exported as `GRANTOPS_*` environment variables, and
/// `{target}`, `{step}`, `{run_id}`, `{action}` and `{attempt}` in the
/// template become double-quoted references to them (`{step}` turns into
/// `"$GRANTOPS_STEP"`), so a value is never parsed as shell syntax. Write the
/// placeholders bare, not inside quotes. The target's current content is fed
/// on stdin. A zero exit status is success and non-empty stdout becomes the
/// artifact. The child is killed if the invocation is dropped, e.g. on a
/// step timeout.
pub struct CommandAction {
    template: String,
    workdir: Option<PathBuf>,
}

impl CommandAction {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    fn render(&self) -> String {
        PLACEHOLDERS
            .iter()
            .fold(self.template.clone(), |command, (placeholder, var)| {
                command.replace(placeholder, &format!("\"${var}\""))
            })
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let cut = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= limit)
        .last()
        .unwrap_or(0);
    &text[..cut]
}

#[async_trait]
impl ActionInterface for CommandAction {
    async fn invoke(
        &self,
        action: ActionKind,
        target: &TargetRef,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome> {
        let command = self.render();
        tracing::info!(step = %ctx.step, target = %target, command = %command, "Running action command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        cmd.env("GRANTOPS_RUN_ID", &ctx.run_id)
            .env("GRANTOPS_PIPELINE", &ctx.pipeline)
            .env("GRANTOPS_STEP", &ctx.step)
            .env("GRANTOPS_ACTION", action.as_str())
            .env("GRANTOPS_TARGET", target.to_string())
            .env("GRANTOPS_ATTEMPT", ctx.attempt.to_string());
        if let Some(section) = &ctx.section {
            cmd.env("GRANTOPS_SECTION_VERSION", section.current_version.to_string());
        }
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawn_error = |e: std::io::Error| GrantOpsError::ActionFailed {
            step: ctx.step.clone(),
            action: action.to_string(),
            target: target.to_string(),
            message: format!("failed to run '{command}': {e}"),
        };
        let mut child = cmd.spawn().map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = ctx.current_content.clone().unwrap_or_default();
            // A command that never reads stdin closes the pipe; that is fine.
            tokio::spawn(async move {
                let _ = stdin.write_all(input.as_bytes()).await;
            });
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::info!(
            step = %ctx.step,
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Action command finished"
        );

        if !output.status.success() {
            let detail = truncate(stderr.trim(), MAX_ERROR_OUTPUT);
            return Ok(ActionOutcome {
                success: false,
                artifact: None,
                error: Some(ErrorInfo {
                    message: if detail.is_empty() {
                        format!("command exited with code {exit_code}")
                    } else {
                        format!("command exited with code {exit_code}: {detail}")
                    },
                    code: Some(exit_code.to_string()),
                }),
            });
        }

        if stdout.trim().is_empty() {
            Ok(ActionOutcome::success())
        } else {
            Ok(ActionOutcome::with_artifact(stdout))
        }
    }
}
