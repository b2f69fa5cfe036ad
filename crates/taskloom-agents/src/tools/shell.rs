use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use taskloom_common::{Error, Result};
use tokio::process::Command;
use tracing::{info, warn};

use crate::parser::ToolParams;
use crate::tools::{Tool, ToolContext, ToolOutput, required_param, truncate_output};

pub struct ExecuteCommand {
    timeout: Duration,
    max_output_bytes: usize,
}

impl ExecuteCommand {
    pub fn new(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
        }
    }

    fn shell(command: &str) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
    }
}

#[async_trait]
impl Tool for ExecuteCommand {
    fn name(&self) -> &'static str {
        "execute_command"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the working directory and return its combined output."
    }

    fn parameters(&self) -> &'static [(&'static str, &'static str)] {
        &[("command", "the shell command line to run")]
    }

    async fn execute(&self, context: &ToolContext, params: &ToolParams) -> Result<ToolOutput> {
        let command = required_param(params, self.name(), "command")?.trim();
        if command.is_empty() {
            return Ok(ToolOutput::error("execute_command: empty command"));
        }
        info!(task = %context.task_id, %command, "executing command");

        let child = Self::shell(command)
            .current_dir(&context.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|e| Error::Tool(format!("execute_command: {e}")))?,
            Err(_) => {
                warn!(%command, "command exceeded its time limit");
                return Ok(ToolOutput::error(format!(
                    "execute_command: killed after {:?} without finishing",
                    self.timeout
                )));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        let mut combined = truncate_output(combined.trim_end().to_string(), self.max_output_bytes);

        if output.status.success() {
            Ok(ToolOutput::success(combined))
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&format!("[exit status: {code}]"));
            Ok(ToolOutput::error(combined))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn command(line: &str) -> ToolParams {
        [("command".to_string(), line.to_string())].into_iter().collect()
    }

    #[tokio::test]
    async fn captures_stdout_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let tool = ExecuteCommand::new(Duration::from_secs(10), 4096);
        let out = tool
            .execute(&ToolContext::new(dir.path()), &command("ls"))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content, "marker.txt");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecuteCommand::new(Duration::from_secs(10), 4096);
        let out = tool
            .execute(&ToolContext::new(dir.path()), &command("echo oops >&2; exit 3"))
            .await
            .unwrap();
        assert!(out.is_error);
        assert_eq!(out.content, "oops\n[exit status: 3]");
    }

    #[tokio::test]
    async fn slow_commands_are_killed() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecuteCommand::new(Duration::from_millis(100), 4096);
        let out = tool
            .execute(&ToolContext::new(dir.path()), &command("sleep 5"))
            .await
            .unwrap();
        assert!(out.is_error);
        assert_eq!(out.content, "execute_command: killed after 100ms without finishing");
    }
}
