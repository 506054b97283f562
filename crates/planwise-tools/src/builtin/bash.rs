use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use planwise_core::error::{PlanwiseError, Result};
use planwise_core::traits::Tool;
use planwise_core::types::{ToolContext, ToolResult};

use super::{outer_timeout, run_with_timeout, truncate_output};

pub struct BashTool {
    default_timeout: u64,
}

#[derive(Deserialize)]
struct BashInput {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

impl BashTool {
    pub fn new(default_timeout: u64) -> Self {
        Self { default_timeout }
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new(120)
    }
}

impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command. Returns stdout and stderr. Use for file operations, listing artifacts, installing packages, etc."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": format!("Timeout in seconds (default {})", self.default_timeout),
                    "default": self.default_timeout
                }
            },
            "required": ["command"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: BashInput = serde_json::from_value(input)
                .map_err(|e| PlanwiseError::ToolValidation(e.to_string()))?;
            let timeout = params.timeout.unwrap_or(self.default_timeout);

            debug!(agent = %ctx.agent_name, command = %params.command, "Executing bash command");

            let output = run_with_timeout(
                "bash",
                &["-c", &params.command],
                &ctx.working_dir,
                Duration::from_secs(timeout),
            )
            .await
            .map_err(|e| PlanwiseError::ToolExecution {
                tool: "bash".to_string(),
                message: e.to_string(),
            })?;

            let Some(output) = output else {
                return Ok(ToolResult::error(format!(
                    "Command timed out after {} seconds",
                    timeout
                )));
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            let mut content = stdout.into_owned();
            if !stderr.is_empty() {
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str("STDERR:\n");
                content.push_str(&stderr);
            }
            if content.is_empty() {
                content = "(no output)".to_string();
            }
            let content = truncate_output(content);

            if output.status.success() {
                Ok(ToolResult::success(content))
            } else {
                let code = output.status.code().unwrap_or(-1);
                Ok(ToolResult::error(format!("Exit code {}\n{}", code, content)))
            }
        })
    }

    fn timeout_secs(&self, input: &serde_json::Value) -> u64 {
        outer_timeout(input, self.default_timeout)
    }
}
