use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info};

use planwise_core::error::{PlanwiseError, Result};
use planwise_core::traits::Tool;
use planwise_core::types::{ToolContext, ToolResult};

use super::{run_with_timeout, truncate_output};

/// Runs a code snippet through `<interpreter> -c`.
pub struct PythonReplTool {
    interpreter: String,
    timeout: u64,
}

#[derive(Deserialize)]
struct PythonReplInput {
    code: String,
}

impl PythonReplTool {
    pub fn new(interpreter: impl Into<String>, timeout: u64) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }
}

impl Default for PythonReplTool {
    fn default() -> Self {
        Self::new("python3", 600)
    }
}

impl Tool for PythonReplTool {
    fn name(&self) -> &str {
        "python_repl"
    }

    fn description(&self) -> &str {
        "Use this to execute python code and do data analysis or calculation. \
         If you want to see the output of a value, print it out with `print(...)`."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The python code to execute to do further analysis or calculation."
                }
            },
            "required": ["code"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: PythonReplInput = serde_json::from_value(input)
                .map_err(|e| PlanwiseError::ToolValidation(e.to_string()))?;

            info!(agent = %ctx.agent_name, "Executing python code");
            debug!(code = %params.code);

            let output = run_with_timeout(
                &self.interpreter,
                &["-c", &params.code],
                &ctx.working_dir,
                Duration::from_secs(self.timeout),
            )
            .await;

            let output = match output {
                Ok(Some(output)) => output,
                Ok(None) => {
                    return Ok(ToolResult::error(format!(
                        "Failed to execute. Error: timed out after {} seconds",
                        self.timeout
                    )))
                }
                Err(e) => {
                    return Ok(ToolResult::error(format!("Failed to execute. Error: {}", e)));
                }
            };

            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(ToolResult::success(truncate_output(format!(
                    "Successfully executed:\n||{}||{}",
                    params.code, stdout
                ))))
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Ok(ToolResult::error(truncate_output(format!(
                    "Failed to execute. Error: {}",
                    stderr
                ))))
            }
        })
    }

    fn timeout_secs(&self, _input: &serde_json::Value) -> u64 {
        self.timeout + 5
    }
}
