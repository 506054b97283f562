use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{error, info};

use planwise_core::error::{PlanwiseError, Result};
use planwise_core::traits::Tool;
use planwise_core::types::{ToolContext, ToolResult};

use super::{outer_timeout, run_with_timeout, truncate_output};

/// Writes a script to disk and runs it in one call.
pub struct WriteAndExecuteTool {
    interpreter: String,
    default_timeout: u64,
}

#[derive(Deserialize)]
struct WriteAndExecuteInput {
    file_path: String,
    content: String,
    #[serde(default)]
    timeout: Option<u64>,
}

impl WriteAndExecuteTool {
    pub fn new(interpreter: impl Into<String>, default_timeout: u64) -> Self {
        Self {
            interpreter: interpreter.into(),
            default_timeout,
        }
    }
}

impl Default for WriteAndExecuteTool {
    fn default() -> Self {
        Self::new("python3", 300)
    }
}

fn resolve(p: &str, wd: &Path) -> PathBuf {
    let path = PathBuf::from(p);
    if path.is_absolute() {
        path
    } else {
        wd.join(path)
    }
}

async fn write_script(path: &Path, content: &str) -> std::io::Result<u64> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, content).await?;
    Ok(tokio::fs::metadata(path).await?.len())
}

impl Tool for WriteAndExecuteTool {
    fn name(&self) -> &str {
        "write_and_execute"
    }

    fn description(&self) -> &str {
        "Write a Python script to a file and immediately execute it. \
         Use this when you need to create and run a script in one step."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Where the script should be written (e.g. './artifacts/code/analysis.py')"
                },
                "content": {
                    "type": "string",
                    "description": "The Python code to write to the file"
                },
                "timeout": {
                    "type": "integer",
                    "description": format!("Timeout in seconds for script execution (default {})", self.default_timeout),
                    "default": self.default_timeout
                }
            },
            "required": ["file_path", "content"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: WriteAndExecuteInput = serde_json::from_value(input)
                .map_err(|e| PlanwiseError::ToolValidation(e.to_string()))?;
            let timeout = params.timeout.unwrap_or(self.default_timeout);
            let path = resolve(&params.file_path, &ctx.working_dir);

            info!(agent = %ctx.agent_name, path = %path.display(), "Writing script");

            let mut lines = Vec::new();

            match write_script(&path, &params.content).await {
                Ok(size) => {
                    let num_lines = params.content.split('\n').count();
                    lines.push(format!(
                        "✓ Written {} lines ({} bytes) to {}",
                        num_lines, size, params.file_path
                    ));
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to write script");
                    return Ok(ToolResult::error(format!("✗ Error writing file: {}", e)));
                }
            }

            let script = path.to_string_lossy().into_owned();
            let output = run_with_timeout(
                &self.interpreter,
                &[script.as_str()],
                &ctx.working_dir,
                Duration::from_secs(timeout),
            )
            .await;

            let is_error = match output {
                Ok(Some(output)) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if output.status.success() {
                        lines.push("✓ Execution successful".to_string());
                        if !stdout.trim().is_empty() {
                            lines.push(format!("Output:\n{}", stdout));
                        }
                        if !stderr.trim().is_empty() {
                            lines.push(format!("Stderr:\n{}", stderr));
                        }
                        false
                    } else {
                        let code = output.status.code().unwrap_or(-1);
                        lines.push(format!("✗ Execution failed with exit code {}", code));
                        if !stdout.is_empty() {
                            lines.push(format!("Stdout: {}", stdout));
                        }
                        if !stderr.is_empty() {
                            lines.push(format!("Stderr: {}", stderr));
                        }
                        true
                    }
                }
                Ok(None) => {
                    lines.push(format!("✗ Execution timed out after {} seconds", timeout));
                    true
                }
                Err(e) => {
                    lines.push(format!("✗ Error executing script: {}", e));
                    true
                }
            };

            let content = truncate_output(lines.join("\n"));
            if is_error {
                error!(path = %path.display(), "Script execution failed");
                Ok(ToolResult::error(content))
            } else {
                Ok(ToolResult::success(content))
            }
        })
    }

    fn timeout_secs(&self, input: &serde_json::Value) -> u64 {
        outer_timeout(input, self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(timeout: u64) -> WriteAndExecuteTool {
        WriteAndExecuteTool::new("sh", timeout)
    }

    #[tokio::test]
    async fn test_writes_nested_file_and_runs_it() {
        let dir = tempfile::tempdir().unwrap();
        let result = tool(10)
            .execute(
                serde_json::json!({
                    "file_path": "artifacts/code/run.sh",
                    "content": "echo from script"
                }),
                ToolContext::new("coder", dir.path()),
            )
            .await
            .unwrap();

        assert!(!result.is_error, "{}", result.content);
        assert!(dir.path().join("artifacts/code/run.sh").exists());
        assert!(result
            .content
            .starts_with("✓ Written 1 lines (16 bytes) to artifacts/code/run.sh"));
        assert!(result.content.contains("✓ Execution successful"));
        assert!(result.content.contains("Output:\nfrom script"));
    }

    #[tokio::test]
    async fn test_failing_script() {
        let dir = tempfile::tempdir().unwrap();
        let result = tool(10)
            .execute(
                serde_json::json!({"file_path": "fail.sh", "content": "exit 2"}),
                ToolContext::new("coder", dir.path()),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("✗ Execution failed with exit code 2"));
    }

    #[tokio::test]
    async fn test_timeout_override() {
        let dir = tempfile::tempdir().unwrap();
        let result = tool(300)
            .execute(
                serde_json::json!({"file_path": "slow.sh", "content": "sleep 5", "timeout": 1}),
                ToolContext::new("coder", dir.path()),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("✗ Execution timed out after 1 seconds"));
    }
}
