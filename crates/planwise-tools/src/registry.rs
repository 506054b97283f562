use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use planwise_core::config::ToolsConfig;
use planwise_core::error::{PlanwiseError, Result};
use planwise_core::traits::Tool;
use planwise_core::types::{ToolContext, ToolDefinition, ToolResult};

use crate::builtin::{BashTool, PythonReplTool, WriteAndExecuteTool};

/// Registry of available tools, keyed by name.
///
/// Ordered so tool definitions are sent to the LLM in a stable order,
/// which keeps the tool list prefix cacheable.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Get tool definitions for sending to the LLM.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// A new registry holding only the named tools. Unknown names are skipped.
    pub fn subset(&self, names: &[&str]) -> Self {
        let mut out = Self::new();
        for name in names {
            match self.get(name) {
                Some(tool) => out.register_arc(tool),
                None => warn!(tool = %name, "Requested tool is not registered"),
            }
        }
        out
    }

    /// Execute a tool by name.
    ///
    /// Exceeding the tool's outer timeout yields an error-tagged result
    /// rather than an `Err`, so the caller can hand it back to the LLM.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| PlanwiseError::ToolNotFound(name.to_string()))?;

        let timeout_secs = tool.timeout_secs(&input);
        let timeout = std::time::Duration::from_secs(timeout_secs);

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                let err = PlanwiseError::ToolTimeout {
                    tool: name.to_string(),
                    timeout_secs,
                };
                warn!(tool = %name, timeout_secs, "Tool timed out");
                Ok(ToolResult::error(err.to_string()))
            }
        }
    }

    /// The subprocess-backed code tools, configured from `[tools]`.
    pub fn with_code_tools(config: &ToolsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(PythonReplTool::new(
            config.python_bin.clone(),
            config.python_timeout_secs,
        ));
        registry.register(BashTool::new(config.bash_timeout_secs));
        registry.register(WriteAndExecuteTool::new(
            config.python_bin.clone(),
            config.write_and_execute_timeout_secs,
        ));
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;

    struct SlowTool;

    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
        ) -> BoxFuture<'_, Result<ToolResult>> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(ToolResult::success("never"))
            })
        }
        fn timeout_secs(&self, _input: &serde_json::Value) -> u64 {
            1
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_error_result() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);

        let result = registry
            .execute("slow", serde_json::json!({}), ToolContext::new("t", "."))
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.content, "Tool slow timed out after 1s");
    }

    #[tokio::test]
    async fn test_requested_timeout_outlasts_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(WriteAndExecuteTool::new("sh", 1));

        let result = registry
            .execute(
                "write_and_execute",
                serde_json::json!({
                    "file_path": "slow.sh",
                    "content": "sleep 8; echo done",
                    "timeout": 20
                }),
                ToolContext::new("coder", dir.path()),
            )
            .await
            .unwrap();
        assert!(!result.is_error, "{}", result.content);
        assert!(result.content.contains("Output:\ndone"));
    }

    #[tokio::test]
    async fn test_bash_requested_timeout_outlasts_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(BashTool::new(1));

        let result = registry
            .execute(
                "bash",
                serde_json::json!({"command": "sleep 7; echo done", "timeout": 15}),
                ToolContext::new("coder", dir.path()),
            )
            .await
            .unwrap();
        assert!(!result.is_error, "{}", result.content);
        assert_eq!(result.content.trim(), "done");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", serde_json::json!({}), ToolContext::new("t", "."))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanwiseError::ToolNotFound(ref n) if n == "nope"));
    }

    #[test]
    fn test_code_tools_and_subset() {
        let registry = ToolRegistry::with_code_tools(&ToolsConfig::default());
        assert_eq!(registry.list(), vec!["bash", "python_repl", "write_and_execute"]);

        let sub = registry.subset(&["python_repl", "bash", "missing"]);
        assert_eq!(sub.list(), vec!["bash", "python_repl"]);

        let defs = sub.definitions();
        assert_eq!(defs[0].name, "bash");
        assert_eq!(defs[1].input_schema["required"][0], "code");
    }
}
