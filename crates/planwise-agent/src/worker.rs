use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use planwise_core::config::{AgentConfig, AppConfig, ModelConfig};
use planwise_core::error::{PlanwiseError, Result};
use planwise_core::traits::{LlmClient, Tool};
use planwise_core::types::{ToolContext, ToolResult};
use planwise_tools::ToolRegistry;

use crate::agent_loop::AgentRuntime;
use crate::prompt::PromptTemplates;

/// The worker agents the supervisor can delegate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Coder,
    Reporter,
    Tracker,
    Validator,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 4] = [
        WorkerRole::Coder,
        WorkerRole::Reporter,
        WorkerRole::Tracker,
        WorkerRole::Validator,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Reporter => "reporter",
            Self::Tracker => "tracker",
            Self::Validator => "validator",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Coder => {
                "Delegate a coding task: data loading, analysis, statistics and charts. \
                 Runs Python and shell code and saves results under ./artifacts/."
            }
            Self::Reporter => {
                "Delegate report writing: turns the collected results and charts into \
                 the final report files."
            }
            Self::Tracker => {
                "Delegate checklist tracking: give it the plan and the latest worker result \
                 and it returns the plan with completed items checked."
            }
            Self::Validator => {
                "Delegate verification: recomputes the recorded numbers and writes a \
                 validation report."
            }
        }
    }

    /// Code tools this worker's agent may call.
    pub fn tool_names(&self) -> &'static [&'static str] {
        match self {
            Self::Coder | Self::Reporter => &["python_repl", "bash", "write_and_execute"],
            Self::Validator => &["python_repl", "bash"],
            Self::Tracker => &[],
        }
    }
}

#[derive(Deserialize)]
struct WorkerInput {
    task: String,
}

/// A worker agent exposed as a tool. Each call runs a fresh agent on the task.
pub struct WorkerTool {
    role: WorkerRole,
    system_prompt: String,
    model: ModelConfig,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    limits: AgentConfig,
    timeout_secs: u64,
}

impl WorkerTool {
    pub fn new(
        role: WorkerRole,
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        prompts: &PromptTemplates,
        code_tools: &ToolRegistry,
    ) -> Result<Self> {
        Ok(Self {
            role,
            system_prompt: prompts.render(role.name(), &[])?,
            model: config.model_for(role.name()),
            llm,
            tools: Arc::new(code_tools.subset(role.tool_names())),
            limits: config.agent.clone(),
            timeout_secs: config.tools.worker_timeout_secs,
        })
    }

    /// A registry holding all four workers, for the supervisor.
    pub fn registry(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        prompts: &PromptTemplates,
    ) -> Result<ToolRegistry> {
        let code_tools = ToolRegistry::with_code_tools(&config.tools);
        let mut registry = ToolRegistry::new();
        for role in WorkerRole::ALL {
            registry.register(Self::new(role, config, llm.clone(), prompts, &code_tools)?);
        }
        Ok(registry)
    }
}

impl Tool for WorkerTool {
    fn name(&self) -> &str {
        self.role.name()
    }

    fn description(&self) -> &str {
        self.role.description()
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task for the worker, with every detail it needs from earlier steps"
                }
            },
            "required": ["task"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: WorkerInput = serde_json::from_value(input)
                .map_err(|e| PlanwiseError::ToolValidation(e.to_string()))?;

            let role = self.role.name();
            info!(worker = role, caller = %ctx.agent_name, "Worker started");

            let mut agent = AgentRuntime::new(
                role,
                self.system_prompt.clone(),
                self.model.clone(),
                self.llm.clone(),
            )
            .with_tools(self.tools.clone())
            .with_working_dir(ctx.working_dir.clone())
            .with_limits(&self.limits);

            // Nested events flow into the caller's channel when it has one
            let (fallback_tx, _fallback_rx) = mpsc::unbounded_channel();
            let events = ctx.events.as_ref().unwrap_or(&fallback_tx);
            let source = format!("{role}_tool");

            match agent.run(&params.task, &source, events).await {
                Ok(text) => {
                    info!(worker = role, "Worker finished");
                    Ok(ToolResult::success(text))
                }
                Err(e) => {
                    error!(worker = role, error = %e, "Worker failed");
                    Ok(ToolResult::error(format!("{role} failed: {e}")))
                }
            }
        })
    }

    fn timeout_secs(&self, _input: &serde_json::Value) -> u64 {
        self.timeout_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planwise_core::types::{AgentEvent, EventKind};
    use planwise_test_utils::{test_config, text_turn, tool_turn, MockLlmClient};

    #[test]
    fn test_role_tool_sets() {
        assert_eq!(WorkerRole::Coder.tool_names().len(), 3);
        assert_eq!(WorkerRole::Validator.tool_names(), &["python_repl", "bash"]);
        assert!(WorkerRole::Tracker.tool_names().is_empty());
    }

    #[test]
    fn test_registry_holds_all_workers() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let llm = Arc::new(MockLlmClient::default());
        let registry = WorkerTool::registry(&config, llm, &PromptTemplates::default()).unwrap();
        assert_eq!(registry.list(), vec!["coder", "reporter", "tracker", "validator"]);
        assert_eq!(
            registry
                .get("coder")
                .unwrap()
                .timeout_secs(&serde_json::json!({"task": "x"})),
            1800
        );
    }

    #[tokio::test]
    async fn test_worker_runs_its_own_agent_and_forwards_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let llm = Arc::new(MockLlmClient::new(vec![
            tool_turn("c1", "bash", serde_json::json!({"command": "echo 7"})),
            text_turn("The answer is 7."),
        ]));
        let code_tools = ToolRegistry::with_code_tools(&config.tools);
        let worker = WorkerTool::new(
            WorkerRole::Coder,
            &config,
            llm.clone(),
            &PromptTemplates::default(),
            &code_tools,
        )
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
        let mut ctx = ToolContext::new("supervisor", dir.path());
        ctx.events = Some(tx);

        let result = worker
            .execute(serde_json::json!({"task": "compute 7"}), ctx)
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, "The answer is 7.");

        let requests = llm.requests();
        assert_eq!(requests[0].last_user_text().as_deref(), Some("compute 7"));
        assert_eq!(requests[0].tools, vec!["bash", "python_repl", "write_and_execute"]);

        let mut saw_bash_result = false;
        while let Ok(ev) = rx.try_recv() {
            assert_eq!(ev.agent, "coder");
            assert_eq!(ev.source, "coder_tool");
            if let EventKind::ToolResult { name, result } = ev.kind {
                assert_eq!(name, "bash");
                assert_eq!(result.content.trim(), "7");
                saw_bash_result = true;
            }
        }
        assert!(saw_bash_result);
    }

    #[tokio::test]
    async fn test_worker_failure_is_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        // Empty script: the first LLM call fails
        let llm = Arc::new(MockLlmClient::default());
        let worker = WorkerTool::new(
            WorkerRole::Tracker,
            &config,
            llm,
            &PromptTemplates::default(),
            &ToolRegistry::new(),
        )
        .unwrap();

        let result = worker
            .execute(
                serde_json::json!({"task": "update"}),
                ToolContext::new("supervisor", dir.path()),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.starts_with("tracker failed:"));
    }
}
