use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use planwise_core::config::AppConfig;
use planwise_core::error::Result;
use planwise_core::event::EventBus;
use planwise_core::traits::LlmClient;
use planwise_core::types::{AgentEvent, ChatMessage, EventKind, ToolResult};
use planwise_core::usage::TokenUsage;

use super::edge::{NodeId, ReviewDecision};
use super::review::{auto_approve, record_response, PlanReviewInput, ReviewOutcome};
use super::state::{SharedState, WorkflowContext, WorkflowRequest};
use crate::agent_loop::AgentRuntime;
use crate::prompt::PromptTemplates;
use crate::worker::{WorkerRole, WorkerTool};

/// Output text of a node that found no shared state.
pub const NO_SHARED_STATE: &str = "No shared state available";

pub fn full_plan_block(plan: &str) -> String {
    format!(
        "Here is full plan :\n\n<full_plan>\n{plan}\n</full_plan>\n\n*Please consider this to select the next step.*"
    )
}

pub fn clues_block(source: &str, clues: &str) -> String {
    format!("Here is clues from {source}:\n\n<clues>\n{clues}\n</clues>\n\n")
}

/// What a node hands back to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutput {
    pub text: String,
    pub succeeded: bool,
    pub review: Option<ReviewDecision>,
}

impl NodeOutput {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            succeeded: true,
            review: None,
        }
    }

    fn failed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            succeeded: false,
            review: None,
        }
    }
}

impl From<ReviewOutcome> for NodeOutput {
    fn from(outcome: ReviewOutcome) -> Self {
        Self {
            text: outcome.text,
            succeeded: outcome.decision != ReviewDecision::Error,
            review: Some(outcome.decision),
        }
    }
}

/// Runs one node against the workflow context. The executor's only view
/// of the nodes.
pub trait NodeRunner: Send {
    fn run_node<'a>(
        &'a mut self,
        node: NodeId,
        request: &'a WorkflowRequest,
        ctx: &'a mut WorkflowContext,
    ) -> BoxFuture<'a, NodeOutput>;
}

/// What a node saw while draining its agent's events.
#[derive(Debug, Default)]
struct Drained {
    /// Text streamed by the node's own agent, across all its turns.
    text: String,
    usage: TokenUsage,
    /// Tool results returned to the node's own agent.
    tool_results: Vec<(String, ToolResult)>,
}

/// The four workflow nodes and the collaborators they share.
pub struct Workflow {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    prompts: PromptTemplates,
    review: Box<dyn PlanReviewInput>,
    bus: Option<Arc<EventBus>>,
}

impl Workflow {
    pub fn new(
        config: AppConfig,
        llm: Arc<dyn LlmClient>,
        review: Box<dyn PlanReviewInput>,
    ) -> Self {
        let prompts = PromptTemplates::new(config.prompts_dir());
        Self {
            config,
            llm,
            prompts,
            review,
            bus: None,
        }
    }

    /// Republish every agent event on `bus` for display.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn agent(&self, role: &str, system_prompt: String) -> AgentRuntime {
        AgentRuntime::new(role, system_prompt, self.config.model_for(role), self.llm.clone())
            .with_working_dir(self.config.working_dir())
            .with_limits(&self.config.agent)
    }

    /// Run `agent` on `message` while draining its events on the same task.
    async fn run_agent(
        &self,
        agent: &mut AgentRuntime,
        message: &str,
        source: &str,
    ) -> (Result<String>, Drained) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
        let name = agent.name().to_string();

        let run = async move { agent.run(message, source, &tx).await };

        let drain = async {
            let mut drained = Drained::default();
            while let Some(event) = rx.recv().await {
                let own = event.agent == name;
                match &event.kind {
                    EventKind::TextChunk(text) if own => drained.text.push_str(text),
                    EventKind::TokenUsage(usage) => drained.usage += *usage,
                    EventKind::ToolResult { name, result } if own => {
                        drained.tool_results.push((name.clone(), result.clone()))
                    }
                    _ => {}
                }
                if let Some(ref bus) = self.bus {
                    bus.publish(event);
                }
            }
            drained
        };

        tokio::join!(run, drain)
    }

    /// Text to record for a finished agent run.
    fn settle(node: NodeId, result: Result<String>, streamed: String) -> NodeOutput {
        match result {
            Ok(text) if streamed.is_empty() => NodeOutput::ok(text),
            Ok(_) => NodeOutput::ok(streamed),
            Err(e) => {
                error!(node = %node, error = %e, "Node agent failed");
                NodeOutput::failed(format!("{node} failed: {e}"))
            }
        }
    }

    /// Greets the user and decides whether the request needs a plan.
    pub async fn coordinator(
        &self,
        request: &WorkflowRequest,
        ctx: &mut WorkflowContext,
    ) -> NodeOutput {
        let state = ctx.shared.get_or_insert_with(|| SharedState::new(request));
        state.request = request.request.clone();
        state.request_prompt = request.request_prompt.clone();

        let system_prompt = match self.prompts.render("coordinator", &[]) {
            Ok(p) => p,
            Err(e) => {
                let output = NodeOutput::failed(format!("coordinator failed: {e}"));
                state.push_history("coordinator", output.text.clone());
                return output;
            }
        };

        let mut agent = self.agent("coordinator", system_prompt);
        let (result, drained) = self
            .run_agent(&mut agent, &request.request_prompt, "coordinator_node")
            .await;
        let output = Self::settle(NodeId::Coordinator, result, drained.text);

        state.token_usage += drained.usage;
        state.messages = agent.messages().to_vec();
        state.push_history("coordinator", output.text.clone());
        output
    }

    /// Writes the plan, or rewrites it from the reviewer's feedback.
    pub async fn planner(&self, ctx: &mut WorkflowContext) -> NodeOutput {
        let Some(state) = ctx.shared.as_mut() else {
            warn!(node = "planner", "No shared state found");
            return NodeOutput::failed(NO_SHARED_STATE);
        };

        let is_revision = state.plan_revision_requested && !state.plan_feedback.is_empty();
        let revision_count = state.plan_revision_count.to_string();
        let max_revisions = self.config.workflow.max_plan_revisions.to_string();

        let rendered = if is_revision {
            info!(revision = state.plan_revision_count, "Revising plan from user feedback");
            self.prompts.render(
                "planner_revise",
                &[
                    ("USER_REQUEST", state.request.as_str()),
                    ("PREVIOUS_PLAN", state.full_plan.as_str()),
                    ("USER_FEEDBACK", state.plan_feedback.as_str()),
                    ("REVISION_COUNT", revision_count.as_str()),
                    ("MAX_REVISIONS", max_revisions.as_str()),
                ],
            )
        } else {
            self.prompts
                .render("planner", &[("USER_REQUEST", state.request.as_str())])
        };
        let system_prompt = match rendered {
            Ok(p) => p,
            Err(e) => {
                let output = NodeOutput::failed(format!("planner failed: {e}"));
                state.push_history("planner", output.text.clone());
                return output;
            }
        };

        let mut message = state.last_message_text();
        if is_revision {
            message.push_str(&format!(
                "\n\n<user_feedback>\nUser requested the following changes to the plan:\n{}\n</user_feedback>",
                state.plan_feedback
            ));
            state.plan_revision_requested = false;
        }

        let mut agent = self.agent("planner", system_prompt);
        let (result, drained) = self.run_agent(&mut agent, &message, "planner_node").await;
        let output = Self::settle(NodeId::Planner, result, drained.text);

        state.token_usage += drained.usage;
        if output.succeeded {
            state.messages = vec![ChatMessage::user(output.text.clone())];
            state.full_plan = output.text.clone();
        }
        state.push_history("planner", output.text.clone());
        output
    }

    /// Shows the plan to the human and records approval or feedback.
    pub async fn plan_reviewer(&mut self, ctx: &mut WorkflowContext) -> ReviewOutcome {
        let Some(state) = ctx.shared.as_mut() else {
            warn!(node = "plan_reviewer", "No shared state found");
            return ReviewOutcome {
                text: NO_SHARED_STATE.to_string(),
                decision: ReviewDecision::Error,
                feedback: None,
            };
        };

        state.plan_revision_requested = false;

        let max_revisions = self.config.workflow.max_plan_revisions;
        if state.plan_revision_count >= max_revisions {
            return auto_approve(state, max_revisions);
        }

        let response = self
            .review
            .review(&state.full_plan, state.plan_revision_count, max_revisions)
            .await;
        record_response(state, response)
    }

    /// Executes the approved plan through the worker tools.
    pub async fn supervisor(&self, ctx: &mut WorkflowContext) -> NodeOutput {
        let Some(state) = ctx.shared.as_mut() else {
            warn!(node = "supervisor", "No shared state found");
            return NodeOutput::failed(NO_SHARED_STATE);
        };

        let setup = self.prompts.render("supervisor", &[]).and_then(|prompt| {
            WorkerTool::registry(&self.config, self.llm.clone(), &self.prompts)
                .map(|tools| (prompt, tools))
        });
        let (system_prompt, workers) = match setup {
            Ok(s) => s,
            Err(e) => {
                let output = NodeOutput::failed(format!("supervisor failed: {e}"));
                state.push_history("supervisor", output.text.clone());
                return output;
            }
        };

        let message = [
            state.last_message_text(),
            full_plan_block(&state.full_plan),
            state.clues.clone(),
        ]
        .join("\n\n");

        let mut agent = self
            .agent("supervisor", system_prompt)
            .with_tools(Arc::new(workers));
        let (result, drained) = self.run_agent(&mut agent, &message, "supervisor_node").await;
        let output = Self::settle(NodeId::Supervisor, result, drained.text);

        state.token_usage += drained.usage;
        for (tool, result) in drained.tool_results {
            if !WorkerRole::ALL.iter().any(|r| r.name() == tool) {
                continue;
            }
            state.clues.push_str(&clues_block(&tool, &result.content));
            state.push_history(tool, result.content);
        }
        state.push_history("supervisor", output.text.clone());
        info!("Workflow completed");
        output
    }
}

impl NodeRunner for Workflow {
    fn run_node<'a>(
        &'a mut self,
        node: NodeId,
        request: &'a WorkflowRequest,
        ctx: &'a mut WorkflowContext,
    ) -> BoxFuture<'a, NodeOutput> {
        Box::pin(async move {
            match node {
                NodeId::Coordinator => self.coordinator(request, ctx).await,
                NodeId::Planner => self.planner(ctx).await,
                NodeId::PlanReviewer => self.plan_reviewer(ctx).await.into(),
                NodeId::Supervisor => self.supervisor(ctx).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::review::ScriptedReview;
    use planwise_test_utils::{test_config, text_turn, tool_turn, MockLlmClient};

    fn workflow(
        dir: &std::path::Path,
        llm: Arc<MockLlmClient>,
        responses: &[&str],
    ) -> Workflow {
        Workflow::new(
            test_config(dir),
            llm,
            Box::new(ScriptedReview::new(responses.iter().copied())),
        )
    }

    fn planned_state(plan: &str) -> WorkflowContext {
        let mut state = SharedState::new(&WorkflowRequest::new("analyse sales"));
        state.full_plan = plan.to_string();
        state.messages = vec![ChatMessage::user(plan)];
        WorkflowContext {
            shared: Some(state),
        }
    }

    #[test]
    fn test_format_blocks() {
        assert_eq!(
            full_plan_block("P"),
            "Here is full plan :\n\n<full_plan>\nP\n</full_plan>\n\n*Please consider this to select the next step.*"
        );
        assert_eq!(
            clues_block("coder", "x=1"),
            "Here is clues from coder:\n\n<clues>\nx=1\n</clues>\n\n"
        );
    }

    #[tokio::test]
    async fn test_nodes_without_state_degrade() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlmClient::default());
        let mut wf = workflow(dir.path(), llm.clone(), &[]);
        let mut ctx = WorkflowContext::new();

        let out = wf.planner(&mut ctx).await;
        assert_eq!(out.text, NO_SHARED_STATE);
        assert!(!out.succeeded);

        let review = wf.plan_reviewer(&mut ctx).await;
        assert_eq!(review.decision, ReviewDecision::Error);

        let out = wf.supervisor(&mut ctx).await;
        assert_eq!(out.text, NO_SHARED_STATE);

        assert!(ctx.shared.is_none());
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_coordinator_creates_state() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlmClient::new(vec![text_turn(
            "handoff_to_planner: analyse the sales data",
        )]));
        let wf = workflow(dir.path(), llm.clone(), &[]);
        let mut ctx = WorkflowContext::new();
        let request = WorkflowRequest::new("analyse sales");

        let out = wf.coordinator(&request, &mut ctx).await;
        assert!(out.succeeded);

        let state = ctx.shared.as_ref().unwrap();
        assert_eq!(state.request, "analyse sales");
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.history()[0].agent, "coordinator");
        assert_eq!(state.token_usage, TokenUsage::new(10, 5));
        assert_eq!(
            llm.requests()[0].last_user_text().as_deref(),
            Some(request.request_prompt.as_str())
        );
    }

    #[tokio::test]
    async fn test_planner_revision_consumes_feedback() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlmClient::new(vec![text_turn("1. load\n2. chart")]));
        let wf = workflow(dir.path(), llm.clone(), &[]);
        let mut ctx = planned_state("1. load");
        {
            let state = ctx.shared.as_mut().unwrap();
            state.plan_revision_requested = true;
            state.plan_feedback = "add a chart".into();
            state.plan_revision_count = 1;
        }

        let out = wf.planner(&mut ctx).await;
        assert!(out.succeeded);

        let state = ctx.shared.as_ref().unwrap();
        assert!(!state.plan_revision_requested);
        assert_eq!(state.full_plan, "1. load\n2. chart");
        assert_eq!(state.last_message_text(), "1. load\n2. chart");

        let req = &llm.requests()[0];
        let sent = req.last_user_text().unwrap();
        assert!(sent.starts_with("1. load\n\n<user_feedback>\n"));
        assert!(sent.contains("add a chart"));
        let system = req.system().unwrap();
        assert!(system.contains("revision 1 of at most 3"));
    }

    #[tokio::test]
    async fn test_planner_failure_keeps_previous_plan() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlmClient::default());
        let wf = workflow(dir.path(), llm, &[]);
        let mut ctx = planned_state("1. load");

        let out = wf.planner(&mut ctx).await;
        assert!(!out.succeeded);

        let state = ctx.shared.as_ref().unwrap();
        assert_eq!(state.full_plan, "1. load");
        assert!(state.history()[0].message.starts_with("planner failed:"));
    }

    #[tokio::test]
    async fn test_reviewer_auto_approves_without_asking() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlmClient::default());
        let mut wf = workflow(dir.path(), llm, &["more please"]);
        let mut ctx = planned_state("plan");
        ctx.shared.as_mut().unwrap().plan_revision_count = 3;

        let outcome = wf.plan_reviewer(&mut ctx).await;
        assert_eq!(outcome.decision, ReviewDecision::Approved);

        let state = ctx.shared.as_ref().unwrap();
        assert_eq!(state.plan_revision_count, 3);
        assert_eq!(
            state.history()[0].message,
            "Plan auto-approved (max 3 revisions reached)"
        );
    }

    #[tokio::test]
    async fn test_reviewer_resets_flag_each_pass() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlmClient::default());
        let mut wf = workflow(dir.path(), llm, &["ok"]);
        let mut ctx = planned_state("plan");
        ctx.shared.as_mut().unwrap().plan_revision_requested = true;

        let outcome = wf.plan_reviewer(&mut ctx).await;
        assert_eq!(outcome.decision, ReviewDecision::Approved);
        assert!(!ctx.shared.as_ref().unwrap().plan_revision_requested);
    }

    #[tokio::test]
    async fn test_supervisor_folds_worker_results_into_clues() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlmClient::new(vec![
            tool_turn("s1", "tracker", serde_json::json!({"task": "mark step 1"})),
            text_turn("- [x] step 1"),
            text_turn("All steps done."),
        ]));
        let wf = workflow(dir.path(), llm.clone(), &[]);
        let mut ctx = planned_state("- [ ] step 1");

        let out = wf.supervisor(&mut ctx).await;
        assert!(out.succeeded);
        assert_eq!(out.text, "All steps done.");

        let state = ctx.shared.as_ref().unwrap();
        assert_eq!(state.clues, clues_block("tracker", "- [x] step 1"));
        let agents: Vec<&str> = state.history().iter().map(|e| e.agent.as_str()).collect();
        assert_eq!(agents, vec!["tracker", "supervisor"]);
        // supervisor turns + the tracker's own turn
        assert_eq!(state.token_usage, TokenUsage::new(30, 15));

        let first = &llm.requests()[0];
        assert_eq!(first.tools, vec!["coder", "reporter", "tracker", "validator"]);
        assert!(first.model.prompt_cache);
        assert!(first.model.tool_cache);
        assert!(first
            .last_user_text()
            .unwrap()
            .contains("<full_plan>\n- [ ] step 1\n</full_plan>"));
    }
}
