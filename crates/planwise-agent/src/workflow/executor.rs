use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use planwise_core::config::WorkflowConfig;
use planwise_core::error::{PlanwiseError, Result};

use super::edge::{Edge, NodeId, ReviewDecision, WorkflowGraph};
use super::nodes::NodeRunner;
use super::state::{SharedState, WorkflowContext, WorkflowRequest};

/// Result of executing a single node.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub output: String,
    pub succeeded: bool,
    pub review: Option<ReviewDecision>,
    pub elapsed_ms: u64,
}

/// Result of executing the whole graph.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: String,
    /// Per-node results in execution order.
    pub node_results: Vec<NodeResult>,
    /// Shared state at the end of the run, if any node created it.
    pub state: Option<SharedState>,
    pub total_elapsed_ms: u64,
    /// False when the run was cut off by the visit cap.
    pub completed: bool,
}

/// Walks a [`WorkflowGraph`] one node at a time.
///
/// After each node every outgoing edge is evaluated against the same
/// state. No ready edge ends the run, one ready edge is followed, more
/// than one is an error.
pub struct GraphExecutor {
    graph: WorkflowGraph,
    max_visits: usize,
}

impl GraphExecutor {
    pub fn new(graph: WorkflowGraph, max_visits: usize) -> Self {
        Self { graph, max_visits }
    }

    /// The standard graph, capped so the revision loop always terminates.
    pub fn for_config(config: &WorkflowConfig) -> Self {
        Self::new(
            WorkflowGraph::standard(),
            config.max_plan_revisions as usize + 2,
        )
    }

    pub async fn execute<R>(&self, runner: &mut R, request: WorkflowRequest) -> Result<ExecutionResult>
    where
        R: NodeRunner + ?Sized,
    {
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(run_id = %run_id, entry = %self.graph.entry, "Workflow started");
        let mut ctx = WorkflowContext::new();
        let mut node_results = Vec::new();
        let mut visits: HashMap<NodeId, usize> = HashMap::new();
        let mut current = self.graph.entry;
        let mut completed = true;

        loop {
            let count = visits.entry(current).or_default();
            *count += 1;
            if *count > self.max_visits {
                warn!(node = %current, max_visits = self.max_visits, "Node visit cap reached, terminating workflow");
                completed = false;
                break;
            }

            info!(node = %current, "Node started");
            let node_start = Instant::now();
            let output = runner.run_node(current, &request, &mut ctx).await;
            let elapsed_ms = node_start.elapsed().as_millis() as u64;

            info!(node = %current, succeeded = output.succeeded, elapsed_ms, "Node completed");
            if let Some(ref state) = ctx.shared {
                let usage = &state.token_usage;
                info!(
                    node = %current,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    cache_read_tokens = usage.cache_read_input_tokens,
                    cache_write_tokens = usage.cache_write_input_tokens,
                    total_tokens = usage.total(),
                    "Token usage"
                );
            }

            let review = output.review;
            node_results.push(NodeResult {
                node_id: current,
                output: output.text,
                succeeded: output.succeeded,
                review,
                elapsed_ms,
            });

            let ready: Vec<&Edge> = self
                .graph
                .outgoing(current)
                .filter(|e| e.condition.is_ready(ctx.shared.as_ref(), review))
                .collect();

            match ready.as_slice() {
                [] => {
                    debug!(node = %current, "No ready edges, workflow complete");
                    break;
                }
                [edge] => {
                    debug!(from = %edge.from, to = %edge.to, "Following edge");
                    current = edge.to;
                }
                many => {
                    let targets: Vec<String> = many.iter().map(|e| e.to.to_string()).collect();
                    return Err(PlanwiseError::Graph(format!(
                        "node {} has {} ready edges ({})",
                        current,
                        many.len(),
                        targets.join(", ")
                    )));
                }
            }
        }

        info!(
            run_id = %run_id,
            nodes = node_results.len(),
            completed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Workflow finished"
        );

        Ok(ExecutionResult {
            run_id,
            node_results,
            state: ctx.shared,
            total_elapsed_ms: start.elapsed().as_millis() as u64,
            completed,
        })
    }
}
