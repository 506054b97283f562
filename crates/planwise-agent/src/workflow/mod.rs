pub mod edge;
pub mod executor;
pub mod nodes;
pub mod review;
pub mod state;

pub use edge::{
    should_handoff_to_planner, should_proceed_to_supervisor, should_revise_plan, Edge,
    EdgeCondition, NodeId, ReviewDecision, WorkflowGraph,
};
pub use executor::{ExecutionResult, GraphExecutor, NodeResult};
pub use nodes::{NodeOutput, NodeRunner, Workflow};
pub use review::{DisplayFlush, PlanReviewInput, ReviewOutcome, ScriptedReview, StdinReview};
pub use state::{HistoryEntry, SharedState, WorkflowContext, WorkflowRequest};
