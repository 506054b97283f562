use std::fmt;

use serde::{Deserialize, Serialize};

use super::state::SharedState;

/// The stages of the plan-review workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Coordinator,
    Planner,
    PlanReviewer,
    Supervisor,
}

impl NodeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Planner => "planner",
            Self::PlanReviewer => "plan_reviewer",
            Self::Supervisor => "supervisor",
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the plan reviewer decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Revise,
    /// No shared state to review.
    Error,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "decision", rename_all = "snake_case")]
pub enum EdgeCondition {
    #[default]
    Always,
    /// The coordinator asked for a plan.
    HandoffToPlanner,
    /// The reviewer returned this decision.
    Review(ReviewDecision),
}

impl EdgeCondition {
    /// Evaluate against the state and review decision left by the node just run.
    pub fn is_ready(&self, state: Option<&SharedState>, review: Option<ReviewDecision>) -> bool {
        match self {
            Self::Always => true,
            Self::HandoffToPlanner => state.is_some_and(should_handoff_to_planner),
            Self::Review(decision) => review == Some(*decision),
        }
    }
}

/// An edge connecting two nodes in the workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default)]
    pub condition: EdgeCondition,
}

impl Edge {
    pub fn always(from: NodeId, to: NodeId) -> Self {
        Self::when(from, to, EdgeCondition::Always)
    }

    pub fn when(from: NodeId, to: NodeId, condition: EdgeCondition) -> Self {
        Self {
            from,
            to,
            condition,
        }
    }
}

/// Entry node plus edge table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub entry: NodeId,
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    /// coordinator -> planner -> plan_reviewer -> (planner | supervisor)
    pub fn standard() -> Self {
        use NodeId::*;
        Self {
            entry: Coordinator,
            edges: vec![
                Edge::when(Coordinator, Planner, EdgeCondition::HandoffToPlanner),
                Edge::always(Planner, PlanReviewer),
                Edge::when(
                    PlanReviewer,
                    Planner,
                    EdgeCondition::Review(ReviewDecision::Revise),
                ),
                Edge::when(
                    PlanReviewer,
                    Supervisor,
                    EdgeCondition::Review(ReviewDecision::Approved),
                ),
            ],
        }
    }

    pub fn outgoing(&self, from: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == from)
    }
}

/// True when the coordinator's latest reply carries the handoff marker.
pub fn should_handoff_to_planner(state: &SharedState) -> bool {
    state
        .last_entry_from("coordinator")
        .is_some_and(|e| e.message.contains("handoff_to_planner"))
}

/// True when the reviewer asked for another planning pass.
pub fn should_revise_plan(state: &SharedState) -> bool {
    state.plan_revision_requested
}

/// True when the reviewer let the plan through.
pub fn should_proceed_to_supervisor(state: &SharedState) -> bool {
    !state.plan_revision_requested
}
