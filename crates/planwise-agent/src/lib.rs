pub mod agent_loop;
pub mod prompt;
pub mod worker;
pub mod workflow;

pub use agent_loop::AgentRuntime;
pub use prompt::PromptTemplates;
pub use worker::{WorkerRole, WorkerTool};
pub use workflow::{GraphExecutor, Workflow, WorkflowRequest};
