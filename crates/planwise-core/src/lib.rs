pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;
pub mod usage;

pub use config::AppConfig;
pub use error::{PlanwiseError, Result};
pub use event::EventBus;
pub use types::*;
pub use usage::TokenUsage;
