pub mod config;
pub mod error;
pub mod event;
pub mod template;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{PlaitError, Result};
pub use event::{EventKind, StepResult, WorkflowEvent};
pub use types::*;
