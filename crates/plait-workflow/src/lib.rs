pub mod capture;
pub mod catalog;
pub mod event_log;
pub mod runner;
pub mod store;
pub mod transform;

pub use catalog::{DirTemplateStore, InMemoryCatalog};
pub use event_log::EventLogger;
pub use runner::{RunHandle, WorkflowRunner, WorkflowRunnerBuilder};
pub use store::{RunOutput, RunResult, RunSnapshot, RunStatus, RunStore};
