pub mod fixtures;
pub mod mock_adapter;

pub use fixtures::*;
pub use mock_adapter::{MockAdapter, ScriptedResponse};
