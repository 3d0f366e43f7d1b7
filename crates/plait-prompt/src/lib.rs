pub mod budget;
pub mod compiler;
pub mod executor;
pub mod leaf;
pub mod registry;
pub mod value;

pub use budget::{estimate_tokens, BudgetManager};
pub use compiler::{compile_template, CompiledPlanNode, CompiledTemplate};
pub use executor::render;
pub use leaf::{compile_leaf, CompiledLeaf, LeafScope};
pub use registry::{
    ExtendedRegistry, RegistrySet, SourceRegistry, StaticRegistry, STEP_INPUTS_KEY,
    STEP_OUTPUTS_SOURCE,
};
