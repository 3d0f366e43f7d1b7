use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use plait_core::template::{PlanNode, SourceRef, Template};
use plait_core::types::{ModelProfile, Role};
use plait_core::workflow::{GenStep, OutputCapture, Workflow};

pub const TASK: &str = "turn_generation";

/// A profile with no parameter overrides.
pub fn test_profile(id: &str) -> ModelProfile {
    ModelProfile {
        id: id.to_string(),
        provider: "openai".to_string(),
        model_id: format!("{id}-model"),
        gen_params: None,
        max_output_tokens: None,
    }
}

/// System prompt in the layout, one user message in the `main` slot.
pub fn simple_template(id: &str) -> Template {
    Template::new(id, TASK)
        .with_node(PlanNode::message(Role::System, "You are a helpful assistant."))
        .with_slot_ref("main")
        .with_slot("main", 0, vec![PlanNode::message(Role::User, "Generate a turn")])
}

/// A template whose user message reads a previous step's captured value.
pub fn step_output_template(id: &str, key: &str) -> Template {
    Template::new(id, TASK)
        .with_node(PlanNode::message(Role::System, "Polish the draft."))
        .with_node(PlanNode::message_from(
            Role::User,
            SourceRef::new("stepOutputs").with_arg("key", json!(key)),
        ))
}

pub fn text_step(id: &str, template_id: &str, output_key: &str) -> GenStep {
    GenStep::new(id, "default", template_id).with_output(OutputCapture::text(output_key))
}

pub fn single_step_workflow(template_id: &str, output_key: &str) -> Workflow {
    Workflow::new("wf-single", TASK).with_step(text_step("generate", template_id, output_key))
}

/// A small turn-generation context.
pub fn sample_context() -> Value {
    json!({
        "turns": [
            { "role": "user", "text": "We sneak into the vault." },
            { "role": "narrator", "text": "The lock clicks open." }
        ],
        "characters": [{ "name": "Ana", "role": "thief" }],
        "scenario": { "title": "Heist" },
        "globals": { "user": "Ana" }
    })
}

/// Write `value` as pretty JSON to `dir/name`.
pub fn write_json(dir: &Path, name: &str, value: &impl serde::Serialize) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path
}
