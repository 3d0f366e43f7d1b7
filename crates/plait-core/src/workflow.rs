use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{PlaitError, Result};
use crate::types::GenParams;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    /// Task kind; selects the source registry templates are checked against.
    pub task: String,
    pub steps: Vec<GenStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenStep {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub model_profile_id: String,
    pub prompt_template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_params: Option<GenParams>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u64>,
    #[serde(default)]
    pub transforms: Vec<TransformSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputCapture>,
}

impl GenStep {
    pub fn new(
        id: impl Into<String>,
        model_profile_id: impl Into<String>,
        prompt_template_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            model_profile_id: model_profile_id.into(),
            prompt_template_id: prompt_template_id.into(),
            gen_params: None,
            stop: Vec::new(),
            max_output_tokens: None,
            max_context_tokens: None,
            transforms: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: OutputCapture) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_transform(mut self, transform: TransformSpec) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Transforms that apply to the given side, in declared order.
    pub fn transforms_for(&self, side: ApplyTo) -> impl Iterator<Item = &TransformSpec> {
        self.transforms.iter().filter(move |t| t.apply_to == side)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApplyTo {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrimMode {
    Start,
    End,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RegexTransform {
    pub pattern: String,
    /// Replacement text. `$1`..`$99` and `$<name>` insert groups, `$&` the
    /// whole match, `$$` a literal dollar.
    pub substitution: String,
    /// Any of `g i m s x U`. Without `g` only the first match is replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
}

impl RegexTransform {
    /// Compile the pattern with its flags applied.
    pub fn build(&self) -> Result<Regex> {
        let mut builder = RegexBuilder::new(&self.pattern);
        for flag in self.flags.as_deref().unwrap_or("").chars() {
            match flag {
                'g' => {}
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'x' => {
                    builder.ignore_whitespace(true);
                }
                'U' => {
                    builder.swap_greed(true);
                }
                other => {
                    return Err(PlaitError::Validation(format!(
                        "unsupported regex flag '{}' in /{}/",
                        other, self.pattern
                    )))
                }
            }
        }
        builder.build().map_err(|e| {
            PlaitError::Validation(format!("invalid regex /{}/: {}", self.pattern, e))
        })
    }

    pub fn replace_all(&self) -> bool {
        self.flags.as_deref().is_some_and(|f| f.contains('g'))
    }

    /// The substitution in the `regex` crate's `${group}` syntax.
    ///
    /// `$10` names group 10 only if `re` has it, otherwise group 1 then a
    /// literal `0`. A `$` that names no group of `re` is kept as text.
    pub fn replacement(&self, re: &Regex) -> String {
        let groups = re.captures_len();
        let has_name = |name: &str| re.capture_names().flatten().any(|n| n == name);

        let mut out = String::with_capacity(self.substitution.len() + 8);
        let mut rest = self.substitution.as_str();
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos + 1..];
            let bytes = tail.as_bytes();
            let used = match bytes.first() {
                Some(b'$') => {
                    out.push_str("$$");
                    1
                }
                Some(b'&') => {
                    out.push_str("${0}");
                    1
                }
                Some(b'<') => match tail.find('>') {
                    Some(end) if has_name(&tail[1..end]) => {
                        out.push_str(&format!("${{{}}}", &tail[1..end]));
                        end + 1
                    }
                    _ => {
                        out.push_str("$$");
                        0
                    }
                },
                Some(d) if d.is_ascii_digit() => {
                    let one = usize::from(d - b'0');
                    let two = bytes
                        .get(1)
                        .filter(|b| b.is_ascii_digit())
                        .map(|b| one * 10 + usize::from(b - b'0'));
                    match two {
                        Some(n) if n >= 1 && n < groups => {
                            out.push_str(&format!("${{{n}}}"));
                            2
                        }
                        _ if one >= 1 && one < groups => {
                            out.push_str(&format!("${{{one}}}"));
                            1
                        }
                        _ => {
                            out.push_str("$$");
                            0
                        }
                    }
                }
                _ => {
                    out.push_str("$$");
                    0
                }
            };
            rest = &tail[used..];
        }
        out.push_str(rest);
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TransformOp {
    Trim(TrimMode),
    Regex(RegexTransform),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransformSpec {
    pub apply_to: ApplyTo,
    #[serde(flatten)]
    pub op: TransformOp,
}

impl TransformSpec {
    pub fn trim(apply_to: ApplyTo, mode: TrimMode) -> Self {
        Self {
            apply_to,
            op: TransformOp::Trim(mode),
        }
    }

    pub fn regex(
        apply_to: ApplyTo,
        pattern: impl Into<String>,
        substitution: impl Into<String>,
        flags: Option<&str>,
    ) -> Self {
        Self {
            apply_to,
            op: TransformOp::Regex(RegexTransform {
                pattern: pattern.into(),
                substitution: substitution.into(),
                flags: flags.map(str::to_string),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "capture", rename_all = "camelCase")]
pub enum CaptureKind {
    AssistantText,
    #[serde(rename_all = "camelCase")]
    JsonParsed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        json_path: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OutputCapture {
    pub key: String,
    #[serde(flatten)]
    pub capture: CaptureKind,
}

impl OutputCapture {
    pub fn text(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            capture: CaptureKind::AssistantText,
        }
    }

    pub fn json(key: impl Into<String>, json_path: Option<&str>) -> Self {
        Self {
            key: key.into(),
            capture: CaptureKind::JsonParsed {
                json_path: json_path.map(str::to_string),
            },
        }
    }
}

impl Workflow {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: GenStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Decode and validate a workflow document.
    pub fn parse(value: serde_json::Value) -> Result<Self> {
        let workflow: Workflow = serde_json::from_value(value)
            .map_err(|e| PlaitError::Validation(e.to_string()))?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PlaitError::Validation("workflow id is empty".into()));
        }
        if self.task.trim().is_empty() {
            return Err(PlaitError::Validation("workflow task is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(PlaitError::Validation(format!(
                "workflow '{}' has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(PlaitError::Validation("step id is empty".into()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(PlaitError::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if step.model_profile_id.trim().is_empty() || step.prompt_template_id.trim().is_empty()
            {
                return Err(PlaitError::Validation(format!(
                    "step '{}' must name a model profile and a prompt template",
                    step.id
                )));
            }
            if step.max_output_tokens == Some(0) || step.max_context_tokens == Some(0) {
                return Err(PlaitError::Validation(format!(
                    "step '{}' token limits must be positive",
                    step.id
                )));
            }
            for output in &step.outputs {
                if output.key.trim().is_empty() {
                    return Err(PlaitError::Validation(format!(
                        "step '{}' has an output with an empty key",
                        step.id
                    )));
                }
            }
            for transform in &step.transforms {
                if let TransformOp::Regex(rx) = &transform.op {
                    rx.build().map_err(|e| match e {
                        PlaitError::Validation(msg) => {
                            PlaitError::Validation(format!("step '{}': {}", step.id, msg))
                        }
                        other => other,
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// JSON schema for workflow documents.
pub fn workflow_json_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(Workflow);
    serde_json::to_value(&schema).unwrap_or(serde_json::Value::Null)
}
