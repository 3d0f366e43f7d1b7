use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A rendered chat message. Order in a rendered list is significant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionMessage {
    pub role: Role,
    pub content: String,
    /// Marks an assistant message the model should continue rather than answer.
    #[serde(default, skip_serializing_if = "is_false")]
    pub prefix: bool,
}

impl ChatCompletionMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            prefix: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_prefix(mut self, prefix: bool) -> Self {
        self.prefix = prefix;
        self
    }
}

/// Sampling parameters. Unset fields fall back to the model profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenParams {
    /// Overlay `self` on top of `base`, field by field.
    pub fn merged_over(&self, base: &GenParams) -> GenParams {
        GenParams {
            temperature: self.temperature.or(base.temperature),
            top_p: self.top_p.or(base.top_p),
            top_k: self.top_k.or(base.top_k),
            frequency_penalty: self.frequency_penalty.or(base.frequency_penalty),
            presence_penalty: self.presence_penalty.or(base.presence_penalty),
            seed: self.seed.or(base.seed),
        }
    }
}

/// How the provider should treat a trailing assistant message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssistantPrefill {
    Require,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestHints {
    pub assistant_prefill: AssistantPrefill,
}

impl RequestHints {
    /// Require prefill when the last message is a prefix-flagged assistant turn.
    pub fn for_messages(messages: &[ChatCompletionMessage]) -> Self {
        let require = messages
            .last()
            .is_some_and(|m| m.role == Role::Assistant && m.prefix);
        Self {
            assistant_prefill: if require {
                AssistantPrefill::Require
            } else {
                AssistantPrefill::Auto
            },
        }
    }
}

/// A streaming completion request handed to a `ProviderAdapter`.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatCompletionMessage>,
    pub max_output_tokens: u32,
    pub stop: Vec<String>,
    pub gen_params: Option<GenParams>,
    pub hints: Option<RequestHints>,
    /// Cancelled when the owning run is cancelled.
    pub signal: CancellationToken,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Cancelled,
    Unknown,
}

/// The aggregated response an adapter reports once its stream ends.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    /// Final assistant content, when the provider reports one.
    pub content: Option<String>,
    pub finish_reason: FinishReason,
}

/// One item of a completion stream. `Done` is the terminating sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Delta(String),
    Done(CompletionResponse),
}

/// A named model binding loaded from config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelProfile {
    pub id: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub gen_params: Option<GenParams>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

fn default_provider() -> String {
    "openai".to_string()
}
