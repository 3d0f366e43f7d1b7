use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{ChatCompletionMessage, RequestHints, RunId};

/// Result payload of a finished step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub response: String,
    pub captured: Map<String, Value>,
}

/// Kind-specific part of a workflow event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventKind {
    RunStarted {
        workflow_id: String,
        task: String,
    },
    StepStarted {
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    PromptRendered {
        step_id: String,
        messages: Vec<ChatCompletionMessage>,
    },
    InputTransformed {
        step_id: String,
        messages: Vec<ChatCompletionMessage>,
    },
    StepPrompt {
        step_id: String,
        model_profile_id: String,
        model_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hints: Option<RequestHints>,
    },
    StreamDelta {
        step_id: String,
        delta: String,
    },
    StepCaptured {
        step_id: String,
        outputs: Map<String, Value>,
    },
    StepFinished {
        step_id: String,
        result: StepResult,
    },
    RunFinished {
        output: Map<String, Value>,
    },
    RunCancelled {},
    RunError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
        error: String,
    },
}

impl EventKind {
    /// Wire name of this event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::StepStarted { .. } => "step_started",
            Self::PromptRendered { .. } => "prompt_rendered",
            Self::InputTransformed { .. } => "input_transformed",
            Self::StepPrompt { .. } => "step_prompt",
            Self::StreamDelta { .. } => "stream_delta",
            Self::StepCaptured { .. } => "step_captured",
            Self::StepFinished { .. } => "step_finished",
            Self::RunFinished { .. } => "run_finished",
            Self::RunCancelled {} => "run_cancelled",
            Self::RunError { .. } => "run_error",
        }
    }

    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunFinished { .. } | Self::RunCancelled {} | Self::RunError { .. }
        )
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step_id, .. }
            | Self::PromptRendered { step_id, .. }
            | Self::InputTransformed { step_id, .. }
            | Self::StepPrompt { step_id, .. }
            | Self::StreamDelta { step_id, .. }
            | Self::StepCaptured { step_id, .. }
            | Self::StepFinished { step_id, .. } => Some(step_id),
            Self::RunError { step_id, .. } => step_id.as_deref(),
            _ => None,
        }
    }
}

/// One entry in a run's ordered, replayable event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub run_id: RunId,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl WorkflowEvent {
    pub fn new(run_id: RunId, kind: EventKind) -> Self {
        Self {
            run_id,
            ts: Utc::now(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}
