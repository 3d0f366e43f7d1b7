use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaitError {
    // Workflow errors
    #[error("Workflow validation failed: {0}")]
    Validation(String),

    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Unknown task kind: {0}")]
    UnknownTask(String),

    // Template errors
    #[error("Template validation failed: {template_id}: {message}")]
    TemplateValidation { template_id: String, message: String },

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Model profile not found: {0}")]
    ProfileNotFound(String),

    // Provider errors
    #[error("Provider request failed: {0}")]
    Provider(String),

    #[error("Provider streaming error: {0}")]
    ProviderStream(String),

    // Run store errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run failed: {0}")]
    RunFailed(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlaitError {
    /// Build a template validation error.
    pub fn template(template_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TemplateValidation {
            template_id: template_id.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PlaitError>;
