//! Error types for essay-eval.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} unavailable (HTTP {status}): {reason}")]
    ServiceUnavailable {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Request rejected by {provider} (HTTP {status}): {reason}")]
    Rejected {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("Context length exceeded on {provider}: {reason}")]
    ContextLengthExceeded { provider: String, reason: String },

    #[error("Model {model} not available on provider {provider}")]
    ModelNotAvailable { provider: String, model: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether redelivering the same request could succeed.
    ///
    /// Network failures, timeouts, throttling, server-side errors and garbled
    /// responses are transient. Authentication, missing deployments and
    /// rejected requests are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. }
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::ServiceUnavailable { .. }
                | Self::InvalidResponse { .. }
        )
    }
}

/// Tool execution errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },
}

/// Prompt template errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("Failed to parse template YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unsupported template format: {0}")]
    UnsupportedFormat(String),

    #[error("Template {name} failed to compile: {reason}")]
    Compile { name: String, reason: String },

    #[error("Template {name} failed to render: {reason}")]
    Render { name: String, reason: String },

    #[error("Template {name} is missing {what}")]
    Incomplete { name: String, what: String },
}

/// Template store (object storage) errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Template {name} not found")]
    NotFound { name: String },

    #[error("Template store request failed: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Queue client errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Lock lost for message {message_id}")]
    LockLost { message_id: String },

    #[error("Queue receive failed: {0}")]
    Receive(String),

    #[error("Failed to settle message {message_id}: {reason}")]
    Settle { message_id: String, reason: String },

    #[error("Queue is closed")]
    Closed,
}

/// Classified failure of a single message.
///
/// The variant decides disposition: only `Transient` is ever retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("shutdown timeout elapsed after {0:?}")]
    ShutdownTimeout(Duration),
}

impl ProcessingError {
    /// Short name attached as the dead-letter reason.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Protocol(_) => "ProtocolError",
            Self::Transient(_) => "TransientError",
            Self::ShutdownTimeout(_) => "ShutdownTimeoutError",
        }
    }
}

impl From<LlmError> for ProcessingError {
    fn from(err: LlmError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Configuration(err.to_string())
        }
    }
}
