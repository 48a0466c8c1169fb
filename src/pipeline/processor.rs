//! Prompt processor: turns one queue message into one evaluation.
//!
//! Flow:
//! 1. Parse and validate the body against the template's required inputs
//! 2. Render the template into chat messages
//! 3. Invoke the backend, with `evaluate_skills` exposed as a tool
//! 4. Classify the result into a `ProcessingOutcome`
//!
//! Backend errors never escape: every failure is classified here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, ProcessingError};
use crate::llm::{BackendHandle, Invocation, InvocationSettings};
use crate::pipeline::template::{PromptRenderer, PromptTemplate};
use crate::pipeline::types::{
    EvaluationResult, InboundMessage, MessageBody, MessageHandler, ProcessingOutcome,
};
use crate::tools::builtin::EVALUATE_SKILLS;

type Variables = serde_json::Map<String, serde_json::Value>;

/// Renders prompts and drives the backend for each message.
pub struct PromptProcessor {
    template: Arc<PromptTemplate>,
    renderer: PromptRenderer,
    backend: Arc<BackendHandle>,
    settings: InvocationSettings,
    timeout: Duration,
}

impl std::fmt::Debug for PromptProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptProcessor")
            .field("template", &self.template.name)
            .field("backend", &self.backend)
            .field("settings", &self.settings)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PromptProcessor {
    /// Create a processor.
    ///
    /// Selects execution settings for the backend's model and compiles the
    /// template, so both failures surface at startup.
    pub fn new(
        template: Arc<PromptTemplate>,
        backend: Arc<BackendHandle>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let settings = InvocationSettings::from(template.select_settings(backend.model_name())?);
        let renderer = template.compile()?;

        info!(
            template = %template.name,
            model = backend.model_name(),
            temperature = ?settings.temperature,
            max_tokens = ?settings.max_tokens,
            "Prompt processor ready"
        );

        Ok(Self {
            template,
            renderer,
            backend,
            settings,
            timeout,
        })
    }

    /// Parse the body and bind template variables.
    ///
    /// Strings bind verbatim; any other value binds as compact JSON.
    fn bind_variables(&self, body: &str) -> Result<Variables, ProcessingError> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| ProcessingError::Validation(format!("body is not valid JSON: {e}")))?;
        let serde_json::Value::Object(object) = value else {
            return Err(ProcessingError::Validation(
                "body is not a JSON object".to_string(),
            ));
        };

        let missing: Vec<&str> = self
            .template
            .required_variables()
            .filter(|name| object.get(*name).is_none_or(|v| v.is_null()))
            .collect();
        if !missing.is_empty() {
            return Err(ProcessingError::Validation(format!(
                "missing required variable(s): {}",
                missing.join(", ")
            )));
        }

        serde_json::from_value::<MessageBody>(serde_json::Value::Object(object.clone()))
            .map_err(|e| ProcessingError::Validation(format!("malformed message body: {e}")))?;

        Ok(object
            .into_iter()
            .map(|(key, value)| {
                let bound = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, serde_json::Value::String(bound))
            })
            .collect())
    }

    /// Process a message, returning its evaluation or a classified error.
    pub async fn process(
        &self,
        message: &InboundMessage,
    ) -> Result<EvaluationResult, ProcessingError> {
        let variables = self.bind_variables(&message.body)?;
        let messages = self
            .renderer
            .render(&variables)
            .map_err(|e| ProcessingError::Validation(e.to_string()))?;

        debug!(
            message_id = %message.id,
            turns = messages.len(),
            "Invoking backend"
        );

        let invocation =
            match tokio::time::timeout(self.timeout, self.backend.invoke(messages, &self.settings))
                .await
            {
                Ok(Ok(invocation)) => invocation,
                Ok(Err(e)) => return Err(ProcessingError::from(e)),
                Err(_) => {
                    return Err(ProcessingError::Transient(format!(
                        "backend did not answer within {:?}",
                        self.timeout
                    )));
                }
            };

        debug!(
            message_id = %message.id,
            rounds = invocation.rounds,
            tool_calls = invocation.tool_invocations.len(),
            tokens = invocation.usage.total(),
            "Backend invocation finished"
        );

        evaluation_from(&invocation)
    }
}

/// Extract the evaluation produced by the tool.
///
/// The last successful call wins. Calls that all failed mean the model sent
/// unusable input; no call at all is a protocol violation.
fn evaluation_from(invocation: &Invocation) -> Result<EvaluationResult, ProcessingError> {
    if let Some(value) = invocation.successful_results(EVALUATE_SKILLS).last() {
        return serde_json::from_value(value.clone()).map_err(|e| {
            ProcessingError::Protocol(format!("{EVALUATE_SKILLS} returned malformed result: {e}"))
        });
    }

    if !invocation.called(EVALUATE_SKILLS) {
        return Err(ProcessingError::Protocol(format!(
            "backend finished without calling {EVALUATE_SKILLS}"
        )));
    }

    let reason = invocation
        .tool_invocations
        .iter()
        .rev()
        .filter(|t| t.name == EVALUATE_SKILLS)
        .find_map(|t| t.result.as_ref().err())
        .map(ToString::to_string)
        .unwrap_or_default();
    Err(ProcessingError::Validation(reason))
}

#[async_trait]
impl MessageHandler for PromptProcessor {
    async fn handle(&self, message: &InboundMessage) -> ProcessingOutcome {
        match self.process(message).await {
            Ok(result) => {
                info!(
                    message_id = %message.id,
                    skills = result.skill_evaluations.len(),
                    aggregate_score = result.aggregate_score,
                    approved = result.approved,
                    "Essay evaluated"
                );
                ProcessingOutcome::Success(result)
            }
            Err(e) => {
                match &e {
                    ProcessingError::Transient(_) => warn!(
                        message_id = %message.id,
                        delivery_count = message.delivery_count,
                        error = %e,
                        "Transient processing failure"
                    ),
                    _ => warn!(
                        message_id = %message.id,
                        kind = e.kind(),
                        error = %e,
                        "Message processing failed"
                    ),
                }
                ProcessingOutcome::from(e)
            }
        }
    }
}
