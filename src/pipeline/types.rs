//! Shared types for the message processing pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProcessingError;

// ── Inbound message ─────────────────────────────────────────────────

/// A message received from the queue under a peek lock.
///
/// Owned by exactly one worker from receipt until its disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Broker-assigned message ID. Stable across redeliveries.
    pub id: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    /// Token identifying this delivery's lock; required to settle it.
    pub lock_token: Uuid,
    /// Raw message body as received.
    pub body: String,
    /// When the message was first enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// Typed message payload: `{"skills_list": [...], "essay": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub skills_list: Vec<String>,
    pub essay: String,
}

// ── Evaluation ──────────────────────────────────────────────────────

/// Score and feedback for a single skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillEvaluation {
    pub skill_name: String,
    #[serde(default)]
    pub comments: String,
    pub score: f64,
}

/// Aggregated evaluation returned by the `evaluate_skills` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Per-skill evaluations, in the order the model supplied them.
    pub skill_evaluations: Vec<SkillEvaluation>,
    /// Mean of all skill scores, rounded to two decimals.
    pub aggregate_score: f64,
    pub approved: bool,
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Result of processing one message. Decides its disposition.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Success(EvaluationResult),
    Retryable(ProcessingError),
    Fatal(ProcessingError),
}

impl ProcessingOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Retryable(_) => "retryable",
            Self::Fatal(_) => "fatal",
        }
    }
}

impl From<ProcessingError> for ProcessingOutcome {
    fn from(err: ProcessingError) -> Self {
        match err {
            ProcessingError::Transient(_) | ProcessingError::ShutdownTimeout(_) => {
                Self::Retryable(err)
            }
            ProcessingError::Validation(_)
            | ProcessingError::Configuration(_)
            | ProcessingError::Protocol(_) => Self::Fatal(err),
        }
    }
}

// ── Handler trait ───────────────────────────────────────────────────

/// Turns one inbound message into one outcome.
///
/// Implementations classify every failure themselves; nothing is thrown
/// back at the consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> ProcessingOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_body_requires_both_fields() {
        let ok: Result<MessageBody, _> =
            serde_json::from_str(r#"{"skills_list": ["coerência"], "essay": "texto"}"#);
        assert_eq!(ok.unwrap().skills_list, vec!["coerência".to_string()]);

        let missing: Result<MessageBody, _> = serde_json::from_str(r#"{"skills_list": []}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn outcome_from_processing_error() {
        let retry = ProcessingOutcome::from(ProcessingError::Transient("timeout".into()));
        assert_eq!(retry.label(), "retryable");

        let fatal = ProcessingOutcome::from(ProcessingError::Protocol("no tool call".into()));
        assert_eq!(fatal.label(), "fatal");

        let fatal = ProcessingOutcome::from(ProcessingError::Validation("empty".into()));
        assert!(matches!(fatal, ProcessingOutcome::Fatal(ProcessingError::Validation(_))));
    }

    #[test]
    fn evaluation_result_serialization() {
        let result = EvaluationResult {
            skill_evaluations: vec![SkillEvaluation {
                skill_name: "coerência".into(),
                comments: "clear".into(),
                score: 8.0,
            }],
            aggregate_score: 8.0,
            approved: true,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["aggregate_score"], 8.0);
        assert_eq!(json["approved"], true);
        assert_eq!(json["skill_evaluations"][0]["skill_name"], "coerência");
    }
}
