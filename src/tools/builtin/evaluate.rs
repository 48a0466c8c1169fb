//! `evaluate_skills`: aggregates per-skill scores into an approval decision.
//!
//! The model calls this tool once it has scored every skill. Aggregation is
//! deterministic: scores are clamped into range, averaged, rounded to two
//! decimals and compared against a fixed threshold.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ProcessingError, ToolError};
use crate::pipeline::types::{EvaluationResult, SkillEvaluation};
use crate::tools::tool::{Tool, ToolOutput, require_field};

/// Name the backend calls the tool by.
pub const EVALUATE_SKILLS: &str = "evaluate_skills";

/// Lowest accepted skill score.
pub const SCORE_MIN: f64 = 0.0;

/// Highest accepted skill score.
pub const SCORE_MAX: f64 = 10.0;

/// Default approval threshold.
pub const DEFAULT_APPROVAL_THRESHOLD: f64 = 7.0;

/// Fixed approval rules applied to every evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationPolicy {
    /// Minimum aggregate score for approval (inclusive).
    pub approval_threshold: f64,
    /// When set, any skill scoring exactly zero rejects the essay.
    pub zero_score_veto: bool,
}

impl Default for EvaluationPolicy {
    fn default() -> Self {
        Self {
            approval_threshold: DEFAULT_APPROVAL_THRESHOLD,
            zero_score_veto: false,
        }
    }
}

/// Aggregate skill evaluations into a result.
///
/// Out-of-range scores are clamped and non-finite scores count as zero, so a
/// single malformed entry cannot fail the whole evaluation. An empty input is
/// a validation error.
pub fn evaluate_skills(
    skills: Vec<SkillEvaluation>,
    policy: &EvaluationPolicy,
) -> Result<EvaluationResult, ProcessingError> {
    if skills.is_empty() {
        return Err(ProcessingError::Validation(
            "no skills provided for evaluation".to_string(),
        ));
    }

    let skill_evaluations: Vec<SkillEvaluation> = skills
        .into_iter()
        .map(|mut skill| {
            skill.score = clamp_score(skill.score);
            skill
        })
        .collect();

    let sum: f64 = skill_evaluations.iter().map(|s| s.score).sum();
    let mean = sum / skill_evaluations.len() as f64;
    let aggregate_score = round2(mean);

    let vetoed = policy.zero_score_veto && skill_evaluations.iter().any(|s| s.score == 0.0);
    let approved = !vetoed && aggregate_score >= policy.approval_threshold;

    debug!(
        skills = skill_evaluations.len(),
        aggregate_score, approved, vetoed, "Skills evaluated"
    );

    Ok(EvaluationResult {
        skill_evaluations,
        aggregate_score,
        approved,
    })
}

fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(SCORE_MIN, SCORE_MAX)
    } else {
        SCORE_MIN
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ── Tool ────────────────────────────────────────────────────────────

/// Skill entry as the model sends it. Field names are matched leniently.
#[derive(Debug, Deserialize)]
struct RawSkill {
    #[serde(default, alias = "habilidade", alias = "skill", alias = "name")]
    skill_name: String,
    #[serde(default, alias = "comentario", alias = "comentarios", alias = "feedback")]
    comments: String,
    #[serde(default, alias = "nota")]
    score: serde_json::Value,
}

/// Read a score leniently: numbers and numeric strings are accepted, anything
/// else counts as zero.
fn score_from_value(skill: &str, value: &serde_json::Value) -> f64 {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.unwrap_or_else(|| {
        warn!(skill = %skill, score = %value, "Unparseable skill score, counting as zero");
        SCORE_MIN
    })
}

/// Parse the `skills` parameter into skill evaluations.
///
/// Accepts the array itself or the array JSON-encoded as a string.
fn parse_skills(params: &serde_json::Value) -> Result<Vec<SkillEvaluation>, ToolError> {
    let invalid = |reason: String| ToolError::InvalidParameters {
        name: EVALUATE_SKILLS.to_string(),
        reason,
    };

    let raw = if params.is_array() {
        params.clone()
    } else {
        match require_field(EVALUATE_SKILLS, params, "skills")? {
            serde_json::Value::String(encoded) => serde_json::from_str(encoded)
                .map_err(|e| invalid(format!("'skills' is not a JSON array: {e}")))?,
            other => other.clone(),
        }
    };

    let entries: Vec<RawSkill> =
        serde_json::from_value(raw).map_err(|e| invalid(format!("malformed skills: {e}")))?;

    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let skill_name = if entry.skill_name.trim().is_empty() {
                format!("skill_{}", i + 1)
            } else {
                entry.skill_name
            };
            let score = score_from_value(&skill_name, &entry.score);
            SkillEvaluation {
                skill_name,
                comments: entry.comments,
                score,
            }
        })
        .collect())
}

/// The evaluation plugin exposed to the backend as a callable tool.
#[derive(Debug, Clone, Default)]
pub struct EvaluateSkillsTool {
    policy: EvaluationPolicy,
}

impl EvaluateSkillsTool {
    pub fn new(policy: EvaluationPolicy) -> Self {
        Self { policy }
    }
}

impl Tool for EvaluateSkillsTool {
    fn name(&self) -> &str {
        EVALUATE_SKILLS
    }

    fn description(&self) -> &str {
        "Record the evaluation of every requested skill and compute the final \
         approval decision. Call this exactly once, after scoring all skills, \
         then reply with the returned result verbatim."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "skills": {
                    "type": "array",
                    "description": "One entry per evaluated skill, in the order requested",
                    "items": {
                        "type": "object",
                        "properties": {
                            "skill_name": {
                                "type": "string",
                                "description": "Name of the skill as given in the request"
                            },
                            "comments": {
                                "type": "string",
                                "description": "Justification for the score"
                            },
                            "score": {
                                "type": "number",
                                "minimum": SCORE_MIN,
                                "maximum": SCORE_MAX,
                                "description": "Score for this skill"
                            }
                        },
                        "required": ["skill_name", "score"]
                    }
                }
            },
            "required": ["skills"]
        })
    }

    fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let skills = parse_skills(&params)?;
        let result =
            evaluate_skills(skills, &self.policy).map_err(|e| ToolError::InvalidParameters {
                name: EVALUATE_SKILLS.to_string(),
                reason: e.to_string(),
            })?;

        let value = serde_json::to_value(&result).map_err(|e| ToolError::ExecutionFailed {
            name: EVALUATE_SKILLS.to_string(),
            reason: format!("Failed to serialize result: {e}"),
        })?;
        Ok(ToolOutput::json(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skills(scores: &[f64]) -> Vec<SkillEvaluation> {
        scores
            .iter()
            .enumerate()
            .map(|(i, score)| SkillEvaluation {
                skill_name: format!("skill-{i}"),
                comments: String::new(),
                score: *score,
            })
            .collect()
    }

    #[test]
    fn mean_above_threshold_is_approved() {
        let result = evaluate_skills(skills(&[8.0, 6.0, 9.0]), &EvaluationPolicy::default()).unwrap();
        assert_eq!(result.aggregate_score, 7.67);
        assert!(result.approved);
        assert_eq!(result.skill_evaluations.len(), 3);
    }

    #[test]
    fn mean_below_threshold_is_rejected() {
        let result = evaluate_skills(skills(&[7.0, 5.0]), &EvaluationPolicy::default()).unwrap();
        assert_eq!(result.aggregate_score, 6.0);
        assert!(!result.approved);
    }

    #[test]
    fn threshold_is_inclusive() {
        let result = evaluate_skills(skills(&[7.0, 7.0, 7.0]), &EvaluationPolicy::default()).unwrap();
        assert_eq!(result.aggregate_score, 7.0);
        assert!(result.approved);
    }

    #[test]
    fn empty_input_is_validation_error() {
        let err = evaluate_skills(Vec::new(), &EvaluationPolicy::default()).unwrap_err();
        assert!(matches!(err, ProcessingError::Validation(_)));
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let result = evaluate_skills(skills(&[15.0, -3.0, f64::NAN]), &EvaluationPolicy::default())
            .unwrap();
        let scores: Vec<f64> = result.skill_evaluations.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![10.0, 0.0, 0.0]);
        assert_eq!(result.aggregate_score, 3.33);
    }

    #[test]
    fn aggregation_is_order_independent() {
        let policy = EvaluationPolicy::default();
        let a = evaluate_skills(skills(&[8.0, 6.0, 9.0]), &policy).unwrap();
        let b = evaluate_skills(skills(&[9.0, 8.0, 6.0]), &policy).unwrap();
        assert_eq!(a.aggregate_score, b.aggregate_score);
        assert_eq!(a.approved, b.approved);
    }

    #[test]
    fn zero_score_veto_rejects_high_mean() {
        let policy = EvaluationPolicy {
            zero_score_veto: true,
            ..Default::default()
        };
        let result = evaluate_skills(skills(&[10.0, 10.0, 10.0, 0.0]), &policy).unwrap();
        assert_eq!(result.aggregate_score, 7.5);
        assert!(!result.approved);

        let lenient = evaluate_skills(skills(&[10.0, 10.0, 10.0, 0.0]), &EvaluationPolicy::default())
            .unwrap();
        assert!(lenient.approved);
    }

    #[test]
    fn tool_accepts_structured_skills() {
        let tool = EvaluateSkillsTool::default();
        let out = tool
            .execute(serde_json::json!({
                "skills": [
                    {"skill_name": "coerência", "comments": "bem estruturado", "score": 8},
                    {"skill_name": "gramática", "comments": "poucos erros", "score": 6}
                ]
            }))
            .unwrap();
        assert_eq!(out.result["aggregate_score"], 7.0);
        assert_eq!(out.result["approved"], true);
        assert_eq!(out.result["skill_evaluations"][0]["comments"], "bem estruturado");
    }

    #[test]
    fn tool_accepts_json_encoded_skills_and_aliases() {
        let tool = EvaluateSkillsTool::default();
        let encoded = r#"[{"habilidade": "writing", "nota": "8"}, {"habilidade": "grammar", "nota": 7}]"#;
        let out = tool
            .execute(serde_json::json!({ "skills": encoded }))
            .unwrap();
        assert_eq!(out.result["aggregate_score"], 7.5);
        assert_eq!(out.result["skill_evaluations"][0]["skill_name"], "writing");
    }

    #[test]
    fn tool_counts_unparseable_score_as_zero() {
        let tool = EvaluateSkillsTool::default();
        let out = tool
            .execute(serde_json::json!({
                "skills": [
                    {"skill_name": "a", "score": "invalid"},
                    {"skill_name": "b", "score": 10}
                ]
            }))
            .unwrap();
        assert_eq!(out.result["aggregate_score"], 5.0);
    }

    #[test]
    fn tool_rejects_empty_and_missing_skills() {
        let tool = EvaluateSkillsTool::default();
        let empty = tool.execute(serde_json::json!({"skills": []})).unwrap_err();
        assert!(matches!(empty, ToolError::InvalidParameters { .. }));

        let missing = tool.execute(serde_json::json!({})).unwrap_err();
        assert!(matches!(missing, ToolError::InvalidParameters { .. }));
    }

    #[test]
    fn tool_names_unnamed_skills_by_position() {
        let tool = EvaluateSkillsTool::default();
        let out = tool
            .execute(serde_json::json!({"skills": [{"score": 9}]}))
            .unwrap();
        assert_eq!(out.result["skill_evaluations"][0]["skill_name"], "skill_1");
    }
}
