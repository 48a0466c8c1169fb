//! Built-in tools exposed to the backend.

pub mod evaluate;

pub use evaluate::{EVALUATE_SKILLS, EvaluateSkillsTool, EvaluationPolicy, evaluate_skills};
