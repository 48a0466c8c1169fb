//! essay-eval: queue-driven essay evaluation with an LLM backend.

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod tools;
pub mod worker;
