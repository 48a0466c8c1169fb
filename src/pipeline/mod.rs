//! Message processing pipeline.
//!
//! Every queue message flows through:
//! 1. `PromptProcessor::bind_variables()`: body validation against the template
//! 2. `PromptRenderer::render()`: template text to chat messages
//! 3. `BackendHandle::invoke()`: model conversation with tool calls
//! 4. `evaluate_skills`: deterministic aggregation and approval
//!
//! The result is a `ProcessingOutcome` that alone decides the message's disposition.

pub mod processor;
pub mod template;
pub mod types;

pub use processor::PromptProcessor;
pub use template::{PromptRenderer, PromptTemplate};
pub use types::{InboundMessage, MessageHandler, ProcessingOutcome};
