//! Backend handle: an LLM provider paired with the tools it may call.
//!
//! `invoke` drives the tool-calling conversation: each round sends the
//! transcript, executes whatever tools the model asked for, and appends the
//! results, until the model answers without calling a tool.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{LlmError, ToolError};
use crate::llm::provider::{ChatMessage, LlmProvider, ToolCompletionRequest};
use crate::tools::ToolRegistry;

/// Upper bound on completion rounds per invocation.
pub const MAX_TOOL_ROUNDS: u32 = 5;

/// Sampling parameters for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InvocationSettings {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Token usage summed over every round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// One tool call made by the model during an invocation.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub result: Result<serde_json::Value, ToolError>,
}

/// Everything an invocation produced.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Final text answer, if the model gave one.
    pub content: Option<String>,
    /// Tool calls in the order they were executed.
    pub tool_invocations: Vec<ToolInvocation>,
    pub rounds: u32,
    pub usage: TokenUsage,
}

impl Invocation {
    /// Successful results of calls to `name`, oldest first.
    pub fn successful_results<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a serde_json::Value> + 'a {
        self.tool_invocations
            .iter()
            .filter(move |t| t.name == name)
            .filter_map(|t| t.result.as_ref().ok())
    }

    /// Whether any tool call has succeeded so far.
    pub fn has_successful_result(&self) -> bool {
        self.tool_invocations.iter().any(|t| t.result.is_ok())
    }

    /// Whether the model called `name` at all.
    pub fn called(&self, name: &str) -> bool {
        self.tool_invocations.iter().any(|t| t.name == name)
    }
}

/// A constructed AI backend plus its registered tools.
///
/// Shared read-only by every worker.
#[derive(Clone)]
pub struct BackendHandle {
    llm: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("provider", &self.llm.provider_name())
            .field("model", &self.llm.model_name())
            .field("tools", &self.tools.count())
            .finish()
    }
}

impl BackendHandle {
    pub fn new(llm: Arc<dyn LlmProvider>, tools: ToolRegistry) -> Self {
        Self { llm, tools }
    }

    pub fn provider_name(&self) -> &str {
        self.llm.provider_name()
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run the conversation, executing tool calls, for at most
    /// [`MAX_TOOL_ROUNDS`] rounds.
    pub async fn invoke(
        &self,
        mut messages: Vec<ChatMessage>,
        settings: &InvocationSettings,
    ) -> Result<Invocation, LlmError> {
        let definitions = self.tools.tool_definitions();
        let mut invocation = Invocation::default();

        while invocation.rounds < MAX_TOOL_ROUNDS {
            invocation.rounds += 1;

            let request = ToolCompletionRequest::new(messages.clone(), definitions.clone())
                .with_temperature(settings.temperature)
                .with_max_tokens(settings.max_tokens);
            let response = match self.llm.complete_with_tools(request).await {
                Ok(response) => response,
                // Tool results already computed stand on their own.
                Err(e) if invocation.has_successful_result() => {
                    warn!(
                        rounds = invocation.rounds,
                        error = %e,
                        "Backend failed after a successful tool call; keeping its result"
                    );
                    return Ok(invocation);
                }
                Err(e) => return Err(e),
            };

            invocation.usage.input_tokens += response.input_tokens;
            invocation.usage.output_tokens += response.output_tokens;

            if response.tool_calls.is_empty() {
                debug!(
                    rounds = invocation.rounds,
                    tokens = invocation.usage.total(),
                    "Backend answered"
                );
                invocation.content = response.content;
                return Ok(invocation);
            }

            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content,
                response.tool_calls.clone(),
            ));

            for call in response.tool_calls {
                let result = self
                    .tools
                    .execute(&call.name, call.arguments)
                    .map(|output| output.result);

                let reply = match &result {
                    Ok(value) => value.to_string(),
                    Err(e) => {
                        debug!(tool = %call.name, error = %e, "Tool call failed");
                        format!("Error: {e}")
                    }
                };
                messages.push(ChatMessage::tool_result(&call.id, &call.name, reply));

                invocation.tool_invocations.push(ToolInvocation {
                    call_id: call.id,
                    name: call.name,
                    result,
                });
            }
        }

        warn!(
            rounds = invocation.rounds,
            tool_calls = invocation.tool_invocations.len(),
            "Tool round limit reached without a final answer"
        );
        Ok(invocation)
    }
}
