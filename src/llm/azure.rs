//! Azure chat-completions backend.
//!
//! Speaks the OpenAI-compatible chat-completions protocol with function tools,
//! against either an Azure OpenAI deployment or an Azure AI Inference endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::ProviderType;
use crate::llm::provider::{
    ChatMessage, FinishReason, LlmProvider, Role, ToolCall, ToolCompletionRequest,
    ToolCompletionResponse, ToolDefinition,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chat backend for Azure OpenAI and Azure AI Inference.
pub struct AzureChatProvider {
    provider_type: ProviderType,
    url: Url,
    /// Deployment or model name. Sent as `model` to AI Inference.
    model: String,
    api_key: SecretString,
    http: Client,
}

impl std::fmt::Debug for AzureChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureChatProvider")
            .field("provider_type", &self.provider_type)
            .field("url", &self.url.as_str())
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl AzureChatProvider {
    /// Create a provider. Inputs are expected to be validated already.
    pub fn new(
        provider_type: ProviderType,
        endpoint: &str,
        model: impl Into<String>,
        api_key: SecretString,
        api_version: &str,
    ) -> Result<Self, LlmError> {
        let model = model.into();
        let url = chat_url(provider_type, endpoint, &model, api_version)?;

        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: provider_type.as_str().to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            provider_type,
            url,
            model,
            api_key,
            http,
        })
    }

    fn provider(&self) -> String {
        self.provider_type.as_str().to_string()
    }

    fn build_request_body(&self, request: &ToolCompletionRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> =
            request.messages.iter().map(convert_message).collect();

        let mut body = serde_json::json!({ "messages": messages });

        if self.provider_type == ProviderType::AzureAiInference && !self.model.is_empty() {
            body["model"] = serde_json::json!(self.model);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(
                request.tools.iter().map(convert_tool).collect::<Vec<_>>()
            );
            body["tool_choice"] = serde_json::json!("auto");
        }

        body
    }

    /// Map a non-success HTTP status to an error.
    fn error_for_status(
        &self,
        status: StatusCode,
        retry_after: Option<Duration>,
        body: String,
    ) -> LlmError {
        let provider = self.provider();
        let code = status.as_u16();
        match code {
            401 | 403 => LlmError::AuthFailed { provider },
            429 => LlmError::RateLimited {
                provider,
                retry_after,
            },
            404 => LlmError::ModelNotAvailable {
                provider,
                model: self.model.clone(),
            },
            408 | 500..=599 => LlmError::ServiceUnavailable {
                provider,
                status: code,
                reason: body,
            },
            400 if body.contains("context_length_exceeded") => {
                LlmError::ContextLengthExceeded {
                    provider,
                    reason: body,
                }
            }
            _ => LlmError::Rejected {
                provider,
                status: code,
                reason: body,
            },
        }
    }

    fn parse_response(&self, response: ChatResponse) -> Result<ToolCompletionResponse, LlmError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.provider(),
                reason: "response contained no choices".to_string(),
            })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::String(tc.function.arguments)),
            })
            .collect();

        let usage = response.usage.unwrap_or_default();
        Ok(ToolCompletionResponse {
            content: choice.message.content,
            tool_calls,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            finish_reason: FinishReason::from_openai(choice.finish_reason.as_deref()),
        })
    }
}

/// Chat-completions URL for `provider_type`. Path segments and the query
/// are percent-encoded.
fn chat_url(
    provider_type: ProviderType,
    endpoint: &str,
    model: &str,
    api_version: &str,
) -> Result<Url, LlmError> {
    let invalid = |reason: String| LlmError::RequestFailed {
        provider: provider_type.as_str().to_string(),
        reason,
    };
    let mut url =
        Url::parse(endpoint).map_err(|e| invalid(format!("Invalid endpoint URL: {e}")))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|()| invalid("Endpoint URL cannot carry a path".to_string()))?;
        segments.pop_if_empty();
        match provider_type {
            ProviderType::AzureOpenAi => {
                segments.extend(["openai", "deployments", model, "chat", "completions"]);
            }
            ProviderType::AzureAiInference => {
                segments.extend(["chat", "completions"]);
            }
        }
    }
    url.query_pairs_mut().append_pair("api-version", api_version);
    Ok(url)
}

fn convert_message(message: &ChatMessage) -> serde_json::Value {
    let mut value = serde_json::json!({
        "role": message.role.as_str(),
        "content": message.content,
    });

    match message.role {
        Role::Assistant if !message.tool_calls.is_empty() => {
            value["tool_calls"] = serde_json::json!(
                message
                    .tool_calls
                    .iter()
                    .map(|tc| serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    }))
                    .collect::<Vec<_>>()
            );
        }
        Role::Tool => {
            value["tool_call_id"] = serde_json::json!(message.tool_call_id);
        }
        _ => {}
    }

    value
}

fn convert_tool(tool: &ToolDefinition) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmProvider for AzureChatProvider {
    fn provider_name(&self) -> &str {
        self.provider_type.as_str()
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let body = self.build_request_body(&request);
        debug!(
            provider = self.provider_type.as_str(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending chat completion"
        );

        let response = self
            .http
            .post(self.url.clone())
            .header("api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: self.provider(),
                        timeout: CONNECT_TIMEOUT,
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: self.provider(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            warn!(
                provider = self.provider_type.as_str(),
                status = status.as_u16(),
                "Chat completion failed"
            );
            return Err(self.error_for_status(status, retry_after, text));
        }

        let parsed: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: self.provider(),
                    reason: e.to_string(),
                })?;

        let result = self.parse_response(parsed)?;
        debug!(
            provider = self.provider_type.as_str(),
            tool_calls = result.tool_calls.len(),
            input_tokens = result.input_tokens,
            output_tokens = result.output_tokens,
            "Chat completion received"
        );
        Ok(result)
    }
}

// Wire types

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    id: String,
    function: ChatFunction,
}

#[derive(Debug, Deserialize)]
struct ChatFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}
