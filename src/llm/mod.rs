//! LLM integration for essay-eval.
//!
//! Supports:
//! - **Azure OpenAI**: deployment-scoped chat completions
//! - **Azure AI Inference**: model-catalog chat completions
//!
//! Both speak the OpenAI-compatible protocol through [`AzureChatProvider`].
//! [`create_backend`] validates a [`ProviderConfig`] and returns a
//! [`BackendHandle`] with the evaluation tool registered.

pub mod azure;
pub mod backend;
pub mod provider;

pub use azure::AzureChatProvider;
pub use backend::{BackendHandle, Invocation, InvocationSettings, MAX_TOOL_ROUNDS, ToolInvocation};
pub use provider::*;

use std::str::FromStr;
use std::sync::Arc;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::tools::ToolRegistry;
use crate::tools::builtin::{EvaluateSkillsTool, EvaluationPolicy};

/// API version used for AI Inference when none is configured.
pub const DEFAULT_INFERENCE_API_VERSION: &str = "2024-05-01-preview";

/// Supported AI backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderType {
    #[default]
    AzureOpenAi,
    AzureAiInference,
}

impl ProviderType {
    /// Identifier used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AzureOpenAi => "azure_openai",
            Self::AzureAiInference => "azure_ai_inference",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AzureOpenAi => "AZURE_OPENAI",
            Self::AzureAiInference => "AZURE_AI_INFERENCE",
        })
    }
}

impl FromStr for ProviderType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "AZURE_OPENAI" => Ok(Self::AzureOpenAi),
            "AZURE_AI_INFERENCE" => Ok(Self::AzureAiInference),
            other => Err(ConfigError::InvalidValue {
                key: "AI_PROVIDER_TYPE".to_string(),
                message: format!(
                    "unknown provider type '{other}', expected AZURE_OPENAI or AZURE_AI_INFERENCE"
                ),
            }),
        }
    }
}

/// Configuration for creating an AI backend.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub provider_type: ProviderType,
    pub deployment_name: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<SecretString>,
    pub api_version: Option<String>,
}

/// A [`ProviderConfig`] with every field the provider type needs.
#[derive(Debug, Clone)]
struct ValidatedProvider {
    endpoint: String,
    model: String,
    api_key: SecretString,
    api_version: String,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ProviderConfig {
    /// Check the fields required by the provider type.
    ///
    /// Every missing field is reported in one error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validated().map(|_| ())
    }

    fn validated(&self) -> Result<ValidatedProvider, ConfigError> {
        use secrecy::ExposeSecret;

        let endpoint = present(&self.endpoint);
        let api_key = self
            .api_key
            .as_ref()
            .filter(|k| !k.expose_secret().trim().is_empty());
        let model = present(&self.deployment_name);
        let api_version = present(&self.api_version);

        let mut missing = Vec::new();
        if endpoint.is_none() {
            missing.push("OPENAI_ENDPOINT");
        }
        if api_key.is_none() {
            missing.push("OPENAI_API_KEY");
        }
        if self.provider_type == ProviderType::AzureOpenAi {
            if model.is_none() {
                missing.push("OPENAI_MODEL_NAME");
            }
            if api_version.is_none() {
                missing.push("OPENAI_API_VERSION");
            }
        }

        let (Some(endpoint), Some(api_key), true) = (endpoint, api_key, missing.is_empty()) else {
            return Err(ConfigError::MissingRequired {
                key: missing.join(", "),
                hint: format!("Required for provider type {}.", self.provider_type),
            });
        };

        let url = reqwest::Url::parse(endpoint).map_err(|e| ConfigError::InvalidValue {
            key: "OPENAI_ENDPOINT".to_string(),
            message: format!("not a valid URL: {e}"),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "OPENAI_ENDPOINT".to_string(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        Ok(ValidatedProvider {
            endpoint: endpoint.to_string(),
            model: model.unwrap_or_default().to_string(),
            api_key: api_key.clone(),
            api_version: api_version
                .unwrap_or(DEFAULT_INFERENCE_API_VERSION)
                .to_string(),
        })
    }
}

/// Build a backend handle from configuration.
///
/// Validates the configuration, constructs the provider and registers the
/// evaluation tool. Each call returns an independent handle.
pub fn create_backend(
    config: &ProviderConfig,
    policy: EvaluationPolicy,
) -> Result<BackendHandle, ConfigError> {
    let validated = config.validated()?;

    let provider = AzureChatProvider::new(
        config.provider_type,
        &validated.endpoint,
        validated.model,
        validated.api_key,
        &validated.api_version,
    )
    .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EvaluateSkillsTool::new(policy)));

    tracing::info!(
        provider = config.provider_type.as_str(),
        model = provider.model_name(),
        "Using {} backend",
        config.provider_type
    );
    Ok(BackendHandle::new(Arc::new(provider), tools))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::EVALUATE_SKILLS;

    fn openai_config() -> ProviderConfig {
        ProviderConfig {
            provider_type: ProviderType::AzureOpenAi,
            deployment_name: Some("gpt-4o".into()),
            endpoint: Some("https://res.openai.azure.com".into()),
            api_key: Some(SecretString::from("k")),
            api_version: Some("2024-06-01".into()),
        }
    }

    #[test]
    fn test_provider_type_parsing() {
        assert_eq!("AZURE_OPENAI".parse::<ProviderType>().unwrap(), ProviderType::AzureOpenAi);
        assert_eq!(
            "azure-ai-inference".parse::<ProviderType>().unwrap(),
            ProviderType::AzureAiInference
        );
        assert!("OPENROUTER".parse::<ProviderType>().is_err());
    }

    #[test]
    fn test_create_backend_registers_tool() {
        let backend = create_backend(&openai_config(), EvaluationPolicy::default()).unwrap();
        assert!(backend.tools().has(EVALUATE_SKILLS));
        assert_eq!(backend.model_name(), "gpt-4o");
        assert_eq!(backend.provider_name(), "azure_openai");
    }

    #[test]
    fn test_missing_fields_reported_together() {
        let config = ProviderConfig {
            provider_type: ProviderType::AzureOpenAi,
            ..Default::default()
        };
        let err = create_backend(&config, EvaluationPolicy::default()).unwrap_err();
        let message = err.to_string();
        for key in [
            "OPENAI_ENDPOINT",
            "OPENAI_API_KEY",
            "OPENAI_MODEL_NAME",
            "OPENAI_API_VERSION",
        ] {
            assert!(message.contains(key), "{key} missing from: {message}");
        }
    }

    #[test]
    fn test_inference_needs_only_endpoint_and_key() {
        let config = ProviderConfig {
            provider_type: ProviderType::AzureAiInference,
            endpoint: Some("https://res.inference.ai.azure.com".into()),
            api_key: Some(SecretString::from("k")),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(create_backend(&config, EvaluationPolicy::default()).is_ok());
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut config = openai_config();
        config.endpoint = Some("not a url".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_independent_handles() {
        let a = create_backend(&openai_config(), EvaluationPolicy::default()).unwrap();
        let b = create_backend(&openai_config(), EvaluationPolicy::default()).unwrap();
        assert_eq!(a.model_name(), b.model_name());
        assert_eq!(a.tools().count(), b.tools().count());
    }
}
