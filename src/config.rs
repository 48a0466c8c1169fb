//! Configuration types.
//!
//! Everything is read from the environment once at startup. `from_lookup`
//! takes any key lookup so tests need not touch the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{ProviderConfig, ProviderType};
use crate::store::{FsTemplateStore, HttpBlobStore, TemplateStore};
use crate::tools::builtin::EvaluationPolicy;
use crate::tools::builtin::evaluate::{SCORE_MAX, SCORE_MIN};
use crate::worker::ConsumerConfig;

/// Queue connection settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Broker connection string. Absent in local mode.
    pub connection: Option<SecretString>,
    pub queue_name: String,
}

/// Where the prompt template lives.
#[derive(Debug, Clone)]
pub enum TemplateSource {
    /// A local directory.
    Directory(PathBuf),
    /// A blob container.
    Blob {
        account_url: String,
        container: String,
        sas_token: Option<SecretString>,
    },
}

impl TemplateSource {
    /// Build the store for this source.
    pub fn store(&self) -> Arc<dyn TemplateStore> {
        match self {
            Self::Directory(root) => Arc::new(FsTemplateStore::new(root.clone())),
            Self::Blob {
                account_url,
                container,
                sas_token,
            } => Arc::new(HttpBlobStore::new(
                account_url.clone(),
                container.clone(),
                sas_token.clone(),
            )),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub template_source: TemplateSource,
    /// Name of the template resource.
    pub template_name: String,
    pub provider: ProviderConfig,
    pub consumer: ConsumerConfig,
    pub policy: EvaluationPolicy,
    /// Upper bound on one backend invocation, tool rounds included.
    pub backend_timeout: Duration,
}

impl Config {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let queue = QueueConfig {
            connection: get("SERVICE_BUS_CONNECTION_STR").map(SecretString::from),
            queue_name: get("SERVICE_BUS_QUEUE_NAME").unwrap_or_else(|| "essays".to_string()),
        };

        let template_source = if let Some(path) = get("PROMPT_TEMPLATE_PATH") {
            TemplateSource::Directory(PathBuf::from(path))
        } else if let Some(account_url) = get("AZURE_STORAGE_ACCOUNT_URL") {
            let container =
                get("PROMPT_TEMPLATE_CONTAINER_NAME").ok_or_else(|| ConfigError::MissingRequired {
                    key: "PROMPT_TEMPLATE_CONTAINER_NAME".to_string(),
                    hint: "Required when AZURE_STORAGE_ACCOUNT_URL is set.".to_string(),
                })?;
            TemplateSource::Blob {
                account_url,
                container,
                sas_token: get("AZURE_STORAGE_SAS_TOKEN").map(SecretString::from),
            }
        } else {
            return Err(ConfigError::MissingRequired {
                key: "PROMPT_TEMPLATE_PATH or AZURE_STORAGE_ACCOUNT_URL".to_string(),
                hint: "Set one to choose where the prompt template is read from.".to_string(),
            });
        };

        let template_name =
            get("PROMPT_TEMPLATE_BLOB_NAME").ok_or_else(|| ConfigError::MissingEnvVar(
                "PROMPT_TEMPLATE_BLOB_NAME".to_string(),
            ))?;

        let provider_type = match get("AI_PROVIDER_TYPE") {
            Some(value) => value.parse::<ProviderType>()?,
            None => ProviderType::default(),
        };
        let provider = ProviderConfig {
            provider_type,
            deployment_name: get("OPENAI_MODEL_NAME"),
            endpoint: get("OPENAI_ENDPOINT"),
            api_key: get("OPENAI_API_KEY").map(SecretString::from),
            api_version: get("OPENAI_API_VERSION"),
        };

        let defaults = ConsumerConfig::default();
        let consumer = ConsumerConfig {
            max_concurrency: parse_or(&get, "MAX_CONCURRENCY", defaults.max_concurrency)?,
            shutdown_timeout: Duration::from_secs(parse_or(
                &get,
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout.as_secs(),
            )?),
            max_delivery_attempts: parse_or(
                &get,
                "MAX_DELIVERY_ATTEMPTS",
                defaults.max_delivery_attempts,
            )?,
            ..defaults
        };
        consumer.validate()?;

        let approval_threshold: f64 = parse_or(
            &get,
            "APPROVAL_THRESHOLD",
            EvaluationPolicy::default().approval_threshold,
        )?;
        if !(SCORE_MIN..=SCORE_MAX).contains(&approval_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "APPROVAL_THRESHOLD".to_string(),
                message: format!("must be between {SCORE_MIN} and {SCORE_MAX}"),
            });
        }
        let zero_score_veto = match get("EVALUATION_ZERO_SCORE_VETO") {
            Some(value) => parse_bool("EVALUATION_ZERO_SCORE_VETO", &value)?,
            None => false,
        };

        let backend_timeout_secs: u64 = parse_or(&get, "BACKEND_TIMEOUT_SECS", 120)?;
        if backend_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BACKEND_TIMEOUT_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            queue,
            template_source,
            template_name,
            provider,
            consumer,
            policy: EvaluationPolicy {
                approval_threshold,
                zero_score_veto,
            },
            backend_timeout: Duration::from_secs(backend_timeout_secs),
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' is not a boolean"),
        }),
    }
}
