//! Prompt templates: YAML definitions rendered with handlebars.
//!
//! A template is loaded once at startup and shared by every worker. Rendered
//! text may carry `<message role="...">` blocks, which become separate chat
//! turns; text without them is sent as a single user message.
//!
//! Bound values are markup-escaped while rendering, so a variable can never
//! open or close a message block. Content is unescaped after splitting.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use handlebars::Handlebars;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ConfigError, TemplateError};
use crate::llm::{ChatMessage, InvocationSettings, Role};

/// Settings block used when no model-specific block matches.
pub const DEFAULT_SETTINGS_KEY: &str = "default";

static SK_VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\$([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex")
});

static MESSAGE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<message\s+role\s*=\s*["']([^"']+)["']\s*>(.*?)</message>"#)
        .expect("valid regex")
});

/// Syntax of the template text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateFormat {
    #[default]
    Handlebars,
    /// `{{$variable}}` placeholders.
    SemanticKernel,
}

impl TemplateFormat {
    fn parse(s: &str) -> Result<Self, TemplateError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "handlebars" => Ok(Self::Handlebars),
            "semantic-kernel" | "semantic_kernel" => Ok(Self::SemanticKernel),
            other => Err(TemplateError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// A declared template input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputVariable {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_required")]
    pub is_required: bool,
}

fn default_required() -> bool {
    true
}

/// Declared output; informational only.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OutputVariable {
    Name(String),
    Spec {
        #[serde(default)]
        description: Option<String>,
    },
}

/// Execution parameters for one model.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl From<&ExecutionSettings> for InvocationSettings {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    template: String,
    #[serde(default)]
    template_format: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_variables: Vec<InputVariable>,
    #[serde(default)]
    output_variable: Option<OutputVariable>,
    #[serde(default)]
    execution_settings: BTreeMap<String, ExecutionSettings>,
}

/// A parsed prompt template.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub name: String,
    pub template: String,
    pub template_format: TemplateFormat,
    pub description: Option<String>,
    pub input_variables: Vec<InputVariable>,
    pub output_variable: Option<OutputVariable>,
    pub execution_settings: BTreeMap<String, ExecutionSettings>,
}

impl PromptTemplate {
    /// Parse template bytes. `fallback_name` names templates that omit `name`.
    pub fn from_yaml(bytes: Vec<u8>, fallback_name: &str) -> Result<Self, TemplateError> {
        let text = String::from_utf8(bytes)?;
        let raw: RawTemplate = serde_yaml::from_str(&text)?;

        let name = raw
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| fallback_name.to_string());

        if raw.template.trim().is_empty() {
            return Err(TemplateError::Incomplete {
                name,
                what: "template text".to_string(),
            });
        }

        let template = Self {
            template_format: TemplateFormat::parse(&raw.template_format)?,
            name,
            template: raw.template,
            description: raw.description,
            input_variables: raw.input_variables,
            output_variable: raw.output_variable,
            execution_settings: raw.execution_settings,
        };
        debug!(
            template = %template.name,
            format = ?template.template_format,
            inputs = template.input_variables.len(),
            settings = template.execution_settings.len(),
            "Parsed prompt template"
        );
        Ok(template)
    }

    /// Names of the inputs a message must supply.
    pub fn required_variables(&self) -> impl Iterator<Item = &str> {
        self.input_variables
            .iter()
            .filter(|v| v.is_required)
            .map(|v| v.name.as_str())
    }

    /// Pick the execution settings for `model`.
    ///
    /// Tries a block keyed by the model name, then a block whose `model_id`
    /// matches, then the `default` block.
    pub fn select_settings(&self, model: &str) -> Result<&ExecutionSettings, ConfigError> {
        if let Some(settings) = self.execution_settings.get(model) {
            return Ok(settings);
        }
        if let Some(settings) = self
            .execution_settings
            .values()
            .find(|s| s.model_id.as_deref() == Some(model))
        {
            return Ok(settings);
        }
        self.execution_settings
            .get(DEFAULT_SETTINGS_KEY)
            .ok_or_else(|| ConfigError::MissingRequired {
                key: format!("execution_settings.{model}"),
                hint: format!(
                    "Template {} has no settings for model '{model}' and no '{DEFAULT_SETTINGS_KEY}' block.",
                    self.name
                ),
            })
    }

    /// Compile the template for rendering.
    pub fn compile(&self) -> Result<PromptRenderer, TemplateError> {
        let source = match self.template_format {
            TemplateFormat::Handlebars => self.template.clone(),
            TemplateFormat::SemanticKernel => {
                SK_VARIABLE.replace_all(&self.template, "{{${1}}}").into_owned()
            }
        };

        let mut registry = Handlebars::new();
        registry.register_escape_fn(escape_markup);
        registry
            .register_template_string(&self.name, source)
            .map_err(|e| TemplateError::Compile {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        Ok(PromptRenderer {
            name: self.name.clone(),
            registry,
        })
    }
}

/// A compiled template, ready to render chat messages.
#[derive(Debug)]
pub struct PromptRenderer {
    name: String,
    registry: Handlebars<'static>,
}

impl PromptRenderer {
    fn render_escaped(
        &self,
        variables: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, TemplateError> {
        self.registry
            .render(&self.name, variables)
            .map_err(|e| TemplateError::Render {
                name: self.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Render the template text with `variables`.
    pub fn render_text(
        &self,
        variables: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, TemplateError> {
        Ok(unescape_markup(&self.render_escaped(variables)?))
    }

    /// Render and split into chat messages.
    ///
    /// Triple-stash placeholders (`{{{x}}}`) bypass escaping and can inject
    /// message blocks; templates should not use them for message input.
    pub fn render(
        &self,
        variables: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<ChatMessage>, TemplateError> {
        let text = self.render_escaped(variables)?;
        split_messages(&self.name, &text)
    }
}

fn escape_markup(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

// `&amp;` goes last so escaped entities survive one round trip.
fn unescape_markup(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Non-whitespace text between or around message blocks.
fn text_outside_blocks(text: &str) -> Vec<&str> {
    let mut stray = Vec::new();
    let mut last_end = 0;
    for block in MESSAGE_BLOCK.find_iter(text) {
        stray.push(&text[last_end..block.start()]);
        last_end = block.end();
    }
    stray.push(&text[last_end..]);
    stray
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Split rendered text on `<message role="...">` blocks.
fn split_messages(name: &str, text: &str) -> Result<Vec<ChatMessage>, TemplateError> {
    let mut messages = Vec::new();
    for captures in MESSAGE_BLOCK.captures_iter(text) {
        let role_name = &captures[1];
        let role = Role::parse(role_name).ok_or_else(|| TemplateError::Render {
            name: name.to_string(),
            reason: format!("unknown message role '{role_name}'"),
        })?;
        messages.push(ChatMessage::new(role, unescape_markup(captures[2].trim())));
    }

    if messages.is_empty() {
        let text = text.trim();
        if text.is_empty() {
            return Err(TemplateError::Render {
                name: name.to_string(),
                reason: "template rendered to empty text".to_string(),
            });
        }
        messages.push(ChatMessage::user(unescape_markup(text)));
        return Ok(messages);
    }

    let stray = text_outside_blocks(text);
    if !stray.is_empty() {
        warn!(
            template = %name,
            fragments = stray.len(),
            chars = stray.iter().map(|s| s.chars().count()).sum::<usize>(),
            "Text outside message blocks is not sent"
        );
    }
    Ok(messages)
}
