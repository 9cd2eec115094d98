//! Text-generation collaborator contract + chat-completion and offline implementations.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use quizcat_core::META_DESCRIPTION_MAX_CHARS;
use quizcat_storage::{FetchError, HttpClient, HttpClientConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

pub const CRATE_NAME: &str = "quizcat-adapters";

/// Closed set of outcomes a generator call can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success(String),
    RateLimited,
    Failure(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 80,
        }
    }
}

#[async_trait]
pub trait DescriptionGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> GenerationOutcome;
}

pub fn description_prompt(quiz_title: &str) -> String {
    format!(
        "Create a fresh and original meta description for a trivia quiz titled: \"{quiz_title}\"\n\n\
         Guidelines:\n\
         - Keep it under {META_DESCRIPTION_MAX_CHARS} characters.\n\
         - Don't follow a standard format or template.\n\
         - Avoid repeating phrases like \"Test your knowledge\" or \"Challenge yourself\".\n\
         - Make it sound different from typical quiz taglines.\n\
         - Use creativity, wit, or intrigue based on the quiz topic.\n\
         - You may use humor, curiosity, mystery, or a clever hook.\n\n\
         Only return the one-sentence meta description with no labels or quotation marks."
    )
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

/// Selects the chat-completion generator when credentials are configured and
/// the offline generator otherwise.
pub fn generator_for_config(config: &GeneratorConfig) -> Result<Box<dyn DescriptionGenerator>> {
    match &config.api_key {
        Some(key) if !key.trim().is_empty() => Ok(Box::new(ChatCompletionGenerator::new(
            config.endpoint.clone(),
            key.clone(),
            config.model.clone(),
            config.timeout,
        )?)),
        _ => Ok(Box::new(OfflineGenerator)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

fn completion_text(value: JsonValue) -> Option<String> {
    let response: ChatCompletionResponse = serde_json::from_value(value).ok()?;
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
}

/// OpenAI-compatible `/chat/completions` client (Groq, OpenRouter, ...).
#[derive(Debug, Clone)]
pub struct ChatCompletionGenerator {
    http: HttpClient,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ChatCompletionGenerator {
    pub fn new(endpoint: String, api_key: String, model: String, timeout: Duration) -> Result<Self> {
        let http = HttpClient::new(HttpClientConfig {
            timeout,
            user_agent: Some(format!("quizcat/{}", env!("CARGO_PKG_VERSION"))),
            ..Default::default()
        })?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl DescriptionGenerator for ChatCompletionGenerator {
    fn name(&self) -> &'static str {
        "chat-completion"
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> GenerationOutcome {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: 1.0,
            stream: false,
        };

        match self
            .http
            .post_json(&self.endpoint, Some(&self.api_key), &request)
            .await
        {
            Ok(value) => match completion_text(value) {
                Some(text) => GenerationOutcome::Success(text),
                None => GenerationOutcome::Failure("response carried no completion choice".into()),
            },
            Err(FetchError::RateLimited { url }) => {
                debug!(%url, "generator signalled rate limit");
                GenerationOutcome::RateLimited
            }
            Err(err) => GenerationOutcome::Failure(err.to_string()),
        }
    }
}

/// Generator used when no credentials are configured; every call fails so the
/// caller falls back to its deterministic templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineGenerator;

#[async_trait]
impl DescriptionGenerator for OfflineGenerator {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn generate(&self, _prompt: &str, _options: &GenerationOptions) -> GenerationOutcome {
        GenerationOutcome::Failure("no generation credentials configured".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(api_key: Option<&str>) -> GeneratorConfig {
        GeneratorConfig {
            endpoint: "http://127.0.0.1:9/v1/chat/completions".into(),
            api_key: api_key.map(str::to_string),
            model: "test-model".into(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn prompt_names_title_and_limit() {
        let prompt = description_prompt("Breaking Bad Trivia");
        assert!(prompt.contains("\"Breaking Bad Trivia\""));
        assert!(prompt.contains("under 160 characters"));
    }

    #[test]
    fn completion_text_takes_first_choice() {
        let value = json!({
            "id": "cmpl-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "Say my name."}},
                {"index": 1, "message": {"role": "assistant", "content": "ignored"}}
            ]
        });
        assert_eq!(completion_text(value).as_deref(), Some("Say my name."));
        assert_eq!(completion_text(json!({"choices": []})), None);
        assert_eq!(completion_text(json!({"error": "nope"})), None);
    }

    #[test]
    fn missing_or_blank_key_selects_offline_generator() {
        assert_eq!(generator_for_config(&config(None)).expect("gen").name(), "offline");
        assert_eq!(generator_for_config(&config(Some("  "))).expect("gen").name(), "offline");
        assert_eq!(
            generator_for_config(&config(Some("gsk_test"))).expect("gen").name(),
            "chat-completion"
        );
    }

    #[tokio::test]
    async fn offline_generator_always_fails() {
        let outcome = OfflineGenerator
            .generate("anything", &GenerationOptions::default())
            .await;
        assert!(matches!(outcome, GenerationOutcome::Failure(_)));
    }
}
