//! OpenAI-compatible chat/completions transport.
//!
//! [`HttpChatClient`] posts a chat request with bearer auth and asks for a
//! strict JSON object. Every call runs inside a bounded backoff loop:
//!
//! - network errors, non-200 statuses and bodies without text → retry
//! - delays grow multiplicatively: `initial`, `initial × factor`, ...,
//!   capped at 30s per sleep
//! - after the last attempt the call yields `None` instead of an error
//!
//! Credentials come from `FACTS_API_KEY` / `FACTS_API_BASE` (optionally
//! loaded from a `.env` file).

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{GenerationConfig, RetryConfig};
use crate::models::{ChatMessage, GenParams};

pub const API_KEY_ENV: &str = "FACTS_API_KEY";
pub const API_BASE_ENV: &str = "FACTS_API_BASE";
pub const DEFAULT_API_BASE: &str = "https://api.cloud.ru/v1";

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Next backoff delay, capped at [`MAX_BACKOFF`].
fn next_delay(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// One model call that never fails: `None` means no usable text.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: GenParams,
    ) -> Option<String>;
}

pub struct HttpChatClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    retry: RetryConfig,
}

impl HttpChatClient {
    pub fn new(
        api_base: &str,
        api_key: impl Into<String>,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: chat_url(api_base),
            api_key: api_key.into(),
            retry,
        })
    }

    /// Build a client from config plus environment credentials.
    ///
    /// # Errors
    ///
    /// Fails when no API key is available.
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        if let Some(path) = &config.dotenv_path {
            if path.exists() {
                dotenvy::from_path(path)?;
            }
        }

        let api_key = std::env::var(API_KEY_ENV).unwrap_or_default();
        if api_key.trim().is_empty() {
            bail!("{} environment variable not set", API_KEY_ENV);
        }
        let api_base = config
            .api_base
            .clone()
            .or_else(|| std::env::var(API_BASE_ENV).ok())
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        Self::new(
            &api_base,
            api_key,
            Duration::from_secs(config.timeout_secs),
            config.retry.clone(),
        )
    }

    async fn chat_once(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: GenParams,
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "max_tokens": params.max_tokens,
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() != 200 {
            bail!("HTTP {}: {}", status, truncate(&text, 500));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("bad JSON body ({}): {}", e, truncate(&text, 500)))?;
        extract_text(&json).ok_or_else(|| {
            let keys: Vec<&str> = json
                .as_object()
                .map(|o| o.keys().map(String::as_str).collect())
                .unwrap_or_default();
            anyhow::anyhow!("no text in response, keys={:?}", keys)
        })
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: GenParams,
    ) -> Option<String> {
        let mut delay = Duration::from_millis(self.retry.initial_delay_ms);

        for attempt in 1..=self.retry.attempts {
            match self.chat_once(model, messages, params).await {
                Ok(text) => return Some(text),
                Err(e) => warn!(model, attempt, error = %e, "chat request failed"),
            }
            if attempt < self.retry.attempts {
                debug!(?delay, "backing off");
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, self.retry.factor);
            }
        }

        None
    }
}

/// `<base>/chat/completions`, adding `/v1` when the base lacks it.
pub fn chat_url(api_base: &str) -> String {
    let base = api_base.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}

/// Pull the completion text out of a response body.
///
/// Prefers `choices[0].message.content`; falls back to a non-empty top-level
/// `output`, `text` or `content` string.
pub fn extract_text(json: &Value) -> Option<String> {
    if let Some(content) = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
    {
        return Some(content.to_string());
    }
    ["output", "text", "content"]
        .iter()
        .filter_map(|k| json.get(*k).and_then(|v| v.as_str()))
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params() -> GenParams {
        GenParams {
            max_tokens: 64,
            temperature: 0.2,
            top_p: 0.95,
        }
    }

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            attempts,
            initial_delay_ms: 1,
            factor: 2.0,
        }
    }

    #[test]
    fn url_handles_v1_suffix() {
        assert_eq!(
            chat_url("https://api.example.com/v1"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            chat_url("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            chat_url("https://api.example.com"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn extract_text_variants() {
        let openai = serde_json::json!({"choices": [{"message": {"content": "{\"facts\":[]}"}}]});
        assert_eq!(extract_text(&openai).as_deref(), Some("{\"facts\":[]}"));

        let generic = serde_json::json!({"output": "  ", "text": "hello"});
        assert_eq!(extract_text(&generic).as_deref(), Some("hello"));

        assert_eq!(extract_text(&serde_json::json!({"id": 1})), None);
    }

    #[tokio::test]
    async fn posts_with_bearer_and_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"facts\": []}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            HttpChatClient::new(&server.uri(), "secret", Duration::from_secs(5), fast_retry(3))
                .unwrap();
        let text = client
            .complete("m", &[ChatMessage::user("hi")], params())
            .await;
        assert_eq!(text.as_deref(), Some("{\"facts\": []}"));
    }

    #[tokio::test]
    async fn retries_then_gives_up_on_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(3)
            .mount(&server)
            .await;

        let client =
            HttpChatClient::new(&server.uri(), "k", Duration::from_secs(5), fast_retry(3)).unwrap();
        let text = client
            .complete("m", &[ChatMessage::user("hi")], params())
            .await;
        assert_eq!(text, None);
    }

    #[test]
    fn backoff_delay_is_capped() {
        let d = Duration::from_millis(500);
        assert_eq!(next_delay(d, 1.5), Duration::from_millis(750));
        assert_eq!(next_delay(Duration::from_secs(25), 2.0), MAX_BACKOFF);
        assert_eq!(next_delay(d, 1e30), MAX_BACKOFF);
        assert_eq!(next_delay(d, f64::INFINITY), MAX_BACKOFF);
        assert_eq!(next_delay(d, f64::NAN), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn huge_backoff_factor_degrades_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let retry = RetryConfig {
            attempts: 2,
            initial_delay_ms: 1,
            factor: 1e30,
        };
        let client =
            HttpChatClient::new(&server.uri(), "k", Duration::from_secs(5), retry).unwrap();
        assert_eq!(
            client.complete("m", &[ChatMessage::user("hi")], params()).await,
            None
        );
    }

    #[tokio::test]
    async fn body_without_text_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "x"})))
            .expect(2)
            .mount(&server)
            .await;

        let client =
            HttpChatClient::new(&server.uri(), "k", Duration::from_secs(5), fast_retry(2)).unwrap();
        assert_eq!(
            client.complete("m", &[ChatMessage::user("hi")], params()).await,
            None
        );
    }
}
