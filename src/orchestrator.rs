//! Retry/repair/fallback state machine around an untrusted chat model.
//!
//! One extraction request makes at most four chat calls, in fixed order,
//! stopping at the first well-formed answer (an object with a `facts` array):
//!
//! ```text
//! primary ──malformed──▶ primary repair ──fails──▶ fallback ──malformed──▶ fallback repair
//!    │                        │                        │                        │
//!    └── ok ──┐               └── ok ──┐               └── ok                   └── ok
//!             ▼                        ▼
//!     empty facts? try the fallback model once, keep whichever is non-empty
//! ```
//!
//! Repairs resend the bad text with a corrective prompt at a temperature
//! lowered by 0.1. When everything fails the result is `{"facts": []}`.

use serde_json::Value;
use tracing::{debug, warn};

use crate::chat::ChatClient;
use crate::models::{ChatMessage, GenParams};
use crate::prompt::build_repair_messages;

/// Which call produced the accepted answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Primary,
    PrimaryRepair,
    /// Fallback model asked because the primary answer had no facts.
    FallbackOnEmpty,
    Fallback,
    FallbackRepair,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub output: Value,
    pub stage: Stage,
}

/// `{"facts": []}`
pub fn empty_facts() -> Value {
    serde_json::json!({ "facts": [] })
}

/// Parse model text into an object carrying a `facts` array.
///
/// Accepts a body wrapped in a fenced code block (with or without a `json`
/// tag). Anything else, including valid JSON of the wrong shape, is `None`.
pub fn parse_generation(raw: &str) -> Option<Value> {
    let mut s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if s.starts_with("```") {
        s = s.trim_matches('`').trim();
        if s.get(..4).is_some_and(|tag| tag.eq_ignore_ascii_case("json")) {
            s = s[4..].trim();
        }
    }
    let value: Value = serde_json::from_str(s).ok()?;
    if value.get("facts").is_some_and(Value::is_array) {
        Some(value)
    } else {
        None
    }
}

fn has_facts(value: &Value) -> bool {
    value
        .get("facts")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

/// Sampling for repair calls: temperature lowered by 0.1, floored at 0.
pub fn repair_params(params: GenParams) -> GenParams {
    GenParams {
        temperature: (params.temperature - 0.1).max(0.0),
        ..params
    }
}

fn usable(text: &Option<String>) -> Option<&str> {
    text.as_deref().filter(|t| !t.trim().is_empty())
}

/// Drives the stage sequence for one request.
pub struct Orchestrator<'a, C: ChatClient + ?Sized> {
    client: &'a C,
    primary: &'a str,
    fallback: Option<&'a str>,
}

impl<'a, C: ChatClient + ?Sized> Orchestrator<'a, C> {
    pub fn new(client: &'a C, primary: &'a str, fallback: Option<&'a str>) -> Self {
        Self {
            client,
            primary,
            fallback: fallback.filter(|m| !m.trim().is_empty()),
        }
    }

    pub async fn run(&self, messages: &[ChatMessage], params: GenParams) -> Outcome {
        // 1) primary
        let text = self.client.complete(self.primary, messages, params).await;
        if let Some(parsed) = text.as_deref().and_then(parse_generation) {
            return self.prefer_fallback_if_empty(parsed, Stage::Primary, messages, params).await;
        }

        // 2) primary repair
        if let Some(bad) = usable(&text) {
            debug!(model = self.primary, "primary answer malformed, repairing");
            let repaired = self
                .client
                .complete(self.primary, &build_repair_messages(bad), repair_params(params))
                .await;
            if let Some(parsed) = repaired.as_deref().and_then(parse_generation) {
                return self
                    .prefer_fallback_if_empty(parsed, Stage::PrimaryRepair, messages, params)
                    .await;
            }
        }

        if let Some(fallback) = self.fallback {
            // 3) fallback
            let text = self.client.complete(fallback, messages, params).await;
            if let Some(parsed) = text.as_deref().and_then(parse_generation) {
                return Outcome {
                    output: parsed,
                    stage: Stage::Fallback,
                };
            }

            // 4) fallback repair
            if let Some(bad) = usable(&text) {
                debug!(model = fallback, "fallback answer malformed, repairing");
                let repaired = self
                    .client
                    .complete(fallback, &build_repair_messages(bad), repair_params(params))
                    .await;
                if let Some(parsed) = repaired.as_deref().and_then(parse_generation) {
                    return Outcome {
                        output: parsed,
                        stage: Stage::FallbackRepair,
                    };
                }
            }
        }

        warn!(model = self.primary, "all generation stages failed, returning no facts");
        Outcome {
            output: empty_facts(),
            stage: Stage::Exhausted,
        }
    }

    async fn prefer_fallback_if_empty(
        &self,
        parsed: Value,
        stage: Stage,
        messages: &[ChatMessage],
        params: GenParams,
    ) -> Outcome {
        if !has_facts(&parsed) {
            if let Some(fallback) = self.fallback {
                let text = self.client.complete(fallback, messages, params).await;
                if let Some(alt) = text.as_deref().and_then(parse_generation) {
                    if has_facts(&alt) {
                        return Outcome {
                            output: alt,
                            stage: Stage::FallbackOnEmpty,
                        };
                    }
                }
            }
        }
        Outcome {
            output: parsed,
            stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned answers and records every call.
    struct Scripted {
        answers: Mutex<VecDeque<Option<String>>>,
        calls: Mutex<Vec<(String, f64, bool)>>,
    }

    impl Scripted {
        fn new(answers: &[Option<&str>]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().map(|a| a.map(str::to_string)).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// (model, temperature, was_repair)
        fn calls(&self) -> Vec<(String, f64, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatClient for Scripted {
        async fn complete(
            &self,
            model: &str,
            messages: &[ChatMessage],
            params: GenParams,
        ) -> Option<String> {
            let repair = messages
                .iter()
                .any(|m| m.content.contains("could not be parsed"));
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), params.temperature, repair));
            self.answers.lock().unwrap().pop_front().flatten()
        }
    }

    const FACT: &str = r#"{"facts": [{"statement": "x", "sources": [{"source_id": "msg:1"}]}]}"#;
    const EMPTY: &str = r#"{"facts": []}"#;

    fn params() -> GenParams {
        GenParams {
            max_tokens: 100,
            temperature: 0.2,
            top_p: 0.9,
        }
    }

    async fn run(client: &Scripted, fallback: Option<&str>) -> Outcome {
        Orchestrator::new(client, "primary", fallback)
            .run(&[ChatMessage::user("extract")], params())
            .await
    }

    #[test]
    fn parse_accepts_fenced_json() {
        assert!(parse_generation("```json\n{\"facts\": []}\n```").is_some());
        assert!(parse_generation("```JSON {\"facts\": []}```").is_some());
        assert!(parse_generation("```\n{\"facts\": [1]}\n```").is_some());
    }

    #[test]
    fn parse_rejects_wrong_shapes() {
        assert!(parse_generation("").is_none());
        assert!(parse_generation("not json").is_none());
        assert!(parse_generation("[1, 2]").is_none());
        assert!(parse_generation(r#"{"facts": {}}"#).is_none());
        assert!(parse_generation(r#"{"items": []}"#).is_none());
    }

    #[test]
    fn repair_temperature_is_floored() {
        let p = repair_params(GenParams {
            max_tokens: 1,
            temperature: 0.05,
            top_p: 1.0,
        });
        assert_eq!(p.temperature, 0.0);
        assert!((repair_params(params()).temperature - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn primary_success_makes_one_call() {
        let client = Scripted::new(&[Some(FACT)]);
        let out = run(&client, Some("fb")).await;
        assert_eq!(out.stage, Stage::Primary);
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn empty_primary_prefers_non_empty_fallback() {
        let client = Scripted::new(&[Some(EMPTY), Some(FACT)]);
        let out = run(&client, Some("fb")).await;
        assert_eq!(out.stage, Stage::FallbackOnEmpty);
        assert!(has_facts(&out.output));
        let calls = client.calls();
        assert_eq!(calls[1].0, "fb");
        assert!(!calls[1].2);
    }

    #[tokio::test]
    async fn empty_primary_kept_when_fallback_also_empty() {
        let client = Scripted::new(&[Some(EMPTY), Some("garbage")]);
        let out = run(&client, Some("fb")).await;
        assert_eq!(out.stage, Stage::Primary);
        assert_eq!(out.output, empty_facts());
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn empty_primary_without_fallback_is_final() {
        let client = Scripted::new(&[Some(EMPTY)]);
        let out = run(&client, None).await;
        assert_eq!(out.stage, Stage::Primary);
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn malformed_primary_is_repaired_at_lower_temperature() {
        let client = Scripted::new(&[Some("{facts: [oops"), Some(FACT)]);
        let out = run(&client, Some("fb")).await;
        assert_eq!(out.stage, Stage::PrimaryRepair);
        let calls = client.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "primary");
        assert!(calls[1].2);
        assert!((calls[1].1 - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_text_skips_repair_and_goes_to_fallback() {
        let client = Scripted::new(&[None, Some(FACT)]);
        let out = run(&client, Some("fb")).await;
        assert_eq!(out.stage, Stage::Fallback);
        let calls = client.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "fb");
        assert!(!calls[1].2);
    }

    #[tokio::test]
    async fn fallback_repair_is_last_resort() {
        let client = Scripted::new(&[Some("bad"), Some("still bad"), Some("fb bad"), Some(FACT)]);
        let out = run(&client, Some("fb")).await;
        assert_eq!(out.stage, Stage::FallbackRepair);
        let calls = client.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(
            calls.iter().map(|c| (c.0.as_str(), c.2)).collect::<Vec<_>>(),
            vec![("primary", false), ("primary", true), ("fb", false), ("fb", true)]
        );
    }

    #[tokio::test]
    async fn everything_failing_yields_empty_facts() {
        let client = Scripted::new(&[Some("bad"), Some("bad"), Some("bad"), Some("bad")]);
        let out = run(&client, Some("fb")).await;
        assert_eq!(out.stage, Stage::Exhausted);
        assert_eq!(out.output, empty_facts());
        assert_eq!(client.calls().len(), 4);
    }

    #[tokio::test]
    async fn no_fallback_stops_after_primary_repair() {
        let client = Scripted::new(&[Some("bad"), None]);
        let out = run(&client, None).await;
        assert_eq!(out.stage, Stage::Exhausted);
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn repaired_but_empty_still_tries_fallback() {
        let client = Scripted::new(&[Some("bad"), Some(EMPTY), Some(FACT)]);
        let out = run(&client, Some("fb")).await;
        assert_eq!(out.stage, Stage::FallbackOnEmpty);
        assert_eq!(client.calls().len(), 3);
    }
}
