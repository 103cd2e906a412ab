//! Prompt construction for extraction and repair requests.

use crate::models::{ChatMessage, SourceText};

const SYSTEM_PROMPT: &str = "You extract atomic, verifiable facts from source messages. \
Respond with a single JSON object and nothing else.";

const OUTPUT_CONTRACT: &str = r#"Return JSON of the form:
{"facts": [{"statement": "...", "sources": [{"source_id": "msg:<id>", "quote": "..."}], "category": "..."}]}
Rules:
- One self-contained statement per fact, in the language of the source.
- Every fact cites at least one source_id exactly as given below.
- "quote" must be copied verbatim from the cited message; omit it if unsure.
- "category" is optional.
- If there are no facts, return {"facts": []}."#;

/// Appended to the hints on the zero-fact escalation pass.
pub const ESCALATION_HINT: &str = "If there is at least one verifiable fact (a number, date or percentage; \
a reference to a document, version or change; a condition, permission or prohibition), extract it. \
If there are no facts, return {\"facts\": []}.";

/// Build the extraction request for a batch of sources.
pub fn build_messages(sources: &[SourceText], hints: &str) -> Vec<ChatMessage> {
    let mut user = String::new();
    user.push_str(OUTPUT_CONTRACT);
    let hints = hints.trim();
    if !hints.is_empty() {
        user.push_str("\n\nAdditional instructions:\n");
        user.push_str(hints);
    }
    user.push_str("\n\nSources:\n");
    for src in sources {
        user.push_str(&format!("\n[{}]\n{}\n", src.source_id, src.text));
    }

    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Ask the model to turn a malformed answer into valid JSON.
pub fn build_repair_messages(bad_output: &str) -> Vec<ChatMessage> {
    let user = format!(
        "The following answer was supposed to be a JSON object with a \"facts\" array but could not be parsed.\n\
         Rewrite it as valid JSON with the same content. Output only the JSON object.\n\n{}\n\n{}",
        OUTPUT_CONTRACT, bad_output
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Hints for the escalation pass.
pub fn escalation_hints(hints: &str) -> String {
    format!("{}\n{}", hints, ESCALATION_HINT).trim().to_string()
}
