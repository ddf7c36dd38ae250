//! LLM client with multi-provider failover.
//!
//! Providers are tried strictly in configured order. A streaming attempt
//! commits to a provider only after its first non-empty delta; anything
//! less is treated as a failure and the next provider is tried. Retries
//! inside a provider are disabled — failover is the sole recovery.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{LlmConfig, LlmProvider};
use crate::prompts::SYSTEM_PROMPT;

/// Fixed apology emitted through the generative stream when every provider
/// has failed.
pub const APOLOGY_TEXT: &str = "Xin lỗi, tất cả LLM đều không phản hồi.";

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Chat client over an ordered provider list.
#[derive(Clone)]
pub struct LlmService {
    client: reqwest::Client,
    providers: Arc<Vec<LlmProvider>>,
    max_tokens: u32,
    temperature: f32,
}

impl LlmService {
    pub fn new(cfg: &LlmConfig) -> Self {
        let names: Vec<String> = cfg
            .providers
            .iter()
            .map(|p| format!("{}({})", p.name, p.model))
            .collect();
        info!("LLM providers: {}", names.join(" -> "));

        Self {
            client: reqwest::Client::new(),
            providers: Arc::new(cfg.providers.clone()),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        }
    }

    /// Stream a reply as a lazy sequence of text deltas.
    ///
    /// The receiver yields deltas from the first provider that produces a
    /// non-empty one; if every provider fails it yields exactly one apology
    /// string and closes.
    pub fn chat_stream(&self, user_text: &str, history: &[ChatTurn]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let messages = build_messages(user_text, history);

        tokio::spawn(async move {
            let total = this.providers.len();
            for (i, provider) in this.providers.iter().enumerate() {
                info!(
                    "LLM trying [{}] {} @ {}",
                    provider.name, provider.model, provider.base_url
                );
                match this.stream_from_provider(provider, &messages, &tx).await {
                    Ok(true) => return,
                    Ok(false) => {
                        warn!(
                            "LLM [{}] produced no output ({} fallback(s) left)",
                            provider.name,
                            total - i - 1
                        );
                    }
                    Err(e) => {
                        warn!(
                            "LLM [{}] failed: {} ({} fallback(s) left)",
                            provider.name,
                            e,
                            total - i - 1
                        );
                    }
                }
            }

            error!("LLM all {} providers failed", total);
            let _ = tx.send(APOLOGY_TEXT.to_string()).await;
        });

        rx
    }

    /// Attempt one provider. Returns `Ok(true)` once committed (first
    /// non-empty delta forwarded), `Ok(false)` when the stream ended without
    /// ever producing content.
    async fn stream_from_provider(
        &self,
        provider: &LlmProvider,
        messages: &[Value],
        tx: &mpsc::Sender<String>,
    ) -> Result<bool> {
        let request = json!({
            "model": provider.model,
            "messages": messages,
            "stream": true,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", provider.base_url))
            .bearer_auth(&provider.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send streaming request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("streaming API error ({}): {}", status, body);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut committed = false;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    if committed {
                        // Already yielding from this provider; end the
                        // stream rather than failing over mid-reply.
                        warn!("LLM [{}] stream broke mid-reply: {}", provider.name, e);
                        return Ok(true);
                    }
                    return Err(e).context("Failed to read stream chunk");
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Parse complete SSE events.
            while let Some(pos) = buffer.find("\n\n") {
                let event: String = buffer.drain(..pos + 2).collect();
                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        continue;
                    }
                    let Some(delta) = delta_from_event(data) else {
                        continue;
                    };
                    if delta.is_empty() {
                        continue;
                    }
                    if !committed {
                        committed = true;
                        info!("LLM [{}] responding", provider.name);
                    }
                    if tx.send(delta).await.is_err() {
                        // Receiver dropped — the pipeline was cancelled.
                        return Ok(true);
                    }
                }
            }
        }

        Ok(committed)
    }

    /// Non-streaming JSON call: request a strict JSON object, retry once per
    /// provider without the strict hint, parse with fallbacks. Returns the
    /// parsed object or `None` when every provider failed.
    pub async fn chat_json(
        &self,
        user_text: &str,
        system_prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Option<Value> {
        let messages = vec![
            json!({"role": "system", "content": system_prompt}),
            json!({"role": "user", "content": user_text}),
        ];

        let total = self.providers.len();
        for (i, provider) in self.providers.iter().enumerate() {
            match self
                .json_from_provider(provider, &messages, max_tokens, temperature)
                .await
            {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(
                        "LLM JSON [{}] failed: {} ({} fallback(s) left)",
                        provider.name,
                        e,
                        total - i - 1
                    );
                }
            }
        }

        error!("LLM JSON all {} providers failed", total);
        None
    }

    async fn json_from_provider(
        &self,
        provider: &LlmProvider,
        messages: &[Value],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Value> {
        // Some providers reject response_format; retry the same provider
        // once without it before failing over.
        let content = match self
            .complete_once(provider, messages, max_tokens, temperature, true)
            .await
        {
            Ok(content) => content,
            Err(_) => {
                self.complete_once(provider, messages, max_tokens, temperature, false)
                    .await?
            }
        };

        if content.trim().is_empty() {
            bail!("empty JSON response");
        }
        parse_json_content(&content)
    }

    async fn complete_once(
        &self,
        provider: &LlmProvider,
        messages: &[Value],
        max_tokens: u32,
        temperature: f32,
        strict_json: bool,
    ) -> Result<String> {
        let mut request = json!({
            "model": provider.model,
            "messages": messages,
            "stream": false,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        if strict_json {
            request["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", provider.base_url))
            .bearer_auth(&provider.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("API error ({}): {}", status, body);
        }

        let raw: Value = response
            .json()
            .await
            .context("Failed to parse completion body")?;
        Ok(extract_content(&raw))
    }
}

/// System prompt + history + user message, in the wire shape.
fn build_messages(user_text: &str, history: &[ChatTurn]) -> Vec<Value> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(json!({"role": "system", "content": SYSTEM_PROMPT}));
    for turn in history {
        messages.push(json!({"role": turn.role, "content": turn.content}));
    }
    messages.push(json!({"role": "user", "content": user_text}));
    messages
}

/// Pull a content delta out of one SSE data payload.
fn delta_from_event(data: &str) -> Option<String> {
    let parsed: StreamResponse = serde_json::from_str(data).ok()?;
    parsed.choices.into_iter().next()?.delta.content
}

/// Extract assistant text from a completion body, handling both plain
/// string content and array-of-content-parts formats.
fn extract_content(raw: &Value) -> String {
    let content = raw
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"));

    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                    part.get("text").and_then(|t| t.as_str()).map(String::from)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^```(?:json)?\s*|\s*```$").expect("fence regex"));

/// Parse a JSON object from model output, tolerating markdown fences and
/// stray prose around the object.
pub fn parse_json_content(content: &str) -> Result<Value> {
    let raw = content.trim();

    // Already a bare JSON object.
    if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
        if parsed.is_object() {
            return Ok(parsed);
        }
    }

    // Strip markdown fences.
    let fenced = FENCE_RE.replace_all(raw, "");
    if let Ok(parsed) = serde_json::from_str::<Value>(fenced.trim()) {
        if parsed.is_object() {
            return Ok(parsed);
        }
    }

    // Last resort: substring between the first '{' and the last '}'.
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            let parsed: Value = serde_json::from_str(&raw[start..=end])
                .context("Failed to parse embedded JSON object")?;
            if parsed.is_object() {
                return Ok(parsed);
            }
        }
    }

    bail!("Cannot parse JSON object from LLM output")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_messages_order() {
        let history = vec![ChatTurn::user("hi"), ChatTurn::assistant("chào bạn")];
        let messages = build_messages("hôm nay thứ mấy?", &history);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "hi");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["role"], "user");
        assert_eq!(messages[3]["content"], "hôm nay thứ mấy?");
    }

    #[test]
    fn test_delta_from_event() {
        let data = r#"{"choices":[{"delta":{"content":"Hôm "}}]}"#;
        assert_eq!(delta_from_event(data), Some("Hôm ".to_string()));

        let empty = r#"{"choices":[{"delta":{}}]}"#;
        assert_eq!(delta_from_event(empty), None);

        assert_eq!(delta_from_event("not json"), None);
    }

    #[test]
    fn test_extract_content_string_and_parts() {
        let plain = json!({"choices":[{"message":{"content":"xin chào"}}]});
        assert_eq!(extract_content(&plain), "xin chào");

        let parts = json!({"choices":[{"message":{"content":[
            {"type":"text","text":"xin "},
            {"type":"image_url","image_url":{"url":"x"}},
            {"type":"text","text":"chào"}
        ]}}]});
        assert_eq!(extract_content(&parts), "xin chào");

        assert_eq!(extract_content(&json!({})), "");
    }

    #[test]
    fn test_parse_json_direct() {
        let v = parse_json_content(r#"{"intent":"music","song_name":"abc"}"#).unwrap();
        assert_eq!(v["intent"], "music");
    }

    #[test]
    fn test_parse_json_fenced() {
        let v = parse_json_content("```json\n{\"intent\":\"other\",\"song_name\":\"\"}\n```")
            .unwrap();
        assert_eq!(v["intent"], "other");
    }

    #[test]
    fn test_parse_json_embedded() {
        let v = parse_json_content(
            "Sure, here is the classification: {\"intent\":\"music\",\"song_name\":\"em của ngày hôm qua\"} hope that helps",
        )
        .unwrap();
        assert_eq!(v["song_name"], "em của ngày hôm qua");
    }

    #[test]
    fn test_parse_json_rejects_non_object() {
        assert!(parse_json_content("[1, 2, 3]").is_err());
        assert!(parse_json_content("just words").is_err());
    }
}
