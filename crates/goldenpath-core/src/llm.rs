use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::clients::DiagnosticModel;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const MAX_TOKENS: u32 = 1024;

/// Upstream failure classification for the diagnostic model.
#[derive(Debug, Clone)]
pub enum LlmError {
    /// HTTP 429 — the breaker treats this as an upstream error.
    RateLimited,
    /// Any other >= 400 response, with a human-readable title.
    Upstream { status: u16, title: String },
    /// Transport / serialization failure.
    Transport(String),
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::RateLimited => write!(f, "Rate limited"),
            LlmError::Upstream { status, title } => write!(f, "HTTP {status}: {title}"),
            LlmError::Transport(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for LlmError {}

impl LlmError {
    /// Short title shown in "Diagnostics unavailable — <title>" messages.
    pub fn title(&self) -> String {
        match self {
            LlmError::RateLimited => "Rate limited".into(),
            LlmError::Upstream { title, .. } => title.clone(),
            LlmError::Transport(_) => "Upstream unreachable".into(),
        }
    }
}

/// Non-streaming messages-API client used for failure diagnosis.
pub struct AnthropicModel {
    client: Client,
    api_key: String,
    model: String,
}

impl AnthropicModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl DiagnosticModel for AnthropicModel {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .client
            .post(API_URL)
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(LlmError::RateLimited);
        }
        if status >= 400 {
            let text = resp.text().await.unwrap_or_default();
            let title = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| {
                    v["error"]["message"]
                        .as_str()
                        .map(|s| s.chars().take(80).collect())
                })
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(LlmError::Upstream { status, title });
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let text_parts: Vec<&str> = data["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        if text_parts.is_empty() {
            return Ok("No diagnostic response".into());
        }
        Ok(text_parts.join("\n"))
    }
}

/// Strip a surrounding markdown code fence, if present.
pub fn strip_fences(text: &str) -> &str {
    let t = text.trim();
    if !t.starts_with("```") {
        return t;
    }
    let nl = match t.find('\n') {
        Some(i) => i,
        None => return t,
    };
    let inner = &t[nl + 1..];
    if inner.ends_with("```") {
        inner[..inner.len() - 3].trim_end()
    } else {
        inner
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_fences_plain() {
        assert_eq!(strip_fences(r#"[{"action":"hard_sync"}]"#), r#"[{"action":"hard_sync"}]"#);
    }

    #[test]
    fn strip_fences_with_backticks() {
        let text = "```json\n[{\"action\":\"hard_sync\"}]\n```";
        assert_eq!(strip_fences(text), r#"[{"action":"hard_sync"}]"#);
    }

    #[test]
    fn strip_fences_without_language_tag() {
        let text = "```\n[]\n```";
        assert_eq!(strip_fences(text), "[]");
    }

    #[test]
    fn llm_error_titles() {
        assert_eq!(LlmError::RateLimited.title(), "Rate limited");
        let up = LlmError::Upstream {
            status: 500,
            title: "Overloaded".into(),
        };
        assert_eq!(up.title(), "Overloaded");
    }
}
