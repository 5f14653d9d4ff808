//! OpenAI-compatible Chat Completions adapter.
//!
//! Also serves third-party OpenAI-compatible endpoints (Together, Groq,
//! vLLM proxies, ...) — anything the roster marks `kind = "openai"`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::provider::{
    MAX_COMPLETION_TOKENS, MAX_RESPONSE_BYTES, ProviderAdapter, ProviderReply, classify_status,
    classify_transport, require_content,
};

/// Adapter for `/v1/chat/completions`.
pub struct OpenAiAdapter {
    client: Client,
    name: String,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(client: Client, name: String, base_url: String) -> Self {
        Self {
            client,
            name,
            base_url,
        }
    }

    fn api_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        key: &SecretString,
        key_index: usize,
    ) -> Result<ProviderReply, ProviderError> {
        let request = ChatCompletionRequest {
            model,
            messages: vec![ChatCompletionMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: MAX_COMPLETION_TOKENS,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(self.api_url())
            .header("Authorization", format!("Bearer {}", key.expose_secret()))
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, &e, started.elapsed()))?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(&self.name, &e, started.elapsed()))?;
        let latency = started.elapsed();

        if body.len() > MAX_RESPONSE_BYTES {
            return Err(ProviderError::Malformed {
                provider: self.name.clone(),
                reason: format!("response body of {} bytes exceeds cap", body.len()),
            });
        }
        if !(200..300).contains(&status) {
            return Err(classify_status(&self.name, status, &body, retry_after, key_index));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::Malformed {
                provider: self.name.clone(),
                reason: format!("JSON parse error: {e}"),
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed {
                provider: self.name.clone(),
                reason: "no choices in response".to_string(),
            })?;

        let content = require_content(&self.name, choice.message.content.unwrap_or_default())?;
        let (tokens_in, tokens_out) = parse_usage(parsed.usage.as_ref());

        Ok(ProviderReply {
            content,
            tokens_in,
            tokens_out,
            latency,
        })
    }
}

pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn parse_usage(usage: Option<&ChatCompletionUsage>) -> (Option<i64>, Option<i64>) {
    let Some(usage) = usage else {
        return (None, None);
    };
    let tokens_in = usage.prompt_tokens.map(|t| t as i64);
    let tokens_out = usage.completion_tokens.map(|t| t as i64).or_else(|| {
        // Some compatible endpoints only report a total.
        match (usage.total_tokens, usage.prompt_tokens) {
            (Some(total), Some(prompt)) => Some(total.saturating_sub(prompt) as i64),
            _ => None,
        }
    });
    (tokens_in, tokens_out)
}

// Chat Completions wire types.

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatCompletionMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatCompletionMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatCompletionUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(base_url: &str) -> OpenAiAdapter {
        OpenAiAdapter::new(Client::new(), "openai".to_string(), base_url.to_string())
    }

    #[test]
    fn test_api_url_without_v1_suffix() {
        assert_eq!(
            adapter("https://api.openai.com").api_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_api_url_with_v1_suffix() {
        assert_eq!(
            adapter("http://127.0.0.1:8318/v1/").api_url(),
            "http://127.0.0.1:8318/v1/chat/completions"
        );
    }

    #[test]
    fn test_parse_usage_prefers_completion_tokens() {
        let usage = ChatCompletionUsage {
            prompt_tokens: Some(10),
            completion_tokens: Some(7),
            total_tokens: Some(17),
        };
        assert_eq!(parse_usage(Some(&usage)), (Some(10), Some(7)));
    }

    #[test]
    fn test_parse_usage_derives_output_from_total() {
        let usage = ChatCompletionUsage {
            prompt_tokens: Some(10),
            completion_tokens: None,
            total_tokens: Some(17),
        };
        assert_eq!(parse_usage(Some(&usage)), (Some(10), Some(7)));
    }

    #[test]
    fn test_parse_usage_clamps_inverted_totals() {
        let usage = ChatCompletionUsage {
            prompt_tokens: Some(500),
            completion_tokens: None,
            total_tokens: Some(120),
        };
        assert_eq!(parse_usage(Some(&usage)), (Some(500), Some(0)));
    }

    #[test]
    fn test_parse_usage_missing() {
        assert_eq!(parse_usage(None), (None, None));
        assert_eq!(
            parse_usage(Some(&ChatCompletionUsage::default())),
            (None, None)
        );
    }

    #[test]
    fn test_response_parse_empty_content_shape() {
        // Deprecated model ids have been observed returning 200 with an
        // empty message; the parse succeeds and require_content rejects it.
        let body = r#"{"choices":[{"message":{"content":""}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(body).expect("parse");
        let content = parsed.choices[0].message.content.clone().unwrap_or_default();
        assert!(require_content("openai", content).is_err());
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "30".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));

        let empty = reqwest::header::HeaderMap::new();
        assert_eq!(parse_retry_after(&empty), None);
    }
}
