//! Anthropic Messages API adapter.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::provider::{
    MAX_COMPLETION_TOKENS, MAX_RESPONSE_BYTES, ProviderAdapter, ProviderReply, classify_status,
    classify_transport, require_content,
};
use crate::provider::openai::parse_retry_after;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for `/v1/messages`.
pub struct AnthropicAdapter {
    client: Client,
    name: String,
    base_url: String,
}

impl AnthropicAdapter {
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
            format!("{base}/messages")
        } else {
            format!("{base}/v1/messages")
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
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
        let request = MessagesRequest {
            model,
            max_tokens: MAX_COMPLETION_TOKENS,
            messages: vec![MessageParam {
                role: "user",
                content: prompt,
            }],
        };

        let started = Instant::now();
        let response = self
            .client
            .post(self.api_url())
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
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

        let parsed: MessagesResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::Malformed {
                provider: self.name.clone(),
                reason: format!("JSON parse error: {e}"),
            })?;

        let content = require_content(&self.name, flatten_content(&parsed.content))?;

        Ok(ProviderReply {
            content,
            tokens_in: parsed.usage.as_ref().and_then(|u| u.input_tokens).map(|t| t as i64),
            tokens_out: parsed
                .usage
                .as_ref()
                .and_then(|u| u.output_tokens)
                .map(|t| t as i64),
            latency,
        })
    }
}

/// Join the text blocks of a Messages response. Non-text blocks (thinking,
/// tool use) are skipped; a response with no text blocks flattens to the
/// empty string and fails the content contract upstream.
fn flatten_content(blocks: &[ContentBlock]) -> String {
    let mut out = String::new();
    for block in blocks {
        if block.block_type == "text"
            && let Some(text) = &block.text
        {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(text);
        }
    }
    out
}

// Messages API wire types.

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<MessageParam<'a>>,
}

#[derive(Debug, Serialize)]
struct MessageParam<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}
