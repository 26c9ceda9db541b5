//! External multimodal model backend
//!
//! The analyzer talks to the model through [`ModelClient`], so any backend
//! that accepts a messages-style request (system prompt, alternating user and
//! assistant turns made of text and image blocks) can answer chunks.
//! [`HttpModelClient`] posts that request as JSON over blocking `reqwest`.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument};
use crate::common::{FusionError, Result};
use crate::config::{ModelConfig, API_KEY_ENV};
use crate::conversation::{CacheControl, Message};

/// Token counts reported for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub usage: TokenUsage,
}

/// Anything that can answer a [`ModelRequest`]
pub trait ModelClient: Send {
    /// Send one request and wait for the reply
    ///
    /// # Errors
    /// * `ModelRequest` - Transport or API failure; `retryable` marks throttling and server errors
    /// * `ResponseParse` - The reply has no text content
    fn send(&self, request: &ModelRequest) -> Result<ModelReply>;
}

#[derive(Serialize)]
struct SystemBlock<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
    cache_control: CacheControl,
}

#[derive(Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<SystemBlock<'a>>,
    messages: &'a [Message],
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ResponseBody {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: TokenUsage,
}

/// Messages-API client over HTTPS
pub struct HttpModelClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_version: String,
    api_key: String,
}

impl HttpModelClient {
    /// Build a client, reading the API key from `MEDIAFUSION_API_KEY`
    ///
    /// # Errors
    /// * `InvalidConfig` - The key is not set or the HTTP client cannot be built
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| FusionError::config_error(format!("{} is not set", API_KEY_ENV)))?;
        Self::new(config, api_key)
    }

    pub fn new(config: &ModelConfig, api_key: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(config.request_timeout_secs))
            .build()
            .map_err(|e| FusionError::config_error(format!("cannot build HTTP client: {}", e)))?;

        debug!("Model client for {} at {}", config.model, config.endpoint);
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_version: config.api_version.clone(),
            api_key,
        })
    }

    fn body<'a>(&'a self, request: &'a ModelRequest) -> RequestBody<'a> {
        RequestBody {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request
                .system
                .as_deref()
                .map(|text| vec![SystemBlock { kind: "text", text, cache_control: CacheControl::ephemeral() }])
                .unwrap_or_default(),
            messages: &request.messages,
        }
    }
}

impl std::fmt::Debug for HttpModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpModelClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish()
    }
}

impl ModelClient for HttpModelClient {
    #[instrument(skip(self, request), fields(messages = request.messages.len()))]
    fn send(&self, request: &ModelRequest) -> Result<ModelReply> {
        let started = Instant::now();

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("content-type", "application/json")
            .json(&self.body(request))
            .send()
            .map_err(|e| {
                error!("Failed to send request to model API: {}", e);
                FusionError::ModelRequest { message: e.to_string(), retryable: true }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_else(|_| "Unknown error".to_string());
            let retryable = status.as_u16() == 429 || status.is_server_error();
            error!("Model API error ({}): {}", status, body);
            return Err(FusionError::ModelRequest {
                message: format!("HTTP {}: {}", status, body),
                retryable,
            });
        }

        let raw = response.text()?;
        debug!("Model answered in {:.2}s", started.elapsed().as_secs_f64());
        parse_reply(&raw)
    }
}

/// Extract the reply text and usage from a messages-API response body
pub fn parse_reply(raw: &str) -> Result<ModelReply> {
    let body: ResponseBody = serde_json::from_str(raw).map_err(|e| FusionError::parse_error(e.to_string(), raw))?;

    let text: String = body
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("");

    if text.is_empty() {
        return Err(FusionError::parse_error("response has no text content", raw));
    }

    Ok(ModelReply { text, usage: body.usage })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays canned replies and records every request
    #[derive(Clone, Default)]
    pub struct ScriptedClient {
        replies: Arc<Mutex<VecDeque<Result<ModelReply>>>>,
        pub requests: Arc<Mutex<Vec<ModelRequest>>>,
    }

    impl ScriptedClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, text: &str, usage: TokenUsage) -> Self {
            self.replies.lock().unwrap().push_back(Ok(ModelReply { text: text.to_string(), usage }));
            self
        }

        pub fn fail(self, error: FusionError) -> Self {
            self.replies.lock().unwrap().push_back(Err(error));
            self
        }

        pub fn recorded(&self) -> Vec<ModelRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ModelClient for ScriptedClient {
        fn send(&self, request: &ModelRequest) -> Result<ModelReply> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FusionError::internal_error("no scripted reply left")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ContentBlock;

    #[test]
    fn test_parse_reply() {
        let raw = r#"{
            "content": [{"type": "text", "text": "```json\n{\"actions\": []}\n```"}],
            "usage": {"input_tokens": 1200, "output_tokens": 80, "cache_read_input_tokens": 3000}
        }"#;
        let reply = parse_reply(raw).unwrap();
        assert!(reply.text.contains("actions"));
        assert_eq!(reply.usage.input_tokens, 1200);
        assert_eq!(reply.usage.cache_read_input_tokens, 3000);
        assert_eq!(reply.usage.cache_creation_input_tokens, 0);
        assert_eq!(reply.usage.total(), 4280);
    }

    #[test]
    fn test_parse_reply_without_text() {
        assert!(matches!(parse_reply(r#"{"content": []}"#), Err(FusionError::ResponseParse { .. })));
        assert!(matches!(parse_reply("<html>"), Err(FusionError::ResponseParse { .. })));
    }

    #[test]
    fn test_request_body_shape() {
        let client = HttpModelClient::new(&ModelConfig::default(), "key".to_string()).unwrap();
        let request = ModelRequest {
            system: Some("Segment the stream.".to_string()),
            messages: vec![Message::user(vec![ContentBlock::text("chunk_0000")])],
            max_tokens: 4096,
            temperature: 0.1,
        };

        let json = serde_json::to_value(client.body(&request)).unwrap();
        assert_eq!(json["max_tokens"], 4096);
        assert_eq!(json["temperature"], 0.1);
        assert_eq!(json["system"][0]["text"], "Segment the stream.");
        assert_eq!(json["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(json["messages"][0]["role"], "user");

        let bare = ModelRequest { system: None, ..request };
        assert!(serde_json::to_value(client.body(&bare)).unwrap().get("system").is_none());
    }

    #[test]
    fn test_debug_hides_key() {
        let client = HttpModelClient::new(&ModelConfig::default(), "secret-key".to_string()).unwrap();
        assert!(!format!("{:?}", client).contains("secret-key"));
    }
}
