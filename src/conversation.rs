//! Conversation history sent to the model with every chunk
//!
//! History is stored as request/response pairs so pruning can never leave a
//! dangling user or assistant turn. Each stored user turn names its chunk as
//! `chunk_<NNNN>`; pruning keeps the pairs whose chunk ids are still wanted.

use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;
use crate::common::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self { kind: "ephemeral".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: ImageSource,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into(), cache_control: None }
    }

    /// Text block marked as a prompt-cache breakpoint
    pub fn cached_text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into(), cache_control: Some(CacheControl::ephemeral()) }
    }

    pub fn jpeg(bytes: &[u8]) -> Self {
        ContentBlock::Image {
            source: ImageSource {
                kind: "base64".to_string(),
                media_type: "image/jpeg".to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            },
        }
    }

    /// Read a JPEG file into an image block
    pub fn jpeg_file(path: &Path) -> Result<Self> {
        Ok(Self::jpeg(&std::fs::read(path)?))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text, .. } => Some(text),
            ContentBlock::Image { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: vec![ContentBlock::text(text)] }
    }

    /// All text blocks joined by newlines
    pub fn text(&self) -> String {
        self.content.iter().filter_map(ContentBlock::as_text).collect::<Vec<_>>().join("\n")
    }
}

fn chunk_ref_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"chunk_(\d{4,})").ok()).as_ref()
}

/// Chunk ids referenced as `chunk_<NNNN>` in a message's text
pub fn referenced_chunk_ids(message: &Message) -> BTreeSet<u32> {
    let text = message.text();
    let Some(re) = chunk_ref_pattern() else {
        return BTreeSet::new();
    };
    re.captures_iter(&text)
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

/// One user turn and the model's reply to it
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub user: Message,
    pub assistant: Message,
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    exchanges: Vec<Exchange>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, user: Message, assistant: Message) {
        self.exchanges.push(Exchange { user, assistant });
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Flattened history followed by `next`, ready to send
    pub fn messages_with(&self, next: Message) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.exchanges.len() * 2 + 1);
        for exchange in &self.exchanges {
            messages.push(exchange.user.clone());
            messages.push(exchange.assistant.clone());
        }
        messages.push(next);
        messages
    }

    /// Keep only exchanges whose user turn references one of `keep`
    ///
    /// # Returns
    /// Number of exchanges removed
    pub fn retain_chunks(&mut self, keep: &BTreeSet<u32>) -> usize {
        let before = self.exchanges.len();
        self.exchanges
            .retain(|exchange| referenced_chunk_ids(&exchange.user).iter().any(|id| keep.contains(id)));
        let removed = before - self.exchanges.len();
        if removed > 0 {
            debug!("Removed {} exchanges (kept {}), chunks kept: {:?}", removed, self.exchanges.len(), keep);
        }
        removed
    }
}
