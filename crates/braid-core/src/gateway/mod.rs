//! The `Gateway` trait -- the adapter interface for the LLM runtime.
//!
//! The engine talks to agents only through this surface: start or continue
//! a conversation, fetch past turns, abort, delete. Every call can fail
//! for network reasons; callers in the engine treat gateway errors as
//! best-effort (warn and continue) except where a failure has a dedicated
//! state transition (`plan_fetch_failed`, `headlessStarted: false`).

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One past turn returned by `chat.history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: TurnContent,
}

impl ChatTurn {
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: TurnContent::Text(text.into()),
        }
    }
}

/// Message content: either a plain string or a list of typed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One block of structured message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl TurnContent {
    /// Flatten to plain text: strings pass through, block lists join their
    /// `text` blocks with newlines.
    pub fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Adapter interface for the external LLM runtime.
///
/// Object-safe so the engine can hold `Arc<dyn Gateway>`.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Start or continue an agent conversation.
    async fn chat_send(&self, session_key: &str, message: &str) -> Result<()>;

    /// Fetch the most recent turns of a conversation, oldest first.
    async fn chat_history(&self, session_key: &str, limit: usize) -> Result<Vec<ChatTurn>>;

    /// Abort a running agent turn. Best-effort.
    async fn chat_abort(&self, session_key: &str) -> Result<()>;

    /// Delete a session entirely. Best-effort.
    async fn session_delete(&self, session_key: &str) -> Result<()>;
}

/// A gateway that is never reachable.
///
/// Used by the CLI when no runtime is wired up: every engine path treats
/// gateway failures as best-effort, so store bookkeeping and git flows
/// still work and spawned sessions report `headlessStarted: false`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGateway;

#[async_trait]
impl Gateway for NullGateway {
    async fn chat_send(&self, _session_key: &str, _message: &str) -> Result<()> {
        anyhow::bail!("no gateway configured")
    }

    async fn chat_history(&self, _session_key: &str, _limit: usize) -> Result<Vec<ChatTurn>> {
        anyhow::bail!("no gateway configured")
    }

    async fn chat_abort(&self, _session_key: &str) -> Result<()> {
        anyhow::bail!("no gateway configured")
    }

    async fn session_delete(&self, _session_key: &str) -> Result<()> {
        anyhow::bail!("no gateway configured")
    }
}

// Compile-time assertion: Gateway must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Gateway) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_deserializes_from_plain_string() {
        let turn: ChatTurn =
            serde_json::from_str(r#"{"role": "assistant", "content": "hello"}"#).unwrap();
        assert_eq!(turn.content.text(), "hello");
    }

    #[test]
    fn content_deserializes_from_block_list() {
        let turn: ChatTurn = serde_json::from_str(
            r#"{"role": "assistant", "content": [
                {"type": "text", "text": "first"},
                {"type": "tool_use"},
                {"type": "text", "text": "second"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(turn.content.text(), "first\nsecond");
    }

    #[tokio::test]
    async fn null_gateway_always_errors() {
        let gw = NullGateway;
        assert!(gw.chat_send("agent:main:webchat", "hi").await.is_err());
        assert!(gw.chat_history("agent:main:webchat", 10).await.is_err());
    }
}
