use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use taskloom_common::Result;

use crate::parser::{BlockKind, ContentBlock, MessageParser, ToolInvocation};

pub mod openai;
pub use openai::OpenAiProvider;

/// Chunks a provider emits while a response streams in.
pub type ChunkFeed = BoxStream<'static, StreamChunk>;

/// Raw text deltas from a provider's wire protocol.
pub type DeltaStream = BoxStream<'static, Result<String>>;

/// Trait for model provider integrations.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "openai").
    fn provider_id(&self) -> &str;

    /// Start a streamed completion. Errors returned here happen before the
    /// first chunk; failures after that arrive as [`StreamChunk::Error`].
    async fn stream(&self, request: &LlmRequest) -> Result<ChunkFeed>;

    /// Check if the provider is available and configured.
    async fn health_check(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One step of an assembling response. `Text` and `ToolUse` carry the
/// current state of the block at the assembler's index; `partial == false`
/// closes that block and moves the index on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Text {
        content: String,
        partial: bool,
    },
    ToolUse {
        content: String,
        invocation: ToolInvocation,
        partial: bool,
    },
    Error {
        message: String,
    },
    Complete,
}

impl StreamChunk {
    pub fn from_block(block: &ContentBlock) -> Self {
        match (block.kind, &block.invocation) {
            (BlockKind::ToolUse, Some(invocation)) => StreamChunk::ToolUse {
                content: block.text.clone(),
                invocation: invocation.clone(),
                partial: block.partial,
            },
            _ => StreamChunk::Text {
                content: block.text.clone(),
                partial: block.partial,
            },
        }
    }
}

/// Turn raw text deltas into a chunk feed by re-parsing the accumulated text
/// after every delta. A delta error ends the feed with
/// [`StreamChunk::Error`]; a clean end yields the final blocks followed by
/// [`StreamChunk::Complete`].
pub fn chunk_feed_from_deltas(deltas: DeltaStream) -> ChunkFeed {
    let state = FeedState {
        deltas,
        parser: MessageParser::new(),
        closed: 0,
        queue: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.queue.pop_front() {
                return Some((chunk, state));
            }
            if state.finished {
                return None;
            }
            match state.deltas.next().await {
                Some(Ok(delta)) => {
                    if delta.is_empty() {
                        continue;
                    }
                    let blocks = state.parser.push(&delta);
                    state.enqueue(&blocks);
                }
                Some(Err(error)) => {
                    state.queue.push_back(StreamChunk::Error {
                        message: error.to_string(),
                    });
                    state.finished = true;
                }
                None => {
                    let blocks = state.parser.finish();
                    state.enqueue(&blocks);
                    state.queue.push_back(StreamChunk::Complete);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

struct FeedState {
    deltas: DeltaStream,
    parser: MessageParser,
    /// Blocks already sent with `partial == false`.
    closed: usize,
    queue: VecDeque<StreamChunk>,
    finished: bool,
}

impl FeedState {
    fn enqueue(&mut self, blocks: &[ContentBlock]) {
        for block in blocks.iter().skip(self.closed) {
            self.queue.push_back(StreamChunk::from_block(block));
            if !block.partial {
                self.closed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_common::Error;

    fn deltas(parts: Vec<Result<String>>) -> DeltaStream {
        stream::iter(parts).boxed()
    }

    #[tokio::test]
    async fn feed_closes_blocks_in_order() {
        let feed = chunk_feed_from_deltas(deltas(vec![
            Ok("Hi <tool name=\"read_file\"><path>a".into()),
            Ok("</path></tool> bye".into()),
        ]));
        let chunks: Vec<StreamChunk> = feed.collect().await;

        let closed: Vec<_> = chunks
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    StreamChunk::Text { partial: false, .. }
                        | StreamChunk::ToolUse { partial: false, .. }
                )
            })
            .collect();
        assert_eq!(closed.len(), 3);
        assert_eq!(chunks.last(), Some(&StreamChunk::Complete));
    }

    #[tokio::test]
    async fn delta_error_ends_the_feed() {
        let feed = chunk_feed_from_deltas(deltas(vec![
            Ok("partial answer".into()),
            Err(Error::Provider("connection reset".into())),
            Ok("never seen".into()),
        ]));
        let chunks: Vec<StreamChunk> = feed.collect().await;
        assert!(matches!(
            chunks.last(),
            Some(StreamChunk::Error { message }) if message.contains("connection reset")
        ));
        assert!(!chunks.contains(&StreamChunk::Complete));
    }
}
