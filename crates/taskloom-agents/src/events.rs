use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::context::TruncationRange;
use crate::parser::ContentBlock;
use crate::stream::BlockObserver;

/// Everything the engine reports to its front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    BlocksUpdated {
        blocks: Vec<ContentBlock>,
    },
    ConfirmationRequested {
        id: String,
        command: String,
        directory: PathBuf,
        description: String,
        /// Set when auto-run resolved the request without waiting.
        auto_approved: bool,
    },
    ConfirmationResolved {
        id: String,
        approved: bool,
    },
    ToolStarted {
        index: usize,
        name: String,
    },
    ToolFinished {
        index: usize,
        name: String,
        success: bool,
    },
    ContextTruncated {
        start: usize,
        end: usize,
        tokens_removed: usize,
    },
    RoundCompleted {
        round: u32,
        continue_reasoning: bool,
    },
    TaskCompleted {
        response: String,
    },
    TaskFailed {
        message: String,
    },
    TaskCancelled,
}

impl From<TruncationRange> for EngineEvent {
    fn from(range: TruncationRange) -> Self {
        EngineEvent::ContextTruncated {
            start: range.start,
            end: range.end,
            tokens_removed: range.tokens_removed,
        }
    }
}

/// Cloneable sending half for [`EngineEvent`]s. Sending never blocks and a
/// dropped receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).is_err()
        {
            trace!("event receiver dropped");
        }
    }
}

#[async_trait]
impl BlockObserver for EventSink {
    async fn on_blocks(&self, blocks: &[ContentBlock]) {
        self.emit(EngineEvent::BlocksUpdated {
            blocks: blocks.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent::ToolStarted {
            index: 0,
            name: "read_file".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_started");
        assert_eq!(json["name"], "read_file");
    }

    #[tokio::test]
    async fn sink_delivers_and_tolerates_dropped_receiver() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(EngineEvent::TaskCancelled);
        assert_eq!(rx.recv().await, Some(EngineEvent::TaskCancelled));
        drop(rx);
        sink.emit(EngineEvent::TaskCancelled);
        EventSink::disabled().emit(EngineEvent::TaskCancelled);
    }
}
