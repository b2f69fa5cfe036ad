//! Applies streamed chunks to an ordered block list and presents snapshots
//! to an observer without ever running two presentation passes at once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use taskloom_common::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::parser::ContentBlock;
use crate::providers::StreamChunk;

/// Receives block snapshots as they are presented.
#[async_trait]
pub trait BlockObserver: Send + Sync {
    async fn on_blocks(&self, blocks: &[ContentBlock]);
}

/// Collapses concurrent presentation requests into at most one running
/// pass. A request that arrives while a pass runs sets `pending`; the
/// running pass then loops once more so the newest state is always shown.
#[derive(Debug, Default)]
pub struct PresentGate {
    presenting: AtomicBool,
    pending: AtomicBool,
}

impl PresentGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_presenting(&self) -> bool {
        self.presenting.load(Ordering::Acquire)
    }

    /// Run `pass` (repeatedly, while requests keep arriving) unless another
    /// caller is already presenting. Returns `false` when the request was
    /// handed to the in-flight pass.
    pub async fn run<F, Fut>(&self, mut pass: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        if self.presenting.swap(true, Ordering::AcqRel) {
            self.pending.store(true, Ordering::Release);
            return false;
        }

        loop {
            self.pending.store(false, Ordering::Release);
            pass().await;
            if self.pending.load(Ordering::Acquire) {
                continue;
            }
            self.presenting.store(false, Ordering::Release);
            // a request may have landed between the check and the release
            if self.pending.load(Ordering::Acquire)
                && !self.presenting.swap(true, Ordering::AcqRel)
            {
                continue;
            }
            return true;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyStatus {
    Streaming,
    Completed,
    Failed(String),
}

#[derive(Debug, Default)]
struct AssemblyState {
    blocks: Vec<ContentBlock>,
    /// Block the next chunk writes to.
    index: usize,
    completed: bool,
    error: Option<String>,
}

pub struct StreamAssembler {
    state: Mutex<AssemblyState>,
    gate: PresentGate,
    observer: Arc<dyn BlockObserver>,
    presentations: AtomicUsize,
}

impl StreamAssembler {
    pub fn new(observer: Arc<dyn BlockObserver>) -> Self {
        Self {
            state: Mutex::new(AssemblyState::default()),
            gate: PresentGate::new(),
            observer,
            presentations: AtomicUsize::new(0),
        }
    }

    /// Apply one chunk and present the result.
    pub async fn ingest(&self, chunk: StreamChunk) -> AssemblyStatus {
        let status = self.apply(chunk);
        self.present().await;
        status
    }

    fn apply(&self, chunk: StreamChunk) -> AssemblyStatus {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.completed {
            warn!("chunk after stream completion ignored");
            return AssemblyStatus::Completed;
        }
        if let Some(error) = &state.error {
            return AssemblyStatus::Failed(error.clone());
        }

        let index = state.index;
        let (block, partial) = match chunk {
            StreamChunk::Text { content, partial } => {
                (ContentBlock::text(index, content, partial), partial)
            }
            StreamChunk::ToolUse {
                content,
                invocation,
                partial,
            } => (
                ContentBlock::tool_use(index, content, invocation, partial),
                partial,
            ),
            StreamChunk::Error { message } => {
                debug!(%message, "stream failed");
                state.error = Some(message.clone());
                return AssemblyStatus::Failed(message);
            }
            StreamChunk::Complete => {
                if let Some(last) = state.blocks.last_mut()
                    && last.partial
                {
                    last.finalize();
                }
                state.index = state.blocks.len();
                state.completed = true;
                return AssemblyStatus::Completed;
            }
        };

        if index < state.blocks.len() {
            state.blocks[index] = block;
        } else {
            state.blocks.push(block);
        }
        if !partial {
            state.index += 1;
        }
        AssemblyStatus::Streaming
    }

    pub async fn present(&self) {
        let observer = &self.observer;
        let presentations = &self.presentations;
        self.gate
            .run(|| async move {
                let snapshot = self.blocks();
                observer.on_blocks(&snapshot).await;
                presentations.fetch_add(1, Ordering::Relaxed);
            })
            .await;
    }

    pub fn blocks(&self) -> Vec<ContentBlock> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blocks
            .clone()
    }

    pub fn is_completed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completed
    }

    /// Number of presentation passes that have run.
    pub fn presentation_count(&self) -> usize {
        self.presentations.load(Ordering::Relaxed)
    }

    /// Drain `feed` until it completes, fails or `cancel` fires. A feed that
    /// ends without [`StreamChunk::Complete`] is completed implicitly.
    pub async fn consume<S>(&self, mut feed: S, cancel: &CancellationToken) -> Result<Vec<ContentBlock>>
    where
        S: Stream<Item = StreamChunk> + Unpin,
    {
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = feed.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.ingest(chunk).await {
                AssemblyStatus::Streaming => {}
                AssemblyStatus::Completed => return Ok(self.blocks()),
                AssemblyStatus::Failed(message) => return Err(Error::Provider(message)),
            }
        }

        if !self.is_completed() {
            debug!("feed ended without completion chunk");
            self.ingest(StreamChunk::Complete).await;
        }
        Ok(self.blocks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ToolInvocation, parse_message};
    use crate::providers::chunk_feed_from_deltas;
    use futures::stream;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        snapshots: Mutex<Vec<Vec<ContentBlock>>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl BlockObserver for Recorder {
        async fn on_blocks(&self, blocks: &[ContentBlock]) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.snapshots.lock().unwrap().push(blocks.to_vec());
        }
    }

    fn text(content: &str, partial: bool) -> StreamChunk {
        StreamChunk::Text {
            content: content.into(),
            partial,
        }
    }

    #[tokio::test]
    async fn partial_chunks_overwrite_the_current_block() {
        let assembler = StreamAssembler::new(Arc::new(Recorder::default()));
        assembler.ingest(text("He", true)).await;
        assembler.ingest(text("Hello", true)).await;
        assembler.ingest(text("Hello world", false)).await;
        assembler.ingest(text("next", true)).await;

        let blocks = assembler.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], ContentBlock::text(0, "Hello world", false));
        assert!(blocks[1].partial);
    }

    #[tokio::test]
    async fn completion_finalizes_the_trailing_block() {
        let assembler = StreamAssembler::new(Arc::new(Recorder::default()));
        assembler
            .ingest(StreamChunk::ToolUse {
                content: "<tool name=\"read_file\">".into(),
                invocation: ToolInvocation::new("read_file"),
                partial: true,
            })
            .await;
        let status = assembler.ingest(StreamChunk::Complete).await;
        assert_eq!(status, AssemblyStatus::Completed);
        let blocks = assembler.blocks();
        assert!(!blocks[0].partial);
        assert!(blocks[0].invocation.as_ref().unwrap().partial);
        assert!(blocks.iter().all(|b| !b.partial));
    }

    #[tokio::test]
    async fn cut_off_invocation_keeps_its_partial_flag() {
        let response = "Saving. <tool name=\"write_to_file\"><path>main.rs</path>\
                        <content>fn main() { let x =";
        let deltas: Vec<taskloom_common::Result<String>> =
            response.chars().map(|c| Ok(c.to_string())).collect();
        let feed = chunk_feed_from_deltas(stream::iter(deltas).boxed());

        let assembler = StreamAssembler::new(Arc::new(Recorder::default()));
        let blocks = assembler
            .consume(feed, &CancellationToken::new())
            .await
            .unwrap();

        let batch = parse_message(response);
        assert_eq!(blocks.len(), batch.len());
        assert!(blocks.iter().all(|b| !b.partial));
        let assembled = blocks[1].invocation.as_ref().unwrap();
        assert!(assembled.partial);
        assert_eq!(Some(assembled), batch[1].invocation.as_ref());
    }

    #[tokio::test]
    async fn error_chunk_fails_consumption() {
        let assembler = StreamAssembler::new(Arc::new(Recorder::default()));
        let feed = stream::iter(vec![
            text("a", true),
            StreamChunk::Error {
                message: "ECONNRESET".into(),
            },
        ]);
        let err = assembler
            .consume(feed, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(m) if m == "ECONNRESET"));
    }

    #[tokio::test]
    async fn cancellation_stops_consumption() {
        let assembler = StreamAssembler::new(Arc::new(Recorder::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let feed = stream::iter(vec![text("a", false)]);
        let err = assembler.consume(feed, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(assembler.blocks().is_empty());
    }

    #[tokio::test]
    async fn streamed_deltas_assemble_to_batch_parse() {
        let response = "Sure, let me check. <tool name=\"list_files\"><path>.</path></tool> \
                        Then <tool name=\"read_file\"><path>a.txt</path></tool> Done.";
        let deltas: Vec<taskloom_common::Result<String>> =
            response.chars().map(|c| Ok(c.to_string())).collect();
        let feed = chunk_feed_from_deltas(stream::iter(deltas).boxed());

        let recorder = Arc::new(Recorder::default());
        let assembler = StreamAssembler::new(recorder.clone());
        let blocks = assembler
            .consume(feed, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(blocks, parse_message(response));
        for snapshot in recorder.snapshots.lock().unwrap().iter() {
            let partials = snapshot.iter().filter(|b| b.partial).count();
            assert!(partials <= 1);
        }
    }

    #[tokio::test]
    async fn concurrent_presents_never_overlap() {
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(5)),
            ..Default::default()
        });
        let assembler = Arc::new(StreamAssembler::new(recorder.clone()));
        assembler.apply(text("x", true));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let assembler = assembler.clone();
            handles.push(tokio::spawn(async move { assembler.present().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // coalesced requests cost at most one extra pass each round
        let passes = assembler.presentation_count();
        assert!(passes >= 1 && passes <= 8);
        assert!(!assembler.gate.is_presenting());
    }

    #[tokio::test]
    async fn gate_reports_coalesced_requests() {
        let gate = Arc::new(PresentGate::new());
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());

        let runner = {
            let gate = gate.clone();
            let entered = entered.clone();
            let release = release.clone();
            tokio::spawn(async move {
                let mut passes = 0;
                let ran = gate
                    .run(|| {
                        passes += 1;
                        let first = passes == 1;
                        let entered = entered.clone();
                        let release = release.clone();
                        async move {
                            if first {
                                entered.notify_one();
                                release.notified().await;
                            }
                        }
                    })
                    .await;
                (ran, passes)
            })
        };

        entered.notified().await;
        assert!(!gate.run(|| async {}).await);
        release.notify_one();
        let (ran, passes) = runner.await.unwrap();
        assert!(ran);
        assert_eq!(passes, 2);
    }
}
