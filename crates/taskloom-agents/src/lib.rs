pub mod approval;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod parser;
pub mod providers;
pub mod reasoning;
pub mod retry;
pub mod runtime;
pub mod stream;
pub mod tools;

pub use approval::{ApprovalGate, ConfirmationTicket, PendingConfirmation, SafetyPolicy};
pub use context::{
    ContextWindow, ContextWindowProfile, ConversationEntry, ProfileRegistry, Role,
    TruncationRange, TruncationStrategy, estimate_tokens,
};
pub use dispatcher::{DispatchBatch, Dispatcher, InvocationResult};
pub use events::{EngineEvent, EventSink};
pub use parser::{BlockKind, ContentBlock, MessageParser, ToolInvocation, parse_message};
pub use providers::{
    ChatMessage, ChatRole, ChunkFeed, LlmProvider, LlmRequest, OpenAiProvider, StreamChunk,
    chunk_feed_from_deltas,
};
pub use reasoning::{ContinuationPolicy, ReasoningController, ReasoningState, StopSignal};
pub use retry::{ActionCategory, Outcome, RetryFailure, RetryPolicy, RetrySupervisor};
pub use runtime::{RuntimeSettings, TaskRuntime, TaskRuntimeBuilder, TurnOutcome};
pub use stream::{BlockObserver, StreamAssembler};
pub use tools::{
    BuiltinToolOptions, CAPABILITY_SET_VERSION, Capability, Tool, ToolContext, ToolOutput,
    ToolRegistry, builtin_registry,
};
