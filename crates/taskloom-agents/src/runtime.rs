use std::path::PathBuf;
use std::sync::Arc;

use taskloom_common::{Error, TaskId};
use taskloom_config::{AppConfig, ContinuationMode};
use taskloom_security::sanitize_for_user;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};

use crate::approval::{ApprovalGate, SafetyPolicy};
use crate::context::{ContextWindow, ConversationEntry, ProfileRegistry, Role};
use crate::dispatcher::{Dispatcher, InvocationResult};
use crate::events::{EngineEvent, EventSink};
use crate::parser::ContentBlock;
use crate::providers::{ChatMessage, ChatRole, LlmProvider, LlmRequest};
use crate::reasoning::{ReasoningController, StopSignal, policy_for_mode};
use crate::retry::{ActionCategory, RetryFailure, RetryPolicy, RetrySupervisor};
use crate::stream::{BlockObserver, StreamAssembler};
use crate::tools::{ToolContext, ToolRegistry};

const FOLLOW_UP_PROMPT: &str =
    "Continue with the task using the tool results above. Reply without tool calls when done.";

/// Per-runtime model and engine settings.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub working_dir: PathBuf,
    pub max_reasoning_rounds: u32,
    pub continuation: ContinuationMode,
    pub preserve_recent: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            system_prompt: None,
            max_tokens: None,
            temperature: None,
            working_dir: PathBuf::from("."),
            max_reasoning_rounds: crate::reasoning::DEFAULT_MAX_ITERATIONS,
            continuation: ContinuationMode::Never,
            preserve_recent: 3,
        }
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let working_dir = config
            .engine
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            model: config.provider.model.clone(),
            system_prompt: config.provider.system_prompt.clone(),
            max_tokens: config.provider.max_tokens,
            temperature: config.provider.temperature,
            working_dir,
            max_reasoning_rounds: config.engine.max_reasoning_rounds,
            continuation: config.engine.continuation,
            preserve_recent: config.engine.preserve_recent,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { response: String, rounds: u32 },
    /// The model call failed. A terminal error entry was appended to the
    /// conversation.
    Failed { message: String },
    Cancelled { partial_response: String },
}

impl TurnOutcome {
    /// Text to show the user for this outcome.
    pub fn display_text(&self) -> &str {
        match self {
            TurnOutcome::Completed { response, .. } => response,
            TurnOutcome::Failed { message } => message,
            TurnOutcome::Cancelled { partial_response } => partial_response,
        }
    }
}

/// Runs tasks: model round, dispatch, reasoning decision, repeated while the
/// reasoning controller asks for more.
pub struct TaskRuntime {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
    supervisor: Arc<RetrySupervisor>,
    context: ContextWindow,
    reasoning: ReasoningController,
    events: EventSink,
    settings: RuntimeSettings,
    cancel: CancellationToken,
}

pub struct TaskRuntimeBuilder {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    settings: RuntimeSettings,
    events: EventSink,
    policy: Option<Arc<dyn SafetyPolicy>>,
    auto_run: bool,
    retry: RetryPolicy,
    profiles: ProfileRegistry,
}

impl TaskRuntimeBuilder {
    pub fn settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn safety_policy(mut self, policy: Arc<dyn SafetyPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn auto_run(mut self, enabled: bool) -> Self {
        self.auto_run = enabled;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn profiles(mut self, profiles: ProfileRegistry) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn build(self) -> TaskRuntime {
        let gate = match self.policy {
            Some(policy) => ApprovalGate::with_policy(policy, self.events.clone()),
            None => ApprovalGate::new(self.events.clone()),
        };
        gate.set_auto_run(self.auto_run);
        let reasoning = ReasoningController::new(
            self.settings.max_reasoning_rounds,
            policy_for_mode(self.settings.continuation),
        );
        TaskRuntime {
            provider: self.provider,
            registry: self.registry,
            gate: Arc::new(gate),
            supervisor: Arc::new(RetrySupervisor::new(self.retry)),
            context: ContextWindow::new(self.profiles, self.settings.preserve_recent),
            reasoning,
            events: self.events,
            settings: self.settings,
            cancel: CancellationToken::new(),
        }
    }
}

impl TaskRuntime {
    pub fn builder(provider: Arc<dyn LlmProvider>, registry: Arc<ToolRegistry>) -> TaskRuntimeBuilder {
        TaskRuntimeBuilder {
            provider,
            registry,
            settings: RuntimeSettings::default(),
            events: EventSink::disabled(),
            policy: None,
            auto_run: false,
            retry: RetryPolicy::default(),
            profiles: ProfileRegistry::builtin(),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn approval_gate(&self) -> Arc<ApprovalGate> {
        self.gate.clone()
    }

    pub fn supervisor(&self) -> Arc<RetrySupervisor> {
        self.supervisor.clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.reasoning.stop_signal()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace a fired token so the next task can run.
    pub fn renew_cancellation(&mut self) -> CancellationToken {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.cancel.clone()
    }

    pub fn conversation(&self) -> &ContextWindow {
        &self.context
    }

    pub fn reset(&mut self) {
        self.context.clear();
        self.gate.cancel_all();
    }

    #[instrument(skip_all, fields(task_id = tracing::field::Empty, model = %self.settings.model))]
    pub async fn run_task(&mut self, request: &str) -> TurnOutcome {
        let task_id = TaskId::new();
        Span::current().record("task_id", task_id.as_str());
        let tool_context = ToolContext {
            task_id,
            working_dir: self.settings.working_dir.clone(),
        };
        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            self.gate.clone(),
            self.supervisor.clone(),
            self.events.clone(),
        )
        .with_cancellation(self.cancel.clone());

        self.reasoning.begin();
        self.context.push(ConversationEntry::user(request).pinned());

        let mut outputs: Vec<String> = Vec::new();
        let mut round = 0u32;
        loop {
            round += 1;
            if self.cancel.is_cancelled() {
                return self.cancelled(&outputs);
            }
            self.fit_context();

            let llm_request = self.build_request();
            let blocks = match self.call_model(&llm_request).await {
                Ok(blocks) => blocks,
                Err(failure) if matches!(failure.error, Error::Cancelled) => {
                    return self.cancelled(&outputs);
                }
                Err(failure) => return self.fail(failure),
            };
            self.context
                .push(ConversationEntry::assistant(assistant_text(&blocks)));

            let batch = dispatcher.dispatch(&blocks, &tool_context).await;
            if !batch.results.is_empty() {
                self.context
                    .push(ConversationEntry::user(tool_results_text(&batch.results)));
            }
            if !batch.response.trim().is_empty() {
                outputs.push(batch.response);
            }
            if self.cancel.is_cancelled() {
                return self.cancelled(&outputs);
            }

            let continue_reasoning = self.reasoning.decide(&batch.results);
            self.events.emit(EngineEvent::RoundCompleted {
                round,
                continue_reasoning,
            });
            if !continue_reasoning {
                break;
            }
            self.context.push(ConversationEntry::user(FOLLOW_UP_PROMPT));
        }

        let response = outputs.join("\n\n");
        info!(rounds = round, "task completed");
        self.events.emit(EngineEvent::TaskCompleted {
            response: response.clone(),
        });
        TurnOutcome::Completed {
            response,
            rounds: round,
        }
    }

    fn fit_context(&mut self) {
        let model = self.settings.model.clone();
        while self.context.needs_truncation(&model) {
            match self.context.auto_truncate(&model) {
                Some(range) => self.events.emit(range.into()),
                None => {
                    warn!(
                        tokens = self.context.total_tokens(),
                        allowed = self.context.allowed_tokens(&model),
                        "conversation over budget but nothing can be truncated"
                    );
                    break;
                }
            }
        }
    }

    fn build_request(&self) -> LlmRequest {
        let tools = self.registry.describe();
        let system = match &self.settings.system_prompt {
            Some(prompt) if !prompt.trim().is_empty() => format!("{prompt}\n\n{tools}"),
            _ => tools,
        };
        let messages = self
            .context
            .entries()
            .iter()
            .map(|entry| {
                let role = match entry.role {
                    Role::User => ChatRole::User,
                    Role::Assistant => ChatRole::Assistant,
                    Role::System => ChatRole::System,
                };
                ChatMessage::new(role, entry.text.clone())
            })
            .collect();
        LlmRequest {
            model: self.settings.model.clone(),
            messages,
            system: Some(system),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }

    async fn call_model(
        &self,
        request: &LlmRequest,
    ) -> std::result::Result<Vec<ContentBlock>, RetryFailure> {
        let observer: Arc<dyn BlockObserver> = Arc::new(self.events.clone());
        self.supervisor
            .execute("model_call", ActionCategory::ModelCall, || {
                let provider = self.provider.clone();
                let observer = observer.clone();
                let cancel = self.cancel.clone();
                async move {
                    let feed = tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        feed = provider.stream(request) => feed?,
                    };
                    let assembler = StreamAssembler::new(observer);
                    assembler.consume(feed, &cancel).await
                }
            })
            .await
    }

    fn fail(&mut self, failure: RetryFailure) -> TurnOutcome {
        let message = sanitize_for_user(&failure.error.to_string());
        warn!(attempts = failure.attempts, "task failed: {message}");
        self.context
            .push(ConversationEntry::new(Role::System, format!("Error: {message}")));
        self.events.emit(EngineEvent::TaskFailed {
            message: message.clone(),
        });
        TurnOutcome::Failed { message }
    }

    fn cancelled(&mut self, outputs: &[String]) -> TurnOutcome {
        let dropped = self.gate.cancel_all();
        debug!(dropped, "task cancelled");
        self.events.emit(EngineEvent::TaskCancelled);
        TurnOutcome::Cancelled {
            partial_response: outputs.join("\n\n"),
        }
    }
}

/// Model turn as recorded in the conversation: block texts in order.
fn assistant_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .map(|b| b.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn tool_results_text(results: &[InvocationResult]) -> String {
    let mut out = String::from("Tool results:");
    for result in results {
        let rendered = result.render();
        let body = if rendered.trim().is_empty() {
            "(no output)"
        } else {
            rendered.as_str()
        };
        out.push_str(&format!("\n\n[{}#{}]\n{}", result.name, result.index, body));
    }
    out
}
