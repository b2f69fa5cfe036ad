use std::sync::Arc;

use futures::future::join_all;
use taskloom_common::Error;
use taskloom_security::sanitize_for_user;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::approval::ApprovalGate;
use crate::events::{EngineEvent, EventSink};
use crate::parser::{BlockKind, ContentBlock, ToolInvocation};
use crate::retry::{Outcome, RetrySupervisor};
use crate::tools::{ToolContext, ToolRegistry};

/// Result of one invocation from a batch, at the invocation's position.
#[derive(Debug)]
pub struct InvocationResult {
    pub index: usize,
    pub name: String,
    pub outcome: Outcome<String>,
}

impl InvocationResult {
    pub fn is_error(&self) -> bool {
        !matches!(self.outcome, Outcome::Ok(_))
    }

    /// Whether the invocation succeeded with non-blank output.
    pub fn has_output(&self) -> bool {
        matches!(&self.outcome, Outcome::Ok(content) if !content.trim().is_empty())
    }

    /// Text shown to the user and fed back to the model. Empty for silent
    /// successes.
    pub fn render(&self) -> String {
        match &self.outcome {
            Outcome::Ok(content) => content.clone(),
            Outcome::Retryable(e) | Outcome::Fatal(e) => {
                format!("[{}] Error: {}", self.name, sanitize_for_user(&error_detail(e)))
            }
            Outcome::UserDeclined => format!("[{}] The user declined this operation.", self.name),
        }
    }
}

fn error_detail(error: &Error) -> String {
    match error {
        Error::Tool(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Everything a dispatched round produced.
#[derive(Debug)]
pub struct DispatchBatch {
    pub results: Vec<InvocationResult>,
    /// Text blocks and rendered results interleaved in block order.
    pub response: String,
}

enum Piece {
    Text(String),
    Invocation(usize),
}

/// Executes the invocations of one round.
///
/// Confirmations are requested one at a time, in block order, before
/// anything runs. Approved invocations then run concurrently and each
/// failure stays in its own slot of the result list.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
    supervisor: Arc<RetrySupervisor>,
    events: EventSink,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<ApprovalGate>,
        supervisor: Arc<RetrySupervisor>,
        events: EventSink,
    ) -> Self {
        Self {
            registry,
            gate,
            supervisor,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Pending and future confirmations of this dispatcher resolve as
    /// declined once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[instrument(skip_all, fields(blocks = blocks.len()))]
    pub async fn dispatch(&self, blocks: &[ContentBlock], context: &ToolContext) -> DispatchBatch {
        let mut pieces = Vec::new();
        let mut invocations: Vec<&ToolInvocation> = Vec::new();
        for block in blocks {
            match (block.kind, &block.invocation) {
                (BlockKind::ToolUse, Some(invocation)) => {
                    pieces.push(Piece::Invocation(invocations.len()));
                    invocations.push(invocation);
                }
                _ => {
                    if !block.text.trim().is_empty() {
                        pieces.push(Piece::Text(block.text.clone()));
                    }
                }
            }
        }

        let mut approvals = Vec::with_capacity(invocations.len());
        for invocation in &invocations {
            approvals.push(self.confirm(invocation, context).await);
        }

        let runs = invocations
            .iter()
            .zip(approvals)
            .enumerate()
            .map(|(index, (invocation, approved))| async move {
                if !approved {
                    return InvocationResult {
                        index,
                        name: invocation.name.clone(),
                        outcome: Outcome::UserDeclined,
                    };
                }
                self.run(index, invocation, context).await
            });
        let results = join_all(runs).await;

        let failures = results.iter().filter(|r| r.is_error()).count();
        if !results.is_empty() {
            info!(invocations = results.len(), failures, "batch finished");
        }

        let response = integrate(&pieces, &results);
        DispatchBatch { results, response }
    }

    /// `true` when the invocation may run. Invocations that cannot run at
    /// all are passed through so they fail in [`Dispatcher::run`].
    async fn confirm(&self, invocation: &ToolInvocation, context: &ToolContext) -> bool {
        if invocation.partial || self.registry.resolve(&invocation.name).is_err() {
            return true;
        }
        if !self.gate.requires_approval(&invocation.name) {
            return true;
        }
        if self.cancel.is_cancelled() {
            return false;
        }
        let command = describe_invocation(invocation);
        let ticket =
            self.gate
                .request_confirmation(&command, &context.working_dir, &invocation.name);
        let id = ticket.id().to_string();
        let approved = tokio::select! {
            approved = ticket.wait() => approved,
            _ = self.cancel.cancelled() => {
                self.gate.reject(&id);
                false
            }
        };
        debug!(tool = %invocation.name, approved, "confirmation resolved");
        approved
    }

    async fn run(
        &self,
        index: usize,
        invocation: &ToolInvocation,
        context: &ToolContext,
    ) -> InvocationResult {
        let name = invocation.name.clone();
        if invocation.partial {
            return InvocationResult {
                index,
                name: name.clone(),
                outcome: Outcome::Fatal(Error::Tool(format!(
                    "{name}: invocation was cut off before it was complete"
                ))),
            };
        }
        let (capability, tool) = match self.registry.resolve(&name) {
            Ok(resolved) => resolved,
            Err(e) => {
                return InvocationResult {
                    index,
                    name,
                    outcome: Outcome::Fatal(e),
                };
            }
        };

        self.events.emit(EngineEvent::ToolStarted {
            index,
            name: name.clone(),
        });
        let outcome = match self
            .supervisor
            .execute(capability.name(), capability.category(), || {
                tool.execute(context, &invocation.params)
            })
            .await
        {
            Ok(output) if output.is_error => Outcome::Fatal(Error::Tool(output.content)),
            Ok(output) => Outcome::Ok(output.content),
            Err(failure) => failure.into_outcome(),
        };
        self.events.emit(EngineEvent::ToolFinished {
            index,
            name: name.clone(),
            success: outcome.is_ok(),
        });

        InvocationResult {
            index,
            name,
            outcome,
        }
    }
}

/// One-line summary of an invocation for a confirmation prompt.
pub fn describe_invocation(invocation: &ToolInvocation) -> String {
    if let Some(command) = invocation.param("command") {
        return command.to_string();
    }
    let params: Vec<String> = invocation
        .params
        .iter()
        .map(|(k, v)| {
            let value: String = v.chars().take(80).collect();
            format!("{k}={value}")
        })
        .collect();
    format!("{} {}", invocation.name, params.join(" "))
        .trim_end()
        .to_string()
}

/// Interleave text and rendered results in block order. Empty pieces are
/// dropped; a result is separated from what precedes it by a blank line, a
/// text piece by a single newline.
fn integrate(pieces: &[Piece], results: &[InvocationResult]) -> String {
    let mut out = String::new();
    for piece in pieces {
        let (text, separator) = match piece {
            Piece::Text(text) => (text.clone(), "\n"),
            Piece::Invocation(i) => match results.get(*i) {
                Some(result) => (result.render(), "\n\n"),
                None => continue,
            },
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str(separator);
        }
        out.push_str(text);
    }
    out
}
