use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use taskloom_config::ContinuationMode;
use tracing::{debug, info};

use crate::dispatcher::InvocationResult;

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningState {
    Idle,
    Active,
    Stopped,
}

/// Decides whether a round's results warrant another round.
pub trait ContinuationPolicy: Send + Sync {
    fn should_continue(&self, results: &[InvocationResult]) -> bool;
}

/// Every task is a single round.
pub struct NeverContinue;

impl ContinuationPolicy for NeverContinue {
    fn should_continue(&self, _results: &[InvocationResult]) -> bool {
        false
    }
}

/// Continue while some invocation succeeded with non-blank output. Errors
/// and declined invocations do not count.
pub struct ContinueOnToolActivity;

impl ContinuationPolicy for ContinueOnToolActivity {
    fn should_continue(&self, results: &[InvocationResult]) -> bool {
        results.iter().any(InvocationResult::has_output)
    }
}

pub fn policy_for_mode(mode: ContinuationMode) -> Arc<dyn ContinuationPolicy> {
    match mode {
        ContinuationMode::Never => Arc::new(NeverContinue),
        ContinuationMode::ToolActivity => Arc::new(ContinueOnToolActivity),
    }
}

/// Shared flag that ends the current reasoning chain at the next decision.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bounds follow-up rounds. The iteration counter never exceeds the cap
/// and is reset whenever a chain ends.
pub struct ReasoningController {
    state: ReasoningState,
    iterations: u32,
    max_iterations: u32,
    policy: Arc<dyn ContinuationPolicy>,
    stop: StopSignal,
}

impl ReasoningController {
    pub fn new(max_iterations: u32, policy: Arc<dyn ContinuationPolicy>) -> Self {
        Self {
            state: ReasoningState::Idle,
            iterations: 0,
            max_iterations,
            policy,
            stop: StopSignal::default(),
        }
    }

    pub fn state(&self) -> ReasoningState {
        self.state
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn set_policy(&mut self, policy: Arc<dyn ContinuationPolicy>) {
        self.policy = policy;
    }

    /// Start of a new task: clears a stop request left from the last one.
    pub fn begin(&mut self) {
        self.stop.reset();
        self.iterations = 0;
        self.state = ReasoningState::Active;
    }

    /// Called after each round. Returns `true` when a follow-up round
    /// should run.
    pub fn decide(&mut self, results: &[InvocationResult]) -> bool {
        self.state = ReasoningState::Active;

        if self.stop.is_set() {
            info!(iterations = self.iterations, "reasoning stopped on request");
            self.iterations = 0;
            self.state = ReasoningState::Stopped;
            return false;
        }
        if self.iterations >= self.max_iterations {
            info!(max = self.max_iterations, "reasoning cap reached");
            self.iterations = 0;
            self.state = ReasoningState::Idle;
            return false;
        }
        if self.policy.should_continue(results) {
            self.iterations += 1;
            debug!(iteration = self.iterations, "continuing reasoning");
            return true;
        }
        self.iterations = 0;
        self.state = ReasoningState::Idle;
        false
    }
}

impl Default for ReasoningController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS, Arc::new(NeverContinue))
    }
}
