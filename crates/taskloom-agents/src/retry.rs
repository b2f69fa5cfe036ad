use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskloom_common::{Error, Result};
use taskloom_config::{DEFAULT_RETRYABLE_SIGNATURES, RetryConfig};
use tracing::{info, warn};

/// Failures remembered for windowed error-rate queries.
const FAILURE_HISTORY_LIMIT: usize = 256;

/// Result of a supervised action.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    /// A transient failure that survived every retry.
    Retryable(Error),
    Fatal(Error),
    UserDeclined,
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Outcome::Retryable(e) | Outcome::Fatal(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    ModelCall,
    ToolExecution,
    FileOperation,
    CommandExecution,
    Generic,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Lowercase message fragments that mark an error as transient.
    pub retryable_signatures: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable_signatures: DEFAULT_RETRYABLE_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            retryable_signatures: config
                .retryable_signatures
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: `base * multiplier^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn is_retryable(&self, error: &Error) -> bool {
        if error.is_fatal() || matches!(error, Error::Cancelled) {
            return false;
        }
        // A retryable status or a known transient signature is enough on its
        // own; a non-retryable status does not mask a signature.
        let message = error.to_string().to_ascii_lowercase();
        let retryable_status = extract_status_code(&message)
            .is_some_and(|status| matches!(status, 408 | 429 | 500 | 502 | 503 | 504));
        retryable_status || self.matching_signature(&message).is_some()
    }

    fn matching_signature(&self, message: &str) -> Option<&str> {
        self.retryable_signatures
            .iter()
            .map(String::as_str)
            .find(|signature| message.contains(signature))
    }

    /// Stable label grouping similar failures in the history.
    pub fn signature(&self, error: &Error) -> String {
        let message = error.to_string().to_ascii_lowercase();
        if let Some(status) = extract_status_code(&message) {
            return format!("{}:status={status}", error.kind());
        }
        match self.matching_signature(&message) {
            Some(signature) => format!("{}:{signature}", error.kind()),
            None => error.kind().to_string(),
        }
    }
}

/// Find an HTTP status code written as `status=503`, `status: 503` or
/// `status code 503`.
pub fn extract_status_code(message: &str) -> Option<u16> {
    for marker in ["status=", "status:", "status code"] {
        let mut search_start = 0usize;
        while let Some(offset) = message[search_start..].find(marker) {
            let after_marker = search_start + offset + marker.len();
            let digits: String = message[after_marker..]
                .trim_start()
                .chars()
                .take_while(|ch| ch.is_ascii_digit())
                .collect();

            if digits.len() == 3
                && let Ok(status) = digits.parse::<u16>()
            {
                return Some(status);
            }
            search_start = after_marker;
        }
    }
    None
}

/// Cleanup run once an action has failed for good. The default for every
/// category does nothing.
#[async_trait]
pub trait RecoveryHooks: Send + Sync {
    async fn cleanup_model_call(&self, _action: &str, _error: &Error) -> Result<()> {
        Ok(())
    }

    async fn cleanup_tool_execution(&self, _action: &str, _error: &Error) -> Result<()> {
        Ok(())
    }

    async fn cleanup_file_operation(&self, _action: &str, _error: &Error) -> Result<()> {
        Ok(())
    }

    async fn cleanup_command_execution(&self, _action: &str, _error: &Error) -> Result<()> {
        Ok(())
    }

    async fn cleanup_generic(&self, _action: &str, _error: &Error) -> Result<()> {
        Ok(())
    }
}

pub struct NoopRecoveryHooks;

impl RecoveryHooks for NoopRecoveryHooks {}

#[derive(Debug)]
pub struct RetryFailure {
    pub action: String,
    pub category: ActionCategory,
    pub error: Error,
    /// Calls made, including the first.
    pub attempts: u32,
    /// Sleeps taken between attempts, in order.
    pub delays: Vec<Duration>,
    pub should_retry: bool,
    pub cleanup_performed: bool,
}

impl RetryFailure {
    pub fn into_outcome<T>(self) -> Outcome<T> {
        if self.error.is_fatal() {
            Outcome::Fatal(self.error)
        } else {
            Outcome::Retryable(self.error)
        }
    }
}

impl std::fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s): {}",
            self.action, self.attempts, self.error
        )
    }
}

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub action: String,
    pub signature: String,
    pub at: Instant,
}

/// Runs fallible actions with capped exponential backoff and keeps a
/// bounded history of failures.
pub struct RetrySupervisor {
    policy: RetryPolicy,
    hooks: Arc<dyn RecoveryHooks>,
    history: Mutex<VecDeque<FailureRecord>>,
}

impl RetrySupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_hooks(policy, Arc::new(NoopRecoveryHooks))
    }

    pub fn with_hooks(policy: RetryPolicy, hooks: Arc<dyn RecoveryHooks>) -> Self {
        Self {
            policy,
            hooks,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_retries` retries have been spent. On final failure the
    /// category's cleanup hook runs before the failure is returned.
    pub async fn execute<T, F, Fut>(
        &self,
        action: &str,
        category: ActionCategory,
        mut operation: F,
    ) -> std::result::Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        let mut delays = Vec::new();

        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(action, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let retryable = self.policy.is_retryable(&error);
            self.record_failure(action, &error);

            if !retryable || attempt >= self.policy.max_retries {
                if retryable {
                    warn!(action, attempts = attempt + 1, "retries exhausted: {error}");
                } else {
                    warn!(action, "non-retryable failure: {error}");
                }
                let cleanup_performed = self.run_cleanup(action, category, &error).await;
                return Err(RetryFailure {
                    action: action.to_string(),
                    category,
                    error,
                    attempts: attempt + 1,
                    delays,
                    should_retry: false,
                    cleanup_performed,
                });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                action,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "retryable failure: {error}"
            );
            delays.push(delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn run_cleanup(&self, action: &str, category: ActionCategory, error: &Error) -> bool {
        if matches!(error, Error::Cancelled) {
            return false;
        }
        let result = match category {
            ActionCategory::ModelCall => self.hooks.cleanup_model_call(action, error).await,
            ActionCategory::ToolExecution => self.hooks.cleanup_tool_execution(action, error).await,
            ActionCategory::FileOperation => self.hooks.cleanup_file_operation(action, error).await,
            ActionCategory::CommandExecution => {
                self.hooks.cleanup_command_execution(action, error).await
            }
            ActionCategory::Generic => self.hooks.cleanup_generic(action, error).await,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(action, "cleanup failed: {e}");
                false
            }
        }
    }

    fn record_failure(&self, action: &str, error: &Error) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() >= FAILURE_HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(FailureRecord {
            action: action.to_string(),
            signature: self.policy.signature(error),
            at: Instant::now(),
        });
    }

    /// Failures of `action` recorded within `window`.
    pub fn recent_retry_count(&self, action: &str, window: Duration) -> usize {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .filter(|r| r.action == action && r.at.elapsed() <= window)
            .count()
    }

    /// True when at least `threshold` failures of any action fell within
    /// `window`.
    pub fn too_many_errors(&self, window: Duration, threshold: usize) -> bool {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.iter().filter(|r| r.at.elapsed() <= window).count() >= threshold
    }

    pub fn history(&self) -> Vec<FailureRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for RetrySupervisor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
