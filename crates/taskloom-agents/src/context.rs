use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskloom_config::ContextConfig;
use tracing::{debug, info, warn};

/// Fallback window for models without a registered profile.
pub const DEFAULT_MAX_TOKENS: usize = 128_000;
pub const DEFAULT_BUFFER_TOKENS: usize = 8_000;

/// Trailing entries that truncation never touches, at minimum.
pub const MIN_PRESERVED_RECENT: usize = 3;

const PROSE_CHARS_PER_TOKEN: usize = 4;
const CODE_CHARS_PER_TOKEN: usize = 3;
const FENCE: &str = "```";

/// Rough token count: prose at four characters per token, fenced code at
/// three.
pub fn estimate_tokens(text: &str) -> usize {
    let mut prose = 0;
    let mut code = 0;
    let mut fences = 0;
    for (i, part) in text.split(FENCE).enumerate() {
        let chars = part.chars().count();
        if i % 2 == 1 {
            code += chars;
        } else {
            prose += chars;
        }
        if i > 0 {
            fences += 1;
        }
    }
    code += fences * FENCE.len();
    prose.div_ceil(PROSE_CHARS_PER_TOKEN) + code.div_ceil(CODE_CHARS_PER_TOKEN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub text: String,
    pub tokens: usize,
    pub timestamp: DateTime<Utc>,
    pub pinned: bool,
}

impl ConversationEntry {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            role,
            tokens: estimate_tokens(&text),
            text,
            timestamp: Utc::now(),
            pinned: false,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindowProfile {
    pub model_id: String,
    pub max_tokens: usize,
    pub buffer_tokens: usize,
}

impl ContextWindowProfile {
    pub fn new(model_id: impl Into<String>, max_tokens: usize, buffer_tokens: usize) -> Self {
        Self {
            model_id: model_id.into(),
            max_tokens,
            buffer_tokens,
        }
    }

    pub fn allowed_tokens(&self) -> usize {
        self.max_tokens.saturating_sub(self.buffer_tokens)
    }
}

/// Model id to context window lookup.
///
/// An exact id wins; otherwise the longest registered id that prefixes the
/// model id (so `gpt-4o` covers `gpt-4o-mini-2024-07-18`); otherwise the
/// default profile.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<ContextWindowProfile>,
    default: ContextWindowProfile,
}

impl ProfileRegistry {
    pub fn empty() -> Self {
        Self {
            profiles: Vec::new(),
            default: ContextWindowProfile::new("default", DEFAULT_MAX_TOKENS, DEFAULT_BUFFER_TOKENS),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (model, max, buffer) in [
            ("gpt-4o", 128_000, 8_000),
            ("gpt-4.1", 1_000_000, 32_000),
            ("o3", 200_000, 16_000),
            ("o4-mini", 200_000, 16_000),
            ("claude", 200_000, 16_000),
            ("deepseek-chat", 64_000, 8_000),
            ("deepseek-reasoner", 64_000, 8_000),
            ("qwen", 32_000, 4_000),
            ("llama3", 8_192, 1_024),
        ] {
            registry.upsert(ContextWindowProfile::new(model, max, buffer));
        }
        registry
    }

    /// Built-in profiles with the configured overrides layered on top.
    pub fn from_config(config: &ContextConfig) -> Self {
        let mut registry = Self::builtin();
        if let Some(default) = &config.default_profile {
            registry.set_default(ContextWindowProfile::new(
                default.model.clone(),
                default.max_tokens,
                default.buffer_tokens,
            ));
        }
        for profile in &config.profiles {
            registry.upsert(ContextWindowProfile::new(
                profile.model.clone(),
                profile.max_tokens,
                profile.buffer_tokens,
            ));
        }
        registry
    }

    pub fn upsert(&mut self, profile: ContextWindowProfile) {
        match self
            .profiles
            .iter_mut()
            .find(|p| p.model_id == profile.model_id)
        {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    pub fn set_default(&mut self, profile: ContextWindowProfile) {
        self.default = profile;
    }

    pub fn resolve(&self, model_id: &str) -> &ContextWindowProfile {
        if let Some(exact) = self.profiles.iter().find(|p| p.model_id == model_id) {
            return exact;
        }
        self.profiles
            .iter()
            .filter(|p| model_id.starts_with(p.model_id.as_str()))
            .max_by_key(|p| p.model_id.len())
            .unwrap_or(&self.default)
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationStrategy {
    Quarter,
    Half,
    Aggressive,
}

impl TruncationStrategy {
    /// Share of the total token count a truncation should try to free.
    pub fn fraction(self) -> f64 {
        match self {
            TruncationStrategy::Quarter => 0.25,
            TruncationStrategy::Half => 0.5,
            TruncationStrategy::Aggressive => 0.75,
        }
    }

    pub fn for_pressure(pressure: f64) -> Self {
        if pressure > 1.5 {
            TruncationStrategy::Aggressive
        } else if pressure > 1.2 {
            TruncationStrategy::Half
        } else {
            TruncationStrategy::Quarter
        }
    }
}

/// A contiguous span of entries, `start..end`, chosen for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationRange {
    pub start: usize,
    pub end: usize,
    pub tokens_removed: usize,
}

impl TruncationRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// The conversation of one task plus the bookkeeping that keeps it inside
/// the model's context window.
///
/// Entry 0 (the original request), pinned entries and the last
/// `preserve_recent` entries are never selected for removal.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    entries: Vec<ConversationEntry>,
    profiles: ProfileRegistry,
    preserve_recent: usize,
}

impl ContextWindow {
    pub fn new(profiles: ProfileRegistry, preserve_recent: usize) -> Self {
        Self {
            entries: Vec::new(),
            profiles,
            preserve_recent: preserve_recent.max(MIN_PRESERVED_RECENT),
        }
    }

    pub fn push(&mut self, entry: ConversationEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Returns `false` when `index` is out of range.
    pub fn pin(&mut self, index: usize) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) => {
                entry.pinned = true;
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn total_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.tokens).sum()
    }

    pub fn allowed_tokens(&self, model_id: &str) -> usize {
        self.profiles.resolve(model_id).allowed_tokens()
    }

    pub fn needs_truncation(&self, model_id: &str) -> bool {
        self.total_tokens() > self.allowed_tokens(model_id)
    }

    /// Total tokens over allowed tokens; above 1.0 means over budget.
    pub fn pressure(&self, model_id: &str) -> f64 {
        let allowed = self.allowed_tokens(model_id);
        if allowed == 0 {
            return f64::INFINITY;
        }
        self.total_tokens() as f64 / allowed as f64
    }

    /// Pick the span to drop, or `None` when the conversation fits or nothing
    /// is removable. The span starts at the first removable entry after the
    /// original request and grows until it frees the strategy's share of
    /// tokens or reaches a pinned entry or the protected tail.
    pub fn select_truncation_range(
        &self,
        model_id: &str,
        strategy: TruncationStrategy,
    ) -> Option<TruncationRange> {
        if !self.needs_truncation(model_id) {
            return None;
        }

        let boundary = self.entries.len().saturating_sub(self.preserve_recent);
        let target = (self.total_tokens() as f64 * strategy.fraction()).ceil() as usize;

        let mut start = 1;
        while start < boundary && self.entries[start].pinned {
            start += 1;
        }
        if start >= boundary {
            debug!("no removable entries: all candidates pinned or recent");
            return None;
        }

        let mut end = start;
        let mut removed = 0;
        while end < boundary && !self.entries[end].pinned && removed < target {
            removed += self.entries[end].tokens;
            end += 1;
        }

        Some(TruncationRange {
            start,
            end,
            tokens_removed: removed,
        })
    }

    /// Replace `range` with a single pinned marker entry. Ranges that would
    /// touch a protected entry are refused and `false` is returned.
    pub fn apply_truncation(&mut self, range: TruncationRange) -> bool {
        let boundary = self.entries.len().saturating_sub(self.preserve_recent);
        let protected = range.is_empty()
            || range.start == 0
            || range.end > boundary
            || self.entries[range.start..range.end].iter().any(|e| e.pinned);
        if protected {
            warn!(?range, "refusing truncation that touches protected entries");
            return false;
        }

        let removed = range.len();
        let marker = ConversationEntry::system(format!(
            "[Conversation truncated: {removed} earlier entries (~{} tokens) were removed to fit the context window.]",
            range.tokens_removed
        ))
        .pinned();
        self.entries.splice(range.start..range.end, [marker]);
        info!(
            removed,
            tokens_removed = range.tokens_removed,
            "truncated conversation"
        );
        true
    }

    /// Truncate once with a strategy picked from the current pressure.
    pub fn auto_truncate(&mut self, model_id: &str) -> Option<TruncationRange> {
        let strategy = TruncationStrategy::for_pressure(self.pressure(model_id));
        let range = self.select_truncation_range(model_id, strategy)?;
        self.apply_truncation(range).then_some(range)
    }
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(ProfileRegistry::default(), MIN_PRESERVED_RECENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_window(max: usize, buffer: usize) -> ContextWindow {
        let mut profiles = ProfileRegistry::empty();
        profiles.upsert(ContextWindowProfile::new("test-model", max, buffer));
        ContextWindow::new(profiles, 3)
    }

    #[test]
    fn estimates_prose_and_code_separately() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // 3 prose chars, then 6 code chars plus two fences
        assert_eq!(estimate_tokens("ab ```abcdef```"), 1 + 4);
    }

    #[test]
    fn unclosed_fence_counts_as_code() {
        assert_eq!(estimate_tokens("```abc"), 2);
    }

    #[test]
    fn resolves_exact_then_prefix_then_default() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(registry.resolve("gpt-4o").max_tokens, 128_000);
        assert_eq!(registry.resolve("gpt-4o-mini").model_id, "gpt-4o");
        assert_eq!(registry.resolve("claude-sonnet-4").model_id, "claude");
        assert_eq!(registry.resolve("mystery").model_id, "default");
        assert_eq!(registry.resolve("mystery").allowed_tokens(), 120_000);
    }

    #[test]
    fn config_profiles_override_builtins() {
        let config = ContextConfig {
            default_profile: None,
            profiles: vec![taskloom_config::ProfileConfig {
                model: "gpt-4o".into(),
                max_tokens: 1000,
                buffer_tokens: 100,
            }],
        };
        let registry = ProfileRegistry::from_config(&config);
        assert_eq!(registry.resolve("gpt-4o").allowed_tokens(), 900);
    }

    #[test]
    fn under_budget_selects_nothing() {
        let mut window = small_window(1000, 200);
        window.push(ConversationEntry::user("short task").pinned());
        window.push(ConversationEntry::assistant("ok"));
        assert!(!window.needs_truncation("test-model"));
        assert_eq!(
            window.select_truncation_range("test-model", TruncationStrategy::Aggressive),
            None
        );
    }

    #[test]
    fn removes_oldest_unpinned_entries_first() {
        let mut window = small_window(1000, 200);
        window.push(ConversationEntry::user("Task: refactor the parser").pinned());
        for _ in 0..10 {
            window.push(ConversationEntry::assistant("a".repeat(360)));
        }
        assert!(window.needs_truncation("test-model"));

        let range = window
            .select_truncation_range("test-model", TruncationStrategy::Quarter)
            .expect("over budget");
        assert_eq!(range.start, 1);
        assert!(range.end <= window.len() - 3);
        assert!(range.tokens_removed >= window.total_tokens() / 4);

        assert!(window.apply_truncation(range));
        assert_eq!(window.entries()[0].text, "Task: refactor the parser");
        assert!(window.entries()[1].pinned);
        assert!(window.entries()[1].text.starts_with("[Conversation truncated"));
    }

    #[test]
    fn pinned_entries_bound_the_range() {
        let mut window = small_window(100, 0);
        window.push(ConversationEntry::user("task").pinned());
        window.push(ConversationEntry::assistant("a".repeat(200)));
        window.push(ConversationEntry::assistant("keep me").pinned());
        for _ in 0..4 {
            window.push(ConversationEntry::assistant("b".repeat(200)));
        }
        let range = window
            .select_truncation_range("test-model", TruncationStrategy::Aggressive)
            .unwrap();
        assert_eq!((range.start, range.end), (1, 2));
    }

    #[test]
    fn refuses_ranges_touching_protected_entries() {
        let mut window = small_window(10, 0);
        window.push(ConversationEntry::user("task").pinned());
        for _ in 0..5 {
            window.push(ConversationEntry::assistant("x".repeat(100)));
        }
        let len = window.len();
        let into_tail = TruncationRange {
            start: 1,
            end: len,
            tokens_removed: 0,
        };
        assert!(!window.apply_truncation(into_tail));
        let first = TruncationRange {
            start: 0,
            end: 1,
            tokens_removed: 0,
        };
        assert!(!window.apply_truncation(first));
        assert_eq!(window.len(), len);
    }

    #[test]
    fn auto_truncation_converges() {
        let mut window = small_window(2_000, 500);
        window.push(ConversationEntry::user("task").pinned());
        for i in 0..40 {
            window.push(ConversationEntry::assistant(format!("{i} {}", "y".repeat(400))));
        }
        let mut passes = 0;
        while window.auto_truncate("test-model").is_some() {
            passes += 1;
            assert!(passes < 40);
        }
        assert!(!window.needs_truncation("test-model"));
        assert_eq!(
            window.select_truncation_range("test-model", TruncationStrategy::Quarter),
            None
        );
    }

    #[test]
    fn strategy_follows_pressure() {
        assert_eq!(TruncationStrategy::for_pressure(1.1), TruncationStrategy::Quarter);
        assert_eq!(TruncationStrategy::for_pressure(1.3), TruncationStrategy::Half);
        assert_eq!(TruncationStrategy::for_pressure(2.0), TruncationStrategy::Aggressive);
    }
}
