use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use taskloom_config::{ApprovalConfig, ApprovalMode};
use tracing::debug;

/// Capabilities that only observe state.
pub const READ_ONLY_TOOLS: &[&str] = &["read_file", "list_files", "search_files", "read_memory"];

/// Capabilities that change files, run processes or reach the network.
pub const MUTATING_TOOLS: &[&str] = &[
    "write_to_file",
    "replace_in_file",
    "execute_command",
    "web_fetch",
    "write_memory",
    "append_memory",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowlistMode {
    ReadOnly,
    All,
    None,
}

impl From<ApprovalMode> for AllowlistMode {
    fn from(mode: ApprovalMode) -> Self {
        match mode {
            ApprovalMode::ReadOnly => AllowlistMode::ReadOnly,
            ApprovalMode::All => AllowlistMode::All,
            ApprovalMode::None => AllowlistMode::None,
        }
    }
}

/// Per-tool approval rules.
///
/// Precedence: explicit `ask` entries, then explicit `allow` entries, then the
/// mode. In `ReadOnly` mode a tool that is in neither built-in list is
/// unclassified and `requires_approval` returns `None`.
#[derive(Debug, Clone)]
pub struct ToolAllowlist {
    mode: AllowlistMode,
    allow: HashSet<String>,
    ask: HashSet<String>,
}

impl ToolAllowlist {
    pub fn new(mode: AllowlistMode) -> Self {
        Self {
            mode,
            allow: HashSet::new(),
            ask: HashSet::new(),
        }
    }

    pub fn from_config(config: &ApprovalConfig) -> Self {
        let mut list = Self::new(config.mode.into());
        for tool in &config.allow {
            list.allow(tool);
        }
        for tool in &config.ask {
            list.always_ask(tool);
        }
        list
    }

    pub fn mode(&self) -> AllowlistMode {
        self.mode
    }

    pub fn allow(&mut self, tool: &str) {
        self.allow.insert(normalize(tool));
    }

    pub fn always_ask(&mut self, tool: &str) {
        self.ask.insert(normalize(tool));
    }

    /// `Some(true)` when the tool must be confirmed, `Some(false)` when it may
    /// run unattended, `None` when these rules do not classify it.
    pub fn requires_approval(&self, tool: &str) -> Option<bool> {
        let tool = normalize(tool);
        let verdict = if self.ask.contains(&tool) {
            Some(true)
        } else if self.allow.contains(&tool) {
            Some(false)
        } else {
            match self.mode {
                AllowlistMode::All => Some(false),
                AllowlistMode::None => Some(true),
                AllowlistMode::ReadOnly => {
                    if READ_ONLY_TOOLS.contains(&tool.as_str()) {
                        Some(false)
                    } else if MUTATING_TOOLS.contains(&tool.as_str()) {
                        Some(true)
                    } else {
                        None
                    }
                }
            }
        };
        debug!(tool = %tool, ?verdict, "allowlist verdict");
        verdict
    }
}

impl Default for ToolAllowlist {
    fn default() -> Self {
        Self::new(AllowlistMode::ReadOnly)
    }
}

fn normalize(tool: &str) -> String {
    tool.trim().to_ascii_lowercase().replace('-', "_")
}
