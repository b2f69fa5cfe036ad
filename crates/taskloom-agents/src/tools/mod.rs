use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskloom_common::{Error, Result, TaskId};
use tracing::{info, warn};

use crate::parser::ToolParams;
use crate::retry::ActionCategory;

pub mod fs;
pub mod memory;
pub mod shell;
pub mod web;

pub use fs::{ListFiles, ReadFile, ReplaceInFile, SearchFiles, WriteToFile};
pub use memory::{AppendMemory, ReadMemory, WriteMemory};
pub use shell::ExecuteCommand;
pub use web::WebFetch;

/// Bumped whenever a capability is added, removed or renamed.
pub const CAPABILITY_SET_VERSION: u32 = 1;

/// The closed set of actions a model may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadFile,
    WriteToFile,
    ReplaceInFile,
    ListFiles,
    SearchFiles,
    ExecuteCommand,
    WebFetch,
    ReadMemory,
    WriteMemory,
    AppendMemory,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::ReadFile,
        Capability::WriteToFile,
        Capability::ReplaceInFile,
        Capability::ListFiles,
        Capability::SearchFiles,
        Capability::ExecuteCommand,
        Capability::WebFetch,
        Capability::ReadMemory,
        Capability::WriteMemory,
        Capability::AppendMemory,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Capability::ReadFile => "read_file",
            Capability::WriteToFile => "write_to_file",
            Capability::ReplaceInFile => "replace_in_file",
            Capability::ListFiles => "list_files",
            Capability::SearchFiles => "search_files",
            Capability::ExecuteCommand => "execute_command",
            Capability::WebFetch => "web_fetch",
            Capability::ReadMemory => "read_memory",
            Capability::WriteMemory => "write_memory",
            Capability::AppendMemory => "append_memory",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Cleanup class used when retries of this capability are exhausted.
    pub fn category(self) -> ActionCategory {
        match self {
            Capability::ReadFile
            | Capability::WriteToFile
            | Capability::ReplaceInFile
            | Capability::ListFiles
            | Capability::SearchFiles => ActionCategory::FileOperation,
            Capability::ExecuteCommand => ActionCategory::CommandExecution,
            Capability::WebFetch
            | Capability::ReadMemory
            | Capability::WriteMemory
            | Capability::AppendMemory => ActionCategory::ToolExecution,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Execution context handed to every tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub task_id: TaskId,
    pub working_dir: PathBuf,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_id: TaskId::new(),
            working_dir: working_dir.into(),
        }
    }

    /// Resolve a model-supplied path against the working directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path.trim());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }
}

/// Result of a tool run. An empty `content` is a silent success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn silent() -> Self {
        Self::success(String::new())
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A handler for one [`Capability`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Must be a capability name.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Parameter names mapped to a short description; listed to the model.
    fn parameters(&self) -> &'static [(&'static str, &'static str)];

    async fn execute(&self, context: &ToolContext, params: &ToolParams) -> Result<ToolOutput>;
}

/// Fetch a required string parameter.
pub fn required_param<'a>(params: &'a ToolParams, tool: &str, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::Tool(format!("{tool}: missing required parameter '{key}'")))
}

pub fn optional_flag(params: &ToolParams, key: &str) -> bool {
    params
        .get(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
        .unwrap_or(false)
}

/// Cut `content` to at most `max_bytes`, on a char boundary.
pub fn truncate_output(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }
    let mut cut = max_bytes;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n[output truncated: {} of {} bytes shown]",
        &content[..cut],
        cut,
        content.len()
    )
}

/// Handlers keyed by capability. Registering a handler whose name is not a
/// capability fails, so nothing outside the closed set can ever run.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: BTreeMap<Capability, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<Capability> {
        let name = tool.name();
        let capability =
            Capability::from_name(name).ok_or_else(|| Error::UnknownCapability(name.to_string()))?;
        if self.handlers.insert(capability, tool).is_some() {
            warn!("replaced handler for {capability}");
        } else {
            info!("registered tool: {capability}");
        }
        Ok(capability)
    }

    pub fn resolve(&self, name: &str) -> Result<(Capability, Arc<dyn Tool>)> {
        let capability =
            Capability::from_name(name).ok_or_else(|| Error::UnknownCapability(name.to_string()))?;
        let tool = self
            .handlers
            .get(&capability)
            .cloned()
            .ok_or_else(|| Error::UnknownCapability(format!("{name} (no handler registered)")))?;
        Ok((capability, tool))
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Listing of registered tools and the invocation syntax, for the
    /// system prompt.
    pub fn describe(&self) -> String {
        let mut out = String::from(
            "Invoke a tool by writing <tool name=\"NAME\"><param>value</param></tool>. \
             Available tools:\n",
        );
        for tool in self.handlers.values() {
            out.push_str(&format!("\n- {}: {}", tool.name(), tool.description()));
            for (param, doc) in tool.parameters() {
                out.push_str(&format!("\n    <{param}>: {doc}"));
            }
        }
        out
    }
}

/// Options for the built-in handlers.
#[derive(Debug, Clone)]
pub struct BuiltinToolOptions {
    pub command_timeout: std::time::Duration,
    pub max_output_bytes: usize,
}

impl Default for BuiltinToolOptions {
    fn default() -> Self {
        Self {
            command_timeout: std::time::Duration::from_secs(120),
            max_output_bytes: 64 * 1024,
        }
    }
}

impl From<&taskloom_config::ToolsConfig> for BuiltinToolOptions {
    fn from(config: &taskloom_config::ToolsConfig) -> Self {
        Self {
            command_timeout: std::time::Duration::from_secs(config.command_timeout_secs),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Registry with a handler for every capability.
pub fn builtin_registry(
    memory: Arc<dyn taskloom_db::MemoryProvider>,
    options: &BuiltinToolOptions,
) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    let max = options.max_output_bytes;
    registry.register(Arc::new(ReadFile::new(max)))?;
    registry.register(Arc::new(WriteToFile))?;
    registry.register(Arc::new(ReplaceInFile))?;
    registry.register(Arc::new(ListFiles))?;
    registry.register(Arc::new(SearchFiles::new(max)))?;
    registry.register(Arc::new(ExecuteCommand::new(options.command_timeout, max)))?;
    registry.register(Arc::new(WebFetch::new(max)))?;
    registry.register(Arc::new(ReadMemory::new(memory.clone())))?;
    registry.register(Arc::new(WriteMemory::new(memory.clone())))?;
    registry.register(Arc::new(AppendMemory::new(memory)))?;
    Ok(registry)
}
