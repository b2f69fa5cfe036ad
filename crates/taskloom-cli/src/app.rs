use std::sync::Arc;

use anyhow::{Context, Result, bail};
use taskloom_agents::{
    BuiltinToolOptions, EventSink, OpenAiProvider, ProfileRegistry, RetryPolicy, RuntimeSettings,
    TaskRuntime, builtin_registry,
};
use taskloom_config::{AppConfig, ConfigLoader, ProviderConfig};
use taskloom_db::{MemoryProvider, SqliteMemoryStore};
use taskloom_security::ToolAllowlist;
use tracing::debug;

/// Inline key first, then the configured environment variable.
fn resolve_api_key(config: &ProviderConfig) -> Result<String> {
    if let Some(key) = config.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
        return Ok(key.clone());
    }
    match std::env::var(&config.api_key_env) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => bail!(
            "no API key: set {} or provider.api_key in the config file",
            config.api_key_env
        ),
    }
}

pub fn build_provider(config: &AppConfig) -> Result<OpenAiProvider> {
    let api_key = resolve_api_key(&config.provider)?;
    Ok(OpenAiProvider::new(api_key, config.provider.base_url.clone()))
}

pub fn build_runtime(config: &AppConfig, events: EventSink) -> Result<TaskRuntime> {
    let provider = build_provider(config)?;

    let memory_path = config
        .memory
        .path
        .clone()
        .unwrap_or_else(|| ConfigLoader::default_config_dir().join("memory.db"));
    let memory: Arc<dyn MemoryProvider> = Arc::new(
        SqliteMemoryStore::open(&memory_path)
            .with_context(|| format!("failed to open memory store {}", memory_path.display()))?,
    );
    let registry = builtin_registry(memory, &BuiltinToolOptions::from(&config.tools))?;
    debug!(tools = registry.len(), "tool registry ready");

    let runtime = TaskRuntime::builder(Arc::new(provider), Arc::new(registry))
        .settings(RuntimeSettings::from_config(config))
        .safety_policy(Arc::new(ToolAllowlist::from_config(&config.approval)))
        .auto_run(config.engine.auto_run)
        .retry_policy(RetryPolicy::from(&config.retry))
        .profiles(ProfileRegistry::from_config(&config.context))
        .events(events)
        .build();
    Ok(runtime)
}
