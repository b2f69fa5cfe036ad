use std::sync::Arc;

use async_trait::async_trait;
use taskloom_common::Result;
use taskloom_db::MemoryProvider;

use crate::parser::ToolParams;
use crate::tools::{Tool, ToolContext, ToolOutput, required_param};

pub struct ReadMemory {
    store: Arc<dyn MemoryProvider>,
}

impl ReadMemory {
    pub fn new(store: Arc<dyn MemoryProvider>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ReadMemory {
    fn name(&self) -> &'static str {
        "read_memory"
    }

    fn description(&self) -> &'static str {
        "Read a remembered value. Without `key`, list the stored keys."
    }

    fn parameters(&self) -> &'static [(&'static str, &'static str)] {
        &[("key", "memory key; omit to list keys")]
    }

    async fn execute(&self, _context: &ToolContext, params: &ToolParams) -> Result<ToolOutput> {
        let key = params.get("key").map(|k| k.trim()).unwrap_or("");
        if key.is_empty() {
            let keys = self.store.keys().await?;
            if keys.is_empty() {
                return Ok(ToolOutput::success("No memories stored."));
            }
            return Ok(ToolOutput::success(keys.join("\n")));
        }
        match self.store.get(key).await? {
            Some(entry) => Ok(ToolOutput::success(entry.value)),
            None => Ok(ToolOutput::success(format!(
                "No memory stored under '{key}'."
            ))),
        }
    }
}

pub struct WriteMemory {
    store: Arc<dyn MemoryProvider>,
}

impl WriteMemory {
    pub fn new(store: Arc<dyn MemoryProvider>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for WriteMemory {
    fn name(&self) -> &'static str {
        "write_memory"
    }

    fn description(&self) -> &'static str {
        "Store a value under a key, replacing any previous value."
    }

    fn parameters(&self) -> &'static [(&'static str, &'static str)] {
        &[("key", "memory key"), ("value", "text to remember")]
    }

    async fn execute(&self, _context: &ToolContext, params: &ToolParams) -> Result<ToolOutput> {
        let key = required_param(params, self.name(), "key")?.trim();
        let value = required_param(params, self.name(), "value")?;
        self.store.set(key, value).await?;
        Ok(ToolOutput::silent())
    }
}

pub struct AppendMemory {
    store: Arc<dyn MemoryProvider>,
}

impl AppendMemory {
    pub fn new(store: Arc<dyn MemoryProvider>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for AppendMemory {
    fn name(&self) -> &'static str {
        "append_memory"
    }

    fn description(&self) -> &'static str {
        "Append a line to the value stored under a key."
    }

    fn parameters(&self) -> &'static [(&'static str, &'static str)] {
        &[("key", "memory key"), ("value", "line to append")]
    }

    async fn execute(&self, _context: &ToolContext, params: &ToolParams) -> Result<ToolOutput> {
        let key = required_param(params, self.name(), "key")?.trim();
        let value = required_param(params, self.name(), "value")?;
        self.store.append(key, value).await?;
        Ok(ToolOutput::silent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_db::InMemoryStore;

    fn params(pairs: &[(&str, &str)]) -> ToolParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn write_and_append_are_silent() {
        let store: Arc<dyn MemoryProvider> = Arc::new(InMemoryStore::new());
        let context = ToolContext::new(".");

        let out = WriteMemory::new(store.clone())
            .execute(&context, &params(&[("key", "todo"), ("value", "parse")]))
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::silent());
        AppendMemory::new(store.clone())
            .execute(&context, &params(&[("key", "todo"), ("value", "test")]))
            .await
            .unwrap();

        let read = ReadMemory::new(store.clone())
            .execute(&context, &params(&[("key", "todo")]))
            .await
            .unwrap();
        assert_eq!(read.content, "parse\ntest");

        let keys = ReadMemory::new(store)
            .execute(&context, &params(&[]))
            .await
            .unwrap();
        assert_eq!(keys.content, "todo");
    }

    #[tokio::test]
    async fn missing_key_is_reported_not_failed() {
        let store: Arc<dyn MemoryProvider> = Arc::new(InMemoryStore::new());
        let out = ReadMemory::new(store)
            .execute(&ToolContext::new("."), &params(&[("key", "nothing")]))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.content.contains("nothing"));
    }
}
