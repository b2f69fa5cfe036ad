pub mod memory_store;
pub mod migrations;

pub use memory_store::{InMemoryStore, MemoryEntry, MemoryProvider, SqliteMemoryStore};
