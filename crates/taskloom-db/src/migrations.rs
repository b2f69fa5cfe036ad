/// A schema step applied when a store is opened.
pub struct Migration {
    pub version: u32,
    pub sql: &'static str,
}

pub const MEMORY_SCHEMA_V1: Migration = Migration {
    version: 1,
    sql: "
CREATE TABLE IF NOT EXISTS memory_entries (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memory_updated_at ON memory_entries(updated_at);
",
};
