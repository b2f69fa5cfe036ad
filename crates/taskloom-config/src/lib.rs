pub mod loader;
pub mod model;

pub use loader::{ConfigFormat, ConfigLoader};
pub use model::{
    AppConfig, ApprovalConfig, ApprovalMode, ContextConfig, ContinuationMode, EngineConfig,
    LoggingConfig, MemoryConfig, ProfileConfig, ProviderConfig, RetryConfig, ToolsConfig,
    DEFAULT_RETRYABLE_SIGNATURES,
};
