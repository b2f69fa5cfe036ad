pub mod allowlist;
pub mod redaction;

pub use allowlist::{AllowlistMode, ToolAllowlist};
pub use redaction::{RedactingWriter, redact_secrets, sanitize_for_user};
