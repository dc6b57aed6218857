//! Secret handling: encryption at rest and scrubbing of outbound text.

pub mod encryption;
pub mod redact;

pub use encryption::AesEncryptor;
pub use redact::{redact_secrets, REDACTED};
