//! Secret scrubbing for text that leaves the process.
//!
//! Provider error bodies sometimes echo the credential back or contain other
//! key-shaped strings. Everything here runs before such text reaches a log
//! line or a response.

use regex::Regex;
use std::sync::LazyLock;

/// Replacement for anything that looks like a secret.
pub const REDACTED: &str = "[REDACTED]";

struct SecretPatterns {
    bearer: Regex,
    prefixed_key: Regex,
    google_key: Regex,
    key_assignment: Regex,
}

static SECRET_PATTERNS: LazyLock<SecretPatterns> = LazyLock::new(|| SecretPatterns {
    bearer: Regex::new(r"(?i)bearer\s+[a-zA-Z0-9\-._~+/]+=*").unwrap(),
    prefixed_key: Regex::new(r"\b(?:sk|pk|rk)-[a-zA-Z0-9_\-]{8,}").unwrap(),
    google_key: Regex::new(r"\bAIza[0-9A-Za-z_\-]{20,}").unwrap(),
    key_assignment: Regex::new(r#"(?i)(api[_-]?key|x-api-key|x-goog-api-key|token|secret)(["']?\s*[:=]\s*["']?)[^\s"',}]{8,}"#)
        .unwrap(),
});

/// Scrub key-shaped substrings from `text`, plus every occurrence of
/// `known_secret` when one is given.
pub fn redact_secrets(text: &str, known_secret: Option<&str>) -> String {
    let mut out = match known_secret {
        Some(secret) if !secret.is_empty() => text.replace(secret, REDACTED),
        _ => text.to_string(),
    };

    let p = &*SECRET_PATTERNS;
    out = p
        .key_assignment
        .replace_all(&out, format!("${{1}}${{2}}{REDACTED}").as_str())
        .into_owned();
    out = p
        .bearer
        .replace_all(&out, format!("Bearer {REDACTED}").as_str())
        .into_owned();
    out = p.prefixed_key.replace_all(&out, REDACTED).into_owned();
    out = p.google_key.replace_all(&out, REDACTED).into_owned();
    out
}
