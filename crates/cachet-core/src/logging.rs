//! Logging helpers with automatic sensitive-data redaction.
//!
//! Key material, shared secrets, and plaintext must never reach log output
//! in full. These wrappers make the safe form the convenient one when
//! emitting `tracing` events.

use std::fmt;

/// A wrapper that redacts its contents entirely when displayed.
pub struct Redacted<T>(pub T);

impl<T: fmt::Display> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: fmt::Debug> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact a byte slice, showing only its length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a hex string, showing only the first and last 4 characters.
///
/// Useful for key fingerprints in debug output where full disclosure is
/// unacceptable but correlation across log lines is still needed.
pub struct RedactedHex<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 12 {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 4..])
        } else {
            write!(f, "[REDACTED HEX]")
        }
    }
}

impl<'a> fmt::Debug for RedactedHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Patterns that should be redacted from free-form log strings.
const SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "secret",
    "private",
    "key",
    "token",
    "credential",
];

/// Check if a string appears to contain sensitive data.
pub fn appears_sensitive(s: &str) -> bool {
    let lower = s.to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitize a string for logging, redacting sensitive patterns.
pub fn sanitize_for_log(s: &str) -> String {
    if appears_sensitive(s) {
        "[REDACTED]".to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_display() {
        let secret = Redacted("my_secret_password");
        assert_eq!(format!("{}", secret), "[REDACTED]");
    }

    #[test]
    fn test_redacted_bytes() {
        let bytes = RedactedBytes(&[1, 2, 3, 4]);
        assert_eq!(format!("{}", bytes), "[4 bytes]");
    }

    #[test]
    fn test_redacted_hex() {
        let displayed = format!("{}", RedactedHex("aabbccddeeff00112233"));
        assert_eq!(displayed, "aabb...2233");
        assert_eq!(format!("{}", RedactedHex("aabb")), "[REDACTED HEX]");
    }

    #[test]
    fn test_appears_sensitive() {
        assert!(appears_sensitive("user_password"));
        assert!(appears_sensitive("secret_key"));
        assert!(!appears_sensitive("hello_world"));
        assert!(!appears_sensitive("message_count"));
    }

    #[test]
    fn test_sanitize_for_log() {
        assert_eq!(sanitize_for_log("hello"), "hello");
        assert_eq!(sanitize_for_log("password123"), "[REDACTED]");
    }
}
