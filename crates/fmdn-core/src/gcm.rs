//! # GCM Register Replies
//!
//! The legacy `c2dm/register3` endpoint answers with line-oriented
//! `key=value` text rather than JSON:
//!
//! ```text
//! token=APA91bH…          success
//! Error=PHONE_REGISTRATION_ERROR   failure (key is case-insensitive)
//! ```
//!
//! Misrouted requests come back as an HTML page, sometimes with status 200.

/// Error codes that never succeed on retry.
pub const NON_RETRYABLE_ERRORS: [&str; 5] = [
    "AUTHENTICATION_FAILED",
    "INVALID_PARAMETERS",
    "INVALID_SENDER",
    "MISSING_SENDER",
    "PHONE_REGISTRATION_ERROR",
];

/// Parsed register reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterReply {
    /// The GCM send token.
    Token(String),
    /// An `error=` code.
    Error(String),
}

impl RegisterReply {
    /// Parses a reply body. Returns `None` when neither key is present.
    pub fn parse(body: &str) -> Option<Self> {
        let mut error = None;
        for line in body.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "token" if !value.is_empty() => return Some(RegisterReply::Token(value.to_string())),
                "error" => error = Some(RegisterReply::Error(value.to_string())),
                _ => {}
            }
        }
        error
    }
}

/// Returns true if `code` is one of [`NON_RETRYABLE_ERRORS`].
pub fn is_non_retryable(code: &str) -> bool {
    NON_RETRYABLE_ERRORS.contains(&code)
}

/// Returns true if a body looks like an HTML page instead of a reply.
pub fn looks_like_html(body: &str) -> bool {
    let head: String = body
        .trim_start()
        .chars()
        .take(64)
        .collect::<String>()
        .to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html") || head.contains("<html")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token() {
        assert_eq!(
            RegisterReply::parse("token=abc:123\n"),
            Some(RegisterReply::Token("abc:123".into()))
        );
    }

    #[test]
    fn test_parse_error_case_insensitive_key() {
        assert_eq!(
            RegisterReply::parse("Error=PHONE_REGISTRATION_ERROR"),
            Some(RegisterReply::Error("PHONE_REGISTRATION_ERROR".into()))
        );
    }

    #[test]
    fn test_token_wins_over_error_line() {
        assert_eq!(
            RegisterReply::parse("error=SERVICE_NOT_AVAILABLE\ntoken=t"),
            Some(RegisterReply::Token("t".into()))
        );
    }

    #[test]
    fn test_unparseable_body() {
        assert_eq!(RegisterReply::parse("hello"), None);
        assert_eq!(RegisterReply::parse("token="), None);
    }

    #[test]
    fn test_non_retryable_set() {
        for code in NON_RETRYABLE_ERRORS {
            assert!(is_non_retryable(code));
        }
        assert!(!is_non_retryable("SERVICE_NOT_AVAILABLE"));
        assert!(!is_non_retryable("TOO_MANY_REGISTRATIONS"));
    }

    #[test]
    fn test_html_detection() {
        assert!(looks_like_html("<!DOCTYPE html><html><body>404</body></html>"));
        assert!(looks_like_html("  <HTML>"));
        assert!(!looks_like_html("token=abc"));
    }
}
