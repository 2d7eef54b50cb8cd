//! Failure classification for calls to external services.
//!
//! The retry coordinator never inspects concrete error types; it asks the
//! error to classify itself. Anything that is not positively known to be
//! transient is treated as fatal (fail closed).

/// How a failure from an external service should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient fault - safe to retry with backoff.
    Recoverable,
    /// Permanent fault - retrying cannot help, surface immediately.
    Fatal,
}

/// Implemented by every error type that crosses the retry boundary.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

/// Substring-matching fallback for collaborators that expose no structured
/// error code. Structured classification via [`Classify`] is always
/// preferred; this exists for free-text error payloads only.
pub fn classify_text(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let transient = ["timeout", "timed out", "rate limit", "429", "500", "502", "503", "504"];
    if transient.iter().any(|marker| lower.contains(marker)) {
        ErrorClass::Recoverable
    } else {
        ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_text_transient_markers() {
        assert_eq!(classify_text("connection timeout"), ErrorClass::Recoverable);
        assert_eq!(classify_text("HTTP 429 Too Many Requests"), ErrorClass::Recoverable);
        assert_eq!(classify_text("upstream returned 503"), ErrorClass::Recoverable);
        assert_eq!(classify_text("Rate limit exceeded"), ErrorClass::Recoverable);
    }

    #[test]
    fn test_classify_text_fails_closed() {
        assert_eq!(classify_text("invalid API key"), ErrorClass::Fatal);
        assert_eq!(classify_text("unknown column `foo`"), ErrorClass::Fatal);
        assert_eq!(classify_text(""), ErrorClass::Fatal);
    }
}
