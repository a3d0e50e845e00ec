use thiserror::Error;

/// Errors surfaced by the transcription subsystem.
///
/// Variants carry their detail as plain strings so the error stays `Clone`;
/// the [`CredentialBroker`](crate::token::CredentialBroker) caches a failed
/// fetch as a terminal result and hands out clones of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscribeError {
    /// Required capture/transport capability is absent. Not retryable with
    /// the same source implementation.
    #[error("transcription not supported in this environment: {0}")]
    Unsupported(String),

    /// Microphone unavailable or permission denied; the session never starts.
    #[error("audio capture failed: {0}")]
    Capture(String),

    /// Credential fetch failed. Not retried automatically.
    #[error("credential fetch failed: {0}")]
    Token(String),

    /// Negotiation or transport setup failed after capture succeeded.
    #[error("session negotiation failed: {0}")]
    Connection(String),

    /// The control channel reported an error after the session connected.
    /// The session is not torn down for this alone but remains stoppable.
    #[error("control channel error: {0}")]
    Channel(String),

    /// A fallback chunk failed to transcribe; subsequent chunks continue.
    #[error("chunk transcription failed: {0}")]
    Transcription(String),
}

/// Upper bound on response-body detail carried inside an error.
const DETAIL_LIMIT: usize = 200;

/// Truncate a response body so error payloads stay bounded.
pub(crate) fn truncate_detail(body: &str) -> String {
    let mut out = String::with_capacity(DETAIL_LIMIT);
    for (taken, ch) in body.chars().enumerate() {
        if taken == DETAIL_LIMIT {
            out.push_str("...");
            return out;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_detail_is_untouched() {
        assert_eq!(truncate_detail("bad request"), "bad request");
    }

    #[test]
    fn long_detail_is_bounded() {
        let body = "x".repeat(500);
        let detail = truncate_detail(&body);
        assert_eq!(detail.len(), DETAIL_LIMIT + 3);
        assert!(detail.ends_with("..."));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = "é".repeat(300);
        let detail = truncate_detail(&body);
        assert_eq!(detail.chars().count(), DETAIL_LIMIT + 3);
    }
}
