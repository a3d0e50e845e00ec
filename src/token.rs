use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, error};

use crate::error::TranscribeError;

/// Short-lived session credential issued by the backend.
///
/// Held in memory only; the validity window is enforced by the remote
/// service, not tracked here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    ok: bool,
    #[serde(rename = "clientSecret")]
    client_secret: Option<String>,
    error: Option<String>,
}

/// Obtains and caches the ephemeral credential for this process lifetime.
///
/// The first caller triggers exactly one outbound fetch; every concurrent or
/// subsequent caller receives the same in-flight or cached result. A failed
/// fetch is cached as a terminal state for this broker — retrying requires a
/// fresh broker (a new subsystem lifetime). No automatic refresh.
pub struct CredentialBroker {
    client: reqwest::Client,
    token_url: String,
    cached: OnceCell<Result<Credential, TranscribeError>>,
}

impl CredentialBroker {
    pub fn new(token_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: token_url.into(),
            cached: OnceCell::new(),
        }
    }

    /// Get the credential, fetching it on first use.
    pub async fn obtain(&self) -> Result<Credential, TranscribeError> {
        self.cached
            .get_or_init(|| async {
                let res = self.fetch().await;
                if let Err(e) = &res {
                    error!(%e, "credential fetch failed");
                }
                res
            })
            .await
            .clone()
    }

    async fn fetch(&self) -> Result<Credential, TranscribeError> {
        debug!(url = %self.token_url, "fetching ephemeral credential");
        let response = self
            .client
            .post(&self.token_url)
            .send()
            .await
            .map_err(|e| TranscribeError::Token(e.to_string()))?;

        // Non-2xx is a failure even when the body parses.
        let status = response.status();
        if !status.is_success() {
            return Err(TranscribeError::Token(format!("http status {status}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| TranscribeError::Token(e.to_string()))?;
        if !body.ok {
            return Err(TranscribeError::Token(
                body.error.unwrap_or_else(|| "token endpoint refused".into()),
            ));
        }
        let secret = body
            .client_secret
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TranscribeError::Token("token response missing clientSecret".into()))?;
        debug!("credential obtained");
        Ok(Credential { secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn obtain_fetches_once_and_caches() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .json_body(serde_json::json!({"ok": true, "clientSecret": "ek_test"}));
            })
            .await;

        let broker = CredentialBroker::new(server.url("/token"));
        let first = broker.obtain().await.unwrap();
        let second = broker.obtain().await.unwrap();
        assert_eq!(first.secret, "ek_test");
        assert_eq!(first, second);
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn concurrent_obtains_issue_one_fetch() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .json_body(serde_json::json!({"ok": true, "clientSecret": "ek_test"}));
            })
            .await;

        let broker = std::sync::Arc::new(CredentialBroker::new(server.url("/token")));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move { broker.obtain().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().secret, "ek_test");
        }
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn failure_is_terminal_for_the_broker() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(500).body("boom");
            })
            .await;

        let broker = CredentialBroker::new(server.url("/token"));
        assert!(matches!(
            broker.obtain().await,
            Err(TranscribeError::Token(_))
        ));
        // Second call must not refetch.
        assert!(matches!(
            broker.obtain().await,
            Err(TranscribeError::Token(_))
        ));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn ok_false_body_is_a_token_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .json_body(serde_json::json!({"ok": false, "error": "no session"}));
            })
            .await;

        let broker = CredentialBroker::new(server.url("/token"));
        assert_eq!(
            broker.obtain().await,
            Err(TranscribeError::Token("no session".into()))
        );
    }

    #[tokio::test]
    async fn non_2xx_with_wellformed_body_is_still_a_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(403)
                    .json_body(serde_json::json!({"ok": true, "clientSecret": "ek_test"}));
            })
            .await;

        let broker = CredentialBroker::new(server.url("/token"));
        assert!(matches!(
            broker.obtain().await,
            Err(TranscribeError::Token(_))
        ));
    }
}
