//! Proactive token refresh with single-flight coordination.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ExternalIdentityProvider, RedirectFlow};
use crate::error::Error;

/// Outcome of a freshness check.
#[derive(Debug)]
pub enum Freshness {
    /// The held token already satisfies the requested validity window.
    StillValid,
    /// One refresh grant ran and the token set was replaced.
    Refreshed,
    /// The session cannot be refreshed; the host must send the user back
    /// through interactive login.
    ReloginRequired(RedirectFlow),
}

/// Serializes refresh traffic for one provider. Concurrent callers finding
/// a stale token share a single refresh-grant exchange.
pub struct TokenRefreshScheduler {
    provider: Arc<ExternalIdentityProvider>,
    gate: Mutex<()>,
}

impl TokenRefreshScheduler {
    #[must_use]
    pub fn new(provider: Arc<ExternalIdentityProvider>) -> Self {
        Self {
            provider,
            gate: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<ExternalIdentityProvider> {
        &self.provider
    }

    /// Guarantees the access token stays valid for at least `min_validity`.
    ///
    /// The staleness check runs under a lock held across the exchange, so
    /// callers piling up behind an in-flight refresh observe the replaced
    /// token and report `StillValid` instead of refreshing again.
    pub async fn ensure_fresh(&self, min_validity: Duration) -> Result<Freshness, Error> {
        let _guard = self.gate.lock().await;
        match self.provider.remaining_validity() {
            None => Err(Error::TokenRefresh("no session to refresh".into())),
            Some(remaining) if remaining >= min_validity => Ok(Freshness::StillValid),
            Some(remaining) => {
                debug!(
                    remaining_secs = remaining.as_secs(),
                    "access token near expiry; refreshing"
                );
                match self.provider.refresh().await {
                    Ok(()) => Ok(Freshness::Refreshed),
                    Err(Error::TokenRefresh(reason)) => {
                        warn!(%reason, "refresh grant rejected; interactive login required");
                        self.provider.discard_tokens();
                        let flow = self.provider.login().await?;
                        Ok(Freshness::ReloginRequired(flow))
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdpConfig;
    use crate::idp::cache::{MemoryTokenCache, StoredTokens, TokenCache};
    use crate::idp::{FlowKind, claims};
    use crate::testutil::can_bind_localhost;
    use anyhow::Result;
    use secrecy::SecretString;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> IdpConfig {
        IdpConfig::new(
            Url::parse(&server.uri()).expect("mock server uri"),
            "main",
            "web-client",
            &Url::parse("https://app.example.com").expect("valid origin"),
        )
        .expect("valid config")
    }

    async fn mount_discovery(server: &MockServer) {
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/realms/main/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": format!("{base}/realms/main"),
                "authorization_endpoint": format!("{base}/realms/main/protocol/openid-connect/auth"),
                "token_endpoint": format!("{base}/realms/main/protocol/openid-connect/token"),
            })))
            .mount(server)
            .await;
    }

    fn token_body(returned_refresh: &str, expires_in: u64) -> serde_json::Value {
        json!({
            "access_token": claims::encode_unsigned(&json!({
                "sub": "f3a1",
                "realm_access": {"roles": ["user"]},
            })),
            "refresh_token": returned_refresh,
            "expires_in": expires_in,
        })
    }

    async fn scheduler_with_session(
        server: &MockServer,
        initial_expires_in: u64,
    ) -> Result<TokenRefreshScheduler> {
        mount_discovery(server).await;
        Mock::given(method("POST"))
            .and(path("/realms/main/protocol/openid-connect/token"))
            .and(body_string_contains("refresh_token=seeded-refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("held-refresh", initial_expires_in)),
            )
            .expect(1)
            .mount(server)
            .await;

        let cache = Arc::new(MemoryTokenCache::default());
        cache.store_tokens(StoredTokens {
            refresh_token: SecretString::from("seeded-refresh"),
            id_token: None,
        });
        let provider = Arc::new(ExternalIdentityProvider::with_cache(config(server), cache)?);
        anyhow::ensure!(provider.init().await?, "session should restore");
        Ok(TokenRefreshScheduler::new(provider))
    }

    #[tokio::test]
    async fn young_token_is_left_alone() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        let scheduler = scheduler_with_session(&server, 300).await?;

        // The seeded-refresh mock's expect(1) proves no second exchange.
        let outcome = scheduler.ensure_fresh(Duration::from_secs(30)).await?;
        assert!(matches!(outcome, Freshness::StillValid));
        Ok(())
    }

    #[tokio::test]
    async fn stale_token_triggers_one_refresh() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        let scheduler = scheduler_with_session(&server, 10).await?;
        Mock::given(method("POST"))
            .and(path("/realms/main/protocol/openid-connect/token"))
            .and(body_string_contains("refresh_token=held-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("next-refresh", 300)))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = scheduler.ensure_fresh(Duration::from_secs(30)).await?;
        assert!(matches!(outcome, Freshness::Refreshed));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        let scheduler = scheduler_with_session(&server, 10).await?;
        Mock::given(method("POST"))
            .and(path("/realms/main/protocol/openid-connect/token"))
            .and(body_string_contains("refresh_token=held-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("next-refresh", 300)))
            .expect(1)
            .mount(&server)
            .await;

        let window = Duration::from_secs(30);
        let (a, b, c) = tokio::join!(
            scheduler.ensure_fresh(window),
            scheduler.ensure_fresh(window),
            scheduler.ensure_fresh(window),
        );
        let outcomes = [a?, b?, c?];
        let refreshed = outcomes
            .iter()
            .filter(|o| matches!(o, Freshness::Refreshed))
            .count();
        assert_eq!(refreshed, 1, "exactly one caller performs the exchange");
        assert!(
            outcomes
                .iter()
                .all(|o| matches!(o, Freshness::Refreshed | Freshness::StillValid))
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejected_refresh_demands_interactive_login() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        let scheduler = scheduler_with_session(&server, 10).await?;
        Mock::given(method("POST"))
            .and(path("/realms/main/protocol/openid-connect/token"))
            .and(body_string_contains("refresh_token=held-refresh"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Session not active",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = scheduler.ensure_fresh(Duration::from_secs(30)).await?;
        let Freshness::ReloginRequired(flow) = outcome else {
            anyhow::bail!("expected a relogin directive");
        };
        assert_eq!(flow.kind(), FlowKind::Login);
        assert!(!scheduler.provider().authenticated());
        Ok(())
    }

    #[tokio::test]
    async fn freshness_check_without_session_fails() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        mount_discovery(&server).await;

        let provider = Arc::new(ExternalIdentityProvider::new(config(&server))?);
        assert!(!provider.init().await?);

        let scheduler = TokenRefreshScheduler::new(provider);
        let err = scheduler
            .ensure_fresh(Duration::from_secs(30))
            .await
            .expect_err("no session");
        assert!(matches!(err, Error::TokenRefresh(_)));
        Ok(())
    }
}
