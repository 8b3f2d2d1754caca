//! External identity provider: OIDC discovery, silent session restoration,
//! PKCE redirect flows, and live token access for the rest of the crate.
//! The provider initializes once per process; redirect flows return
//! directives the host follows, never navigating itself.

pub mod cache;
pub mod claims;
mod discovery;
mod pkce;
pub mod refresh;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{Instrument, debug, info_span, instrument, warn};
use url::Url;

use crate::APP_USER_AGENT;
use crate::config::IdpConfig;
use crate::error::Error;
use crate::session::Role;

use cache::{MemoryTokenCache, PendingAuth, StoredTokens, TokenCache};
use claims::AccessClaims;
use discovery::DiscoveryDocument;

/// Assumed access-token lifetime when the provider omits `expires_in`.
const FALLBACK_TOKEN_TTL_SECS: u64 = 60;

/// Provider lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Uninitialized,
    Initializing,
    Ready,
}

/// Which interactive flow a redirect directive starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Login,
    Register,
    Logout,
}

/// A redirect the host must follow. Building one ends this process's part
/// in the flow; continuation happens out-of-process, after the provider
/// sends the user agent back.
#[derive(Debug, Clone)]
#[must_use = "a redirect directive does nothing until the host follows its URL"]
pub struct RedirectFlow {
    kind: FlowKind,
    url: Url,
}

impl RedirectFlow {
    #[must_use]
    pub const fn kind(&self) -> FlowKind {
        self.kind
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

/// Identity snapshot sent to the backend when linking an external session.
/// Serializes in the backend's field convention.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalProfile {
    pub id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
    pub realm_roles: Vec<String>,
}

/// The provider's live credential set.
#[derive(Debug, Clone)]
pub(crate) struct TokenSet {
    access_token: SecretString,
    refresh_token: SecretString,
    id_token: Option<SecretString>,
    expires_at: Instant,
    claims: AccessClaims,
}

impl TokenSet {
    /// Builds a set from a token-endpoint response. A response without a
    /// refresh token keeps `previous_refresh` (the endpoint may rotate or
    /// retain it).
    fn from_response(
        response: TokenResponse,
        previous_refresh: Option<&SecretString>,
    ) -> Result<Self, Error> {
        let claims = match claims::decode(&response.access_token) {
            Ok(claims) => claims,
            Err(err) => {
                warn!(error = %err, "access token payload unreadable; role hints unavailable");
                AccessClaims::default()
            }
        };
        let refresh_token = match response.refresh_token {
            Some(token) => SecretString::from(token),
            None => previous_refresh.cloned().ok_or_else(|| {
                Error::UnexpectedResponse("token response carried no refresh token".into())
            })?,
        };
        let ttl = response.expires_in.unwrap_or(FALLBACK_TOKEN_TTL_SECS);
        Ok(Self {
            access_token: SecretString::from(response.access_token),
            refresh_token,
            id_token: response.id_token.map(SecretString::from),
            expires_at: Instant::now() + Duration::from_secs(ttl),
            claims,
        })
    }
}

/// Shared cell holding the current token set. Reads are synchronous so pure
/// decision code can consult live claims; no lock is held across `await`.
#[derive(Debug, Default)]
pub(crate) struct TokenCell {
    inner: RwLock<Option<TokenSet>>,
}

impl TokenCell {
    fn read(&self) -> RwLockReadGuard<'_, Option<TokenSet>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<TokenSet>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, tokens: Option<TokenSet>) {
        *self.write() = tokens;
    }

    fn present(&self) -> bool {
        self.read().is_some()
    }

    fn access_token(&self) -> Option<SecretString> {
        self.read().as_ref().map(|t| t.access_token.clone())
    }

    fn refresh_token(&self) -> Option<SecretString> {
        self.read().as_ref().map(|t| t.refresh_token.clone())
    }

    fn id_token(&self) -> Option<SecretString> {
        self.read().as_ref().and_then(|t| t.id_token.clone())
    }

    fn claims(&self) -> Option<AccessClaims> {
        self.read().as_ref().map(|t| t.claims.clone())
    }

    fn remaining(&self) -> Option<Duration> {
        self.read()
            .as_ref()
            .map(|t| t.expires_at.saturating_duration_since(Instant::now()))
    }

    fn has_realm_role(&self, name: &str) -> bool {
        self.read()
            .as_ref()
            .is_some_and(|t| t.claims.has_realm_role(name))
    }

    fn realm_roles(&self) -> Vec<String> {
        self.read()
            .as_ref()
            .map(|t| t.claims.realm_access.roles.clone())
            .unwrap_or_default()
    }
}

/// Read handle onto the provider's current token claims. External sessions
/// carry one, so role checks always see the latest refreshed token.
#[derive(Debug, Clone)]
pub struct ClaimsHandle {
    cell: Arc<TokenCell>,
}

impl ClaimsHandle {
    pub(crate) fn new(cell: Arc<TokenCell>) -> Self {
        Self { cell }
    }

    /// True when the live token claims carry the named realm role.
    #[must_use]
    pub fn has_role(&self, name: &str) -> bool {
        self.cell.has_realm_role(name)
    }

    /// Realm roles on the live token; empty when no token is held.
    #[must_use]
    pub fn realm_roles(&self) -> Vec<String> {
        self.cell.realm_roles()
    }

    /// Handle over a fixed role set, for state-machine tests.
    #[cfg(test)]
    pub(crate) fn fixed(roles: &[&str]) -> Self {
        let cell = Arc::new(TokenCell::default());
        cell.set(Some(TokenSet {
            access_token: SecretString::from("test-access"),
            refresh_token: SecretString::from("test-refresh"),
            id_token: None,
            expires_at: Instant::now() + Duration::from_secs(300),
            claims: AccessClaims {
                realm_access: claims::RealmAccess {
                    roles: roles.iter().map(ToString::to_string).collect(),
                },
                ..AccessClaims::default()
            },
        }));
        Self { cell }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    sub: String,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
}

/// Wrapper around the external OIDC provider. One instance per process;
/// initialization runs once and later calls reuse the memoized outcome.
pub struct ExternalIdentityProvider {
    config: IdpConfig,
    http: Client,
    cache: Arc<dyn TokenCache>,
    tokens: Arc<TokenCell>,
    discovery: OnceCell<DiscoveryDocument>,
    init: OnceCell<bool>,
    initializing: AtomicBool,
}

impl ExternalIdentityProvider {
    /// Provider with in-memory credential storage.
    pub fn new(config: IdpConfig) -> Result<Self, Error> {
        Self::with_cache(config, Arc::new(MemoryTokenCache::default()))
    }

    /// Provider with host-supplied credential storage, letting refresh
    /// material and pending redirects survive process restarts.
    pub fn with_cache(config: IdpConfig, cache: Arc<dyn TokenCache>) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(APP_USER_AGENT)
            .build()
            .map_err(|err| Error::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            config,
            http,
            cache,
            tokens: Arc::new(TokenCell::default()),
            discovery: OnceCell::new(),
            init: OnceCell::new(),
            initializing: AtomicBool::new(false),
        })
    }

    /// Reports where initialization stands without running it.
    #[must_use]
    pub fn phase(&self) -> InitPhase {
        if self.init.initialized() {
            InitPhase::Ready
        } else if self.initializing.load(Ordering::Acquire) {
            InitPhase::Initializing
        } else {
            InitPhase::Uninitialized
        }
    }

    /// Runs the silent sign-on check once and reports whether a session
    /// exists. Concurrent first callers share one in-flight check; once
    /// ready, the answer comes straight from provider state. A transient
    /// failure leaves the provider uninitialized so a later call retries.
    #[instrument(skip_all)]
    pub async fn init(&self) -> Result<bool, Error> {
        if self.init.initialized() {
            return Ok(self.authenticated());
        }
        self.init
            .get_or_try_init(|| async {
                self.initializing.store(true, Ordering::Release);
                let outcome = self.silent_check().await;
                self.initializing.store(false, Ordering::Release);
                outcome
            })
            .await
            .copied()
    }

    /// Whether the provider currently holds a session.
    #[must_use]
    pub fn authenticated(&self) -> bool {
        self.tokens.present()
    }

    /// Current access token, if a session exists.
    #[must_use]
    pub fn token(&self) -> Option<SecretString> {
        self.tokens.access_token()
    }

    /// Checks the named role against live token claims.
    #[must_use]
    pub fn has_role(&self, name: &str) -> bool {
        self.tokens.has_realm_role(name)
    }

    /// Handle that external identities embed for live role checks.
    #[must_use]
    pub fn claims_handle(&self) -> ClaimsHandle {
        ClaimsHandle::new(Arc::clone(&self.tokens))
    }

    /// Builds the interactive login redirect. Following it leaves this
    /// process; the outcome becomes observable through `complete_redirect`
    /// and `init` once the user agent returns.
    pub async fn login(&self) -> Result<RedirectFlow, Error> {
        self.authorization_flow(FlowKind::Login).await
    }

    /// Builds the account-registration redirect.
    pub async fn register(&self) -> Result<RedirectFlow, Error> {
        self.authorization_flow(FlowKind::Register).await
    }

    /// Ends the external session: clears held credentials, performs the
    /// provider's back-channel logout best-effort, and returns the
    /// end-session redirect for the host to follow.
    pub async fn logout(&self) -> Result<RedirectFlow, Error> {
        let stored = self.cache.load_tokens();
        let refresh_token = self
            .tokens
            .refresh_token()
            .or_else(|| stored.as_ref().map(|s| s.refresh_token.clone()));
        let id_token = self
            .tokens
            .id_token()
            .or_else(|| stored.and_then(|s| s.id_token));
        self.discard_tokens();

        let discovery = self.discovery_doc().await?;
        let Some(end_session) = discovery.end_session_endpoint.clone() else {
            return Err(Error::Config(
                "identity provider advertises no end_session_endpoint".into(),
            ));
        };

        if let Some(refresh_token) = &refresh_token {
            if let Err(err) = self.backchannel_logout(&end_session, refresh_token).await {
                warn!(error = %err, "back-channel logout failed; proceeding with redirect");
            }
        }

        let mut url = end_session;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("client_id", self.config.client_id());
            pairs.append_pair(
                "post_logout_redirect_uri",
                self.config.post_logout_redirect_uri().as_str(),
            );
            if let Some(id_token) = &id_token {
                pairs.append_pair("id_token_hint", id_token.expose_secret());
            }
        }
        Ok(RedirectFlow {
            kind: FlowKind::Logout,
            url,
        })
    }

    /// Completes a returning authorization redirect: validates `state`
    /// against the pending record, exchanges the code, and seeds the
    /// initialization outcome so a following `init` reports the session.
    #[instrument(skip_all)]
    pub async fn complete_redirect(&self, callback: &Url) -> Result<bool, Error> {
        let mut code = None;
        let mut state = None;
        let mut flow_error = None;
        let mut flow_error_description = None;
        for (key, value) in callback.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => flow_error = Some(value.into_owned()),
                "error_description" => flow_error_description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = flow_error {
            self.cache.take_pending();
            return Err(Error::Auth(flow_error_description.unwrap_or(error)));
        }
        let (Some(code), Some(state)) = (code, state) else {
            return Err(Error::Auth("authorization callback carries no code".into()));
        };
        let Some(pending) = self.cache.take_pending() else {
            return Err(Error::Auth("no authorization attempt is pending".into()));
        };
        if pending.state != state {
            return Err(Error::Auth("authorization state mismatch".into()));
        }

        let discovery = self.discovery_doc().await?;
        let tokens = self.exchange_code(discovery, &code, &pending).await?;
        if let Some(id_token) = &tokens.id_token {
            verify_nonce(id_token, &pending.nonce)?;
        }
        self.install(tokens);
        let _ = self.init.set(true);
        debug!("authorization redirect completed");
        Ok(true)
    }

    /// Profile of the authenticated session, with realm roles mapped to
    /// the canonical role by precedence (admin over manager over user).
    /// `None` when unauthenticated.
    pub async fn user_info(&self) -> Result<Option<ExternalProfile>, Error> {
        let Some(access_token) = self.tokens.access_token() else {
            return Ok(None);
        };
        let Some(claims) = self.tokens.claims() else {
            return Ok(None);
        };

        let mut profile = ExternalProfile {
            id: claims.sub.clone().unwrap_or_default(),
            username: claims.preferred_username.clone(),
            email: claims.email.clone(),
            first_name: claims.given_name.clone(),
            last_name: claims.family_name.clone(),
            role: claims.canonical_role(),
            realm_roles: claims.realm_access.roles.clone(),
        };

        let discovery = self.discovery_doc().await?;
        if let Some(userinfo) = discovery.userinfo_endpoint.clone() {
            match self.fetch_userinfo(userinfo, &access_token).await {
                Ok(info) => {
                    profile.id = info.sub;
                    if info.preferred_username.is_some() {
                        profile.username = info.preferred_username;
                    }
                    if info.email.is_some() {
                        profile.email = info.email;
                    }
                    if info.given_name.is_some() {
                        profile.first_name = info.given_name;
                    }
                    if info.family_name.is_some() {
                        profile.last_name = info.family_name;
                    }
                }
                Err(err) => warn!(error = %err, "userinfo fetch failed; using token claims"),
            }
        }
        Ok(Some(profile))
    }

    /// One refresh-grant exchange replacing the held token set.
    pub(crate) async fn refresh(&self) -> Result<(), Error> {
        let Some(refresh_token) = self.tokens.refresh_token() else {
            return Err(Error::TokenRefresh("no refresh token held".into()));
        };
        let discovery = self.discovery_doc().await?;
        let tokens = self.redeem_refresh(discovery, &refresh_token).await?;
        self.install(tokens);
        Ok(())
    }

    pub(crate) fn remaining_validity(&self) -> Option<Duration> {
        self.tokens.remaining()
    }

    pub(crate) fn discard_tokens(&self) {
        self.tokens.set(None);
        self.cache.clear_tokens();
    }

    async fn silent_check(&self) -> Result<bool, Error> {
        let discovery = self.discovery_doc().await?;
        let Some(stored) = self.cache.load_tokens() else {
            debug!("no cached refresh token; no existing session");
            return Ok(false);
        };
        match self.redeem_refresh(discovery, &stored.refresh_token).await {
            Ok(tokens) => {
                debug!("existing session restored silently");
                self.install(tokens);
                Ok(true)
            }
            Err(Error::TokenRefresh(reason)) => {
                debug!(%reason, "cached refresh token no longer valid");
                self.cache.clear_tokens();
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn discovery_doc(&self) -> Result<&DiscoveryDocument, Error> {
        self.discovery
            .get_or_try_init(|| async {
                let url = self.config.discovery_url()?;
                discovery::fetch(&self.http, url).await
            })
            .await
    }

    async fn authorization_flow(&self, kind: FlowKind) -> Result<RedirectFlow, Error> {
        let discovery = self.discovery_doc().await?;
        let verifier = pkce::generate_verifier();
        let challenge = pkce::challenge_s256(&verifier);
        let state = pkce::generate_state();
        let nonce = pkce::generate_nonce();

        let mut url = match kind {
            // Keycloak serves its registration form on a sibling of the
            // authorization endpoint.
            FlowKind::Register => registration_endpoint(&discovery.authorization_endpoint)?,
            _ => discovery.authorization_endpoint.clone(),
        };
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("client_id", self.config.client_id());
            pairs.append_pair("response_type", "code");
            pairs.append_pair("scope", "openid profile email");
            pairs.append_pair("redirect_uri", self.config.redirect_uri().as_str());
            pairs.append_pair("state", &state);
            pairs.append_pair("nonce", &nonce);
            pairs.append_pair("code_challenge", &challenge);
            pairs.append_pair("code_challenge_method", "S256");
        }

        self.cache.store_pending(PendingAuth {
            state,
            verifier: SecretString::from(verifier),
            nonce,
        });
        debug!(flow = ?kind, "authorization redirect prepared");
        Ok(RedirectFlow { kind, url })
    }

    async fn exchange_code(
        &self,
        discovery: &DiscoveryDocument,
        code: &str,
        pending: &PendingAuth,
    ) -> Result<TokenSet, Error> {
        let url = discovery.token_endpoint.clone();
        let span =
            info_span!("idp.token", http.method = "POST", url = %url, grant = "authorization_code");
        async {
            let response = self
                .http
                .post(url)
                .form(&[
                    ("grant_type", "authorization_code"),
                    ("client_id", self.config.client_id()),
                    ("code", code),
                    ("redirect_uri", self.config.redirect_uri().as_str()),
                    ("code_verifier", pending.verifier.expose_secret()),
                ])
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                let body: TokenResponse = response.json().await.map_err(|err| {
                    Error::UnexpectedResponse(format!("invalid token response: {err}"))
                })?;
                TokenSet::from_response(body, None)
            } else {
                // A spent or forged code is an authentication failure, not
                // a refresh problem.
                Err(match token_endpoint_failure(response).await {
                    Error::TokenRefresh(reason) => Error::Auth(reason),
                    other => other,
                })
            }
        }
        .instrument(span)
        .await
    }

    async fn redeem_refresh(
        &self,
        discovery: &DiscoveryDocument,
        refresh_token: &SecretString,
    ) -> Result<TokenSet, Error> {
        let url = discovery.token_endpoint.clone();
        let span =
            info_span!("idp.token", http.method = "POST", url = %url, grant = "refresh_token");
        async {
            let response = self
                .http
                .post(url)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("client_id", self.config.client_id()),
                    ("refresh_token", refresh_token.expose_secret()),
                ])
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                let body: TokenResponse = response.json().await.map_err(|err| {
                    Error::UnexpectedResponse(format!("invalid token response: {err}"))
                })?;
                TokenSet::from_response(body, Some(refresh_token))
            } else {
                Err(token_endpoint_failure(response).await)
            }
        }
        .instrument(span)
        .await
    }

    async fn backchannel_logout(
        &self,
        end_session: &Url,
        refresh_token: &SecretString,
    ) -> Result<(), Error> {
        let span = info_span!("idp.logout", http.method = "POST", url = %end_session);
        async {
            let response = self
                .http
                .post(end_session.clone())
                .form(&[
                    ("client_id", self.config.client_id()),
                    ("refresh_token", refresh_token.expose_secret()),
                ])
                .send()
                .await?;
            let status = response.status();
            if status.is_success() || status.is_redirection() {
                Ok(())
            } else {
                Err(Error::Http {
                    status: status.as_u16(),
                    message: "end-session request rejected".into(),
                })
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_userinfo(
        &self,
        url: Url,
        access_token: &SecretString,
    ) -> Result<UserInfoResponse, Error> {
        let span = info_span!("idp.userinfo", http.method = "GET", url = %url);
        async {
            let response = self
                .http
                .get(url)
                .bearer_auth(access_token.expose_secret())
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::Http {
                    status: status.as_u16(),
                    message: "userinfo request rejected".into(),
                });
            }
            response.json::<UserInfoResponse>().await.map_err(|err| {
                Error::UnexpectedResponse(format!("invalid userinfo response: {err}"))
            })
        }
        .instrument(span)
        .await
    }

    fn install(&self, tokens: TokenSet) {
        self.cache.store_tokens(StoredTokens {
            refresh_token: tokens.refresh_token.clone(),
            id_token: tokens.id_token.clone(),
        });
        self.tokens.set(Some(tokens));
    }
}

async fn token_endpoint_failure(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let body = response.bytes().await.unwrap_or_default();
    match serde_json::from_slice::<TokenErrorResponse>(&body) {
        Ok(body) if body.error == "invalid_grant" => {
            Error::TokenRefresh(body.error_description.unwrap_or(body.error))
        }
        Ok(body) => Error::Http {
            status,
            message: body.error_description.unwrap_or(body.error),
        },
        Err(_) => Error::Http {
            status,
            message: "token endpoint rejected the request".into(),
        },
    }
}

fn verify_nonce(id_token: &SecretString, expected: &str) -> Result<(), Error> {
    let claims = claims::decode(id_token.expose_secret())?;
    match claims.nonce.as_deref() {
        Some(nonce) if nonce == expected => Ok(()),
        _ => Err(Error::Auth("id token nonce mismatch".into())),
    }
}

fn registration_endpoint(auth: &Url) -> Result<Url, Error> {
    let mut url = auth.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            Error::Config("authorization endpoint cannot host a registration path".into())
        })?;
        segments.pop();
        segments.push("registrations");
    }
    Ok(url)
}
