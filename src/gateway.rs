//! Authenticated access to the backend API. These helpers centralize
//! headers, envelope decoding and session teardown on credential
//! rejection, keeping callers free of per-request auth plumbing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info_span, warn};

use crate::APP_USER_AGENT;
use crate::config::BackendConfig;
use crate::error::Error;
use crate::idp::refresh::{Freshness, TokenRefreshScheduler};
use crate::session::SessionStore;

/// Minimum remaining validity requested from the scheduler before a
/// session-authenticated call goes out.
const REFRESH_MIN_VALIDITY: Duration = Duration::from_secs(30);

/// How a request authenticates.
#[derive(Debug, Clone)]
pub enum RequestAuth {
    /// Attach the current session's credential, refreshing an external
    /// token first when one is active.
    Session,
    /// Attach this specific bearer token.
    Bearer(SecretString),
    /// Send no credential.
    Anonymous,
}

/// Backend response envelope; every endpoint wraps its payload in one.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    errors: Option<HashMap<String, FieldMessage>>,
}

#[derive(Debug, Deserialize)]
struct FieldMessage {
    #[serde(default)]
    message: Option<String>,
}

/// HTTP front door to the backend. Shared by the local provider, the user
/// directory and the session synchronizer.
pub struct RequestGateway {
    http: Client,
    config: BackendConfig,
    store: SessionStore,
    refresher: Option<Arc<TokenRefreshScheduler>>,
    local_token: RwLock<Option<SecretString>>,
}

impl RequestGateway {
    pub fn new(config: BackendConfig, store: SessionStore) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(APP_USER_AGENT)
            .build()
            .map_err(|err| Error::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            http,
            config,
            store,
            refresher: None,
            local_token: RwLock::new(None),
        })
    }

    /// Routes session credentials through the scheduler, so requests ride
    /// on tokens valid for at least the refresh window.
    #[must_use]
    pub fn with_refresher(mut self, refresher: Arc<TokenRefreshScheduler>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Installs or clears the bearer token local sessions attach to
    /// session-authenticated requests.
    pub(crate) fn set_local_token(&self, token: Option<SecretString>) {
        *self
            .local_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// GET expecting enveloped data.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        auth: RequestAuth,
    ) -> Result<T, Error> {
        self.execute::<(), T>(Method::GET, path, None, auth)
            .await?
            .ok_or_else(|| missing_data(path))
    }

    /// POST expecting enveloped data.
    pub async fn post_json<B, T>(&self, path: &str, body: &B, auth: RequestAuth) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(Method::POST, path, Some(body), auth)
            .await?
            .ok_or_else(|| missing_data(path))
    }

    /// PUT expecting enveloped data.
    pub async fn put_json<B, T>(&self, path: &str, body: &B, auth: RequestAuth) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(Method::PUT, path, Some(body), auth)
            .await?
            .ok_or_else(|| missing_data(path))
    }

    /// PATCH expecting enveloped data.
    pub async fn patch_json<B, T>(
        &self,
        path: &str,
        body: &B,
        auth: RequestAuth,
    ) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(Method::PATCH, path, Some(body), auth)
            .await?
            .ok_or_else(|| missing_data(path))
    }

    /// POST where only the envelope verdict matters.
    pub async fn post_unit<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        auth: RequestAuth,
    ) -> Result<(), Error> {
        self.execute::<B, serde_json::Value>(Method::POST, path, Some(body), auth)
            .await
            .map(|_| ())
    }

    /// PUT where only the envelope verdict matters.
    pub async fn put_unit<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        auth: RequestAuth,
    ) -> Result<(), Error> {
        self.execute::<B, serde_json::Value>(Method::PUT, path, Some(body), auth)
            .await
            .map(|_| ())
    }

    async fn execute<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        auth: RequestAuth,
    ) -> Result<Option<T>, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send(method, path, body, auth).await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if status == StatusCode::UNAUTHORIZED {
            let message = envelope_message(&bytes)
                .unwrap_or_else(|| "session rejected by the backend".to_string());
            warn!(%status, path, "credential rejected; clearing session");
            self.store.logout();
            return Err(Error::Auth(message));
        }

        if status.is_success() {
            // 204 and other bodiless success responses have no envelope.
            if bytes.is_empty() {
                return Ok(None);
            }
            let envelope: Envelope<T> = parse_envelope(&bytes)?;
            if envelope.success {
                return Ok(envelope.data);
            }
            return Err(Error::UnexpectedResponse(envelope.message.unwrap_or_else(
                || "backend reported failure without a message".to_string(),
            )));
        }

        Err(failure_from(status, &bytes))
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        auth: RequestAuth,
    ) -> Result<reqwest::Response, Error> {
        let url = self.config.endpoint(path)?;
        let span = info_span!("backend.request", http.method = %method, url = %url);
        async {
            let mut request = self.http.request(method, url);
            if let Some(token) = self.credential(&auth).await? {
                request = request.bearer_auth(token.expose_secret());
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            Ok(request.send().await?)
        }
        .instrument(span)
        .await
    }

    async fn credential(&self, auth: &RequestAuth) -> Result<Option<SecretString>, Error> {
        match auth {
            RequestAuth::Anonymous => Ok(None),
            RequestAuth::Bearer(token) => Ok(Some(token.clone())),
            RequestAuth::Session => self.session_credential().await,
        }
    }

    /// Credential for the current session. Local tokens win when present;
    /// external tokens pass through the freshness gate first.
    async fn session_credential(&self) -> Result<Option<SecretString>, Error> {
        let local = self
            .local_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if local.is_some() {
            return Ok(local);
        }
        let Some(refresher) = &self.refresher else {
            return Ok(None);
        };
        if !refresher.provider().authenticated() {
            return Ok(None);
        }
        match refresher.ensure_fresh(REFRESH_MIN_VALIDITY).await? {
            Freshness::StillValid | Freshness::Refreshed => Ok(refresher.provider().token()),
            Freshness::ReloginRequired(_) => {
                warn!("refresh rejected mid-request; interactive login required");
                Err(Error::TokenRefresh(
                    "session expired; interactive login required".into(),
                ))
            }
        }
    }
}

fn parse_envelope<T: DeserializeOwned>(bytes: &[u8]) -> Result<Envelope<T>, Error> {
    serde_json::from_slice(bytes)
        .map_err(|err| Error::UnexpectedResponse(format!("malformed backend envelope: {err}")))
}

fn envelope_message(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<Envelope<serde_json::Value>>(bytes)
        .ok()
        .and_then(|envelope| envelope.message)
}

fn failure_from(status: StatusCode, bytes: &[u8]) -> Error {
    let Ok(envelope) = serde_json::from_slice::<Envelope<serde_json::Value>>(bytes) else {
        return Error::Http {
            status: status.as_u16(),
            message: format!("backend returned {status}"),
        };
    };
    let message = envelope
        .message
        .unwrap_or_else(|| format!("backend returned {status}"));
    let fields = field_map(envelope.errors);
    if !fields.is_empty()
        || status == StatusCode::BAD_REQUEST
        || status == StatusCode::UNPROCESSABLE_ENTITY
    {
        Error::Validation { message, fields }
    } else {
        Error::Http {
            status: status.as_u16(),
            message,
        }
    }
}

fn field_map(errors: Option<HashMap<String, FieldMessage>>) -> HashMap<String, String> {
    errors
        .unwrap_or_default()
        .into_iter()
        .map(|(field, entry)| {
            let message = entry.message.unwrap_or_else(|| "invalid value".to_string());
            (field, message)
        })
        .collect()
}

fn missing_data(path: &str) -> Error {
    Error::UnexpectedResponse(format!("response from {path} carried no data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Identity, Role, User};
    use crate::testutil::can_bind_localhost;
    use anyhow::Result;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer, store: SessionStore) -> RequestGateway {
        let base = Url::parse(&server.uri()).expect("mock server uri");
        RequestGateway::new(BackendConfig::new(base), store).expect("gateway builds")
    }

    fn local_identity() -> Identity {
        Identity::Local(User {
            id: "u1".into(),
            name: "Alice".into(),
            email: "alice@example.com".into(),
            role: Role::User,
        })
    }

    #[tokio::test]
    async fn local_bearer_token_is_attached() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/profile"))
            .and(header("authorization", "Bearer local-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "message": "ok",
                "data": {"id": "u1"},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = gateway(&server, SessionStore::default());
        gateway.set_local_token(Some(SecretString::from("local-token")));

        let data: serde_json::Value = gateway
            .get_json("/auth/profile", RequestAuth::Session)
            .await?;
        assert_eq!(data["id"], "u1");
        Ok(())
    }

    #[tokio::test]
    async fn anonymous_requests_carry_no_credential() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(json!({"email": "a@b.co"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "message": "ok",
                "data": {"token": "t"},
            })))
            .mount(&server)
            .await;

        let gateway = gateway(&server, SessionStore::default());
        let _data: serde_json::Value = gateway
            .post_json("/auth/login", &json!({"email": "a@b.co"}), RequestAuth::Anonymous)
            .await?;

        let requests = server.received_requests().await.expect("recording enabled");
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("authorization"));
        Ok(())
    }

    #[tokio::test]
    async fn session_auth_without_any_provider_sends_nothing() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "message": "ok",
                "data": [],
            })))
            .mount(&server)
            .await;

        let gateway = gateway(&server, SessionStore::default());
        let _data: serde_json::Value = gateway.get_json("/users", RequestAuth::Session).await?;

        let requests = server.received_requests().await.expect("recording enabled");
        assert!(!requests[0].headers.contains_key("authorization"));
        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_response_clears_the_session() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "success": false,
                "message": "Invalid token",
            })))
            .mount(&server)
            .await;

        let store = SessionStore::default();
        store.login_success(local_identity());
        assert!(store.current().is_authenticated());

        let gateway = gateway(&server, store.clone());
        let err = gateway
            .get_json::<serde_json::Value>("/users", RequestAuth::Session)
            .await
            .expect_err("credential rejected");

        assert!(matches!(err, Error::Auth(ref message) if message == "Invalid token"));
        assert!(!store.current().is_authenticated());
        Ok(())
    }

    #[tokio::test]
    async fn validation_failures_map_field_messages() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/signup"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "success": false,
                "message": "Validation failed",
                "errors": {
                    "email": {"message": "Email already registered"},
                    "password": {"message": "Password too weak"},
                },
            })))
            .mount(&server)
            .await;

        let gateway = gateway(&server, SessionStore::default());
        let err = gateway
            .post_json::<_, serde_json::Value>(
                "/auth/signup",
                &json!({"email": "a@b.co"}),
                RequestAuth::Anonymous,
            )
            .await
            .expect_err("validation rejected");

        let Error::Validation { message, fields } = err else {
            anyhow::bail!("expected a validation error, got {err:?}");
        };
        assert_eq!(message, "Validation failed");
        assert_eq!(
            fields.get("email").map(String::as_str),
            Some("Email already registered")
        );
        assert_eq!(
            fields.get("password").map(String::as_str),
            Some("Password too weak")
        );
        Ok(())
    }

    #[tokio::test]
    async fn server_errors_keep_status_and_message() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "success": false,
                "message": "database unavailable",
            })))
            .mount(&server)
            .await;

        let gateway = gateway(&server, SessionStore::default());
        let err = gateway
            .get_json::<serde_json::Value>("/users", RequestAuth::Anonymous)
            .await
            .expect_err("server failure");
        assert!(
            matches!(err, Error::Http { status: 500, ref message } if message == "database unavailable")
        );
        Ok(())
    }

    #[tokio::test]
    async fn bodiless_success_responses_are_accepted() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/logout"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = gateway(&server, SessionStore::default());
        gateway
            .post_unit("/auth/logout", &json!({}), RequestAuth::Session)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn soft_failure_with_ok_status_is_surfaced() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/logout"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "message": "already logged out",
            })))
            .mount(&server)
            .await;

        let gateway = gateway(&server, SessionStore::default());
        let err = gateway
            .post_unit("/auth/logout", &json!({}), RequestAuth::Anonymous)
            .await
            .expect_err("soft failure");
        assert!(matches!(err, Error::UnexpectedResponse(_)));
        Ok(())
    }

    #[tokio::test]
    async fn connection_failures_become_network_errors() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind to localhost");
            return Ok(());
        }
        // Bind a port, then free it so the connection is refused.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };
        let base = Url::parse(&format!("http://127.0.0.1:{port}"))?;
        let gateway =
            RequestGateway::new(BackendConfig::new(base), SessionStore::default())?;

        let err = gateway
            .get_json::<serde_json::Value>("/users", RequestAuth::Anonymous)
            .await
            .expect_err("nothing listening");
        assert!(matches!(err, Error::Network(_)));
        Ok(())
    }
}
