//! Backend and identity-provider configuration. Values come from the host
//! application or from `ENSALUTI_*` environment variables; redirect landing
//! URIs default to well-known paths under the application origin.

use std::env;

use url::Url;

use crate::error::Error;

const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1";
const DEFAULT_REDIRECT_PATH: &str = "/dashboard";
const DEFAULT_POST_LOGOUT_PATH: &str = "/login";
const DEFAULT_SILENT_CHECK_PATH: &str = "/silent-check-sso.html";

const ENV_API_URL: &str = "ENSALUTI_API_URL";
const ENV_IDP_URL: &str = "ENSALUTI_IDP_URL";
const ENV_IDP_REALM: &str = "ENSALUTI_IDP_REALM";
const ENV_IDP_CLIENT_ID: &str = "ENSALUTI_IDP_CLIENT_ID";
const ENV_APP_ORIGIN: &str = "ENSALUTI_APP_ORIGIN";

/// Base URL of the canonical user backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    base_url: Url,
}

impl BackendConfig {
    #[must_use]
    pub const fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    /// Reads `ENSALUTI_API_URL`, falling back to the development default.
    pub fn from_env() -> Result<Self, Error> {
        let raw = env::var(ENV_API_URL).unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let base_url = parse_url(ENV_API_URL, &raw)?;
        Ok(Self::new(base_url))
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Joins a path onto the base URL, tolerating slashes on either side.
    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|err| Error::Config(format!("invalid endpoint for {path}: {err}")))
    }
}

/// Connection settings for the external OIDC provider.
///
/// `server_url` is the provider base (the realm lives under
/// `/realms/<realm>`); the three landing URIs are pages the host serves and
/// default to conventional paths under `app_origin`.
#[derive(Debug, Clone)]
pub struct IdpConfig {
    server_url: Url,
    realm: String,
    client_id: String,
    redirect_uri: Url,
    post_logout_redirect_uri: Url,
    silent_check_uri: Url,
}

impl IdpConfig {
    pub fn new(
        server_url: Url,
        realm: impl Into<String>,
        client_id: impl Into<String>,
        app_origin: &Url,
    ) -> Result<Self, Error> {
        let realm = realm.into();
        let client_id = client_id.into();
        if realm.trim().is_empty() {
            return Err(Error::Config("identity provider realm is empty".into()));
        }
        if client_id.trim().is_empty() {
            return Err(Error::Config("identity provider client id is empty".into()));
        }
        Ok(Self {
            server_url,
            realm,
            client_id,
            redirect_uri: join_origin(app_origin, DEFAULT_REDIRECT_PATH)?,
            post_logout_redirect_uri: join_origin(app_origin, DEFAULT_POST_LOGOUT_PATH)?,
            silent_check_uri: join_origin(app_origin, DEFAULT_SILENT_CHECK_PATH)?,
        })
    }

    /// Reads `ENSALUTI_IDP_URL`, `ENSALUTI_IDP_REALM`,
    /// `ENSALUTI_IDP_CLIENT_ID` and `ENSALUTI_APP_ORIGIN`.
    pub fn from_env() -> Result<Self, Error> {
        let server_url = parse_url(ENV_IDP_URL, &require_env(ENV_IDP_URL)?)?;
        let realm = require_env(ENV_IDP_REALM)?;
        let client_id = require_env(ENV_IDP_CLIENT_ID)?;
        let app_origin = parse_url(ENV_APP_ORIGIN, &require_env(ENV_APP_ORIGIN)?)?;
        Self::new(server_url, realm, client_id, &app_origin)
    }

    /// Landing URI after an interactive login or registration.
    #[must_use]
    pub fn with_redirect_uri(mut self, uri: Url) -> Self {
        self.redirect_uri = uri;
        self
    }

    /// Landing URI after the provider ends its session.
    #[must_use]
    pub fn with_post_logout_redirect_uri(mut self, uri: Url) -> Self {
        self.post_logout_redirect_uri = uri;
        self
    }

    /// Static page used by the provider for non-interactive session checks.
    #[must_use]
    pub fn with_silent_check_uri(mut self, uri: Url) -> Self {
        self.silent_check_uri = uri;
        self
    }

    #[must_use]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    #[must_use]
    pub const fn post_logout_redirect_uri(&self) -> &Url {
        &self.post_logout_redirect_uri
    }

    #[must_use]
    pub const fn silent_check_uri(&self) -> &Url {
        &self.silent_check_uri
    }

    /// Realm discovery document location.
    pub(crate) fn discovery_url(&self) -> Result<Url, Error> {
        let base = self.server_url.as_str().trim_end_matches('/');
        Url::parse(&format!(
            "{base}/realms/{}/.well-known/openid-configuration",
            self.realm
        ))
        .map_err(|err| Error::Config(format!("invalid discovery url: {err}")))
    }
}

fn require_env(name: &str) -> Result<String, Error> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::Config(format!("{name} is not set"))),
    }
}

fn parse_url(name: &str, raw: &str) -> Result<Url, Error> {
    Url::parse(raw.trim()).map_err(|err| Error::Config(format!("{name} is not a valid URL: {err}")))
}

fn join_origin(origin: &Url, path: &str) -> Result<Url, Error> {
    origin
        .join(path)
        .map_err(|err| Error::Config(format!("cannot derive {path} from app origin: {err}")))
}
