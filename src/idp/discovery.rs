//! OIDC discovery document fetch.

use reqwest::Client;
use serde::Deserialize;
use tracing::{Instrument, info_span};
use url::Url;

use crate::error::Error;

/// The subset of `/.well-known/openid-configuration` this crate uses.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    #[serde(default)]
    pub userinfo_endpoint: Option<Url>,
    #[serde(default)]
    pub end_session_endpoint: Option<Url>,
}

pub(crate) async fn fetch(client: &Client, url: Url) -> Result<DiscoveryDocument, Error> {
    let span = info_span!("idp.discovery", http.method = "GET", url = %url);
    async move {
        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                message: "discovery document fetch failed".into(),
            });
        }
        response
            .json::<DiscoveryDocument>()
            .await
            .map_err(|err| Error::UnexpectedResponse(format!("invalid discovery document: {err}")))
    }
    .instrument(span)
    .await
}
