//! Remote system connection settings.

use serde::Deserialize;
use url::Url;

use moldap_common::{Error, Result, Secret};

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    /// GraphQL endpoint, e.g. `http://mo:5000/graphql/v22`.
    pub graphql_url: Url,
    /// OAuth2 token endpoint of the auth server realm.
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: Secret,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl RemoteSettings {
    /// # Errors
    /// - `Configuration` for a non-HTTP URL or empty client credentials
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [("graphql_url", &self.graphql_url), ("token_url", &self.token_url)] {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::Configuration(format!(
                    "{} must be an http(s) URL, got {}",
                    name, url
                )));
            }
        }
        if self.client_id.trim().is_empty() || self.client_secret.is_empty() {
            return Err(Error::Configuration(
                "client_id and client_secret are required".to_string(),
            ));
        }
        Ok(())
    }
}
