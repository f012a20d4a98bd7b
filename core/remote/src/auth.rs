//! OAuth2 client-credentials token management.

use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{ClientId, ClientSecret, TokenResponse, TokenUrl};
use tokio::sync::RwLock;
use tracing::info;

use moldap_common::{Error, Result, Secret};

use crate::config::RemoteSettings;

/// Seconds before expiry at which a token is considered stale.
const REFRESH_MARGIN_SECS: i64 = 30;

/// An access token with expiration tracking.
#[derive(Debug, Clone)]
pub struct Tokens {
    pub access_token: Secret,
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Expired, or expiring within the refresh margin.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

enum Source {
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: Secret,
        http: oauth2::reqwest::Client,
    },
    Fixed,
}

/// Token manager that fetches a new token shortly before the current one
/// expires.
pub struct TokenManager {
    source: Source,
    tokens: RwLock<Option<Tokens>>,
}

impl TokenManager {
    /// Token manager using the client-credentials grant.
    ///
    /// # Errors
    /// - `Configuration` if the HTTP client cannot be built
    pub fn new(settings: &RemoteSettings) -> Result<Self> {
        let http = oauth2::reqwest::Client::builder()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build token client: {}", e)))?;
        Ok(Self {
            source: Source::ClientCredentials {
                token_url: settings.token_url.to_string(),
                client_id: settings.client_id.clone(),
                client_secret: settings.client_secret.clone(),
                http,
            },
            tokens: RwLock::new(None),
        })
    }

    /// Token manager handing out a fixed token that never expires.
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            source: Source::Fixed,
            tokens: RwLock::new(Some(Tokens {
                access_token: Secret::new(token),
                expires_at: DateTime::<Utc>::MAX_UTC,
            })),
        }
    }

    /// Get a valid access token, fetching a new one if necessary.
    ///
    /// # Errors
    /// - `Transport` if the token endpoint cannot be reached or refuses
    pub async fn access_token(&self) -> Result<Secret> {
        {
            let tokens = self.tokens.read().await;
            if let Some(tokens) = tokens.as_ref().filter(|t| !t.is_expired()) {
                return Ok(tokens.access_token.clone());
            }
        }

        let mut tokens = self.tokens.write().await;
        if let Some(current) = tokens.as_ref().filter(|t| !t.is_expired()) {
            return Ok(current.access_token.clone());
        }

        info!("Fetching access token");
        let fresh = self.fetch().await?;
        let token = fresh.access_token.clone();
        *tokens = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token, e.g. after the API answered 401.
    pub async fn invalidate(&self) {
        if matches!(self.source, Source::ClientCredentials { .. }) {
            *self.tokens.write().await = None;
        }
    }

    async fn fetch(&self) -> Result<Tokens> {
        let Source::ClientCredentials {
            token_url,
            client_id,
            client_secret,
            http,
        } = &self.source
        else {
            return Err(Error::Configuration("Fixed token has no source".to_string()));
        };

        let client = BasicClient::new(ClientId::new(client_id.clone()))
            .set_client_secret(ClientSecret::new(client_secret.expose().to_string()))
            .set_token_uri(
                TokenUrl::new(token_url.clone())
                    .map_err(|e| Error::Configuration(format!("Invalid token URL: {}", e)))?,
            );

        let response = client
            .exchange_client_credentials()
            .request_async(http)
            .await
            .map_err(|e| Error::Transport(format!("Token request failed: {}", e)))?;

        let expires_in = response
            .expires_in()
            .unwrap_or_else(|| std::time::Duration::from_secs(300));
        let expires_at =
            Utc::now() + Duration::from_std(expires_in).unwrap_or_else(|_| Duration::minutes(5));

        Ok(Tokens {
            access_token: Secret::new(response.access_token().secret().clone()),
            expires_at,
        })
    }
}
