//! Access tokens for the Salesforce REST API

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::SalesforceConfig;

/// Lifetime of a cached token
pub const TOKEN_TTL: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token endpoint returned status {0}")]
    Status(u16),

    #[error("Missing setting {0}")]
    Missing(&'static str),
}

/// Bearer token and the instance it is valid for
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub instance_url: String,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"***")
            .field("instance_url", &self.instance_url)
            .finish()
    }
}

#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// A usable token. Never fails: when no token can be obtained the token
    /// string is empty and the next API call is rejected with 401.
    async fn token(&self) -> AccessToken;
}

/// Fixed token, for local runs against a known session
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: AccessToken,
}

impl StaticTokenProvider {
    pub fn new(access_token: impl Into<String>, instance_url: impl Into<String>) -> Self {
        Self {
            token: AccessToken {
                access_token: access_token.into(),
                instance_url: instance_url.into(),
            },
        }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn token(&self) -> AccessToken {
        self.token.clone()
    }
}

/// OAuth2 client credentials grant with retry and a short-lived cache
pub struct ClientCredentialsTokenProvider {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    fallback_instance_url: String,
    attempts: u32,
    backoff: Duration,
    cached: Mutex<Option<(AccessToken, Instant)>>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(config: &SalesforceConfig) -> Result<Self, TokenError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("eventlog-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            token_url: config
                .token_url
                .clone()
                .ok_or(TokenError::Missing("SF_TOKEN_URL"))?,
            client_id: config
                .client_id
                .clone()
                .ok_or(TokenError::Missing("SF_CLIENT_ID"))?,
            client_secret: config
                .client_secret
                .clone()
                .ok_or(TokenError::Missing("SF_CLIENT_SECRET"))?,
            fallback_instance_url: config.instance_url.clone().unwrap_or_default(),
            attempts: config.token_attempts.max(1),
            backoff: config.token_backoff(),
            cached: Mutex::new(None),
        })
    }

    async fn request(&self) -> Result<AccessToken, TokenError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::Status(status.as_u16()));
        }
        Ok(response.json::<AccessToken>().await?)
    }
}

#[async_trait]
impl AccessTokenProvider for ClientCredentialsTokenProvider {
    async fn token(&self) -> AccessToken {
        let mut cached = self.cached.lock().await;
        if let Some((token, fetched_at)) = cached.as_ref() {
            if fetched_at.elapsed() < TOKEN_TTL {
                return token.clone();
            }
        }

        for attempt in 1..=self.attempts {
            match self.request().await {
                Ok(token) => {
                    debug!(instance_url = %token.instance_url, "Obtained access token");
                    *cached = Some((token.clone(), Instant::now()));
                    return token;
                },
                Err(e) => {
                    warn!(attempt, attempts = self.attempts, error = %e, "Token request failed");
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                },
            }
        }

        error!(attempts = self.attempts, "Giving up on access token");
        let instance_url = cached
            .as_ref()
            .map(|(token, _)| token.instance_url.clone())
            .unwrap_or_else(|| self.fallback_instance_url.clone());
        AccessToken {
            access_token: String::new(),
            instance_url,
        }
    }
}
