//! Bearer token cache shared by the OAuth-based connectors
//!
//! The cache holds one access token per connector instance. Refresh happens
//! under the cache's mutex, so concurrent callers trigger a single token
//! request and reuse its result.

use serde::{Deserialize, Deserializer};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::ingestion::ClassifiedError;

/// A bearer token and its expiry
#[derive(Clone)]
pub struct AccessToken {
    /// Raw token
    pub token: String,
    /// Instant after which the token is invalid
    pub expires_at: Instant,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// OAuth2 token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Lifetime in seconds; some endpoints send it as a string
    #[serde(deserialize_with = "number_or_string", default = "default_expires_in")]
    pub expires_in: u64,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Convert into a cached token starting now
    pub fn into_access_token(self) -> AccessToken {
        AccessToken {
            token: self.access_token,
            expires_at: Instant::now() + Duration::from_secs(self.expires_in),
        }
    }
}

fn default_expires_in() -> u64 {
    3600
}

fn number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Single-token cache with proactive refresh
#[derive(Debug)]
pub struct TokenCache {
    token: Mutex<Option<AccessToken>>,
    refresh_threshold: Duration,
}

impl TokenCache {
    /// Refresh tokens once they are within `refresh_threshold` of expiry
    pub fn new(refresh_threshold: Duration) -> Self {
        Self {
            token: Mutex::new(None),
            refresh_threshold,
        }
    }

    /// Return the cached token, calling `refresh` first if it is missing or
    /// about to expire. Refresh errors are returned unchanged.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<String, ClassifiedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken, ClassifiedError>>,
    {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if Instant::now() + self.refresh_threshold < token.expires_at {
                return Ok(token.token.clone());
            }
            debug!("Access token within refresh threshold, refreshing");
        }

        let fresh = refresh().await?;
        let value = fresh.token.clone();
        *guard = Some(fresh);
        Ok(value)
    }

    /// Drop the cached token (after the provider rejected it)
    pub async fn invalidate(&self) {
        *self.token.lock().await = None;
    }

    /// Whether a token is cached, regardless of expiry
    pub async fn is_cached(&self) -> bool {
        self.token.lock().await.is_some()
    }
}
