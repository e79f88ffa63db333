use std::sync::Arc;
#[cfg(feature = "reqwest")]
use std::time::Duration;

use async_trait::async_trait;
#[cfg(feature = "reqwest")]
use reqwest::Client;

#[cfg(feature = "reqwest")]
use crate::error;
use crate::error::FetchError;

/// A publisher of key-set documents
///
/// The cache bounds every call with its own fetch timeout and cancellation,
/// so implementations need not do so.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetches the raw key-set document
    async fn fetch_key_set(&self) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl<T: KeySource + ?Sized> KeySource for Arc<T> {
    #[inline]
    async fn fetch_key_set(&self) -> Result<Vec<u8>, FetchError> {
        (**self).fetch_key_set().await
    }
}

/// A key source that fetches a key set over HTTP
#[cfg(feature = "reqwest")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
#[derive(Clone, Debug)]
pub struct HttpKeySource {
    client: Client,
    endpoint: String,
}

#[cfg(feature = "reqwest")]
impl HttpKeySource {
    /// Constructs a source for `endpoint` whose requests give up after `timeout`
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!("keyward/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(error::request_failed)?;

        Ok(Self::with_client(client, endpoint))
    }

    /// Constructs a source for `endpoint` that uses an existing client
    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// The URL the key set is fetched from
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(feature = "reqwest")]
#[async_trait]
impl KeySource for HttpKeySource {
    #[tracing::instrument(skip(self), fields(jwks.url = %self.endpoint))]
    async fn fetch_key_set(&self) -> Result<Vec<u8>, FetchError> {
        tracing::debug!("requesting key set");

        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(error::request_failed)?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                http.status_code = status.as_u16(),
                "key set request failed; unexpected response status"
            );
            return Err(FetchError::UnexpectedStatus {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(error::body_unreadable)?;
        Ok(body.to_vec())
    }
}
