//! Client side of the pairing exchange

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use super::{PairRequest, PairResponse};
use crate::{Error, Result};

/// Path of the pairing endpoint on the peer operator
pub const PAIR_PATH: &str = "/api/v1/pair";

/// Timeout for one pairing exchange
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport to the peer operator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Send our ready replicas and receive the peer's
    async fn exchange(&self, request: &PairRequest) -> Result<PairResponse>;
}

/// JSON-over-HTTP client for the peer operator
#[derive(Clone, Debug)]
pub struct HttpPeerClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPeerClient {
    /// Create a client for the peer operator at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(base_url, client))
    }

    /// Create a client with a custom HTTP client
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Full URL of the pairing endpoint
    pub fn pair_url(&self) -> String {
        format!("{}{PAIR_PATH}", self.base_url)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn exchange(&self, request: &PairRequest) -> Result<PairResponse> {
        let url = self.pair_url();
        debug!(%url, app = %request.app, replica_type = %request.replica_type, "sending pairing request");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::pairing(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%url, %status, "peer rejected pairing request");
            return Err(Error::pairing(format!("peer returned HTTP {status}: {body}")));
        }

        response
            .json::<PairResponse>()
            .await
            .map_err(|e| Error::protocol(format!("invalid pairing response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_url_joins_without_double_slash() {
        let client = HttpPeerClient::new("http://peer:8081/").unwrap();
        assert_eq!(client.pair_url(), "http://peer:8081/api/v1/pair");
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_pairing_error() {
        // Port 9 (discard) on localhost is closed in test environments
        let client = HttpPeerClient::new("http://127.0.0.1:9").unwrap();
        let request = PairRequest {
            app: "mnist".into(),
            replica_type: crate::crd::ReplicaType::worker(),
            local: vec![],
        };
        let err = client.exchange(&request).await.unwrap_err();
        assert!(matches!(err, Error::Pairing(_)));
        assert!(err.is_retryable());
    }
}
