//! HTTP client for the beacon node API.

use crate::config::NodeConfig;
use crate::core::codec::ConsensusFork;
use crate::types::EventTopic;
use crate::types::events::parse_quantity;
use crate::utils::error::{BeaconIndexerError, Result};
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Fail fast if the node is unreachable.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const CONSENSUS_VERSION_HEADER: &str = "Eth-Consensus-Version";
const SSZ_MEDIA_TYPE: &str = "application/octet-stream";

/// Envelope every JSON response of the beacon API is wrapped in.
#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct SyncingData {
    head_slot: String,
    sync_distance: String,
    is_syncing: bool,
}

#[derive(Debug, Deserialize)]
struct RootData {
    root: String,
}

/// `/eth/v1/node/syncing` as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub head_slot: u64,
    pub sync_distance: u64,
    pub is_syncing: bool,
}

/// Result of an SSZ download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SszResponse {
    /// Payload plus the version the node declared for it.
    Found {
        bytes: Bytes,
        version: Option<ConsensusFork>,
    },
    /// The node answered with a non-success status.
    Unavailable(StatusCode),
}

/// Beacon node HTTP API client.
///
/// One client is shared by every processing mode; `reqwest::Client` pools
/// connections internally.
#[derive(Debug, Clone)]
pub struct BeaconNodeClient {
    base_url: String,
    client: Client,
    events_client: Client,
    block_path: String,
    state_path: String,
    request_timeout: Option<Duration>,
}

impl BeaconNodeClient {
    /// Creates a client from the node configuration.
    ///
    /// # Errors
    ///
    /// Returns `BeaconIndexerError::HttpError` if the TLS backend cannot be initialised.
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        // no request timeout: event streams stay open indefinitely
        let events_client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            events_client,
            block_path: config.block_path.trim_end_matches('/').to_string(),
            state_path: config.state_path.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Client to use for long-lived event streams.
    #[must_use]
    pub fn events_client(&self) -> &Client {
        &self.events_client
    }

    /// Event-stream URL for one topic.
    #[must_use]
    pub fn events_url(&self, topic: EventTopic) -> String {
        format!("{}/eth/v1/events?topics={}", self.base_url, topic.as_str())
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}{path}", self.base_url));
        match self.request_timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    }

    /// `GET /eth/v1/node/health`; any non-success status is an error.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` on transport failure and `NodeError` when unhealthy.
    pub async fn health(&self) -> Result<()> {
        let response = self.get("/eth/v1/node/health").send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BeaconIndexerError::NodeError(format!(
                "health check returned {status}"
            )))
        }
    }

    /// `GET /eth/v1/node/syncing`.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` on transport or status failure, `DecodingError` on
    /// a malformed body.
    pub async fn syncing(&self) -> Result<SyncStatus> {
        let envelope: DataEnvelope<SyncingData> = self
            .get("/eth/v1/node/syncing")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let data = envelope.data;
        Ok(SyncStatus {
            head_slot: parse_quantity("head_slot", &data.head_slot)?,
            sync_distance: parse_quantity("sync_distance", &data.sync_distance)?,
            is_syncing: data.is_syncing,
        })
    }

    /// `GET /eth/v1/beacon/blocks/{block_id}/root`; `None` when the node has
    /// no block for the id.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` on transport failure and `NodeError` on unexpected statuses.
    pub async fn block_root(&self, block_id: &str) -> Result<Option<String>> {
        let response = self
            .get(&format!("/eth/v1/beacon/blocks/{block_id}/root"))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let envelope: DataEnvelope<RootData> = response.json().await?;
                Ok(Some(envelope.data.root))
            }
            status => Err(BeaconIndexerError::NodeError(format!(
                "block root lookup for {block_id} returned {status}"
            ))),
        }
    }

    /// Downloads a `SignedBeaconBlock` as SSZ.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` on transport failure.
    pub async fn fetch_block_ssz(&self, block_id: &str) -> Result<SszResponse> {
        self.fetch_ssz(&format!("{}/{block_id}", self.block_path))
            .await
    }

    /// Downloads a `BeaconState` as SSZ.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` on transport failure.
    pub async fn fetch_state_ssz(&self, state_id: &str) -> Result<SszResponse> {
        self.fetch_ssz(&format!("{}/{state_id}", self.state_path))
            .await
    }

    async fn fetch_ssz(&self, path: &str) -> Result<SszResponse> {
        let response = self
            .get(path)
            .header(reqwest::header::ACCEPT, SSZ_MEDIA_TYPE)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(path, %status, "SSZ payload unavailable");
            return Ok(SszResponse::Unavailable(status));
        }

        let version = response
            .headers()
            .get(CONSENSUS_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| ConsensusFork::from_str(v).ok());
        let bytes = response.bytes().await?;

        Ok(SszResponse::Found { bytes, version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BeaconIndexerConfigBuilder;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> BeaconNodeClient {
        let config = BeaconIndexerConfigBuilder::new()
            .with_node(server.uri())
            .with_database("postgresql://localhost/unused")
            .build()
            .unwrap();
        BeaconNodeClient::new(&config.node).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_syncing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/node/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/node/syncing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "head_slot": "120",
                    "sync_distance": "0",
                    "is_syncing": false,
                    "is_optimistic": false
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.health().await.unwrap();
        let status = client.syncing().await.unwrap();
        assert_eq!(status.head_slot, 120);
        assert!(!status.is_syncing);
    }

    #[tokio::test]
    async fn test_unhealthy_node() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/node/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(matches!(
            client.health().await,
            Err(BeaconIndexerError::NodeError(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_ssz_reads_version_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eth/v2/debug/beacon/states/10"))
            .and(header("accept", SSZ_MEDIA_TYPE))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(CONSENSUS_VERSION_HEADER, "deneb")
                    .set_body_bytes(vec![1u8, 2, 3]),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/eth/v2/beacon/blocks/11"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(
            client.fetch_state_ssz("10").await.unwrap(),
            SszResponse::Found {
                bytes: Bytes::from_static(&[1, 2, 3]),
                version: Some(ConsensusFork::Deneb),
            }
        );
        assert_eq!(
            client.fetch_block_ssz("11").await.unwrap(),
            SszResponse::Unavailable(StatusCode::NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn test_block_root_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/beacon/blocks/5/root"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "root": "0xabc" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.block_root("5").await.unwrap().as_deref(), Some("0xabc"));
        assert_eq!(client.block_root("6").await.unwrap(), None);
        assert_eq!(
            client.events_url(EventTopic::Head),
            format!("{}/eth/v1/events?topics=head", server.uri())
        );
    }
}
