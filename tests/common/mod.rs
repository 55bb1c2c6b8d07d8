#![allow(dead_code)]

use beacon_indexer::config::{BatchConfig, RetryConfig, SubscriberConfig};
use beacon_indexer::core::codec::fixtures;
use beacon_indexer::{
    BeaconIndexer, BeaconIndexerConfigBuilder, ConsensusFork, HeadConfig, InMemoryStorage,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn root(byte: u8) -> [u8; 32] {
    [byte; 32]
}

pub fn root_hex(byte: u8) -> String {
    format!("0x{}", hex::encode(root(byte)))
}

/// A block the mock node serves, addressed by slot and by root.
pub struct MockBlock {
    pub slot: u64,
    pub root: u8,
    pub parent: u8,
    pub state: u8,
}

pub struct MockNode {
    pub server: MockServer,
}

impl MockNode {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub async fn healthy(&self) {
        Mock::given(method("GET"))
            .and(path("/eth/v1/node/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/node/syncing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "head_slot": "1000",
                    "sync_distance": "0",
                    "is_syncing": false,
                    "is_optimistic": false,
                    "el_offline": false
                }
            })))
            .mount(&self.server)
            .await;
    }

    /// Serves block, state and root lookup for `block`.
    ///
    /// When `by_slot` is set the payloads are also served under the slot
    /// number, which is how batch workers ask for them.
    pub async fn block(&self, block: &MockBlock, by_slot: bool) {
        let body = fixtures::signed_block(
            ConsensusFork::Deneb,
            block.slot,
            root(block.parent),
            root(block.state),
            root(0xee),
        );
        let state = fixtures::state(block.slot);

        let mut block_ids = vec![root_hex(block.root)];
        let mut state_ids = vec![root_hex(block.state)];
        if by_slot {
            block_ids.push(block.slot.to_string());
            state_ids.push(block.slot.to_string());
        }

        for id in &block_ids {
            Mock::given(method("GET"))
                .and(path(format!("/eth/v2/beacon/blocks/{id}")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .insert_header("Eth-Consensus-Version", "deneb")
                        .set_body_bytes(body.clone()),
                )
                .mount(&self.server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/eth/v1/beacon/blocks/{id}/root")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "data": { "root": root_hex(block.root) }
                })))
                .mount(&self.server)
                .await;
        }
        for id in &state_ids {
            Mock::given(method("GET"))
                .and(path(format!("/eth/v2/debug/beacon/states/{id}")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .insert_header("Eth-Consensus-Version", "deneb")
                        .set_body_bytes(state.clone()),
                )
                .mount(&self.server)
                .await;
        }
    }

    /// Serves a valid block for `slot` but fails its state with a server error,
    /// so processing the slot errors out.
    pub async fn broken_slot(&self, slot: u64) {
        let body =
            fixtures::signed_block(ConsensusFork::Deneb, slot, root(1), root(2), root(0xee));
        Mock::given(method("GET"))
            .and(path(format!("/eth/v2/beacon/blocks/{slot}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/eth/v2/debug/beacon/states/{slot}")))
            .respond_with(ResponseTemplate::new(500))
            .mount(&self.server)
            .await;
    }

    /// Answers the block request for `id` with `status` and no body.
    pub async fn block_status(&self, id: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(format!("/eth/v2/beacon/blocks/{id}")))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Serves a block payload for `id` that ends right after its message offset.
    pub async fn truncated_block(&self, id: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/eth/v2/beacon/blocks/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![100u8, 0, 0, 0]))
            .mount(&self.server)
            .await;
    }

    /// Serves a valid block for `root` only after `delay`.
    pub async fn slow_block(&self, slot: u64, block_root: u8, delay: Duration) {
        let body = fixtures::signed_block(ConsensusFork::Deneb, slot, root(1), root(2), root(0xee));
        Mock::given(method("GET"))
            .and(path(format!("/eth/v2/beacon/blocks/{}", root_hex(block_root))))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body)
                    .set_delay(delay),
            )
            .mount(&self.server)
            .await;
    }

    /// Whether the node has seen a request for `request_path`.
    pub async fn requested(&self, request_path: &str) -> bool {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .any(|request| request.url.path() == request_path)
    }

    /// Serves `body` as the event stream of `topic`.
    pub async fn events(&self, topic: &str, body: String) {
        Mock::given(method("GET"))
            .and(path("/eth/v1/events"))
            .and(query_param("topics", topic))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&self.server)
            .await;
    }
}

pub fn head_frame(slot: u64, block: u8, state: u8) -> String {
    format!(
        "event: head\ndata: {}\n\n",
        json!({
            "slot": slot.to_string(),
            "block": root_hex(block),
            "state": root_hex(state),
            "epoch_transition": false,
            "execution_optimistic": false
        })
    )
}

pub fn fast_batch() -> BatchConfig {
    BatchConfig {
        enabled: true,
        workers: 2,
        max_consecutive_lease_errors: 5,
        lease_backoff: RetryConfig {
            max_retries: u32::MAX,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            backoff_multiplier: 1.0,
            jitter: false,
        },
        lease_ttl_secs: None,
    }
}

pub fn quiet_subscriber() -> SubscriberConfig {
    SubscriberConfig {
        idle_timeout_secs: 0,
        reconnect_delay_secs: 60,
        channel_capacity: 64,
    }
}

pub fn indexer(node: &MockNode, storage: &InMemoryStorage) -> Arc<BeaconIndexer> {
    let config = BeaconIndexerConfigBuilder::new()
        .with_node(node.uri())
        .with_database("postgresql://localhost/unused")
        .with_worker_id("test-worker")
        .with_subscriber(quiet_subscriber())
        .with_head(HeadConfig {
            enabled: true,
            dispatch_workers: 2,
            dispatch_queue_capacity: 8,
        })
        .with_historic(fast_batch())
        .with_known_gaps(fast_batch())
        .with_known_gaps_increment(100)
        .build()
        .unwrap();
    Arc::new(BeaconIndexer::new_with_storage(config, Arc::new(storage.clone())).unwrap())
}

/// Polls `check` until it returns true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
