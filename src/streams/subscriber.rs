//! Typed subscription to one topic of the beacon node event stream.
//!
//! Raw frames travel from a background reader task through the message
//! channel; the subscriber decodes them and forwards each result, in arrival
//! order, to the delivery channel: a typed event, or the raw payload plus
//! decode error.

use crate::config::SubscriberConfig;
use crate::core::metrics::IndexerMetrics;
use crate::core::node::BeaconNodeClient;
use crate::streams::sse::SseDecoder;
use crate::types::{BeaconEvent, EventTopic, TopicPayload};
use crate::utils::error::{BeaconIndexerError, Result};
use crate::utils::logging;
use futures_util::StreamExt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

/// A payload that could not be decoded into its topic type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub topic: EventTopic,
    pub raw: String,
    pub error: String,
}

/// One decoded frame, in the order it arrived on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<T> {
    Event(T),
    Undecodable(DecodeFailure),
}

impl<T: TopicPayload> Delivery<T> {
    /// Lifts the payload into the closed [`BeaconEvent`] sum.
    #[must_use]
    pub fn into_event(self) -> Delivery<BeaconEvent> {
        match self {
            Delivery::Event(payload) => Delivery::Event(payload.into_event()),
            Delivery::Undecodable(failure) => Delivery::Undecodable(failure),
        }
    }
}

#[derive(Debug)]
enum StreamItem {
    Data { event: Option<String>, data: String },
    Closed(Option<String>),
}

enum SubscriberState {
    Disconnected,
    Connected { reader: JoinHandle<()> },
}

/// Event-stream subscriber for the topic of `T`.
pub struct EventSubscriber<T: TopicPayload> {
    url: String,
    client: reqwest::Client,
    config: SubscriberConfig,
    metrics: Arc<IndexerMetrics>,
    state: SubscriberState,
    message_tx: mpsc::Sender<StreamItem>,
    message_rx: mpsc::Receiver<StreamItem>,
    delivery_tx: mpsc::Sender<Delivery<T>>,
    _topic: PhantomData<T>,
}

impl<T: TopicPayload> EventSubscriber<T> {
    /// Creates a disconnected subscriber and the channel its output goes to.
    #[must_use]
    pub fn new(
        node: &BeaconNodeClient,
        config: SubscriberConfig,
        metrics: Arc<IndexerMetrics>,
    ) -> (Self, mpsc::Receiver<Delivery<T>>) {
        let capacity = config.channel_capacity.max(1);
        let (message_tx, message_rx) = mpsc::channel(capacity);
        let (delivery_tx, deliveries) = mpsc::channel(capacity);

        let subscriber = Self {
            url: node.events_url(T::TOPIC),
            client: node.events_client().clone(),
            config,
            metrics,
            state: SubscriberState::Disconnected,
            message_tx,
            message_rx,
            delivery_tx,
            _topic: PhantomData,
        };
        (subscriber, deliveries)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.state, SubscriberState::Connected { .. })
    }

    /// Opens the stream and starts the background reader.
    ///
    /// # Errors
    ///
    /// Returns `BeaconIndexerError::ConnectError` if the handshake fails.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            self.disconnect().await;
        }

        logging::log(
            logging::LogLevel::Info,
            &format!("Subscribing to {} events", T::TOPIC),
        );

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                BeaconIndexerError::ConnectError(format!("{} stream: {e}", T::TOPIC))
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(BeaconIndexerError::ConnectError(format!(
                "{} stream returned {status}",
                T::TOPIC
            )));
        }

        let mut body = response.bytes_stream();
        let tx = self.message_tx.clone();
        let reader = tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let reason = loop {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        for frame in decoder.push(&chunk) {
                            let item = StreamItem::Data {
                                event: frame.event,
                                data: frame.data,
                            };
                            if tx.send(item).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            let _ = tx.send(StreamItem::Closed(reason)).await;
        });

        self.state = SubscriberState::Connected { reader };
        logging::log(
            logging::LogLevel::Success,
            &format!("Subscribed to {} events", T::TOPIC),
        );
        Ok(())
    }

    /// Stops the reader and drains the message channel.
    ///
    /// Frames already read are still decoded and forwarded, so nothing that
    /// arrived before the disconnect is lost.
    pub async fn disconnect(&mut self) {
        if let SubscriberState::Connected { reader } =
            std::mem::replace(&mut self.state, SubscriberState::Disconnected)
        {
            reader.abort();
            let _ = reader.await;
        }

        while let Ok(item) = self.message_rx.try_recv() {
            if let StreamItem::Data { event, data } = item {
                self.handle_message(event, data).await;
            }
        }
    }

    /// Connects, then forwards events until `token` is cancelled or the
    /// consumer drops the delivery channel. Stream ends, stream errors and idle
    /// periods longer than the configured timeout trigger a reconnect.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError` if the initial connection fails.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        self.connect().await?;

        loop {
            let idle = self.config.idle_timeout();
            let watchdog = async move {
                match idle {
                    Some(timeout) => sleep(timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                () = token.cancelled() => break,
                item = self.message_rx.recv() => match item {
                    Some(StreamItem::Data { event, data }) => {
                        if !self.handle_message(event, data).await {
                            break;
                        }
                    }
                    Some(StreamItem::Closed(reason)) => {
                        tracing::warn!(
                            topic = %T::TOPIC,
                            reason = reason.as_deref().unwrap_or("end of stream"),
                            "Event stream closed"
                        );
                        self.reconnect(&token).await;
                    }
                    None => break,
                },
                () = watchdog => {
                    tracing::warn!(topic = %T::TOPIC, ?idle, "No events within idle timeout");
                    self.reconnect(&token).await;
                }
            }
        }

        self.disconnect().await;
        Ok(())
    }

    async fn reconnect(&mut self, token: &CancellationToken) {
        IndexerMetrics::inc(&self.metrics.subscriber_reconnects);
        self.disconnect().await;

        let delay = Duration::from_secs(self.config.reconnect_delay_secs);
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                () = sleep(delay) => {}
            }
            match self.connect().await {
                Ok(()) => return,
                Err(e) => tracing::warn!(topic = %T::TOPIC, error = %e, "Reconnect failed"),
            }
        }
    }

    /// Decodes one payload. Returns `false` once the consumer is gone.
    async fn handle_message(&self, event: Option<String>, data: String) -> bool {
        if let Some(event) = event.as_deref()
            && event != T::TOPIC.as_str()
        {
            tracing::debug!(topic = %T::TOPIC, event, "Ignoring frame for another topic");
            return true;
        }
        if data.trim().is_empty() {
            return true;
        }

        let delivery = match serde_json::from_str::<T>(&data) {
            Ok(payload) => Delivery::Event(payload),
            Err(e) => {
                IndexerMetrics::inc(&self.metrics.decode_failures);
                tracing::warn!(topic = %T::TOPIC, error = %e, "Undecodable event payload");
                Delivery::Undecodable(DecodeFailure {
                    topic: T::TOPIC,
                    raw: data,
                    error: e.to_string(),
                })
            }
        };
        self.delivery_tx.send(delivery).await.is_ok()
    }
}
