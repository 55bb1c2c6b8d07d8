//! Typed payloads of the beacon node event stream.
//!
//! Each subscribed topic decodes into its own struct; [`BeaconEvent`] is the
//! closed sum of all of them.

use crate::utils::error::{BeaconIndexerError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event-stream topics the indexer subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    Head,
    ChainReorg,
    FinalizedCheckpoint,
}

impl EventTopic {
    /// Topic name as used in the `topics` query parameter.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::Head => "head",
            EventTopic::ChainReorg => "chain_reorg",
            EventTopic::FinalizedCheckpoint => "finalized_checkpoint",
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `head` topic payload.
///
/// `slot` stays a string: the head tracker owns parsing so that malformed
/// slots are counted as bad head messages instead of being dropped here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadEvent {
    pub slot: String,
    pub block: String,
    pub state: String,
    #[serde(default)]
    pub current_duty_dependent_root: String,
    #[serde(default)]
    pub previous_duty_dependent_root: String,
    #[serde(default)]
    pub epoch_transition: bool,
    #[serde(default)]
    pub execution_optimistic: bool,
}

/// `chain_reorg` topic payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReorgEvent {
    pub slot: String,
    pub depth: String,
    pub old_head_block: String,
    pub new_head_block: String,
    pub old_head_state: String,
    pub new_head_state: String,
    pub epoch: String,
    #[serde(default)]
    pub execution_optimistic: bool,
}

/// `finalized_checkpoint` topic payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedCheckpointEvent {
    pub block: String,
    pub state: String,
    pub epoch: String,
    #[serde(default)]
    pub execution_optimistic: bool,
}

/// Every event the indexer understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconEvent {
    Head(HeadEvent),
    ChainReorg(ChainReorgEvent),
    FinalizedCheckpoint(FinalizedCheckpointEvent),
}

impl BeaconEvent {
    /// Topic this event was received on.
    #[must_use]
    pub fn topic(&self) -> EventTopic {
        match self {
            BeaconEvent::Head(_) => EventTopic::Head,
            BeaconEvent::ChainReorg(_) => EventTopic::ChainReorg,
            BeaconEvent::FinalizedCheckpoint(_) => EventTopic::FinalizedCheckpoint,
        }
    }
}

/// A payload type bound to exactly one topic.
pub trait TopicPayload: DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    const TOPIC: EventTopic;

    fn into_event(self) -> BeaconEvent;
}

impl TopicPayload for HeadEvent {
    const TOPIC: EventTopic = EventTopic::Head;

    fn into_event(self) -> BeaconEvent {
        BeaconEvent::Head(self)
    }
}

impl TopicPayload for ChainReorgEvent {
    const TOPIC: EventTopic = EventTopic::ChainReorg;

    fn into_event(self) -> BeaconEvent {
        BeaconEvent::ChainReorg(self)
    }
}

impl TopicPayload for FinalizedCheckpointEvent {
    const TOPIC: EventTopic = EventTopic::FinalizedCheckpoint;

    fn into_event(self) -> BeaconEvent {
        BeaconEvent::FinalizedCheckpoint(self)
    }
}

/// Parses a decimal quantity as the beacon API encodes it (`"1234"`).
///
/// # Errors
///
/// Returns `BeaconIndexerError::DecodingError` naming `field` on failure.
pub fn parse_quantity(field: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|e| {
        BeaconIndexerError::DecodingError(format!("invalid {field} '{raw}': {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_event_deserialization() {
        let json_data = r#"{
            "slot": "10",
            "block": "0x9a2fefd2fdb57f74993c7780ea5b9030d2897b615b89f808011ca5aebed54eaf",
            "state": "0x600e852a08c1200654ddf11025f1ceacb3c2e74bdd5c630cde0838b2591b69f9",
            "epoch_transition": false,
            "previous_duty_dependent_root": "0x5e0043f107cb57913498fbf2f99ff55e730bf1e151f02f221e977c91a90a0e91",
            "current_duty_dependent_root": "0x5e0043f107cb57913498fbf2f99ff55e730bf1e151f02f221e977c91a90a0e91",
            "execution_optimistic": false
        }"#;

        let event: HeadEvent = serde_json::from_str(json_data).unwrap();
        assert_eq!(event.slot, "10");
        assert!(event.block.starts_with("0x9a2f"));
        assert_eq!(event.clone().into_event().topic(), EventTopic::Head);
    }

    #[test]
    fn test_chain_reorg_deserialization() {
        let json_data = r#"{
            "slot": "200",
            "depth": "50",
            "old_head_block": "0x01",
            "new_head_block": "0x02",
            "old_head_state": "0x03",
            "new_head_state": "0x04",
            "epoch": "2",
            "execution_optimistic": false
        }"#;

        let event: ChainReorgEvent = serde_json::from_str(json_data).unwrap();
        assert_eq!(parse_quantity("depth", &event.depth).unwrap(), 50);
        assert_eq!(ChainReorgEvent::TOPIC.as_str(), "chain_reorg");
    }

    #[test]
    fn test_finalized_checkpoint_missing_optional_field() {
        let json_data = r#"{"block": "0x01", "state": "0x02", "epoch": "7"}"#;
        let event: FinalizedCheckpointEvent = serde_json::from_str(json_data).unwrap();
        assert!(!event.execution_optimistic);
        assert_eq!(
            event.into_event().topic().to_string(),
            "finalized_checkpoint"
        );
    }

    #[test]
    fn test_parse_quantity_rejects_garbage() {
        assert!(parse_quantity("slot", "abc").is_err());
        assert_eq!(parse_quantity("slot", " 42 ").unwrap(), 42);
    }
}
