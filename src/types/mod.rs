//! Event payloads and persisted models.

pub mod events;
pub mod models;

pub use events::{
    BeaconEvent, ChainReorgEvent, EventTopic, FinalizedCheckpointEvent, HeadEvent, TopicPayload,
};
pub use models::{
    BeaconStateRecord, GapQueue, GapRange, NewKnownGap, ProcessingError, ReorgOutcome,
    SignedBlockRecord, SlotRecord, SlotStatus, SlotWriteModel,
};
