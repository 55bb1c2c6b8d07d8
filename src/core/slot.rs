//! Fetching, decoding and writing of a single slot.

use crate::core::codec::{CodecRegistry, ConsensusFork, DecodedBlock};
use crate::core::content_key::{content_key_for_hex, format_root};
use crate::core::node::{BeaconNodeClient, SszResponse};
use crate::core::writer::DbWriter;
use crate::types::{SlotStatus, SlotWriteModel};
use crate::utils::error::{BeaconIndexerError, Result};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Identifies the slot to process.
///
/// Head events carry both roots; batch workers only know the slot number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotRequest {
    pub slot: Option<u64>,
    pub block_root: Option<String>,
    pub state_root: Option<String>,
}

impl SlotRequest {
    #[must_use]
    pub fn from_slot(slot: u64) -> Self {
        Self {
            slot: Some(slot),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_head(slot: u64, block_root: impl Into<String>, state_root: impl Into<String>) -> Self {
        Self {
            slot: Some(slot),
            block_root: Some(block_root.into()),
            state_root: Some(state_root.into()),
        }
    }

    fn block_id(&self) -> Result<String> {
        match (&self.block_root, self.slot) {
            (Some(root), _) => Ok(root.clone()),
            (None, Some(slot)) => Ok(slot.to_string()),
            (None, None) => Err(BeaconIndexerError::MissingIdentifier),
        }
    }

    fn state_id(&self) -> Result<String> {
        match (&self.state_root, self.slot) {
            (Some(root), _) => Ok(root.clone()),
            (None, Some(slot)) => Ok(slot.to_string()),
            (None, None) => Err(BeaconIndexerError::MissingIdentifier),
        }
    }
}

/// Turns a [`SlotRequest`] into a [`SlotWriteModel`] and persists it.
pub struct SlotProcessor {
    node: Arc<BeaconNodeClient>,
    codecs: Arc<CodecRegistry>,
    writer: Arc<DbWriter>,
    slots_per_epoch: u64,
}

impl SlotProcessor {
    #[must_use]
    pub fn new(
        node: Arc<BeaconNodeClient>,
        codecs: Arc<CodecRegistry>,
        writer: Arc<DbWriter>,
        slots_per_epoch: u64,
    ) -> Self {
        Self {
            node,
            codecs,
            writer,
            slots_per_epoch,
        }
    }

    #[must_use]
    pub fn writer(&self) -> &Arc<DbWriter> {
        &self.writer
    }

    /// Fetches block and state concurrently and builds the write model.
    ///
    /// The state download reports the payload version it detected through a
    /// oneshot channel; the block decode waits for it and tries that codec
    /// first. A block the node does not serve (any non-2xx answer) yields a
    /// skipped slot.
    ///
    /// # Errors
    ///
    /// - `MissingIdentifier` when the request names neither slot nor roots
    /// - `DecodingError` when the block cannot be decoded to a usable header
    /// - `NodeError`/`HttpError` when the node cannot serve the payloads
    pub async fn fetch(&self, request: &SlotRequest) -> Result<SlotWriteModel> {
        let block_id = request.block_id()?;
        let state_id = request.state_id()?;
        let (version_tx, version_rx) = oneshot::channel::<Option<ConsensusFork>>();

        let state_fut = async {
            let response = self.node.fetch_state_ssz(&state_id).await?;
            let version = match &response {
                SszResponse::Found { version, .. } => *version,
                SszResponse::Unavailable(_) => None,
            };
            // receiver only goes away when the block side already failed
            let _ = version_tx.send(version);
            Ok::<_, BeaconIndexerError>(response)
        };

        let block_fut = async {
            let response = self.node.fetch_block_ssz(&block_id).await?;
            let hint = version_rx.await.ok().flatten();
            match response {
                SszResponse::Found { bytes, .. } => {
                    let decoded = self.codecs.decode_block(&bytes, hint)?;
                    Ok::<_, BeaconIndexerError>(Ok((bytes, decoded)))
                }
                SszResponse::Unavailable(status) => Ok(Err(status)),
            }
        };

        let (state, block) = tokio::try_join!(state_fut, block_fut)?;

        let (block_ssz, decoded) = match block {
            Ok(found) => found,
            Err(status) => {
                let Some(slot) = request.slot else {
                    return Err(BeaconIndexerError::NodeError(format!(
                        "block {block_id} unavailable ({status})"
                    )));
                };
                tracing::debug!(slot, %status, "No block for slot, recording as skipped");
                return Ok(SlotWriteModel::skipped(slot, self.slots_per_epoch));
            }
        };

        let decoded = accept_decoded(decoded)?;
        let slot = request.slot.unwrap_or(decoded.summary.slot);

        let state_ssz = match state {
            SszResponse::Found { bytes, .. } => bytes,
            SszResponse::Unavailable(status) => {
                return Err(BeaconIndexerError::NodeError(format!(
                    "state {state_id} for slot {slot} unavailable ({status})"
                )));
            }
        };
        match self.codecs.decode_state_slot(&state_ssz) {
            Ok(state_slot) if state_slot != slot => {
                tracing::warn!(slot, state_slot, "State slot does not match block slot");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(slot, error = %e, "Could not read state slot"),
        }

        let block_root = match &request.block_root {
            Some(root) => root.clone(),
            None => self
                .node
                .block_root(&slot.to_string())
                .await?
                .ok_or_else(|| {
                    BeaconIndexerError::NodeError(format!("no block root for slot {slot}"))
                })?,
        };
        let state_root = match &request.state_root {
            Some(root) => root.clone(),
            None => format_root(&decoded.summary.state_root),
        };

        Ok(SlotWriteModel {
            slot,
            epoch: slot / self.slots_per_epoch,
            status: SlotStatus::Proposed,
            block_content_key: content_key_for_hex(&block_root)?,
            state_content_key: content_key_for_hex(&state_root)?,
            parent_block_root: format_root(&decoded.summary.parent_root),
            eth1_block_hash: format_root(&decoded.summary.eth1_block_hash),
            block_root,
            state_root,
            block_ssz,
            state_ssz,
        })
    }

    /// Fetches and writes a slot.
    ///
    /// # Errors
    ///
    /// See [`fetch`](Self::fetch); storage failures are propagated as well.
    pub async fn process(&self, request: &SlotRequest) -> Result<SlotWriteModel> {
        let model = self.fetch(request).await?;
        self.writer.write_full_slot(&model).await?;
        Ok(model)
    }

    /// Processes a slot known only by number and, if other roots are already
    /// stored for it, makes the node's current block canonical.
    ///
    /// # Errors
    ///
    /// See [`process`](Self::process).
    pub async fn process_slot(&self, slot: u64) -> Result<SlotWriteModel> {
        let model = self.process(&SlotRequest::from_slot(slot)).await?;
        if model.status == SlotStatus::Proposed {
            let rows = self.writer.storage().get_slots(slot).await?;
            if rows.len() > 1 {
                self.writer.write_reorgs(slot, &model.block_root).await?;
            }
        }
        Ok(model)
    }
}

/// Applies the partial-decode policy: a block whose body did not match
/// any codec is still usable when its header looks sane.
fn accept_decoded(decoded: DecodedBlock) -> Result<DecodedBlock> {
    let Some(error) = &decoded.error else {
        return Ok(decoded);
    };
    if decoded.summary.slot == 0 || decoded.summary.parent_root == [0u8; 32] {
        return Err(BeaconIndexerError::DecodingError(format!(
            "block could not be decoded: {error}"
        )));
    }
    tracing::warn!(
        slot = decoded.summary.slot,
        fork = %decoded.fork,
        error = %error,
        "Using partially decoded block"
    );
    Ok(decoded)
}
