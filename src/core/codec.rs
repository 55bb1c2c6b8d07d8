//! SSZ payload codecs for every consensus fork.
//!
//! Only the fields the indexer persists are decoded. Forks share the
//! `SignedBeaconBlock` header layout and differ in the fixed part of the
//! block body, so a codec recognises "its" payload by the first variable
//! offset of the body, which always equals the fixed-part length.

use crate::utils::error::{BeaconIndexerError, Result};
use ssz::Decode;
use std::fmt;
use std::str::FromStr;

/// `SignedBeaconBlock`: message offset followed by the BLS signature.
const SIGNED_BLOCK_FIXED_LEN: usize = 4 + 96;
/// `BeaconBlock`: slot, proposer index, parent root, state root, body offset.
const BLOCK_FIXED_LEN: usize = 8 + 8 + 32 + 32 + 4;
/// `randao_reveal` then `eth1_data { deposit_root, deposit_count, block_hash }`.
const ETH1_BLOCK_HASH_OFFSET: usize = 96 + 32 + 8;
/// `randao_reveal`, `eth1_data`, `graffiti`.
const BODY_COMMON_FIXED_LEN: usize = 96 + 72 + 32;
/// `BeaconState`: genesis time and validators root precede the slot.
const STATE_SLOT_OFFSET: usize = 8 + 32;

/// Consensus forks a payload may be encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConsensusFork {
    Phase0,
    Altair,
    Bellatrix,
    Capella,
    Deneb,
    Electra,
}

impl ConsensusFork {
    /// Every supported fork, newest first.
    #[must_use]
    pub fn all() -> Vec<ConsensusFork> {
        vec![
            ConsensusFork::Electra,
            ConsensusFork::Deneb,
            ConsensusFork::Capella,
            ConsensusFork::Bellatrix,
            ConsensusFork::Altair,
            ConsensusFork::Phase0,
        ]
    }

    /// Name as sent in the `Eth-Consensus-Version` header.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusFork::Phase0 => "phase0",
            ConsensusFork::Altair => "altair",
            ConsensusFork::Bellatrix => "bellatrix",
            ConsensusFork::Capella => "capella",
            ConsensusFork::Deneb => "deneb",
            ConsensusFork::Electra => "electra",
        }
    }

    /// Length of the fixed part of `BeaconBlockBody`.
    #[must_use]
    pub fn body_fixed_len(&self) -> usize {
        // proposer_slashings, attester_slashings, attestations, deposits, voluntary_exits
        let phase0 = BODY_COMMON_FIXED_LEN + 5 * 4;
        // sync_aggregate: 512 participation bits and a signature
        let altair = phase0 + 64 + 96;
        match self {
            ConsensusFork::Phase0 => phase0,
            ConsensusFork::Altair => altair,
            // execution_payload
            ConsensusFork::Bellatrix => altair + 4,
            // bls_to_execution_changes
            ConsensusFork::Capella => altair + 8,
            // blob_kzg_commitments
            ConsensusFork::Deneb => altair + 12,
            // execution_requests
            ConsensusFork::Electra => altair + 16,
        }
    }
}

impl fmt::Display for ConsensusFork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsensusFork {
    type Err = BeaconIndexerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "phase0" => Ok(ConsensusFork::Phase0),
            "altair" => Ok(ConsensusFork::Altair),
            "bellatrix" => Ok(ConsensusFork::Bellatrix),
            "capella" => Ok(ConsensusFork::Capella),
            "deneb" => Ok(ConsensusFork::Deneb),
            "electra" => Ok(ConsensusFork::Electra),
            other => Err(BeaconIndexerError::ConfigError(format!(
                "Unknown consensus fork '{other}'"
            ))),
        }
    }
}

/// Block fields the indexer persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockSummary {
    pub slot: u64,
    pub proposer_index: u64,
    pub parent_root: [u8; 32],
    pub state_root: [u8; 32],
    pub eth1_block_hash: [u8; 32],
}

/// Output of a block decode.
///
/// `error` is set when the header decoded but the body did not match the
/// codec; the summary then holds whatever could be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    pub fork: ConsensusFork,
    pub summary: BlockSummary,
    pub error: Option<String>,
}

impl DecodedBlock {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.error.is_some()
    }
}

/// Decoder for one payload format.
pub trait PayloadCodec: Send + Sync {
    fn fork(&self) -> ConsensusFork;

    /// Decodes a `SignedBeaconBlock`.
    ///
    /// # Errors
    ///
    /// Fails when not even the block header can be read.
    fn decode_block(&self, bytes: &[u8]) -> Result<DecodedBlock>;

    /// Reads the slot of a `BeaconState`.
    ///
    /// # Errors
    ///
    /// Fails when the payload is too short.
    fn decode_state_slot(&self, bytes: &[u8]) -> Result<u64> {
        read_u64(bytes, STATE_SLOT_OFFSET, "state slot")
    }
}

fn field<'a>(bytes: &'a [u8], start: usize, len: usize, name: &str) -> Result<&'a [u8]> {
    bytes.get(start..start + len).ok_or_else(|| {
        BeaconIndexerError::DecodingError(format!(
            "{name} out of bounds: need {} bytes, have {}",
            start + len,
            bytes.len()
        ))
    })
}

fn tail<'a>(bytes: &'a [u8], start: usize, name: &str) -> Result<&'a [u8]> {
    bytes.get(start..).ok_or_else(|| {
        BeaconIndexerError::DecodingError(format!(
            "{name} starts at {start}, past the end of a {} byte payload",
            bytes.len()
        ))
    })
}

fn read_u64(bytes: &[u8], start: usize, name: &str) -> Result<u64> {
    u64::from_ssz_bytes(field(bytes, start, 8, name)?)
        .map_err(|e| BeaconIndexerError::DecodingError(format!("{name}: {e:?}")))
}

fn read_offset(bytes: &[u8], start: usize, name: &str) -> Result<usize> {
    let offset = u32::from_ssz_bytes(field(bytes, start, 4, name)?)
        .map_err(|e| BeaconIndexerError::DecodingError(format!("{name}: {e:?}")))?;
    usize::try_from(offset).map_err(|e| BeaconIndexerError::DecodingError(e.to_string()))
}

fn read_root(bytes: &[u8], start: usize, name: &str) -> Result<[u8; 32]> {
    <[u8; 32]>::from_ssz_bytes(field(bytes, start, 32, name)?)
        .map_err(|e| BeaconIndexerError::DecodingError(format!("{name}: {e:?}")))
}

/// Codec for a single fork.
#[derive(Debug, Clone, Copy)]
pub struct ForkCodec {
    fork: ConsensusFork,
}

impl ForkCodec {
    #[must_use]
    pub fn new(fork: ConsensusFork) -> Self {
        Self { fork }
    }
}

impl PayloadCodec for ForkCodec {
    fn fork(&self) -> ConsensusFork {
        self.fork
    }

    fn decode_block(&self, bytes: &[u8]) -> Result<DecodedBlock> {
        let message_offset = read_offset(bytes, 0, "message offset")?;
        if message_offset != SIGNED_BLOCK_FIXED_LEN {
            return Err(BeaconIndexerError::DecodingError(format!(
                "unexpected message offset {message_offset}"
            )));
        }
        let message = tail(bytes, message_offset, "message")?;

        let mut summary = BlockSummary {
            slot: read_u64(message, 0, "slot")?,
            proposer_index: read_u64(message, 8, "proposer index")?,
            parent_root: read_root(message, 16, "parent root")?,
            state_root: read_root(message, 48, "state root")?,
            eth1_block_hash: [0; 32],
        };

        let body_offset = read_offset(message, 80, "body offset")?;
        if body_offset != BLOCK_FIXED_LEN {
            return Err(BeaconIndexerError::DecodingError(format!(
                "unexpected body offset {body_offset}"
            )));
        }
        let body = tail(message, body_offset, "body")?;

        let partial = |summary: BlockSummary, error: String| DecodedBlock {
            fork: self.fork,
            summary,
            error: Some(error),
        };

        match read_root(body, ETH1_BLOCK_HASH_OFFSET, "eth1 block hash") {
            Ok(hash) => summary.eth1_block_hash = hash,
            Err(e) => return Ok(partial(summary, e.to_string())),
        }

        let expected = self.fork.body_fixed_len();
        match read_offset(body, BODY_COMMON_FIXED_LEN, "first body offset") {
            Ok(found) if found == expected => Ok(DecodedBlock {
                fork: self.fork,
                summary,
                error: None,
            }),
            Ok(found) => Ok(partial(
                summary,
                format!(
                    "body layout does not match {}: fixed part is {found} bytes, expected {expected}",
                    self.fork
                ),
            )),
            Err(e) => Ok(partial(summary, e.to_string())),
        }
    }
}

/// Ordered list of codecs tried when decoding a payload.
pub struct CodecRegistry {
    codecs: Vec<Box<dyn PayloadCodec>>,
}

impl CodecRegistry {
    /// Builds one codec per fork, keeping the given order.
    #[must_use]
    pub fn new(forks: &[ConsensusFork]) -> Self {
        Self {
            codecs: forks
                .iter()
                .map(|fork| Box::new(ForkCodec::new(*fork)) as Box<dyn PayloadCodec>)
                .collect(),
        }
    }

    /// Builds a registry from arbitrary codecs.
    #[must_use]
    pub fn with_codecs(codecs: Vec<Box<dyn PayloadCodec>>) -> Self {
        Self { codecs }
    }

    #[must_use]
    pub fn forks(&self) -> Vec<ConsensusFork> {
        self.codecs.iter().map(|c| c.fork()).collect()
    }

    /// Decodes a block, trying `hint` first and then the configured order.
    ///
    /// The first clean decode wins. If every codec only produced a partial
    /// result, the first partial result is returned so the caller can decide
    /// whether it is usable.
    ///
    /// # Errors
    ///
    /// Returns the last error when no codec could read the block header.
    pub fn decode_block(&self, bytes: &[u8], hint: Option<ConsensusFork>) -> Result<DecodedBlock> {
        let hinted = hint.and_then(|fork| self.codecs.iter().find(|c| c.fork() == fork));
        if hint.is_some() && hinted.is_none() {
            tracing::debug!(?hint, "Payload version not among enabled codecs");
        }

        let ordered = hinted
            .into_iter()
            .chain(self.codecs.iter().filter(|c| Some(c.fork()) != hint));

        let mut first_partial = None;
        let mut last_error = None;
        for codec in ordered {
            match codec.decode_block(bytes) {
                Ok(decoded) if !decoded.is_partial() => return Ok(decoded),
                Ok(decoded) => {
                    first_partial.get_or_insert(decoded);
                }
                Err(e) => last_error = Some(e),
            }
        }

        match (first_partial, last_error) {
            (Some(partial), _) => Ok(partial),
            (None, Some(e)) => Err(e),
            (None, None) => Err(BeaconIndexerError::DecodingError(
                "no codecs enabled".to_string(),
            )),
        }
    }

    /// Reads the slot of a state with the first codec that accepts it.
    ///
    /// # Errors
    ///
    /// Returns the last error when no codec accepts the payload.
    pub fn decode_state_slot(&self, bytes: &[u8]) -> Result<u64> {
        let mut last_error = None;
        for codec in &self.codecs {
            match codec.decode_state_slot(bytes) {
                Ok(slot) => return Ok(slot),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            BeaconIndexerError::DecodingError("no codecs enabled".to_string())
        }))
    }
}

/// SSZ builders for synthetic payloads, used by tests.
pub mod fixtures {
    use super::{BLOCK_FIXED_LEN, BODY_COMMON_FIXED_LEN, ConsensusFork, SIGNED_BLOCK_FIXED_LEN};

    /// Encodes a minimal `SignedBeaconBlock` whose body layout matches `fork`.
    #[must_use]
    pub fn signed_block(
        fork: ConsensusFork,
        slot: u64,
        parent_root: [u8; 32],
        state_root: [u8; 32],
        eth1_block_hash: [u8; 32],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(SIGNED_BLOCK_FIXED_LEN as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 96]);

        out.extend_from_slice(&slot.to_le_bytes());
        out.extend_from_slice(&7u64.to_le_bytes());
        out.extend_from_slice(&parent_root);
        out.extend_from_slice(&state_root);
        out.extend_from_slice(&(BLOCK_FIXED_LEN as u32).to_le_bytes());

        let fixed_len = fork.body_fixed_len();
        let mut body = Vec::with_capacity(fixed_len);
        body.extend_from_slice(&[0u8; 96]);
        body.extend_from_slice(&[0u8; 32]);
        body.extend_from_slice(&0u64.to_le_bytes());
        body.extend_from_slice(&eth1_block_hash);
        body.extend_from_slice(&[0u8; 32]);
        debug_assert_eq!(body.len(), BODY_COMMON_FIXED_LEN);
        // every variable field is empty, so all offsets point at the end
        body.resize(fixed_len, 0);
        for chunk in body[BODY_COMMON_FIXED_LEN..].chunks_mut(4) {
            if chunk.len() == 4 {
                chunk.copy_from_slice(&(fixed_len as u32).to_le_bytes());
            }
        }
        // sync_aggregate is fixed-size and sits between the offsets
        if fork >= ConsensusFork::Altair {
            let aggregate_start = BODY_COMMON_FIXED_LEN + 5 * 4;
            body[aggregate_start..aggregate_start + 160].fill(0);
        }

        out.extend_from_slice(&body);
        out
    }

    /// Encodes the leading fields of a `BeaconState`.
    #[must_use]
    pub fn state(slot: u64) -> Vec<u8> {
        let mut out = vec![0u8; 8 + 32];
        out.extend_from_slice(&slot.to_le_bytes());
        out.extend_from_slice(&[0u8; 16]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_fixed_lengths() {
        let lens: Vec<usize> = ConsensusFork::all()
            .iter()
            .map(ConsensusFork::body_fixed_len)
            .collect();
        assert_eq!(lens, vec![396, 392, 388, 384, 380, 220]);
    }

    #[test]
    fn test_fork_from_str() {
        assert_eq!("Deneb".parse::<ConsensusFork>().unwrap(), ConsensusFork::Deneb);
        assert!(matches!(
            "fulu".parse::<ConsensusFork>(),
            Err(BeaconIndexerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_decode_matching_fork() {
        let bytes = fixtures::signed_block(ConsensusFork::Capella, 42, [1; 32], [2; 32], [3; 32]);
        let registry = CodecRegistry::new(&ConsensusFork::all());

        let decoded = registry.decode_block(&bytes, None).unwrap();
        assert_eq!(decoded.fork, ConsensusFork::Capella);
        assert!(!decoded.is_partial());
        assert_eq!(decoded.summary.slot, 42);
        assert_eq!(decoded.summary.parent_root, [1; 32]);
        assert_eq!(decoded.summary.state_root, [2; 32]);
        assert_eq!(decoded.summary.eth1_block_hash, [3; 32]);
    }

    #[test]
    fn test_hint_is_tried_first() {
        let bytes = fixtures::signed_block(ConsensusFork::Phase0, 1, [1; 32], [2; 32], [3; 32]);
        let registry = CodecRegistry::new(&[ConsensusFork::Deneb, ConsensusFork::Phase0]);
        let decoded = registry
            .decode_block(&bytes, Some(ConsensusFork::Phase0))
            .unwrap();
        assert_eq!(decoded.fork, ConsensusFork::Phase0);
    }

    #[test]
    fn test_unknown_layout_returns_partial() {
        let bytes = fixtures::signed_block(ConsensusFork::Electra, 9, [1; 32], [2; 32], [3; 32]);
        let registry = CodecRegistry::new(&[ConsensusFork::Phase0, ConsensusFork::Altair]);

        let decoded = registry.decode_block(&bytes, None).unwrap();
        assert!(decoded.is_partial());
        assert_eq!(decoded.fork, ConsensusFork::Phase0);
        assert_eq!(decoded.summary.slot, 9);
        assert_eq!(decoded.summary.parent_root, [1; 32]);
    }

    #[test]
    fn test_garbage_is_an_error() {
        let registry = CodecRegistry::new(&ConsensusFork::all());
        assert!(registry.decode_block(&[1, 2, 3], None).is_err());
        assert!(registry.decode_block(&[0u8; 150], None).is_err());
    }

    #[test]
    fn test_truncated_block_is_a_decoding_error() {
        let registry = CodecRegistry::new(&ConsensusFork::all());
        let full = fixtures::signed_block(ConsensusFork::Deneb, 5, [1; 32], [2; 32], [3; 32]);

        assert!(matches!(
            registry.decode_block(&[100, 0, 0, 0], None),
            Err(BeaconIndexerError::DecodingError(_))
        ));
        // cut inside the signature, the header and the body offset
        for len in [4, 50, 100, 150, 183] {
            assert!(
                matches!(
                    registry.decode_block(&full[..len], None),
                    Err(BeaconIndexerError::DecodingError(_))
                ),
                "length {len}"
            );
        }
        // header intact, body missing
        let decoded = registry.decode_block(&full[..184], None).unwrap();
        assert!(decoded.is_partial());
        assert_eq!(decoded.summary.slot, 5);
    }

    #[test]
    fn test_state_slot() {
        let registry = CodecRegistry::new(&ConsensusFork::all());
        assert_eq!(registry.decode_state_slot(&fixtures::state(77)).unwrap(), 77);
        assert!(registry.decode_state_slot(&[0u8; 10]).is_err());
    }
}
