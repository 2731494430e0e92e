//! State documents and their persisted byte format
//!
//! A document is persisted as a fixed header, the opaque payload and a
//! trailing checksum (all integers little-endian):
//!
//! ```text
//! [2 bytes:  format version (u16)]
//! [16 bytes: lineage (UUID)]
//! [8 bytes:  serial (u64)]
//! [8 bytes:  payload length (u64)]
//! [N bytes:  payload]
//! [4 bytes:  CRC32 of everything above (u32)]
//! ```

use serde::Serialize;
use uuid::Uuid;

use crate::backend::{Address, BackendError, BackendResult};

const HEADER_SIZE: usize = 2 + 16 + 8 + 8;
const CHECKSUM_SIZE: usize = 4;

/// A state document: opaque payload plus lineage/serial metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDocument {
    /// Persisted format version
    pub format_version: u16,
    /// Fixed when the document is first created; never changes afterwards
    pub lineage: Uuid,
    /// Incremented by exactly one on every successful write
    pub serial: u64,
    /// Caller-owned content, never interpreted here
    pub payload: Vec<u8>,
}

impl StateDocument {
    /// Current persisted format version
    pub const CURRENT_VERSION: u16 = 1;

    /// Create the first document of a new lineage
    pub fn initial(payload: Vec<u8>) -> Self {
        Self {
            format_version: Self::CURRENT_VERSION,
            lineage: Uuid::new_v4(),
            serial: 1,
            payload,
        }
    }

    /// Create the document that follows this one in the same lineage
    pub fn successor(&self, payload: Vec<u8>) -> Self {
        Self {
            format_version: Self::CURRENT_VERSION,
            lineage: self.lineage,
            serial: self.serial + 1,
            payload,
        }
    }

    /// Serialize to the persisted byte format
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE);
        buf.extend_from_slice(&self.format_version.to_le_bytes());
        buf.extend_from_slice(self.lineage.as_bytes());
        buf.extend_from_slice(&self.serial.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse and verify the persisted byte format
    pub fn decode(bytes: &[u8]) -> BackendResult<Self> {
        if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(BackendError::CorruptPayload(format!(
                "document is {} bytes, shorter than the {} byte minimum",
                bytes.len(),
                HEADER_SIZE + CHECKSUM_SIZE
            )));
        }

        let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
        let stored = u32::from_le_bytes(fixed_array(trailer));
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(BackendError::CorruptPayload(format!(
                "checksum mismatch: stored {:08x}, computed {:08x}",
                stored, computed
            )));
        }

        let format_version = u16::from_le_bytes(fixed_array(&body[0..2]));
        if format_version != Self::CURRENT_VERSION {
            return Err(BackendError::CorruptPayload(format!(
                "unsupported format version {}",
                format_version
            )));
        }
        let lineage = Uuid::from_bytes(fixed_array(&body[2..18]));
        let serial = u64::from_le_bytes(fixed_array(&body[18..26]));
        let payload_len = u64::from_le_bytes(fixed_array(&body[26..34]));

        let payload = &body[HEADER_SIZE..];
        if payload.len() as u64 != payload_len {
            return Err(BackendError::CorruptPayload(format!(
                "payload length {} does not match header length {}",
                payload.len(),
                payload_len
            )));
        }

        Ok(Self {
            format_version,
            lineage,
            serial,
            payload: payload.to_vec(),
        })
    }

    /// Summarize this document as stored at `address`
    pub fn summarize(&self, address: &Address, version_id: &str) -> DocSummary {
        DocSummary {
            address: address.clone(),
            version_id: version_id.to_string(),
            lineage: self.lineage,
            serial: self.serial,
            payload_len: self.payload.len() as u64,
        }
    }
}

/// What a migration confirmation prompt gets to see about a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocSummary {
    pub address: Address,
    pub version_id: String,
    pub lineage: Uuid,
    pub serial: u64,
    pub payload_len: u64,
}

// Callers guarantee the slice length; the header was length-checked above.
fn fixed_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
