//! Intent log record format
//!
//! Little-endian, length-prefixed, CRC-protected records. The only kind
//! the volume layer produces is `RECORD_WRITE`; the kind byte is carried
//! verbatim so replay can reject records it does not understand.

use bytes::Bytes;
use std::io::Read;
use volio_common::{Txg, VolumeError, VolumeResult};

/// Write record: re-apply `body` at `offset` during replay
pub const RECORD_WRITE: u8 = 1;

const BODY_PAYLOAD: u8 = 0;
const BODY_POINTER: u8 = 1;

/// Resolved location of an indirect record's data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPointer {
    /// Physical byte address of the block
    pub phys: u64,
    /// Generation the block was written in
    pub birth_txg: Txg,
}

/// Payload supplied at append time
#[derive(Debug, Clone)]
pub enum AppendPayload {
    /// Bytes copied into the record immediately
    Immediate(Bytes),
    /// Bytes fetched from the store when the log commits
    Indirect,
}

/// Record body as committed to the log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    /// Inline copy of the written bytes
    Payload(Bytes),
    /// Final location of the data block inside the store
    Pointer(RecordPointer),
}

/// A committed intent log record
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Sequence number, monotonic across rotations
    pub sequence: u64,
    /// Record kind; only `RECORD_WRITE` is dispatched by replay
    pub kind: u8,
    /// Store transaction generation recorded at append time
    pub txg: Txg,
    /// Byte offset of the write within the volume
    pub offset: u64,
    /// Length of the write in bytes
    pub length: u64,
    /// Inline payload or resolved pointer
    pub body: RecordBody,
    /// CRC32C over every field above
    pub checksum: u32,
}

impl LogRecord {
    /// Build a record with its checksum filled in.
    #[must_use]
    pub fn new(sequence: u64, kind: u8, txg: Txg, offset: u64, length: u64, body: RecordBody) -> Self {
        let mut record = Self {
            sequence,
            kind,
            txg,
            offset,
            length,
            body,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        record
    }

    fn body_kind(&self) -> u8 {
        match self.body {
            RecordBody::Payload(_) => BODY_PAYLOAD,
            RecordBody::Pointer(_) => BODY_POINTER,
        }
    }

    fn body_bytes(&self) -> Vec<u8> {
        match &self.body {
            RecordBody::Payload(data) => data.to_vec(),
            RecordBody::Pointer(ptr) => {
                let mut buf = Vec::with_capacity(16);
                buf.extend_from_slice(&ptr.phys.to_le_bytes());
                buf.extend_from_slice(&ptr.birth_txg.to_le_bytes());
                buf
            }
        }
    }

    fn compute_checksum(&self) -> u32 {
        let mut data = Vec::new();
        data.extend_from_slice(&self.sequence.to_le_bytes());
        data.push(self.kind);
        data.push(self.body_kind());
        data.extend_from_slice(&self.txg.to_le_bytes());
        data.extend_from_slice(&self.offset.to_le_bytes());
        data.extend_from_slice(&self.length.to_le_bytes());
        data.extend_from_slice(&self.body_bytes());
        crc32c::crc32c(&data)
    }

    /// Verify the stored checksum.
    #[must_use]
    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Serialize to bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let body = self.body_bytes();
        let mut buf = Vec::with_capacity(43 + body.len());

        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.push(self.kind);
        buf.push(self.body_kind());
        buf.extend_from_slice(&self.txg.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&self.checksum.to_le_bytes());

        buf
    }

    /// Deserialize from a reader.
    pub fn deserialize<R: Read>(reader: &mut R) -> VolumeResult<Self> {
        let mut u64_buf = [0u8; 8];
        let mut u32_buf = [0u8; 4];
        let mut byte_buf = [0u8; 1];

        reader.read_exact(&mut u64_buf)?;
        let sequence = u64::from_le_bytes(u64_buf);

        reader.read_exact(&mut byte_buf)?;
        let kind = byte_buf[0];

        reader.read_exact(&mut byte_buf)?;
        let body_kind = byte_buf[0];

        reader.read_exact(&mut u64_buf)?;
        let txg = u64::from_le_bytes(u64_buf);

        reader.read_exact(&mut u64_buf)?;
        let offset = u64::from_le_bytes(u64_buf);

        reader.read_exact(&mut u64_buf)?;
        let length = u64::from_le_bytes(u64_buf);

        reader.read_exact(&mut u32_buf)?;
        let body_len = u32::from_le_bytes(u32_buf) as usize;
        let mut body_buf = vec![0u8; body_len];
        reader.read_exact(&mut body_buf)?;

        let body = match body_kind {
            BODY_PAYLOAD => RecordBody::Payload(Bytes::from(body_buf)),
            BODY_POINTER => {
                if body_len != 16 {
                    return Err(VolumeError::io("pointer body must be 16 bytes"));
                }
                let phys = u64::from_le_bytes(
                    body_buf[0..8]
                        .try_into()
                        .map_err(|_| VolumeError::io("truncated pointer body"))?,
                );
                let birth_txg = u64::from_le_bytes(
                    body_buf[8..16]
                        .try_into()
                        .map_err(|_| VolumeError::io("truncated pointer body"))?,
                );
                RecordBody::Pointer(RecordPointer { phys, birth_txg })
            }
            other => return Err(VolumeError::io(format!("invalid body kind {other}"))),
        };

        reader.read_exact(&mut u32_buf)?;
        let checksum = u32::from_le_bytes(u32_buf);

        Ok(Self {
            sequence,
            kind,
            txg,
            offset,
            length,
            body,
            checksum,
        })
    }
}
