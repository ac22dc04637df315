//! Block Codec (spec.md §4.1): the on-wire frame — fixed 32-byte header, envelope,
//! optional payload.
//!
//! The codec never looks inside the envelope bytes it reads or writes. Per the layering
//! note in spec.md §9 ("keep both layers but expose only the block layer to the codec"),
//! the caller supplies the envelope's message-id hash rather than the codec parsing JSON
//! itself.
//!
//! ```text
//! Offset Size  Field
//! 0      4     Magic = 0xBA5E10B1
//! 4      2     Version (major.minor)
//! 6      2     Flags (bit0=Forwarded, bit1=Heartbeat, bit2=Admin)
//! 8      4     EnvelopeLength
//! 12     8     PayloadLength
//! 20     8     MessageIdHash
//! 28     4     HeaderCRC32 (over offsets 0..27)
//! 32     …     Envelope
//! …      …     Payload
//! ```

use crate::error::{BrokerError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: u32 = 0xBA5E_10B1;
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;
pub const HEADER_LEN: usize = 32;
pub const CRC_RANGE: usize = 28;

pub const FLAG_FORWARDED: u16 = 0b001;
pub const FLAG_HEARTBEAT: u16 = 0b010;
pub const FLAG_ADMIN: u16 = 0b100;

/// Maximum envelope length accepted, per spec.md §6 ("EnvelopeLength … ≤ 1 MiB").
pub const MAX_ENVELOPE_LEN: u32 = 1024 * 1024;

/// Default maximum payload length (spec.md §3); callers may configure a smaller bound.
pub const DEFAULT_MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version_major: u8,
    pub version_minor: u8,
    pub flags: u16,
    pub envelope_length: u32,
    pub payload_length: u64,
    pub message_id_hash: [u8; 8],
    pub crc32: u32,
}

impl Header {
    pub fn is_forwarded(&self) -> bool {
        self.flags & FLAG_FORWARDED != 0
    }

    pub fn is_heartbeat(&self) -> bool {
        self.flags & FLAG_HEARTBEAT != 0
    }

    pub fn is_admin(&self) -> bool {
        self.flags & FLAG_ADMIN != 0
    }
}

/// A fully decoded, CRC-validated block. No partial decoding is ever exposed to callers
/// (spec.md §4.1): constructing one of these means the frame already passed every check.
#[derive(Debug, Clone)]
pub struct Block {
    pub header: Header,
    pub envelope: Vec<u8>,
    pub payload: Vec<u8>,
}

fn compute_crc(buf: &[u8; CRC_RANGE]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(buf);
    hasher.finalize()
}

fn header_prefix(
    flags: u16,
    envelope_length: u32,
    payload_length: u64,
    message_id_hash: [u8; 8],
) -> [u8; CRC_RANGE] {
    let mut buf = [0u8; CRC_RANGE];
    buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    buf[4] = VERSION_MAJOR;
    buf[5] = VERSION_MINOR;
    buf[6..8].copy_from_slice(&flags.to_be_bytes());
    buf[8..12].copy_from_slice(&envelope_length.to_be_bytes());
    buf[12..20].copy_from_slice(&payload_length.to_be_bytes());
    buf[20..28].copy_from_slice(&message_id_hash);
    buf
}

/// Build the full wire frame for one block as a single contiguous buffer, so a write can
/// be issued as one batch and no partial frame is ever observable (spec.md §4.1).
pub fn encode(
    flags: u16,
    message_id_hash: [u8; 8],
    envelope: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>> {
    if envelope.len() as u64 > MAX_ENVELOPE_LEN as u64 {
        return Err(BrokerError::Protocol(format!(
            "envelope length {} exceeds {}",
            envelope.len(),
            MAX_ENVELOPE_LEN
        )));
    }

    let prefix = header_prefix(flags, envelope.len() as u32, payload.len() as u64, message_id_hash);
    let crc = compute_crc(&prefix);

    let mut out = Vec::with_capacity(HEADER_LEN + envelope.len() + payload.len());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(envelope);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Parse and CRC-validate a 32-byte header. Does not allocate for envelope/payload.
pub fn decode_header(buf: &[u8; HEADER_LEN], max_payload_len: u64) -> Result<Header> {
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(BrokerError::Protocol(format!("bad magic: {magic:#010x}")));
    }

    let version_major = buf[4];
    let version_minor = buf[5];
    if version_major != VERSION_MAJOR {
        return Err(BrokerError::Protocol(format!(
            "unsupported protocol version {version_major}.{version_minor}"
        )));
    }

    let flags = u16::from_be_bytes(buf[6..8].try_into().unwrap());
    let envelope_length = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    let payload_length = u64::from_be_bytes(buf[12..20].try_into().unwrap());
    let mut message_id_hash = [0u8; 8];
    message_id_hash.copy_from_slice(&buf[20..28]);
    let crc32 = u32::from_be_bytes(buf[28..32].try_into().unwrap());

    let mut prefix = [0u8; CRC_RANGE];
    prefix.copy_from_slice(&buf[0..CRC_RANGE]);
    if compute_crc(&prefix) != crc32 {
        return Err(BrokerError::Protocol("header CRC mismatch".into()));
    }

    if envelope_length > MAX_ENVELOPE_LEN {
        return Err(BrokerError::Protocol(format!(
            "envelope length {envelope_length} exceeds {MAX_ENVELOPE_LEN}"
        )));
    }
    if payload_length > max_payload_len {
        return Err(BrokerError::Protocol(format!(
            "payload length {payload_length} exceeds {max_payload_len}"
        )));
    }

    Ok(Header {
        version_major,
        version_minor,
        flags,
        envelope_length,
        payload_length,
        message_id_hash,
        crc32,
    })
}

/// Decode a complete in-memory frame (header + envelope + payload). Used by tests and by
/// any caller that already has the whole buffer.
pub fn decode(buf: &[u8], max_payload_len: u64) -> Result<Block> {
    if buf.len() < HEADER_LEN {
        return Err(BrokerError::Protocol("frame shorter than header".into()));
    }
    let mut header_buf = [0u8; HEADER_LEN];
    header_buf.copy_from_slice(&buf[0..HEADER_LEN]);
    let header = decode_header(&header_buf, max_payload_len)?;

    let envelope_end = HEADER_LEN + header.envelope_length as usize;
    let payload_end = envelope_end + header.payload_length as usize;
    if buf.len() != payload_end {
        return Err(BrokerError::Protocol(format!(
            "frame length {} does not match header-declared {}",
            buf.len(),
            payload_end
        )));
    }

    Ok(Block {
        header,
        envelope: buf[HEADER_LEN..envelope_end].to_vec(),
        payload: buf[envelope_end..payload_end].to_vec(),
    })
}

/// Read exactly one block from an async stream. Reads the header first so an oversized
/// `payload_length` is rejected before any allocation beyond the header (spec.md §8.2).
pub async fn read_one<R: AsyncRead + Unpin>(reader: &mut R, max_payload_len: u64) -> Result<Block> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            BrokerError::Transport("end of stream".into())
        } else {
            BrokerError::from(e)
        }
    })?;

    let header = decode_header(&header_buf, max_payload_len)?;

    let mut envelope = vec![0u8; header.envelope_length as usize];
    reader.read_exact(&mut envelope).await?;

    let mut payload = vec![0u8; header.payload_length as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Block {
        header,
        envelope,
        payload,
    })
}

/// Write one block as a single write batch so the peer never observes a partial frame.
pub async fn write_one<W: AsyncWrite + Unpin>(
    writer: &mut W,
    flags: u16,
    message_id_hash: [u8; 8],
    envelope: &[u8],
    payload: &[u8],
) -> Result<()> {
    let frame = encode(flags, message_id_hash, envelope, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
