//! Chunk framing for snapshot streams.

use bytes::{BufMut, Bytes, BytesMut};
use common::{SmError, SmResult};

/// Magic bytes for frame validation: "SNAP" in ASCII.
pub const FRAME_MAGIC: u32 = 0x534E_4150;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 13;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Size of the end frame payload: total length (u64) + data checksum (u32).
const END_PAYLOAD_SIZE: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    End,
}

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::End => 1,
        }
    }

    fn from_byte(b: u8) -> SmResult<Self> {
        match b {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::End),
            other => Err(SmError::Corrupted(format!("unknown frame kind {other}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FrameHeader {
    pub magic: u32,
    pub kind: u8,
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4] = self.kind;
        buf[5..9].copy_from_slice(&self.length.to_le_bytes());
        buf[9..13].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[0..4]);
        let magic = u32::from_le_bytes(word);
        word.copy_from_slice(&buf[5..9]);
        let length = u32::from_le_bytes(word);
        word.copy_from_slice(&buf[9..13]);
        let checksum = u32::from_le_bytes(word);
        Self {
            magic,
            kind: buf[4],
            length,
            checksum,
        }
    }

    /// Validate everything that can be checked without the payload.
    pub fn validate(&self) -> SmResult<FrameKind> {
        if self.magic != FRAME_MAGIC {
            return Err(SmError::Corrupted(format!(
                "bad frame magic {:#010x}",
                self.magic
            )));
        }
        if self.length > MAX_FRAME_LEN {
            return Err(SmError::Corrupted(format!(
                "frame length {} exceeds limit",
                self.length
            )));
        }
        FrameKind::from_byte(self.kind)
    }
}

/// A decoded, checksum-verified frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

/// Totals carried by the end frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndMarker {
    pub total_len: u64,
    pub checksum: u32,
}

impl EndMarker {
    pub fn to_bytes(self) -> [u8; END_PAYLOAD_SIZE] {
        let mut buf = [0u8; END_PAYLOAD_SIZE];
        buf[0..8].copy_from_slice(&self.total_len.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_payload(payload: &[u8]) -> SmResult<Self> {
        if payload.len() != END_PAYLOAD_SIZE {
            return Err(SmError::Corrupted(format!(
                "end frame payload is {} bytes",
                payload.len()
            )));
        }
        let mut total = [0u8; 8];
        total.copy_from_slice(&payload[0..8]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&payload[8..12]);
        Ok(Self {
            total_len: u64::from_le_bytes(total),
            checksum: u32::from_le_bytes(checksum),
        })
    }
}

/// Encode a frame (header + payload) into a single buffer.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Bytes {
    let header = FrameHeader {
        magic: FRAME_MAGIC,
        kind: kind.to_byte(),
        length: payload.len() as u32,
        checksum: crc32fast::hash(payload),
    };
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode and verify one complete frame.
pub fn decode_frame(mut bytes: Bytes) -> SmResult<Frame> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(SmError::Corrupted(format!(
            "frame of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    header_buf.copy_from_slice(&bytes[..FRAME_HEADER_SIZE]);
    let header = FrameHeader::from_bytes(&header_buf);
    let kind = header.validate()?;

    let payload = bytes.split_off(FRAME_HEADER_SIZE);
    if payload.len() != header.length as usize {
        return Err(SmError::Corrupted(format!(
            "frame declares {} bytes, carries {}",
            header.length,
            payload.len()
        )));
    }
    if crc32fast::hash(&payload) != header.checksum {
        return Err(SmError::Corrupted("frame checksum mismatch".into()));
    }
    Ok(Frame { kind, payload })
}
