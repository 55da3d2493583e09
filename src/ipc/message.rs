//! Message framing and payload codec.
//!
//! Every frame is `{ id: u32, tag: u32, payload: bytes }`. `id` selects the
//! remote operation, `tag` correlates a call with its reply. Replies reuse the
//! request id and carry the request tag with [`REPLY_FLAG`] set. Tag 0 marks a
//! one-way message that must not be answered.
use crate::config::types::{Result, VmError};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const REPLY_FLAG: u32 = 0x8000_0000;
pub const ONE_WAY_TAG: u32 = 0;

/// Frames larger than this are a protocol violation.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Socket framing header: payload length, id, tag (little endian).
pub const HEADER_LEN: usize = 12;

/// Pack a (major, minor) pair into a message id.
pub const fn syscall_id(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

/// Split a message id into its (major, minor) pair.
pub const fn split_id(id: u32) -> (u16, u16) {
    ((id >> 16) as u16, (id & 0xffff) as u16)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub tag: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn call(id: u32, tag: u32, payload: Vec<u8>) -> Self {
        debug_assert!(tag != ONE_WAY_TAG && tag & REPLY_FLAG == 0);
        Self { id, tag, payload }
    }

    pub fn one_way(id: u32, payload: Vec<u8>) -> Self {
        Self {
            id,
            tag: ONE_WAY_TAG,
            payload,
        }
    }

    /// Build the reply envelope for this request
    pub fn reply(&self, payload: Vec<u8>) -> Self {
        Self {
            id: self.id,
            tag: self.tag | REPLY_FLAG,
            payload,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.tag & REPLY_FLAG != 0
    }

    pub fn expects_reply(&self) -> bool {
        !self.is_reply() && self.tag != ONE_WAY_TAG
    }

    /// Correlation tag with the reply bit stripped
    pub fn call_tag(&self) -> u32 {
        self.tag & !REPLY_FLAG
    }

    /// Socket encoding: header then payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_payload_len(self.payload.len())?;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse a socket header into (payload length, id, tag).
    pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(usize, u32, u32)> {
        let word = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
        let len = word(0) as usize;
        if len > MAX_PAYLOAD {
            return Err(VmError::Protocol(format!(
                "frame payload of {} bytes exceeds limit of {} bytes",
                len, MAX_PAYLOAD
            )));
        }
        Ok((len, word(4), word(8)))
    }
}

/// A remote operation: its id plus the argument and reply shapes.
pub trait Message {
    const ID: u32;
    type Args: Serialize + DeserializeOwned;
    type Reply: Serialize + DeserializeOwned;
}

/// Encode a value as a message payload.
///
/// Oversized payloads fail here, before anything reaches the channel.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| VmError::Protocol(format!("failed to encode payload: {}", e)))?;
    check_payload_len(payload.len())?;
    Ok(payload)
}

fn check_payload_len(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD {
        return Err(VmError::PayloadTooLarge(len));
    }
    Ok(())
}

/// Structured reader over one inbound message.
#[derive(Debug)]
pub struct Reader {
    id: u32,
    tag: u32,
    payload: Vec<u8>,
}

impl Reader {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn expects_reply(&self) -> bool {
        self.tag != ONE_WAY_TAG && self.tag & REPLY_FLAG == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the whole payload. A shape mismatch is a protocol violation.
    pub fn read<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            let (major, minor) = split_id(self.id);
            VmError::Protocol(format!(
                "failed to decode payload of message {}:{}: {}",
                major, minor, e
            ))
        })
    }

    /// Build the reply frame for this message
    pub fn reply_frame<T: Serialize>(&self, value: &T) -> Result<Frame> {
        Ok(Frame {
            id: self.id,
            tag: self.tag | REPLY_FLAG,
            payload: encode_payload(value)?,
        })
    }
}

impl From<Frame> for Reader {
    fn from(frame: Frame) -> Self {
        Self {
            id: frame.id,
            tag: frame.tag,
            payload: frame.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_id_packing() {
        let id = syscall_id(0x12, 3);
        assert_eq!(id, 0x0012_0003);
        assert_eq!(split_id(id), (0x12, 3));
    }

    #[test]
    fn test_reply_reuses_id_and_tag() {
        let request = Frame::call(42, 7, b"[]".to_vec());
        assert!(request.expects_reply());
        let reply = request.reply(b"null".to_vec());
        assert_eq!(reply.id, 42);
        assert!(reply.is_reply());
        assert!(!reply.expects_reply());
        assert_eq!(reply.call_tag(), 7);
    }

    #[test]
    fn test_one_way_never_expects_reply() {
        let frame = Frame::one_way(9, Vec::new());
        assert!(!frame.expects_reply());
        assert!(!frame.is_reply());
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::call(0x0011_0002, 5, vec![1, 2, 3]);
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 3);
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        assert_eq!(Frame::decode_header(&header).unwrap(), (3, 0x0011_0002, 5));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&((MAX_PAYLOAD as u32) + 1).to_le_bytes());
        assert!(matches!(
            Frame::decode_header(&header),
            Err(VmError::Protocol(_))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected_at_encode() {
        let dump = vec![0u8; MAX_PAYLOAD];
        let err = encode_payload(&dump).unwrap_err();
        assert!(matches!(err, VmError::PayloadTooLarge(len) if len > MAX_PAYLOAD));
        assert!(!err.is_fatal());

        let frame = Frame::one_way(1, vec![0u8; MAX_PAYLOAD + 1]);
        assert!(matches!(frame.encode(), Err(VmError::PayloadTooLarge(_))));
        assert!(Frame::one_way(1, vec![0u8; MAX_PAYLOAD]).encode().is_ok());
    }

    #[test]
    fn test_reader_decode_failure_is_protocol_violation() {
        let reader = Reader::from(Frame::call(syscall_id(1, 1), 1, b"\"text\"".to_vec()));
        assert!(matches!(reader.read::<u64>(), Err(VmError::Protocol(_))));
        assert_eq!(reader.read::<String>().unwrap(), "text");
    }
}
