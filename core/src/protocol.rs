//! Framing codec and the typed message set (component A).
//!
//! A frame on the wire is `u32 be total_length` followed by `total_length`
//! bytes split into `u32 header_length`, a UTF-8 JSON header of exactly
//! `header_length` bytes, then the remaining bytes as a raw binary payload.
//! The header always carries an integer `type` field; [`Message`] is the
//! tagged sum of every variant that field can select, and dispatch happens
//! through a single match rather than runtime branching on the integer.

use crate::error::{Error, Result};
use crate::transfer::FileMetadata;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound on a single frame's total length, including header.
pub const MAX_FRAME_SIZE: u32 = 128 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    HandshakeHello = 0x01,
    HandshakeChallenge = 0x02,
    HandshakeResponse = 0x03,
    HandshakeOk = 0x04,
    Heartbeat = 0x10,
    Text = 0x11,
    Image = 0x12,
    FilesInline = 0x13,
    FileAnnounce = 0x14,
    FileRequest = 0x15,
    FileChunk = 0x16,
    FileComplete = 0x17,
    TransferCancel = 0x18,
    TransferError = 0x19,
}

impl MsgType {
    fn from_code(code: u64) -> Result<Self> {
        Ok(match code {
            0x01 => Self::HandshakeHello,
            0x02 => Self::HandshakeChallenge,
            0x03 => Self::HandshakeResponse,
            0x04 => Self::HandshakeOk,
            0x10 => Self::Heartbeat,
            0x11 => Self::Text,
            0x12 => Self::Image,
            0x13 => Self::FilesInline,
            0x14 => Self::FileAnnounce,
            0x15 => Self::FileRequest,
            0x16 => Self::FileChunk,
            0x17 => Self::FileComplete,
            0x18 => Self::TransferCancel,
            0x19 => Self::TransferError,
            other => return Err(Error::ProtocolError(format!("unknown message type 0x{other:x}"))),
        })
    }
}

/// The typed message set. Variants whose payload is described as "raw
/// bytes" above (`Image`, `FilesInline`, `FileChunk`) carry their bulk data
/// in the frame's payload section, not inline in these fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    HandshakeHello { nonce_c: String, device_id: String },
    HandshakeChallenge { nonce_s: String, challenge: String },
    HandshakeResponse { mac: String },
    HandshakeOk,
    Heartbeat,
    Text { content: String },
    Image { width: u32, height: u32, format: String },
    FilesInline { files: Vec<FileMetadata>, layout: String },
    FileAnnounce { transfer_id: String, files: Vec<FileMetadata> },
    FileRequest { transfer_id: String },
    FileChunk { transfer_id: String, file_index: u32, offset: u64, length: u32, chunk_checksum: String },
    FileComplete { transfer_id: String },
    TransferCancel { transfer_id: String },
    TransferError { transfer_id: Option<String>, code: String, detail: String },
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::HandshakeHello { .. } => MsgType::HandshakeHello,
            Self::HandshakeChallenge { .. } => MsgType::HandshakeChallenge,
            Self::HandshakeResponse { .. } => MsgType::HandshakeResponse,
            Self::HandshakeOk => MsgType::HandshakeOk,
            Self::Heartbeat => MsgType::Heartbeat,
            Self::Text { .. } => MsgType::Text,
            Self::Image { .. } => MsgType::Image,
            Self::FilesInline { .. } => MsgType::FilesInline,
            Self::FileAnnounce { .. } => MsgType::FileAnnounce,
            Self::FileRequest { .. } => MsgType::FileRequest,
            Self::FileChunk { .. } => MsgType::FileChunk,
            Self::FileComplete { .. } => MsgType::FileComplete,
            Self::TransferCancel { .. } => MsgType::TransferCancel,
            Self::TransferError { .. } => MsgType::TransferError,
        }
    }

    /// Serializes to the header JSON object, with `type` set to the
    /// message's integer code.
    fn to_header_value(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        // `Message` derives an externally-tagged enum encoding by default
        // (`{"Text": {...}}`); flatten that into `{"type": N, ...fields}`.
        let Value::Object(outer) = value else {
            return Err(Error::InternalError("message did not serialize to an object".into()));
        };
        let mut fields = match outer.into_values().next() {
            Some(Value::Object(inner)) => inner,
            Some(Value::Null) | None => Map::new(),
            Some(_other) => return Err(Error::InternalError("unexpected message shape".into())),
        };
        fields.insert("type".into(), Value::from(self.msg_type() as u8));
        value = Value::Object(fields);
        Ok(value)
    }

    fn from_header_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(Error::ProtocolError("header is not a JSON object".into()));
        };
        let code = fields
            .remove("type")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::ProtocolError("header missing integer 'type'".into()))?;
        let msg_type = MsgType::from_code(code)?;
        let rest = Value::Object(fields);
        let parse = |v: Value| -> Result<Self> { Ok(serde_json::from_value(v)?) };
        macro_rules! variant {
            ($name:ident) => {
                parse(serde_json::json!({ stringify!($name): rest }))
            };
        }
        match msg_type {
            MsgType::HandshakeHello => variant!(HandshakeHello),
            MsgType::HandshakeChallenge => variant!(HandshakeChallenge),
            MsgType::HandshakeResponse => variant!(HandshakeResponse),
            MsgType::HandshakeOk => Ok(Self::HandshakeOk),
            MsgType::Heartbeat => Ok(Self::Heartbeat),
            MsgType::Text => variant!(Text),
            MsgType::Image => variant!(Image),
            MsgType::FilesInline => variant!(FilesInline),
            MsgType::FileAnnounce => variant!(FileAnnounce),
            MsgType::FileRequest => variant!(FileRequest),
            MsgType::FileChunk => variant!(FileChunk),
            MsgType::FileComplete => variant!(FileComplete),
            MsgType::TransferCancel => variant!(TransferCancel),
            MsgType::TransferError => variant!(TransferError),
        }
    }
}

/// Encodes `header_len || header_json || payload`, the shape shared by both
/// the plaintext pre-handshake envelope and the plaintext sealed by AEAD
/// post-handshake.
pub fn encode_inner(msg: &Message, payload: &[u8]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(&msg.to_header_value()?)?;
    if header.len() > u32::MAX as usize {
        return Err(Error::ProtocolError("header too large".into()));
    }
    let mut out = Vec::with_capacity(4 + header.len() + payload.len());
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decodes the shape written by [`encode_inner`].
pub fn decode_inner(buf: &[u8]) -> Result<(Message, Vec<u8>)> {
    if buf.len() < 4 {
        return Err(Error::ProtocolError("frame shorter than header length prefix".into()));
    }
    let header_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    if 4 + header_len > buf.len() {
        return Err(Error::ProtocolError("header length overflows frame".into()));
    }
    let header_json = &buf[4..4 + header_len];
    let value: Value = serde_json::from_slice(header_json)?;
    let msg = Message::from_header_value(value)?;
    let payload = buf[4 + header_len..].to_vec();
    Ok((msg, payload))
}

/// Encodes the pre-handshake plaintext envelope: `u32 total_length || inner`.
pub fn encode_plain_frame(msg: &Message, payload: &[u8]) -> Result<Vec<u8>> {
    let inner = encode_inner(msg, payload)?;
    if inner.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(Error::ProtocolError("frame exceeds MAX_FRAME_SIZE".into()));
    }
    let mut out = Vec::with_capacity(4 + inner.len());
    out.extend_from_slice(&(inner.len() as u32).to_be_bytes());
    out.extend_from_slice(&inner);
    Ok(out)
}

/// Decodes the `total_length` body written after the outer length prefix has
/// already been read and validated by the caller.
pub fn decode_plain_frame(body: &[u8]) -> Result<(Message, Vec<u8>)> {
    decode_inner(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(msg: Message, payload: &[u8]) {
        let enc = encode_plain_frame(&msg, payload).unwrap();
        let total_len = u32::from_be_bytes(enc[0..4].try_into().unwrap()) as usize;
        assert_eq!(enc.len(), 4 + total_len);
        let (dec, dec_payload) = decode_plain_frame(&enc[4..]).unwrap();
        assert_eq!(dec, msg);
        assert_eq!(dec_payload, payload);
    }

    #[test]
    fn roundtrip_handshake_hello() {
        roundtrip(Message::HandshakeHello { nonce_c: "abc".into(), device_id: "dev1".into() }, b"");
    }

    #[test]
    fn roundtrip_handshake_ok() {
        roundtrip(Message::HandshakeOk, b"");
    }

    #[test]
    fn roundtrip_text() {
        roundtrip(Message::Text { content: "hello world".into() }, b"");
    }

    #[test]
    fn roundtrip_image_with_payload() {
        roundtrip(
            Message::Image { width: 10, height: 10, format: "png".into() },
            b"\x89PNG fake bytes",
        );
    }

    #[test]
    fn roundtrip_file_chunk_with_payload() {
        roundtrip(
            Message::FileChunk {
                transfer_id: "t1".into(),
                file_index: 0,
                offset: 0,
                length: 5,
                chunk_checksum: "deadbeef".into(),
            },
            b"hello",
        );
    }

    #[test]
    fn roundtrip_transfer_error() {
        roundtrip(
            Message::TransferError {
                transfer_id: Some("t1".into()),
                code: "EXPIRED_OR_UNKNOWN".into(),
                detail: "no such transfer".into(),
            },
            b"",
        );
    }

    #[test]
    fn unknown_type_code_is_protocol_error() {
        let body = {
            let header = serde_json::json!({"type": 0xff});
            let header = serde_json::to_vec(&header).unwrap();
            let mut v = (header.len() as u32).to_be_bytes().to_vec();
            v.extend_from_slice(&header);
            v
        };
        assert!(matches!(decode_plain_frame(&body), Err(Error::ProtocolError(_))));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let huge = vec![0u8; (MAX_FRAME_SIZE as usize) + 1];
        let err = encode_plain_frame(&Message::Text { content: String::new() }, &huge).unwrap_err();
        assert!(matches!(err, Error::ProtocolError(_)));
    }

    proptest! {
        #[test]
        fn decode_plain_frame_never_panics(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let _ = decode_plain_frame(&data);
        }

        #[test]
        fn text_roundtrip_prop(content in "[ -~]{0,256}") {
            let msg = Message::Text { content: content.clone() };
            let enc = encode_plain_frame(&msg, b"").unwrap();
            let (dec, _) = decode_plain_frame(&enc[4..]).unwrap();
            prop_assert_eq!(dec, Message::Text { content });
        }
    }
}
