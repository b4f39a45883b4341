//! Binary frame protocol: 4-byte big-endian header length + JSON header + raw payload.

use serde::{Deserialize, Serialize};

use crate::types::Destination;

/// Header `type` value marking a whole-file frame.
pub const FILE_FRAME_TYPE: &str = "store_file";

/// Header for one chunk of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub id: String,
    pub session_id: String,
    pub index: u32,
    /// SHA-256 hex of the payload (empty means no verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Header for a whole file stored without a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHeader {
    pub id: String,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub filename: String,
    pub destination: Destination,
    /// Payload length the sender committed to; a shorter frame is rejected.
    pub size: u64,
}

impl FileHeader {
    pub fn new(
        id: impl Into<String>,
        filename: impl Into<String>,
        destination: Destination,
        size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            frame_type: FILE_FRAME_TYPE.into(),
            filename: filename.into(),
            destination,
            size,
        }
    }
}

/// Parsed binary frame.
#[derive(Debug)]
pub enum BinaryFrame {
    Chunk { header: ChunkHeader, data: Vec<u8> },
    File { header: FileHeader, data: Vec<u8> },
}

impl BinaryFrame {
    /// Request id carried in the header, used to correlate the reply.
    pub fn id(&self) -> &str {
        match self {
            BinaryFrame::Chunk { header, .. } => &header.id,
            BinaryFrame::File { header, .. } => &header.id,
        }
    }
}

/// Parses a raw binary WebSocket frame.
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`
pub fn parse_frame(data: &[u8]) -> Result<BinaryFrame, ParseError> {
    if data.len() < 4 {
        return Err(ParseError::TooShort);
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if data.len() - 4 < header_len {
        return Err(ParseError::HeaderTruncated {
            expected: header_len,
            got: data.len() - 4,
        });
    }

    let header_bytes = &data[4..4 + header_len];
    let payload = data[4 + header_len..].to_vec();

    // Peek at the JSON to determine type.
    let peek: HeaderPeek =
        serde_json::from_slice(header_bytes).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    if peek.frame_type.as_deref() == Some(FILE_FRAME_TYPE) {
        let header: FileHeader = serde_json::from_slice(header_bytes)
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        Ok(BinaryFrame::File {
            header,
            data: payload,
        })
    } else {
        let header: ChunkHeader = serde_json::from_slice(header_bytes)
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        Ok(BinaryFrame::Chunk {
            header,
            data: payload,
        })
    }
}

/// Encodes a header and payload into a binary frame.
pub fn encode_frame<T: Serialize>(header: &T, payload: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[derive(Deserialize)]
struct HeaderPeek {
    #[serde(rename = "type")]
    frame_type: Option<String>,
}

/// Errors from binary frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(header: &[u8], payload: &[u8]) -> Vec<u8> {
        let len = header.len() as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(header);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parse_chunk_frame() {
        let header = serde_json::to_vec(&serde_json::json!({
            "id": "msg-1",
            "sessionId": "s-1",
            "index": 3,
            "checksum": "abc123"
        }))
        .unwrap();
        let frame = make_frame(&header, b"chunk bytes");

        match parse_frame(&frame).unwrap() {
            BinaryFrame::Chunk { header, data } => {
                assert_eq!(header.id, "msg-1");
                assert_eq!(header.session_id, "s-1");
                assert_eq!(header.index, 3);
                assert_eq!(header.checksum, "abc123");
                assert_eq!(data, b"chunk bytes");
            }
            other => panic!("expected Chunk, got {other:?}"),
        }
    }

    #[test]
    fn parse_file_frame() {
        let header = FileHeader::new("msg-2", "notes.txt", Destination::new("docs", "2024"), 5);
        let frame = encode_frame(&header, b"hello").unwrap();

        match parse_frame(&frame).unwrap() {
            BinaryFrame::File { header: h, data } => {
                assert_eq!(h, header);
                assert_eq!(h.size, 5);
                assert_eq!(data, b"hello");
            }
            other => panic!("expected File, got {other:?}"),
        }
    }

    #[test]
    fn parse_too_short() {
        assert!(matches!(parse_frame(&[0, 0, 0]), Err(ParseError::TooShort)));
    }

    #[test]
    fn parse_header_truncated() {
        let data = [0, 0, 0, 100, 1, 2, 3, 4, 5];
        assert!(matches!(
            parse_frame(&data),
            Err(ParseError::HeaderTruncated { expected: 100, got: 5 })
        ));
    }

    #[test]
    fn parse_invalid_json() {
        let frame = make_frame(b"not json", b"payload");
        assert!(matches!(parse_frame(&frame), Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn frame_id_comes_from_header() {
        let header = ChunkHeader {
            id: "r-1".into(),
            session_id: "s".into(),
            index: 0,
            checksum: String::new(),
        };
        let frame = parse_frame(&encode_frame(&header, &[]).unwrap()).unwrap();
        assert_eq!(frame.id(), "r-1");
    }
}
