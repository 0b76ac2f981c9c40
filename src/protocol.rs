//! Wire protocol spoken with the processing service.
//!
//! Messages are text-framed JSON, discriminated by a `type` field:
//!
//! - client → server: `{"type":"frame","data":"data:image/jpeg;base64,..."}`
//!   and, once before a voluntary disconnect, `{"type":"close"}`
//! - server → client:
//!   `{"type":"processed_frame","data":"data:image/jpeg;base64,...","stats":{...}}`
//!
//! The protocol carries no frame identifier or sequence number. A processed
//! frame cannot be correlated with the capture it came from; the client shows
//! whatever arrives last.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

pub const JPEG_MIME: &str = "image/jpeg";

/// Messages sent by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Frame { data: String },
    Close,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize client message")
    }
}

/// Messages received from the processing service.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ProcessedFrame {
        data: String,
        #[serde(default)]
        stats: Option<DetectionStats>,
    },
    /// Any message type this client does not understand.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| anyhow!("invalid server message: {}", e))
    }
}

/// Detection counts reported by the server for one processed frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionStats {
    #[serde(default)]
    pub faces: u32,
    #[serde(default)]
    pub documents: u32,
    #[serde(default)]
    pub total: u32,
}

/// Decoded `data:` URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataUri {
    pub mime: String,
    pub payload: Vec<u8>,
}

/// Wrap an encoded image as a base64 `data:` URI.
pub fn encode_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, general_purpose::STANDARD.encode(bytes))
}

/// Parse a base64 `data:` URI.
///
/// Only the base64 form is accepted; percent-encoded payloads are rejected.
pub fn decode_data_uri(uri: &str) -> Result<DataUri> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("payload is not a data uri"))?;
    let (header, body) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("data uri missing ',' separator"))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| anyhow!("data uri is not base64-encoded"))?;
    let payload = general_purpose::STANDARD
        .decode(body.trim())
        .context("decode base64 payload")?;
    if payload.is_empty() {
        return Err(anyhow!("data uri payload is empty"));
    }
    Ok(DataUri {
        mime: mime.to_string(),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_message_matches_wire_format() -> Result<()> {
        let msg = ClientMessage::Frame {
            data: "data:image/jpeg;base64,AAAA".to_string(),
        };
        assert_eq!(
            msg.to_json()?,
            r#"{"type":"frame","data":"data:image/jpeg;base64,AAAA"}"#
        );
        assert_eq!(ClientMessage::Close.to_json()?, r#"{"type":"close"}"#);
        Ok(())
    }

    #[test]
    fn parses_processed_frame_with_stats() -> Result<()> {
        let msg = ServerMessage::parse(
            r#"{"type":"processed_frame","data":"data:image/jpeg;base64,/9j/","stats":{"faces":3,"documents":1,"total":4}}"#,
        )?;
        assert_eq!(
            msg,
            ServerMessage::ProcessedFrame {
                data: "data:image/jpeg;base64,/9j/".to_string(),
                stats: Some(DetectionStats {
                    faces: 3,
                    documents: 1,
                    total: 4
                }),
            }
        );
        Ok(())
    }

    #[test]
    fn processed_frame_without_stats_is_accepted() -> Result<()> {
        let msg = ServerMessage::parse(r#"{"type":"processed_frame","data":"x"}"#)?;
        assert!(matches!(
            msg,
            ServerMessage::ProcessedFrame { stats: None, .. }
        ));
        Ok(())
    }

    #[test]
    fn unknown_types_are_tolerated() -> Result<()> {
        let msg = ServerMessage::parse(r#"{"type":"status","message":"warming up"}"#)?;
        assert_eq!(msg, ServerMessage::Unknown);
        Ok(())
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(ServerMessage::parse("{not json").is_err());
        assert!(ServerMessage::parse(r#"{"data":"x"}"#).is_err());
    }

    #[test]
    fn data_uri_round_trips_payload() -> Result<()> {
        let uri = encode_data_uri(JPEG_MIME, &[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(uri.starts_with("data:image/jpeg;base64,"));
        let decoded = decode_data_uri(&uri)?;
        assert_eq!(decoded.mime, JPEG_MIME);
        assert_eq!(decoded.payload, vec![0xFF, 0xD8, 0xFF, 0xD9]);
        Ok(())
    }

    #[test]
    fn data_uri_rejects_bad_input() {
        assert!(decode_data_uri("AAAA").is_err());
        assert!(decode_data_uri("data:image/jpeg,AAAA").is_err());
        assert!(decode_data_uri("data:image/jpeg;base64,!!!").is_err());
        assert!(decode_data_uri("data:image/jpeg;base64,").is_err());
    }
}
