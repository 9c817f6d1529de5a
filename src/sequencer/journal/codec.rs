//! Payload codecs for log records.
//!
//! Every log stores its payloads with one [`LogCodec`]. JSON is the default;
//! the compact binary codec requires the `bincode` feature:
//!
//! ```toml
//! [dependencies]
//! exchange-sequencer = { version = "0.1", features = ["bincode"] }
//! ```

use super::error::JournalError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Payload encoding used by a durable log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCodec {
    /// Human-readable JSON (`serde_json`).
    #[default]
    Json,
    /// Compact binary encoding (`bincode`, standard configuration).
    #[cfg(feature = "bincode")]
    Bincode,
}

impl LogCodec {
    /// Encodes `value` into bytes.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Encode`] if the value cannot be serialized.
    pub fn encode<R: Serialize>(&self, value: &R) -> Result<Vec<u8>, JournalError> {
        match self {
            LogCodec::Json => serde_json::to_vec(value).map_err(|e| JournalError::Encode {
                message: e.to_string(),
            }),
            #[cfg(feature = "bincode")]
            LogCodec::Bincode => bincode::serde::encode_to_vec(value, bincode::config::standard())
                .map_err(|e| JournalError::Encode {
                    message: e.to_string(),
                }),
        }
    }

    /// Decodes the payload of the record stored at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Decode`] if the bytes are not a valid `R`.
    pub fn decode<R: DeserializeOwned>(
        &self,
        position: u64,
        bytes: &[u8],
    ) -> Result<R, JournalError> {
        match self {
            LogCodec::Json => serde_json::from_slice(bytes).map_err(|e| JournalError::Decode {
                position,
                message: e.to_string(),
            }),
            #[cfg(feature = "bincode")]
            LogCodec::Bincode => {
                bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                    .map(|(value, _)| value)
                    .map_err(|e| JournalError::Decode {
                        position,
                        message: e.to_string(),
                    })
            }
        }
    }

    /// MIME-style content type of the encoding.
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self {
            LogCodec::Json => "application/json",
            #[cfg(feature = "bincode")]
            LogCodec::Bincode => "application/x-bincode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        guid: String,
        amount: u128,
    }

    #[test]
    fn test_json_decode_reports_position() {
        let result: Result<Sample, _> = LogCodec::Json.decode(17, b"{not json");
        match result {
            Err(JournalError::Decode { position, .. }) => assert_eq!(position, 17),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_json_preserves_large_amounts() {
        let sample = Sample {
            guid: "g".to_string(),
            amount: u128::from(u64::MAX) * 3,
        };
        let bytes = LogCodec::Json.encode(&sample).expect("encode");
        let back: Sample = LogCodec::Json.decode(0, &bytes).expect("decode");
        assert_eq!(back, sample);
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn test_bincode_is_more_compact_than_json() {
        let sample = Sample {
            guid: "abc".to_string(),
            amount: 1_000_000,
        };
        let json = LogCodec::Json.encode(&sample).expect("json");
        let bin = LogCodec::Bincode.encode(&sample).expect("bincode");
        assert!(bin.len() < json.len());
        let back: Sample = LogCodec::Bincode.decode(0, &bin).expect("decode");
        assert_eq!(back, sample);
    }
}
