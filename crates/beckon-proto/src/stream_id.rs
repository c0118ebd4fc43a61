//! Stream identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Width of the hex-encoded stream id sent on the back channel
pub const STREAM_ID_ENCODED_LEN: usize = 32;

/// 128-bit random token correlating one front connection to the one back
/// connection that will service it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Fixed-width lowercase hex form (32 characters, no separators)
    pub fn encode(&self) -> String {
        self.0.simple().to_string()
    }

    /// Parse the fixed-width token read from a back connection
    pub fn decode(token: &[u8]) -> Result<Self, StreamIdError> {
        if token.len() != STREAM_ID_ENCODED_LEN {
            return Err(StreamIdError::BadLength(token.len()));
        }
        let text = std::str::from_utf8(token).map_err(|_| StreamIdError::NotHex)?;
        let uuid = Uuid::try_parse(text).map_err(|_| StreamIdError::NotHex)?;
        Ok(Self(uuid))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for StreamId {
    type Err = StreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s.as_bytes())
    }
}

/// Stream id parse errors
#[derive(Debug, Error)]
pub enum StreamIdError {
    #[error("Bad stream id length: {0} bytes")]
    BadLength(usize),

    #[error("Stream id is not valid hex")]
    NotHex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_fixed_width_hex() {
        let id = StreamId::generate();
        let encoded = id.encode();

        assert_eq!(encoded.len(), STREAM_ID_ENCODED_LEN);
        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!encoded.contains('-'));
    }

    #[test]
    fn test_decode_round_trip() {
        let id = StreamId::generate();
        let decoded = StreamId::decode(id.encode().as_bytes()).unwrap();

        assert_eq!(id, decoded);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let result = StreamId::decode(b"abc123");
        assert!(matches!(result, Err(StreamIdError::BadLength(6))));

        let result = StreamId::decode(&[b'a'; 33]);
        assert!(matches!(result, Err(StreamIdError::BadLength(33))));
    }

    #[test]
    fn test_decode_rejects_non_hex() {
        let result = StreamId::decode(&[b'z'; STREAM_ID_ENCODED_LEN]);
        assert!(matches!(result, Err(StreamIdError::NotHex)));

        let result = StreamId::decode(&[0xff; STREAM_ID_ENCODED_LEN]);
        assert!(matches!(result, Err(StreamIdError::NotHex)));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(StreamId::generate()));
        }
    }

    #[test]
    fn test_from_str() {
        let id = StreamId::generate();
        let parsed: StreamId = id.encode().parse().unwrap();

        assert_eq!(id, parsed);
    }
}
