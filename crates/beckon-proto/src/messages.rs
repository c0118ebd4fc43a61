//! Control-channel message types

use serde::{Deserialize, Serialize};

use crate::stream_id::StreamId;

/// Control protocol message enum, one message per frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Agent claims an access id on its control connection (agent → broker)
    Register {
        access_id: String,
        register_token: String,
    },

    /// Broker orders the agent to dial the back channel for one stream
    /// (broker → agent)
    Bind { stream_id: StreamId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_round_trip() {
        let msg = ControlMessage::Register {
            access_id: "svc1".to_string(),
            register_token: "tok1".to_string(),
        };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_bind_round_trip() {
        let stream_id = StreamId::generate();
        let msg = ControlMessage::Bind { stream_id };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlMessage = bincode::deserialize(&serialized).unwrap();

        if let ControlMessage::Bind { stream_id: decoded } = deserialized {
            assert_eq!(decoded, stream_id);
        } else {
            panic!("Expected Bind message");
        }
    }

    #[test]
    fn test_register_preserves_fields() {
        let msg = ControlMessage::Register {
            access_id: "db.internal".to_string(),
            register_token: "s3cret-token".to_string(),
        };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlMessage = bincode::deserialize(&serialized).unwrap();

        if let ControlMessage::Register {
            access_id,
            register_token,
        } = deserialized
        {
            assert_eq!(access_id, "db.internal");
            assert_eq!(register_token, "s3cret-token");
        } else {
            panic!("Expected Register message");
        }
    }

    #[test]
    fn test_garbage_does_not_decode() {
        let result: Result<ControlMessage, _> = bincode::deserialize(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(result.is_err());
    }
}
