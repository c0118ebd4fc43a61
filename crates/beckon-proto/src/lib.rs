//! Wire protocol for the beckon relay broker
//!
//! This crate defines the control-channel messages exchanged with agents,
//! their length-prefixed framing, the stream-id token used on the back
//! channel, and the listener configuration types shared across the broker
//! crates.

pub mod codec;
pub mod listener;
pub mod messages;
pub mod stream_id;

pub use codec::{CodecError, ControlCodec, FRAME_HEADER_LEN, MAX_CONTROL_FRAME};
pub use listener::{AclEntry, ListenerProtocol, ListenerSpec};
pub use messages::ControlMessage;
pub use stream_id::{StreamId, StreamIdError, STREAM_ID_ENCODED_LEN};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;
