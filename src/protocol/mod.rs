//! JSON wire protocol between the engine and the remote consumer.

pub mod messages;

pub use messages::{
    parse_inbound, ClearedMessage, InboundEvent, IncorrectPayloadMessage, MediaMessage,
    PlayAudio, PlayedMessage, StartMessage, StopMessage,
};
