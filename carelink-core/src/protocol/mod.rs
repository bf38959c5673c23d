pub mod events;
pub mod packet;

pub use events::{
    unwrap_message_payload, InboundEvent, OutboundEvent, MESSAGE_EVENT_ALIASES,
    RECONNECTED_EVENT, RECONNECT_FAILED_EVENT,
};
pub use packet::{EnginePacket, OpenPayload, PacketKind, SocketPacket};
