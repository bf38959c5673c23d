pub mod conversation;
pub mod message;

pub use conversation::{ConnectionState, ConversationContext, Participant, RoomKey, Role};
pub use message::{
    normalize_conversation_key, value_as_id, Attachment, DeliveryStatus, Message,
    CONVERSATION_KEY_ALIASES, TEMP_ID_PREFIX,
};
