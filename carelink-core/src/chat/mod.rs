//! Conversation engine: connection lifecycle, rooms, the message list,
//! sending, polling and the view-side helpers.

pub mod call;
pub mod connection;
pub mod event;
pub mod poller;
pub mod rooms;
pub mod scroll;
pub mod sender;
pub mod session;
pub mod store;

pub use call::{end_call, format_elapsed, start_call, CallHandle};
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionSettings};
pub use event::{Notice, NoticeLevel, SessionEvent};
pub use poller::{HistoryPoller, PollTarget, PollerSettings};
pub use rooms::{join_events, RoomJoiner};
pub use scroll::{ScrollController, ScrollDecision, ScrollMetrics, ScrollSurface};
pub use sender::{Composer, MessageSender, SendOutcome, SendPath};
pub use session::{ChatSession, ChatSessionBuilder, SessionSettings};
pub use store::{InboundOutcome, MessageStore, OptimisticHandle, SharedStore};
