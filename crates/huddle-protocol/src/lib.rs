//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle presence server.
//!
//! This crate defines what clients and the server exchange: request and
//! reply frames, the events pushed on subscribed topics, the records those
//! carry, and the codecs that put them on the wire.
//!
//! ## Frames
//!
//! - `join` / `leave` / `ping` - Presence lifecycle
//! - `chat` / `chat_history` - Room conversations
//! - `call_signal` - Point-to-point signaling between room members
//! - `subscribe` / `unsubscribe` - Topic membership
//! - `room_presence` / `online_users` / `room_list` / `system_stats` - Queries
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientFrame};
//!
//! let frame = ClientFrame::Leave { id: 1 };
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod records;
pub mod topic;
pub mod version;

pub use codec::{decode, decode_json, encode, encode_json, ProtocolError};
pub use frames::{ClientFrame, ServerEvent, ServerFrame};
pub use records::{
    ChatRecord, RoomPresenceRecord, RoomSummaryRecord, SignalKind, SignalRecord,
    SystemStatsRecord, UserRecord,
};
pub use topic::Topic;
pub use version::{Version, PROTOCOL_VERSION};
