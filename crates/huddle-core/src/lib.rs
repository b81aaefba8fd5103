//! # huddle-core
//!
//! The presence and room state engine behind the Huddle server.
//!
//! This crate provides:
//!
//! - **Registry** - Sessions, users and room membership
//! - **Presence** - Join, leave, heartbeat and disconnect transitions
//! - **Chat** - Room messages with bounded per-room history
//! - **Signal** - Point-to-point call signaling between room members
//! - **Gateway** - The single outbound path for events
//! - **Broker** - In-process topic fan-out the transport subscribes to
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Engine    │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//! ┌─────────────┐     ┌─────────────┐
//! │   Broker    │◀────│   Gateway   │
//! └─────────────┘     └─────────────┘
//! ```

pub mod broker;
pub mod chat;
pub mod clock;
pub mod engine;
pub mod error;
pub mod gateway;
mod locks;
pub mod presence;
pub mod registry;
pub mod signal;
pub mod user;

pub use broker::Broker;
pub use chat::{ChatLog, ChatMessage, DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_ROOMS};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineConfig, SystemStats};
pub use error::EngineError;
pub use gateway::{Gateway, GatewayError, NullPublisher, Publisher};
pub use presence::{RoomPresence, RoomSummary};
pub use registry::{Registry, Removal};
pub use signal::SignalEnvelope;
pub use user::{RoomId, SessionId, User, UserId};
