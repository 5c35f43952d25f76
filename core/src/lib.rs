//! Multi-Connection IRC Client Engine Core
//!
//! This crate provides the core functionality for an IRC client engine
//! that maintains many independent server connections, tracks channel
//! membership per connection, and reports everything that happens as a
//! single stream of events.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod framing;
pub mod group;
pub mod membership;
pub mod message;
pub mod reconnect;

pub use config::{Config, ServerConfig};
pub use connection::{ConnectSettings, ConnectionOption};
pub use engine::{ConnectionId, Engine, GroupId};
pub use error::{Error, Result};
pub use events::{Event, EventKind};
pub use framing::{frame_read, truncate_for_raw, MAX_RAW_EVENT_LEN, MAX_TRANSFER};
pub use group::GroupTable;
pub use membership::MembershipStore;
pub use message::{Command, LineKind, ParsedLine, PRIVILEGE_GLYPHS};
pub use reconnect::ReconnectPolicy;
