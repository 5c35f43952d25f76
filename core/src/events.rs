//! Outward notifications produced by connections
//!
//! Events are pushed into an unbounded channel by the connection tasks
//! and drained by the embedding host at its own cadence. Lifecycle is
//! create, enqueue, dequeue, discard; nothing is persisted.

use crate::ConnectionId;
use serde::Serialize;

/// One outward notification, tagged with its originating connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub connection: ConnectionId,
    pub kind: EventKind,
}

/// Everything a connection can report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventKind {
    /// Registration completed (numeric 001 received).
    Connected { address: String, port: u16 },
    /// The stream ended; reason is the timeout sentinel or transport
    /// error text.
    Disconnected {
        reason: String,
        address: String,
        port: u16,
    },
    /// About to attempt a TCP connect to one resolved candidate.
    ConnectAttempt { address: String, port: u16 },
    /// A resolve or connect attempt failed.
    ConnectAttemptFailed {
        reason: String,
        address: String,
        port: u16,
    },
    /// The bot joined a channel.
    JoinedChannel { channel: String },
    /// The bot parted a channel.
    LeftChannel { reason: String, channel: String },
    /// The bot was invited to a channel.
    InvitedToChannel {
        host: String,
        user: String,
        channel: String,
    },
    /// The bot was kicked from a channel.
    KickedFromChannel {
        reason: String,
        host: String,
        kicker: String,
        channel: String,
    },
    /// Another user quit the network.
    UserQuit {
        reason: String,
        host: String,
        user: String,
    },
    /// Another user joined a channel.
    UserJoinedChannel {
        host: String,
        user: String,
        channel: String,
    },
    /// Another user parted a channel.
    UserLeftChannel {
        reason: String,
        host: String,
        user: String,
        channel: String,
    },
    /// Another user was kicked from a channel.
    UserKickedFromChannel {
        reason: String,
        host: String,
        kicker: String,
        kicked: String,
        channel: String,
    },
    /// Another user changed nickname.
    UserChangedNick {
        host: String,
        new_nick: String,
        old_nick: String,
    },
    /// Another user changed channel modes.
    UserSetChannelMode {
        modes: String,
        host: String,
        user: String,
        channel: String,
    },
    /// Another user set a channel topic.
    UserSetChannelTopic {
        topic: String,
        host: String,
        user: String,
        channel: String,
    },
    /// PRIVMSG from another user.
    UserSaid {
        text: String,
        host: String,
        user: String,
        target: String,
    },
    /// NOTICE from another user.
    UserNotice {
        text: String,
        host: String,
        user: String,
        target: String,
    },
    /// CTCP request (PRIVMSG wrapped in 0x01).
    CtcpRequest {
        text: String,
        host: String,
        user: String,
    },
    /// CTCP reply (NOTICE wrapped in 0x01).
    CtcpReply {
        text: String,
        host: String,
        user: String,
    },
    /// Numeric reply not consumed by the engine itself.
    NumericReply { code: u16, text: String },
    /// Every framed line, truncated for transport.
    RawLine { line: String },
}
