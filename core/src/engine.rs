//! Engine: the connection registry and command surface
//!
//! The engine owns the connection table, the group table and the event
//! queue. Commands are fire-and-forget messages into the per-connection
//! tasks; queries read the shared membership state directly. Events from
//! every connection arrive on one queue, tagged with the connection id.

use crate::connection::{
    ConnectionCommand, ConnectionHandle, ConnectionOption, ConnectionTable, ConnectionTask,
};
use crate::group::GroupTable;
use crate::membership::MembershipStore;
use crate::{ConnectSettings, Error, Event, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies one connection. Ids are small positive integers, reused
/// after a connection terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one connection group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A multi-connection IRC client engine.
///
/// Each [`connect`](Engine::connect) spawns an independent task that
/// maintains its server link; the engine routes commands to those tasks
/// and drains their events through [`next_event`](Engine::next_event).
pub struct Engine {
    connections: Arc<Mutex<ConnectionTable>>,
    groups: Arc<Mutex<GroupTable>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl Engine {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connections: Arc::new(Mutex::new(ConnectionTable::new())),
            groups: Arc::new(Mutex::new(GroupTable::new())),
            events_tx,
            events_rx,
        }
    }

    /// Open a new connection and return its id. The connection proceeds
    /// in the background; progress arrives as events.
    pub fn connect(&self, settings: ConnectSettings) -> ConnectionId {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let membership = Arc::new(Mutex::new(MembershipStore::new()));
        let id = {
            let mut connections = self.connections.lock();
            let id = smallest_unused_id(&connections);
            connections.insert(
                id,
                ConnectionHandle {
                    commands: commands_tx,
                    membership: Arc::clone(&membership),
                },
            );
            id
        };
        let task = ConnectionTask::new(
            id,
            settings,
            commands_rx,
            self.events_tx.clone(),
            membership,
            Arc::clone(&self.groups),
            Arc::clone(&self.connections),
        );
        tokio::spawn(task.run());
        tracing::debug!(connection = %id, "connection spawned");
        id
    }

    /// Close a connection, sending `QUIT :<message>` first when it is
    /// registered. The connection never respawns after this.
    pub fn quit(&self, id: ConnectionId, message: Option<&str>) -> Result<()> {
        self.send_command(id, ConnectionCommand::Quit(message.map(str::to_string)))
    }

    pub fn join_channel(&self, id: ConnectionId, channel: &str, key: Option<&str>) -> Result<()> {
        match key {
            Some(key) => self.send_line(id, format!("JOIN {} {}", channel, key)),
            None => self.send_line(id, format!("JOIN {}", channel)),
        }
    }

    pub fn part_channel(&self, id: ConnectionId, channel: &str, message: &str) -> Result<()> {
        self.send_line(id, format!("PART {} :{}", channel, message))
    }

    pub fn change_nick(&self, id: ConnectionId, nick: &str) -> Result<()> {
        self.send_line(id, format!("NICK {}", nick))
    }

    pub fn set_mode(&self, id: ConnectionId, target: &str, modes: &str) -> Result<()> {
        self.send_line(id, format!("MODE {} {}", target, modes))
    }

    pub fn say(&self, id: ConnectionId, target: &str, text: &str) -> Result<()> {
        self.send_line(id, format!("PRIVMSG {} :{}", target, text))
    }

    pub fn notice(&self, id: ConnectionId, target: &str, text: &str) -> Result<()> {
        self.send_line(id, format!("NOTICE {} :{}", target, text))
    }

    pub fn invite_user(&self, id: ConnectionId, user: &str, channel: &str) -> Result<()> {
        self.send_line(id, format!("INVITE {} {}", user, channel))
    }

    pub fn kick_user(
        &self,
        id: ConnectionId,
        channel: &str,
        user: &str,
        message: &str,
    ) -> Result<()> {
        self.send_line(id, format!("KICK {} {} :{}", channel, user, message))
    }

    pub fn set_channel_topic(&self, id: ConnectionId, channel: &str, topic: &str) -> Result<()> {
        self.send_line(id, format!("TOPIC {} :{}", channel, topic))
    }

    /// Send a CTCP request, wrapped in 0x01 delimiters.
    pub fn ctcp_request(&self, id: ConnectionId, user: &str, text: &str) -> Result<()> {
        self.send_line(id, format!("PRIVMSG {} :\u{1}{}\u{1}", user, text))
    }

    /// Send a CTCP reply, wrapped in 0x01 delimiters.
    pub fn ctcp_reply(&self, id: ConnectionId, user: &str, text: &str) -> Result<()> {
        self.send_line(id, format!("NOTICE {} :\u{1}{}\u{1}", user, text))
    }

    /// Send a raw protocol line verbatim (CRLF is appended).
    pub fn send_raw(&self, id: ConnectionId, line: &str) -> Result<()> {
        self.send_line(id, line.to_string())
    }

    /// Adjust one reconnect-policy knob on a live connection. Takes
    /// effect immediately; a connection with an open socket that has
    /// not registered yet restarts its connect cycle with the new
    /// value.
    pub fn set_option(&self, id: ConnectionId, option: ConnectionOption, value: i64) -> Result<()> {
        self.send_command(id, ConnectionCommand::SetOption(option, value))
    }

    /// Whether a connection id refers to a live connection.
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    pub fn is_user_on_channel(
        &self,
        id: ConnectionId,
        user: &str,
        channel: &str,
    ) -> Result<bool> {
        let membership = self.membership_of(id)?;
        let on = membership.lock().is_user_on(user, channel);
        Ok(on)
    }

    /// The privilege glyph a user holds on a channel, `"-"` when none
    /// is tracked.
    pub fn user_channel_mode(
        &self,
        id: ConnectionId,
        user: &str,
        channel: &str,
    ) -> Result<String> {
        let membership = self.membership_of(id)?;
        let mode = membership.lock().mode_of(user, channel);
        Ok(mode)
    }

    /// Space-separated `<glyph><nick>` listing for a channel, `"None"`
    /// when nothing is tracked.
    pub fn channel_user_list(&self, id: ConnectionId, channel: &str) -> Result<String> {
        let membership = self.membership_of(id)?;
        let list = membership.lock().channel_user_list(channel);
        Ok(list)
    }

    pub fn create_group(&self) -> GroupId {
        self.groups.lock().create()
    }

    pub fn destroy_group(&self, group: GroupId) -> Result<()> {
        if self.groups.lock().destroy(group) {
            Ok(())
        } else {
            Err(Error::UnknownGroup(group))
        }
    }

    /// Add a connection to a group. A connection belongs to at most one
    /// group and may not be added twice.
    pub fn add_to_group(&self, group: GroupId, id: ConnectionId) -> Result<()> {
        if !self.is_connected(id) {
            return Err(Error::UnknownConnection(id));
        }
        if self.groups.lock().add(group, id) {
            Ok(())
        } else {
            Err(Error::UnknownGroup(group))
        }
    }

    pub fn remove_from_group(&self, group: GroupId, id: ConnectionId) -> Result<()> {
        if self.groups.lock().remove(group, id) {
            Ok(())
        } else {
            Err(Error::UnknownGroup(group))
        }
    }

    /// Send a channel message through the group's next member in the
    /// rotation.
    pub fn group_say(&self, group: GroupId, target: &str, text: &str) -> Result<()> {
        let member = self.select_member(group)?;
        self.say(member, target, text)
    }

    /// Send a channel notice through the group's next member in the
    /// rotation.
    pub fn group_notice(&self, group: GroupId, target: &str, text: &str) -> Result<()> {
        let member = self.select_member(group)?;
        self.notice(member, target, text)
    }

    /// Wait for the next event from any connection.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    /// Take the next event without waiting, if one is queued.
    pub fn try_next_event(&mut self) -> Option<Event> {
        self.events_rx.try_recv().ok()
    }

    fn select_member(&self, group: GroupId) -> Result<ConnectionId> {
        let mut groups = self.groups.lock();
        if !groups.contains(group) {
            return Err(Error::UnknownGroup(group));
        }
        groups.select(group).ok_or(Error::EmptyGroup(group))
    }

    fn membership_of(&self, id: ConnectionId) -> Result<Arc<Mutex<MembershipStore>>> {
        let connections = self.connections.lock();
        let handle = connections.get(&id).ok_or(Error::UnknownConnection(id))?;
        Ok(Arc::clone(&handle.membership))
    }

    fn send_line(&self, id: ConnectionId, line: String) -> Result<()> {
        self.send_command(id, ConnectionCommand::SendLine(line))
    }

    fn send_command(&self, id: ConnectionId, command: ConnectionCommand) -> Result<()> {
        let connections = self.connections.lock();
        let handle = connections.get(&id).ok_or(Error::UnknownConnection(id))?;
        handle
            .commands
            .send(command)
            .map_err(|_| Error::UnknownConnection(id))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn smallest_unused_id(connections: &ConnectionTable) -> ConnectionId {
    let mut id = ConnectionId(1);
    for existing in connections.keys() {
        if *existing != id {
            break;
        }
        id.0 += 1;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smallest_unused_id_fills_gaps() {
        let mut table = ConnectionTable::new();
        assert_eq!(smallest_unused_id(&table), ConnectionId(1));
        for n in [1, 2, 4] {
            let (commands, _rx) = mpsc::unbounded_channel();
            table.insert(
                ConnectionId(n),
                ConnectionHandle {
                    commands,
                    membership: Arc::new(Mutex::new(MembershipStore::new())),
                },
            );
        }
        assert_eq!(smallest_unused_id(&table), ConnectionId(3));
    }

    #[test]
    fn test_commands_to_unknown_connection_fail() {
        let engine = Engine::new();
        let id = ConnectionId(42);
        assert!(!engine.is_connected(id));
        assert!(matches!(
            engine.say(id, "#chan", "hi"),
            Err(Error::UnknownConnection(_))
        ));
        assert!(matches!(
            engine.channel_user_list(id, "#chan"),
            Err(Error::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_group_errors() {
        let engine = Engine::new();
        assert!(matches!(
            engine.group_say(GroupId(9), "#chan", "hi"),
            Err(Error::UnknownGroup(_))
        ));
        let group = engine.create_group();
        assert!(matches!(
            engine.group_say(group, "#chan", "hi"),
            Err(Error::EmptyGroup(_))
        ));
        engine.destroy_group(group).unwrap();
        assert!(matches!(
            engine.destroy_group(group),
            Err(Error::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_add_to_group_requires_live_connection() {
        let engine = Engine::new();
        let group = engine.create_group();
        assert!(matches!(
            engine.add_to_group(group, ConnectionId(1)),
            Err(Error::UnknownConnection(_))
        ));
    }
}
