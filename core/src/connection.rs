//! Connection lifecycle and inbound dispatch
//!
//! Each connection is owned by a single tokio task that drives the
//! resolve -> connect -> register -> stream cycle, applies membership
//! updates from parsed lines, and reacts to commands sent by the
//! engine. Serialization comes from task ownership: no two handlers
//! for the same connection ever run concurrently.

use crate::framing::{self, MAX_TRANSFER};
use crate::group::GroupTable;
use crate::membership::MembershipStore;
use crate::message::{self, Command, LineKind, ParsedLine};
use crate::reconnect::{
    ReconnectPolicy, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_DELAY, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_RECEIVE_TIMEOUT,
};
use crate::{ConnectionId, Error, Event, EventKind, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use hickory_resolver::TokioAsyncResolver;

/// Everything needed to open one connection.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub host: String,
    pub port: u16,
    pub nickname: String,
    pub realname: String,
    pub username: String,
    /// Local address to bind the socket to before connecting.
    pub local_address: Option<String>,
    /// Server password, sent as PASS before registration.
    pub password: Option<String>,
    pub connect_attempts: u32,
    pub connect_delay: u64,
    pub connect_timeout: u64,
    pub receive_timeout: u64,
    pub respawn: bool,
}

impl ConnectSettings {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        nickname: impl Into<String>,
        realname: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            nickname: nickname.into(),
            realname: realname.into(),
            username: username.into(),
            local_address: None,
            password: None,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_delay: DEFAULT_CONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            respawn: true,
        }
    }
}

/// Reconnect-policy knobs adjustable on a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOption {
    ConnectAttempts,
    ConnectDelay,
    ConnectTimeout,
    ReceiveTimeout,
    Respawn,
}

/// Commands the engine sends into a connection task.
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    /// Queue one wire line (without CRLF) for sending.
    SendLine(String),
    /// Send QUIT if registered, then stop without respawn.
    Quit(Option<String>),
    /// Change a policy knob; restarts a live attempt that has not
    /// registered yet.
    SetOption(ConnectionOption, i64),
}

/// The engine's grip on a running connection task.
pub(crate) struct ConnectionHandle {
    pub commands: mpsc::UnboundedSender<ConnectionCommand>,
    pub membership: Arc<Mutex<MembershipStore>>,
}

/// Live-connection table, keyed by id. Ordered so the smallest unused
/// id can be found by scanning.
pub(crate) type ConnectionTable = BTreeMap<ConnectionId, ConnectionHandle>;

/// What a command handler decided about the current phase.
enum Flow {
    Continue,
    Restart,
    Stop,
}

/// How a connected session ended.
enum SessionEnd {
    /// Read error, timeout or EOF; respawn may apply.
    Dropped,
    /// Explicit quit; never respawns.
    Quit,
    /// Options changed pre-registration; restart from resolve.
    Restart,
}

/// State owned by one connection's task.
pub(crate) struct ConnectionTask {
    id: ConnectionId,
    settings: ConnectSettings,
    policy: ReconnectPolicy,
    /// Current nickname; follows successful NICK changes.
    nickname: String,
    /// True once numeric 001 has been received.
    registered: bool,
    /// True while a connect attempt or a session stream is live.
    socket_open: bool,
    quitting: bool,
    /// Channels with an in-flight NAMES listing.
    pending_channels: HashSet<String>,
    connected_addr: Option<(String, u16)>,
    membership: Arc<Mutex<MembershipStore>>,
    groups: Arc<Mutex<GroupTable>>,
    connections: Arc<Mutex<ConnectionTable>>,
    events: mpsc::UnboundedSender<Event>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    writer: Option<mpsc::UnboundedSender<String>>,
}

impl ConnectionTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnectionId,
        settings: ConnectSettings,
        commands: mpsc::UnboundedReceiver<ConnectionCommand>,
        events: mpsc::UnboundedSender<Event>,
        membership: Arc<Mutex<MembershipStore>>,
        groups: Arc<Mutex<GroupTable>>,
        connections: Arc<Mutex<ConnectionTable>>,
    ) -> Self {
        let mut policy = ReconnectPolicy::default();
        policy.connect_attempts = settings.connect_attempts;
        policy.connect_delay = settings.connect_delay;
        policy.connect_timeout = settings.connect_timeout;
        policy.receive_timeout = settings.receive_timeout;
        policy.respawn = settings.respawn;
        let nickname = settings.nickname.clone();
        Self {
            id,
            settings,
            policy,
            nickname,
            registered: false,
            socket_open: false,
            quitting: false,
            pending_channels: HashSet::new(),
            connected_addr: None,
            membership,
            groups,
            connections,
            events,
            commands,
            writer: None,
        }
    }

    /// Drive the connection until it terminates, then deregister it.
    pub(crate) async fn run(mut self) {
        'respawn: loop {
            // Resolving: bounded retries on a timer.
            let candidates = loop {
                let lookup = Self::resolve(self.settings.host.clone(), self.settings.port);
                match self.await_with_commands(lookup).await {
                    Ok(Ok(candidates)) => break candidates,
                    Ok(Err(e)) => {
                        self.emit(EventKind::ConnectAttemptFailed {
                            reason: e.to_string(),
                            address: self.settings.host.clone(),
                            port: self.settings.port,
                        });
                        match self.wait_for(self.policy.connect_timeout).await {
                            Flow::Continue | Flow::Restart => {}
                            Flow::Stop => return self.finish(),
                        }
                        if !self.policy.retry_resolve() {
                            tracing::debug!(connection = %self.id, "resolve attempts exhausted");
                            return self.finish();
                        }
                    }
                    Err(Flow::Stop) => return self.finish(),
                    Err(_) => continue 'respawn,
                }
            };
            self.policy.begin(candidates);

            // Staggered connect attempts across the candidates.
            let (stream, addr) = loop {
                match self.wait_for(self.policy.connect_delay).await {
                    Flow::Continue => {}
                    Flow::Restart => continue 'respawn,
                    Flow::Stop => return self.finish(),
                }
                let Some(addr) = self.policy.next_attempt() else {
                    // Every candidate exhausted; terminal, no event.
                    tracing::debug!(connection = %self.id, "connect candidates exhausted");
                    return self.finish();
                };
                self.emit(EventKind::ConnectAttempt {
                    address: addr.ip().to_string(),
                    port: addr.port(),
                });
                self.socket_open = true;
                let connect = Self::try_connect(
                    self.settings.local_address.clone(),
                    self.policy.connect_timeout,
                    addr,
                );
                match self.await_with_commands(connect).await {
                    Ok(Ok(stream)) => break (stream, addr),
                    Ok(Err(reason)) => {
                        self.socket_open = false;
                        self.emit(EventKind::ConnectAttemptFailed {
                            reason,
                            address: addr.ip().to_string(),
                            port: addr.port(),
                        });
                    }
                    Err(flow) => {
                        self.socket_open = false;
                        match flow {
                            Flow::Stop => return self.finish(),
                            _ => continue 'respawn,
                        }
                    }
                }
            };

            self.connected_addr = Some((addr.ip().to_string(), addr.port()));
            match self.run_session(stream).await {
                SessionEnd::Quit => return self.finish(),
                SessionEnd::Restart => continue 'respawn,
                SessionEnd::Dropped => {
                    if self.quitting || !self.policy.respawn {
                        return self.finish();
                    }
                }
            }
        }
    }

    /// Await one phase of the cycle while still serving commands. A
    /// command that stops or restarts the cycle aborts the in-flight
    /// resolve or connect by dropping it.
    async fn await_with_commands<F>(&mut self, attempt: F) -> std::result::Result<F::Output, Flow>
    where
        F: std::future::Future,
    {
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                output = &mut attempt => return Ok(output),
                cmd = self.commands.recv() => match cmd {
                    None => {
                        self.quitting = true;
                        return Err(Flow::Stop);
                    }
                    Some(cmd) => match self.handle_command(cmd) {
                        Flow::Continue => {}
                        flow => return Err(flow),
                    },
                },
            }
        }
    }

    async fn resolve(host: String, port: u16) -> Result<Vec<SocketAddr>> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Resolve(e.to_string()))?;
        let lookup = resolver
            .lookup_ip(host.as_str())
            .await
            .map_err(|e| Error::Resolve(e.to_string()))?;
        let candidates: Vec<SocketAddr> = lookup
            .iter()
            .filter(|ip| ip.is_ipv4())
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        if candidates.is_empty() {
            return Err(Error::Resolve(format!("no IPv4 addresses for {}", host)));
        }
        Ok(candidates)
    }

    /// One connect attempt, bounded by the connect timeout. The timeout
    /// is reported with a fixed sentinel so the host can tell it apart
    /// from a refusal.
    async fn try_connect(
        local_address: Option<String>,
        timeout: u64,
        addr: SocketAddr,
    ) -> std::result::Result<TcpStream, String> {
        let socket = TcpSocket::new_v4().map_err(|e| e.to_string())?;
        if let Some(local) = &local_address {
            match local.parse::<IpAddr>() {
                Ok(ip) => {
                    if let Err(e) = socket.bind(SocketAddr::new(ip, 0)) {
                        tracing::warn!("error binding local address {} to socket: {}", local, e);
                    }
                }
                Err(e) => tracing::warn!("error using supplied local address {}: {}", local, e),
            }
        }
        match tokio::time::timeout(Duration::from_secs(timeout), socket.connect(addr)).await {
            Err(_) => Err("Connection attempt timed out".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(stream)) => Ok(stream),
        }
    }

    /// Registration handshake plus the read loop. Runs until the stream
    /// ends or a command stops it.
    async fn run_session(&mut self, stream: TcpStream) -> SessionEnd {
        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(write_half, rx));
        self.writer = Some(tx);

        if let Some(password) = self.settings.password.clone() {
            self.send_line(&format!("PASS {}", password));
        }
        self.send_line(&format!(
            "USER {} 0 * :{}",
            self.settings.username, self.settings.realname
        ));
        self.send_line(&format!("NICK {}", self.nickname));

        let mut buf = vec![0u8; MAX_TRANSFER];
        let end = loop {
            let receive_timeout = Duration::from_secs(self.policy.receive_timeout);
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None => {
                        self.quitting = true;
                        break SessionEnd::Quit;
                    }
                    Some(cmd) => match self.handle_command(cmd) {
                        Flow::Continue => {}
                        Flow::Restart => break SessionEnd::Restart,
                        Flow::Stop => break SessionEnd::Quit,
                    },
                },
                read = tokio::time::timeout(receive_timeout, read_half.read(&mut buf)) => {
                    match read {
                        Err(_) => {
                            self.emit_disconnect("Connection timed out");
                            break SessionEnd::Dropped;
                        }
                        Ok(Ok(0)) => {
                            self.emit_disconnect("End of file");
                            break SessionEnd::Dropped;
                        }
                        Ok(Ok(n)) => {
                            for line in framing::frame_read(&buf[..n]) {
                                self.emit(EventKind::RawLine {
                                    line: framing::truncate_for_raw(&line).to_string(),
                                });
                                self.handle_line(&line);
                            }
                        }
                        Ok(Err(e)) => {
                            self.emit_disconnect(&e.to_string());
                            break SessionEnd::Dropped;
                        }
                    }
                }
            }
        };
        self.teardown(writer_task).await;
        end
    }

    /// Drop session state and let queued outbound lines flush briefly.
    async fn teardown(&mut self, writer_task: JoinHandle<()>) {
        self.writer = None;
        if tokio::time::timeout(Duration::from_secs(5), writer_task)
            .await
            .is_err()
        {
            tracing::debug!(connection = %self.id, "writer did not drain in time");
        }
        self.registered = false;
        self.socket_open = false;
        self.pending_channels.clear();
        self.membership.lock().clear();
    }

    /// Remove this connection from the live table. The id becomes free
    /// for reuse only now.
    fn finish(&mut self) {
        self.connections.lock().remove(&self.id);
        tracing::debug!(connection = %self.id, "connection stopped");
    }

    fn handle_command(&mut self, command: ConnectionCommand) -> Flow {
        match command {
            ConnectionCommand::SendLine(line) => {
                self.send_line(&line);
                Flow::Continue
            }
            ConnectionCommand::Quit(message) => {
                self.quitting = true;
                if self.registered {
                    self.send_line(&format!("QUIT :{}", message.unwrap_or_default()));
                }
                Flow::Stop
            }
            ConnectionCommand::SetOption(option, value) => {
                let value = value.max(0);
                match option {
                    ConnectionOption::ConnectAttempts => {
                        self.policy.connect_attempts = value as u32
                    }
                    ConnectionOption::ConnectDelay => self.policy.connect_delay = value as u64,
                    ConnectionOption::ConnectTimeout => self.policy.connect_timeout = value as u64,
                    ConnectionOption::ReceiveTimeout => self.policy.receive_timeout = value as u64,
                    ConnectionOption::Respawn => self.policy.respawn = value != 0,
                }
                // Restart only a live, unregistered attempt; with no
                // socket the new value simply applies to the next one.
                if !self.registered && self.socket_open {
                    Flow::Restart
                } else {
                    Flow::Continue
                }
            }
        }
    }

    /// Sleep while still serving commands.
    async fn wait_for(&mut self, seconds: u64) -> Flow {
        let sleep = tokio::time::sleep(Duration::from_secs(seconds));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return Flow::Continue,
                cmd = self.commands.recv() => match cmd {
                    None => {
                        self.quitting = true;
                        return Flow::Stop;
                    }
                    Some(cmd) => match self.handle_command(cmd) {
                        Flow::Continue => {}
                        flow => return flow,
                    },
                },
            }
        }
    }

    /// Queue one line for sending. Lines sent while no stream is up are
    /// dropped; the read path owns failure reporting.
    fn send_line(&self, line: &str) {
        match &self.writer {
            Some(writer) => {
                let _ = writer.send(format!("{}\r\n", line));
            }
            None => {
                tracing::debug!(connection = %self.id, "dropping outbound line while not connected");
            }
        }
    }

    fn emit(&self, kind: EventKind) {
        let _ = self.events.send(Event {
            connection: self.id,
            kind,
        });
    }

    fn emit_disconnect(&self, reason: &str) {
        let (address, port) = self.connected_addr.clone().unwrap_or_default();
        self.emit(EventKind::Disconnected {
            reason: reason.to_string(),
            address,
            port,
        });
    }

    /// Dispatch one framed line: membership updates, protocol replies,
    /// event emission. Malformed lines are skipped, never errors.
    fn handle_line(&mut self, raw: &str) {
        let line = ParsedLine::parse(raw);
        match line.kind {
            LineKind::Numeric(code) => self.handle_numeric(code, &line, raw),
            LineKind::Command(command) => self.handle_server_command(command, &line, raw),
            LineKind::Unknown => {}
        }
    }

    fn handle_numeric(&mut self, code: u16, line: &ParsedLine, raw: &str) {
        match code {
            // RPL_WELCOME: registration complete.
            1 => {
                self.registered = true;
                let (address, port) = self.connected_addr.clone().unwrap_or_default();
                self.emit(EventKind::Connected { address, port });
            }
            // RPL_NAMREPLY: one page of a NAMES listing.
            353 => {
                if line.params.is_empty() || line.trailing.is_empty() {
                    return;
                }
                let channel = line.params.last().cloned().unwrap_or_default();
                if !self.pending_channels.contains(&channel) {
                    // First page of a fresh listing: rebuild rather
                    // than merge, so a second NAMES burst cannot
                    // duplicate entries.
                    self.membership.lock().remove_channel(&channel);
                    self.pending_channels.insert(channel.clone());
                }
                let mut membership = self.membership.lock();
                for token in line.trailing.split(' ').filter(|t| !t.is_empty()) {
                    let (mode, nick) = message::split_privilege(token);
                    if !nick.is_empty() {
                        membership.insert(nick, &channel, &mode);
                    }
                }
            }
            // RPL_ENDOFNAMES: the listing is complete.
            366 => {
                if let Some(channel) = line.params.last() {
                    self.pending_channels.remove(channel);
                }
            }
            _ => {
                self.emit(EventKind::NumericReply {
                    code,
                    text: message::numeric_text(raw, line.params.first().map(|p| p.as_str())),
                });
            }
        }
    }

    fn handle_server_command(&mut self, command: Command, line: &ParsedLine, raw: &str) {
        match command {
            Command::Nick => {
                if !line.has_prefix() || line.params.is_empty() {
                    return;
                }
                let new_nick = line.params.last().cloned().unwrap_or_default();
                if line.user != self.nickname {
                    self.emit(EventKind::UserChangedNick {
                        host: line.host.clone(),
                        new_nick: new_nick.clone(),
                        old_nick: line.user.clone(),
                    });
                } else {
                    self.nickname = new_nick.clone();
                }
                self.membership.lock().rename_user(&line.user, &new_nick);
            }
            Command::Quit => {
                if !line.has_prefix() || line.user == self.nickname {
                    return;
                }
                self.emit(EventKind::UserQuit {
                    reason: reason_or(&line.trailing, "No reason"),
                    host: line.host.clone(),
                    user: line.user.clone(),
                });
                self.membership.lock().remove_user(&line.user);
            }
            Command::Join => {
                if !line.has_prefix() || line.trailing.is_empty() {
                    return;
                }
                let channel = line.trailing.clone();
                if line.user == self.nickname {
                    self.emit(EventKind::JoinedChannel {
                        channel: channel.clone(),
                    });
                } else {
                    self.emit(EventKind::UserJoinedChannel {
                        host: line.host.clone(),
                        user: line.user.clone(),
                        channel: channel.clone(),
                    });
                }
                self.membership.lock().insert(&line.user, &channel, "");
            }
            Command::Part => {
                if !line.has_prefix() || line.params.is_empty() {
                    return;
                }
                let channel = line.params.last().cloned().unwrap_or_default();
                let reason = reason_or(&line.trailing, "No reason");
                if line.user == self.nickname {
                    self.emit(EventKind::LeftChannel {
                        reason,
                        channel: channel.clone(),
                    });
                    self.membership.lock().remove_channel(&channel);
                } else {
                    self.emit(EventKind::UserLeftChannel {
                        reason,
                        host: line.host.clone(),
                        user: line.user.clone(),
                        channel: channel.clone(),
                    });
                    self.membership.lock().remove_membership(&line.user, &channel);
                }
            }
            Command::Topic => {
                if !line.has_prefix() || line.params.is_empty() || line.user == self.nickname {
                    return;
                }
                self.emit(EventKind::UserSetChannelTopic {
                    topic: reason_or(&line.trailing, "No topic"),
                    host: line.host.clone(),
                    user: line.user.clone(),
                    channel: line.params.last().cloned().unwrap_or_default(),
                });
            }
            Command::Invite => {
                if !line.has_prefix() || line.trailing.is_empty() {
                    return;
                }
                self.emit(EventKind::InvitedToChannel {
                    host: line.host.clone(),
                    user: line.user.clone(),
                    channel: line.trailing.clone(),
                });
            }
            Command::Kick => {
                if !line.has_prefix() || line.params.len() != 2 {
                    return;
                }
                let channel = line.params[0].clone();
                let kicked = line.params[1].clone();
                let reason = reason_or(&line.trailing, "No reason");
                if kicked == self.nickname {
                    self.emit(EventKind::KickedFromChannel {
                        reason,
                        host: line.host.clone(),
                        kicker: line.user.clone(),
                        channel: channel.clone(),
                    });
                    self.membership.lock().remove_channel(&channel);
                } else {
                    self.emit(EventKind::UserKickedFromChannel {
                        reason,
                        host: line.host.clone(),
                        kicker: line.user.clone(),
                        kicked: kicked.clone(),
                        channel: channel.clone(),
                    });
                    self.membership.lock().remove_membership(&kicked, &channel);
                }
            }
            Command::Mode => {
                if !line.has_prefix() || line.params.len() < 2 {
                    return;
                }
                if line.user != self.nickname {
                    self.emit(EventKind::UserSetChannelMode {
                        modes: line.params_after_first(),
                        host: line.host.clone(),
                        user: line.user.clone(),
                        channel: line.params[0].clone(),
                    });
                }
                // Privilege-affecting modes invalidate tracked NAMES
                // state; refresh the listing.
                if line.params[1].chars().any(|c| "vhoauq".contains(c)) {
                    self.send_line(&format!("NAMES {}", line.params[0]));
                }
            }
            Command::Privmsg => {
                if !line.has_prefix() || line.params.is_empty() || line.trailing.is_empty() {
                    return;
                }
                if line.trailing.starts_with('\u{1}') {
                    self.emit(EventKind::CtcpRequest {
                        text: line.trailing.replace('\u{1}', ""),
                        host: line.host.clone(),
                        user: line.user.clone(),
                    });
                    return;
                }
                let target = line.params.last().cloned().unwrap_or_default();
                if (target.starts_with('#') || target.starts_with('&'))
                    && !self.groups.lock().is_designated_observer(self.id)
                {
                    // Another connection in the group reports this
                    // channel's traffic.
                    return;
                }
                if line.user != self.nickname {
                    self.emit(EventKind::UserSaid {
                        text: line.trailing.clone(),
                        host: line.host.clone(),
                        user: line.user.clone(),
                        target,
                    });
                }
            }
            Command::Notice => {
                if !line.has_prefix() || line.params.is_empty() || line.trailing.is_empty() {
                    return;
                }
                if line.trailing.starts_with('\u{1}') {
                    self.emit(EventKind::CtcpReply {
                        text: line.trailing.replace('\u{1}', ""),
                        host: line.host.clone(),
                        user: line.user.clone(),
                    });
                    return;
                }
                if line.user != self.nickname {
                    self.emit(EventKind::UserNotice {
                        text: line.trailing.clone(),
                        host: line.host.clone(),
                        user: line.user.clone(),
                        target: line.params.last().cloned().unwrap_or_default(),
                    });
                }
            }
            Command::Ping => {
                self.send_line(&raw.replacen("PING", "PONG", 1));
            }
        }
    }
}

fn reason_or(trailing: &str, fallback: &str) -> String {
    if trailing.is_empty() {
        fallback.to_string()
    } else {
        trailing.to_string()
    }
}

/// Outbound writer: drains the queue strictly in order, one line at a
/// time. A failed write ends the loop, discarding everything still
/// queued; disconnect reporting belongs to the read path.
async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            tracing::debug!("write failed, discarding pending output: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        task: ConnectionTask,
        commands: mpsc::UnboundedSender<ConnectionCommand>,
        events: mpsc::UnboundedReceiver<Event>,
        outbound: mpsc::UnboundedReceiver<String>,
    }

    fn fixture() -> Fixture {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (writer_tx, outbound) = mpsc::unbounded_channel();
        let mut task = ConnectionTask::new(
            ConnectionId(1),
            ConnectSettings::new("irc.example.net", 6667, "mybot", "My Bot", "mybot"),
            commands_rx,
            events_tx,
            Arc::new(Mutex::new(MembershipStore::new())),
            Arc::new(Mutex::new(GroupTable::new())),
            Arc::new(Mutex::new(ConnectionTable::new())),
        );
        task.registered = true;
        task.socket_open = true;
        task.writer = Some(writer_tx);
        task.connected_addr = Some(("10.0.0.1".to_string(), 6667));
        Fixture {
            task,
            commands: commands_tx,
            events,
            outbound,
        }
    }

    fn feed(fixture: &mut Fixture, bytes: &[u8]) {
        for line in framing::frame_read(bytes) {
            fixture.task.handle_line(&line);
        }
    }

    #[test]
    fn test_privmsg_roundtrip() {
        let mut f = fixture();
        feed(&mut f, b":nick!user@host PRIVMSG #chan :hello\r\n");
        let event = f.events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            EventKind::UserSaid {
                text: "hello".to_string(),
                host: "user@host".to_string(),
                user: "nick".to_string(),
                target: "#chan".to_string(),
            }
        );
    }

    #[test]
    fn test_privmsg_from_self_is_silent() {
        let mut f = fixture();
        feed(&mut f, b":mybot!user@host PRIVMSG #chan :hello\r\n");
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn test_ping_pong() {
        let mut f = fixture();
        feed(&mut f, b"PING :server123\r\n");
        assert_eq!(f.outbound.try_recv().unwrap(), "PONG :server123\r\n");
    }

    #[test]
    fn test_welcome_marks_registered() {
        let mut f = fixture();
        f.task.registered = false;
        feed(&mut f, b":irc.example.net 001 mybot :Welcome\r\n");
        assert!(f.task.registered);
        let event = f.events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            EventKind::Connected {
                address: "10.0.0.1".to_string(),
                port: 6667,
            }
        );
    }

    #[test]
    fn test_numeric_reply_event() {
        let mut f = fixture();
        feed(&mut f, b":irc.example.net 372 mybot :- motd line\r\n");
        let event = f.events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            EventKind::NumericReply {
                code: 372,
                text: ":- motd line".to_string(),
            }
        );
    }

    #[test]
    fn test_names_bootstrap_is_idempotent() {
        let mut f = fixture();
        feed(&mut f, b":srv 353 mybot = #x :@alice +bob carol\r\n");
        assert_eq!(
            f.task.membership.lock().channel_user_list("#x"),
            "@alice +bob carol"
        );

        // Continuation while pending: merge, not clear.
        feed(&mut f, b":srv 353 mybot = #x :dave\r\n");
        assert_eq!(
            f.task.membership.lock().channel_user_list("#x"),
            "@alice +bob carol dave"
        );

        // End of listing, then a fresh burst: rebuild, no duplicates.
        feed(&mut f, b":srv 366 mybot #x :End of /NAMES list.\r\n");
        feed(&mut f, b":srv 353 mybot = #x :@alice +bob carol\r\n");
        assert_eq!(
            f.task.membership.lock().channel_user_list("#x"),
            "@alice +bob carol"
        );
    }

    #[test]
    fn test_kick_of_self_prunes_channel_everywhere() {
        let mut f = fixture();
        {
            let mut membership = f.task.membership.lock();
            membership.insert("a", "#x", "");
            membership.insert("a", "#y", "");
            membership.insert("b", "#x", "");
        }
        feed(&mut f, b":op!h KICK #x mybot :bye\r\n");
        let event = f.events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            EventKind::KickedFromChannel {
                reason: "bye".to_string(),
                host: "h".to_string(),
                kicker: "op".to_string(),
                channel: "#x".to_string(),
            }
        );
        let membership = f.task.membership.lock();
        assert!(!membership.is_user_on("a", "#x"));
        assert!(membership.is_user_on("a", "#y"));
        assert!(!membership.is_user_on("b", "#x"));
        assert!(membership.no_empty_users());
    }

    #[test]
    fn test_kick_of_other_removes_single_membership() {
        let mut f = fixture();
        f.task.membership.lock().insert("victim", "#x", "");
        feed(&mut f, b":op!h KICK #x victim\r\n");
        let event = f.events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            EventKind::UserKickedFromChannel {
                reason: "No reason".to_string(),
                host: "h".to_string(),
                kicker: "op".to_string(),
                kicked: "victim".to_string(),
                channel: "#x".to_string(),
            }
        );
        assert!(!f.task.membership.lock().is_user_on("victim", "#x"));
    }

    #[test]
    fn test_own_nick_change_is_silent() {
        let mut f = fixture();
        feed(&mut f, b":mybot!u@h NICK newbot\r\n");
        assert!(f.events.try_recv().is_err());
        assert_eq!(f.task.nickname, "newbot");
    }

    #[test]
    fn test_other_nick_change_rekeys_membership() {
        let mut f = fixture();
        f.task.membership.lock().insert("alice", "#x", "@");
        feed(&mut f, b":alice!u@h NICK alicia\r\n");
        let event = f.events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            EventKind::UserChangedNick {
                host: "u@h".to_string(),
                new_nick: "alicia".to_string(),
                old_nick: "alice".to_string(),
            }
        );
        let membership = f.task.membership.lock();
        assert!(!membership.is_user_on("alice", "#x"));
        assert_eq!(membership.mode_of("alicia", "#x"), "@");
    }

    #[test]
    fn test_quit_removes_user_everywhere() {
        let mut f = fixture();
        {
            let mut membership = f.task.membership.lock();
            membership.insert("alice", "#x", "");
            membership.insert("alice", "#y", "");
        }
        feed(&mut f, b":alice!u@h QUIT :gone\r\n");
        let event = f.events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            EventKind::UserQuit {
                reason: "gone".to_string(),
                host: "u@h".to_string(),
                user: "alice".to_string(),
            }
        );
        assert!(f.task.membership.lock().is_empty());
    }

    #[test]
    fn test_ctcp_reply_stripping() {
        let mut f = fixture();
        feed(&mut f, b":nick!u@h NOTICE mybot :\x01VERSION\x01\r\n");
        let event = f.events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            EventKind::CtcpReply {
                text: "VERSION".to_string(),
                host: "u@h".to_string(),
                user: "nick".to_string(),
            }
        );
    }

    #[test]
    fn test_mode_refreshes_names_on_privilege_change() {
        let mut f = fixture();
        feed(&mut f, b":op!h MODE #x +o alice\r\n");
        let event = f.events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            EventKind::UserSetChannelMode {
                modes: "+o alice".to_string(),
                host: "h".to_string(),
                user: "op".to_string(),
                channel: "#x".to_string(),
            }
        );
        assert_eq!(f.outbound.try_recv().unwrap(), "NAMES #x\r\n");
    }

    #[test]
    fn test_mode_without_privilege_letters_skips_refresh() {
        let mut f = fixture();
        feed(&mut f, b":op!h MODE #x +m\r\n");
        // Wrong arity for the event (one trailing token), but also no
        // refresh should fire for a non-membership mode.
        feed(&mut f, b":op!h MODE #x +tn extra\r\n");
        while f.events.try_recv().is_ok() {}
        assert!(f.outbound.try_recv().is_err());
    }

    #[test]
    fn test_group_suppression_for_non_designated_member() {
        let mut f = fixture();
        {
            let mut groups = f.task.groups.lock();
            let group = groups.create();
            groups.add(group, ConnectionId(7));
            groups.add(group, ConnectionId(1));
        }
        feed(&mut f, b":nick!u@h PRIVMSG #chan :hello\r\n");
        assert!(f.events.try_recv().is_err());

        // Direct messages are never suppressed.
        feed(&mut f, b":nick!u@h PRIVMSG mybot :hello\r\n");
        assert!(f.events.try_recv().is_ok());
    }

    #[test]
    fn test_join_and_part_self() {
        let mut f = fixture();
        feed(&mut f, b":mybot!u@h JOIN :#x\r\n");
        assert_eq!(
            f.events.try_recv().unwrap().kind,
            EventKind::JoinedChannel {
                channel: "#x".to_string()
            }
        );

        f.task.membership.lock().insert("alice", "#x", "");
        feed(&mut f, b":mybot!u@h PART #x\r\n");
        assert_eq!(
            f.events.try_recv().unwrap().kind,
            EventKind::LeftChannel {
                reason: "No reason".to_string(),
                channel: "#x".to_string(),
            }
        );
        assert!(!f.task.membership.lock().is_user_on("alice", "#x"));
    }

    #[test]
    fn test_set_option_restarts_only_live_unregistered_attempt() {
        let mut f = fixture();
        f.task.registered = false;
        assert!(matches!(
            f.task
                .handle_command(ConnectionCommand::SetOption(ConnectionOption::ConnectDelay, 3)),
            Flow::Restart
        ));
        assert_eq!(f.task.policy.connect_delay, 3);

        // No socket yet: the value applies without restarting.
        f.task.socket_open = false;
        assert!(matches!(
            f.task
                .handle_command(ConnectionCommand::SetOption(ConnectionOption::ConnectTimeout, 7)),
            Flow::Continue
        ));
        assert_eq!(f.task.policy.connect_timeout, 7);

        // Registered: the value applies to the next cycle only.
        f.task.socket_open = true;
        f.task.registered = true;
        assert!(matches!(
            f.task
                .handle_command(ConnectionCommand::SetOption(ConnectionOption::Respawn, 0)),
            Flow::Continue
        ));
        assert!(!f.task.policy.respawn);
    }

    #[tokio::test]
    async fn test_quit_aborts_in_flight_attempt() {
        let mut f = fixture();
        f.commands.send(ConnectionCommand::Quit(None)).unwrap();
        // The attempt never completes; the queued quit must win.
        let outcome = f
            .task
            .await_with_commands(std::future::pending::<()>())
            .await;
        assert!(matches!(outcome, Err(Flow::Stop)));
        assert!(f.task.quitting);
    }

    #[tokio::test]
    async fn test_set_option_aborts_in_flight_attempt_pre_registration() {
        let mut f = fixture();
        f.task.registered = false;
        f.commands
            .send(ConnectionCommand::SetOption(ConnectionOption::ConnectDelay, 1))
            .unwrap();
        let outcome = f
            .task
            .await_with_commands(std::future::pending::<()>())
            .await;
        assert!(matches!(outcome, Err(Flow::Restart)));
        assert_eq!(f.task.policy.connect_delay, 1);
    }

    #[tokio::test]
    async fn test_closed_command_channel_stops_attempt() {
        let Fixture {
            mut task, commands, ..
        } = fixture();
        drop(commands);
        let outcome = task.await_with_commands(std::future::pending::<()>()).await;
        assert!(matches!(outcome, Err(Flow::Stop)));
        assert!(task.quitting);
    }

    #[tokio::test]
    async fn test_write_failure_discards_pending_queue() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        let (_read_half, write_half) = client.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write_half, rx));
        // Keep queueing; the loop must end on the first failed write
        // while our sender is still alive, not by draining the channel.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !writer.is_finished() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "writer kept retrying after failed writes"
            );
            let _ = tx.send("PRIVMSG #chan :payload\r\n".to_string());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        writer.await.unwrap();
    }

    #[test]
    fn test_quit_sends_quit_only_when_registered() {
        let mut f = fixture();
        assert!(matches!(
            f.task
                .handle_command(ConnectionCommand::Quit(Some("bye".to_string()))),
            Flow::Stop
        ));
        assert!(f.task.quitting);
        assert_eq!(f.outbound.try_recv().unwrap(), "QUIT :bye\r\n");

        let mut g = fixture();
        g.task.registered = false;
        assert!(matches!(
            g.task.handle_command(ConnectionCommand::Quit(None)),
            Flow::Stop
        ));
        assert!(g.outbound.try_recv().is_err());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let mut f = fixture();
        // KICK with wrong arity, QUIT without prefix, bare command.
        feed(&mut f, b":op!h KICK #x\r\n");
        feed(&mut f, b"QUIT :gone\r\n");
        feed(&mut f, b"UNKNOWNCMD a b c\r\n");
        assert!(f.events.try_recv().is_err());
    }
}
