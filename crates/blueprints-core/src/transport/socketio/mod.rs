//! Socket.IO adapter: room/event emission over the Engine.IO WebSocket
//! transport.
//!
//! Joining a channel emits `join-room` with the channel id as room name and
//! listens for `blueprint-update`. Drawn points go out as `draw-event`.

pub mod packet;

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use url::Url;

use self::packet::{EnginePacket, Handshake, Packet};
use super::link::{self, Exit, Inbound, Session, Socket};
use super::{
    ConnectionState, Subscription, Transport, TransportError, TransportEvent, TransportKind,
    UpdateCallback, websocket_url,
};
use crate::config::SocketIoConfig;
use crate::message::{PointPublish, UpdateMessage};
use crate::model::{BlueprintKey, ChannelId};

pub const JOIN_EVENT: &str = "join-room";
pub const DRAW_EVENT: &str = "draw-event";
pub const UPDATE_EVENT: &str = "blueprint-update";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Emits buffered while offline, oldest dropped first.
const MAX_QUEUED_EMITS: usize = 256;

pub(crate) enum IoCommand {
    Join {
        id: u64,
        room: String,
        on_update: UpdateCallback,
    },
    Leave {
        id: u64,
    },
    Emit {
        event: String,
        payload: Value,
    },
    Close,
}

/// Socket.IO client, driven by a background thread.
pub struct SocketIoTransport {
    config: SocketIoConfig,
    state: ConnectionState,
    cmd_tx: Option<Sender<IoCommand>>,
    event_rx: Option<Receiver<TransportEvent>>,
    _thread: Option<JoinHandle<()>>,
    next_listener: u64,
}

impl SocketIoTransport {
    pub fn new(config: SocketIoConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            cmd_tx: None,
            event_rx: None,
            _thread: None,
            next_listener: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn endpoint(&self) -> Result<Url, TransportError> {
        let path = format!(
            "{}/?EIO=4&transport=websocket",
            self.config.path.trim_end_matches('/')
        );
        websocket_url(&self.config.base_url, &path)
    }
}

impl Transport for SocketIoTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SocketIo
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.cmd_tx.is_some() {
            return Ok(());
        }
        let url = self.endpoint()?;

        let (cmd_tx, cmd_rx) = channel::<IoCommand>();
        let (event_tx, event_rx) = channel::<TransportEvent>();

        let session = SocketIoSession {
            url,
            listeners: BTreeMap::new(),
            queued: Vec::new(),
        };
        let reconnect_delay = self.config.reconnect_delay;
        let handle = thread::Builder::new()
            .name("socketio-transport".to_string())
            .spawn(move || link::supervise(session, cmd_rx, event_tx, reconnect_delay))
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        self.state = ConnectionState::Connecting;
        self.cmd_tx = Some(cmd_tx);
        self.event_rx = Some(event_rx);
        self._thread = Some(handle);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(IoCommand::Close);
        }
        self.event_rx = None;
        self._thread = None;
        self.state = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn join_channel(
        &mut self,
        channel: &ChannelId,
        on_update: UpdateCallback,
    ) -> Result<Subscription, TransportError> {
        let tx = self.cmd_tx.clone().ok_or(TransportError::NotConnected)?;
        let id = self.next_listener;
        self.next_listener += 1;

        tx.send(IoCommand::Join {
            id,
            room: channel.as_str().to_string(),
            on_update,
        })
        .map_err(|e| TransportError::Send(e.to_string()))?;

        Ok(Subscription::new(channel.clone(), move || {
            let _ = tx.send(IoCommand::Leave { id });
        }))
    }

    fn publish_point(
        &mut self,
        channel: &ChannelId,
        payload: &PointPublish,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let tx = self.cmd_tx.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(IoCommand::Emit {
            event: DRAW_EVENT.to_string(),
            payload: draw_payload(channel, payload),
        })
        .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if let Some(ref rx) = self.event_rx {
            while let Ok(event) = rx.try_recv() {
                match &event {
                    TransportEvent::Connected => self.state = ConnectionState::Connected,
                    TransportEvent::Disconnected { .. } => self.state = ConnectionState::Connecting,
                    TransportEvent::Error { .. } => self.state = ConnectionState::Error,
                }
                events.push(event);
            }
        }
        events
    }
}

impl Drop for SocketIoTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// `draw-event` payload: `{room, author, name, point}`.
pub fn draw_payload(channel: &ChannelId, payload: &PointPublish) -> Value {
    json!({
        "room": channel.as_str(),
        "author": payload.author,
        "name": payload.name,
        "point": payload.point,
    })
}

/// Longest silence tolerated between server pings.
fn liveness_window(handshake: &Handshake) -> Duration {
    Duration::from_millis(handshake.ping_interval.saturating_add(handshake.ping_timeout))
}

struct Listener {
    room: String,
    on_update: UpdateCallback,
}

/// Worker-side state. Room memberships are server-side per socket, so every
/// new session re-emits `join-room` for the live listeners.
pub(crate) struct SocketIoSession {
    url: Url,
    listeners: BTreeMap<u64, Listener>,
    queued: Vec<(String, Value)>,
}

impl SocketIoSession {
    fn send(&self, socket: &mut Socket, packet: EnginePacket) -> Result<(), TransportError> {
        let text = packet.encode();
        log::debug!("[SOCKET.IO] >>> {text}");
        link::send_text(socket, text)
    }

    fn emit(&self, socket: &mut Socket, event: &str, payload: Value) -> Result<(), TransportError> {
        self.send(
            socket,
            EnginePacket::Message(Packet::event(event, payload).encode()),
        )
    }

    fn queue(&mut self, event: String, payload: Value) {
        if self.queued.len() >= MAX_QUEUED_EMITS {
            let (dropped, _) = self.queued.remove(0);
            log::warn!("[SOCKET.IO] offline queue full, dropping oldest {dropped}");
        }
        self.queued.push((event, payload));
    }

    /// Read until the Engine.IO open packet arrives, connect the default
    /// namespace and wait for its acknowledgement.
    fn handshake(&self, socket: &mut Socket) -> Result<Duration, TransportError> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut liveness = None;

        while Instant::now() < deadline {
            let text = match link::read(socket) {
                Inbound::Text(text) => text,
                Inbound::Idle => continue,
                Inbound::Closed(reason) => return Err(TransportError::Connection(reason)),
            };
            log::debug!("[SOCKET.IO] <<< {text}");
            match EnginePacket::decode(&text).map_err(|e| TransportError::Protocol(e.to_string()))? {
                EnginePacket::Open(handshake) => {
                    liveness = Some(liveness_window(&handshake));
                    self.send(socket, EnginePacket::Message(Packet::connect().encode()))?;
                }
                EnginePacket::Ping(data) => self.send(socket, EnginePacket::Pong(data))?,
                EnginePacket::Message(data) => {
                    match Packet::decode(&data).map_err(|e| TransportError::Protocol(e.to_string()))? {
                        Packet::Connect { .. } => {
                            return liveness.ok_or_else(|| {
                                TransportError::Protocol("namespace ack before open".to_string())
                            });
                        }
                        Packet::ConnectError { data, .. } => {
                            return Err(TransportError::Protocol(format!(
                                "namespace refused: {data}"
                            )));
                        }
                        other => log::debug!("[SOCKET.IO] ignoring {other:?} during handshake"),
                    }
                }
                EnginePacket::Close => {
                    return Err(TransportError::Connection("closed during handshake".to_string()));
                }
                _ => {}
            }
        }
        Err(TransportError::Connection("timed out waiting for namespace ack".to_string()))
    }

    /// Deliver a `blueprint-update` to the listeners it concerns.
    fn deliver(&mut self, payload: Value) {
        let update = match UpdateMessage::from_value(payload) {
            Ok(update) => update,
            Err(e) => {
                log::error!("[SOCKET.IO] invalid {UPDATE_EVENT} payload: {e}");
                return;
            }
        };
        let room = match (&update.author, &update.name) {
            (Some(author), Some(name)) => {
                Some(BlueprintKey::new(author.clone(), name.clone()).channel())
            }
            _ => None,
        };
        for listener in self.listeners.values_mut() {
            if room.as_ref().is_none_or(|r| r.as_str() == listener.room) {
                (listener.on_update)(update.clone());
            }
        }
    }

    fn handle_message(&mut self, data: &str) -> Result<(), Exit> {
        match Packet::decode(data) {
            Ok(Packet::Event { name, mut args, .. }) if name == UPDATE_EVENT => {
                if args.is_empty() {
                    log::error!("[SOCKET.IO] {UPDATE_EVENT} without payload dropped");
                } else {
                    self.deliver(args.swap_remove(0));
                }
            }
            Ok(Packet::Event { name, .. }) => log::debug!("[SOCKET.IO] ignoring event {name}"),
            Ok(Packet::Disconnect { .. }) => {
                return Err(Exit::Dropped("namespace disconnected by server".to_string()));
            }
            Ok(other) => log::debug!("[SOCKET.IO] ignoring {other:?}"),
            Err(e) => log::error!("[SOCKET.IO] undecodable packet dropped: {e}"),
        }
        Ok(())
    }

    /// Apply a command on a live socket. `Ok(false)` means the owner closed.
    fn apply(&mut self, socket: &mut Socket, command: IoCommand) -> Result<bool, TransportError> {
        match command {
            IoCommand::Join {
                id,
                room,
                on_update,
            } => {
                self.emit(socket, JOIN_EVENT, Value::String(room.clone()))?;
                self.listeners.insert(id, Listener { room, on_update });
            }
            IoCommand::Leave { id } => {
                self.listeners.remove(&id);
            }
            IoCommand::Emit { event, payload } => self.emit(socket, &event, payload)?,
            IoCommand::Close => {
                let _ = self.send(socket, EnginePacket::Message(Packet::Disconnect {
                    namespace: packet::DEFAULT_NAMESPACE.to_string(),
                }.encode()));
                link::close(socket);
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Session for SocketIoSession {
    type Command = IoCommand;

    fn label(&self) -> &'static str {
        "SOCKET.IO"
    }

    fn run(&mut self, commands: &Receiver<IoCommand>, events: &Sender<TransportEvent>) -> Exit {
        let mut socket = match link::open(&self.url, "SOCKET.IO") {
            Ok(socket) => socket,
            Err(e) => return Exit::Unreachable(e.to_string()),
        };
        let liveness = match self.handshake(&mut socket) {
            Ok(liveness) => liveness,
            Err(e) => {
                link::close(&mut socket);
                return Exit::Unreachable(e.to_string());
            }
        };
        log::info!("[SOCKET.IO] connected");
        let _ = events.send(TransportEvent::Connected);

        let mut rooms: Vec<String> = self.listeners.values().map(|l| l.room.clone()).collect();
        rooms.sort();
        rooms.dedup();
        for room in rooms {
            if let Err(e) = self.emit(&mut socket, JOIN_EVENT, Value::String(room)) {
                return Exit::Dropped(e.to_string());
            }
        }
        for (event, payload) in std::mem::take(&mut self.queued) {
            if let Err(e) = self.emit(&mut socket, &event, payload) {
                return Exit::Dropped(e.to_string());
            }
        }

        let mut last_ping = Instant::now();
        loop {
            loop {
                match commands.try_recv() {
                    Ok(command) => match self.apply(&mut socket, command) {
                        Ok(true) => {}
                        Ok(false) => return Exit::Closed,
                        Err(e) => return Exit::Dropped(e.to_string()),
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        link::close(&mut socket);
                        return Exit::Closed;
                    }
                }
            }

            if last_ping.elapsed() > liveness {
                link::close(&mut socket);
                return Exit::Dropped("ping timeout".to_string());
            }

            match link::read(&mut socket) {
                Inbound::Text(text) => {
                    log::debug!("[SOCKET.IO] <<< {text}");
                    match EnginePacket::decode(&text) {
                        Ok(EnginePacket::Ping(data)) => {
                            last_ping = Instant::now();
                            if let Err(e) = self.send(&mut socket, EnginePacket::Pong(data)) {
                                return Exit::Dropped(e.to_string());
                            }
                        }
                        Ok(EnginePacket::Message(data)) => {
                            if let Err(exit) = self.handle_message(&data) {
                                link::close(&mut socket);
                                return exit;
                            }
                        }
                        Ok(EnginePacket::Close) => {
                            return Exit::Dropped("engine closed by server".to_string());
                        }
                        Ok(_) => {}
                        Err(e) => log::error!("[SOCKET.IO] undecodable packet dropped: {e}"),
                    }
                }
                Inbound::Idle => {}
                Inbound::Closed(reason) => return Exit::Dropped(reason),
            }
        }
    }

    fn offline(&mut self, command: IoCommand) -> bool {
        match command {
            IoCommand::Join {
                id,
                room,
                on_update,
            } => {
                self.listeners.insert(id, Listener { room, on_update });
            }
            IoCommand::Leave { id } => {
                self.listeners.remove(&id);
            }
            IoCommand::Emit { event, payload } => self.queue(event, payload),
            IoCommand::Close => return true,
        }
        false
    }
}
