//! STOMP adapter: topic/subscribe messaging over a WebSocket.
//!
//! Connects to the raw WebSocket endpoint of a SockJS-enabled broker
//! (`<base>/ws-blueprints/websocket`), subscribes channels as
//! `/topic/<channel>` and publishes drawn points to `/app/draw`.

pub mod frame;

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use url::Url;

use self::frame::{Command, Frame, HeartBeat, Item};
use super::link::{self, Exit, Inbound, Session, Socket};
use super::{
    ConnectionState, Subscription, Transport, TransportError, TransportEvent, TransportKind,
    UpdateCallback, websocket_url,
};
use crate::config::StompConfig;
use crate::message::{PointPublish, UpdateMessage};
use crate::model::ChannelId;

/// How long to wait for CONNECTED after sending CONNECT.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Commands sent to the STOMP worker thread.
pub(crate) enum StompCommand {
    Subscribe {
        id: String,
        destination: String,
        on_update: UpdateCallback,
    },
    Unsubscribe {
        id: String,
    },
    Send {
        destination: String,
        body: String,
    },
    Close,
}

/// STOMP client over a WebSocket, driven by a background thread.
pub struct StompTransport {
    config: StompConfig,
    state: ConnectionState,
    /// Channel to send commands to the worker thread.
    cmd_tx: Option<Sender<StompCommand>>,
    /// Channel to receive events from the worker thread.
    event_rx: Option<Receiver<TransportEvent>>,
    _thread: Option<JoinHandle<()>>,
    next_subscription: u64,
}

impl StompTransport {
    pub fn new(config: StompConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            cmd_tx: None,
            event_rx: None,
            _thread: None,
            next_subscription: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn endpoint(&self) -> Result<Url, TransportError> {
        let path = format!(
            "{}/websocket",
            self.config.handshake_path.trim_end_matches('/')
        );
        websocket_url(&self.config.base_url, &path)
    }

    fn command(&self, command: StompCommand) -> Result<(), TransportError> {
        let tx = self.cmd_tx.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(command)
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

impl Transport for StompTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stomp
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.cmd_tx.is_some() {
            return Ok(());
        }
        let url = self.endpoint()?;

        let (cmd_tx, cmd_rx) = channel::<StompCommand>();
        let (event_tx, event_rx) = channel::<TransportEvent>();

        let session = StompSession {
            url,
            heartbeat: HeartBeat::new(
                self.config.heartbeat_outgoing,
                self.config.heartbeat_incoming,
            ),
            subscriptions: HashMap::new(),
        };
        let reconnect_delay = self.config.reconnect_delay;
        let handle = thread::Builder::new()
            .name("stomp-transport".to_string())
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
            let _ = tx.send(StompCommand::Close);
        }
        self.event_rx = None;
        // The worker notices the close within one read timeout; it is not joined
        // so teardown never blocks the caller.
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
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;

        tx.send(StompCommand::Subscribe {
            id: id.clone(),
            destination: channel.topic(),
            on_update,
        })
        .map_err(|e| TransportError::Send(e.to_string()))?;

        Ok(Subscription::new(channel.clone(), move || {
            let _ = tx.send(StompCommand::Unsubscribe { id });
        }))
    }

    fn publish_point(
        &mut self,
        _channel: &ChannelId,
        payload: &PointPublish,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let body =
            serde_json::to_string(payload).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.command(StompCommand::Send {
            destination: self.config.draw_destination.clone(),
            body,
        })
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

impl Drop for StompTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct ActiveSubscription {
    destination: String,
    on_update: UpdateCallback,
}

/// Worker-side state. Subscriptions outlive individual sessions and are
/// re-sent after every reconnect.
pub(crate) struct StompSession {
    url: Url,
    heartbeat: HeartBeat,
    subscriptions: HashMap<String, ActiveSubscription>,
}

impl StompSession {
    fn send(&self, socket: &mut Socket, frame: Frame) -> Result<(), TransportError> {
        let text = frame.encode();
        log::debug!("[STOMP] >>> {}", text.trim_end_matches('\0'));
        link::send_text(socket, text)
    }

    fn subscribe_frame(id: &str, destination: &str) -> Frame {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    /// Send CONNECT and wait for CONNECTED. Returns the broker's heart-beat.
    fn handshake(&self, socket: &mut Socket) -> Result<HeartBeat, TransportError> {
        let host = self.url.host_str().unwrap_or("localhost").to_string();
        self.send(
            socket,
            Frame::new(Command::Connect)
                .header("accept-version", "1.2,1.1")
                .header("host", host)
                .header("heart-beat", self.heartbeat.header_value()),
        )?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while Instant::now() < deadline {
            match link::read(socket) {
                Inbound::Text(text) => {
                    let items = frame::decode(&text)
                        .map_err(|e| TransportError::Protocol(e.to_string()))?;
                    for item in items {
                        let Item::Frame(frame) = item else { continue };
                        match frame.command {
                            Command::Connected => {
                                log::debug!(
                                    "[STOMP] <<< CONNECTED version={}",
                                    frame.get("version").unwrap_or("?")
                                );
                                return match frame.get("heart-beat") {
                                    Some(value) => HeartBeat::parse(value)
                                        .map_err(|e| TransportError::Protocol(e.to_string())),
                                    None => Ok(HeartBeat::default()),
                                };
                            }
                            Command::Error => {
                                return Err(TransportError::Protocol(
                                    frame.get("message").unwrap_or("broker error").to_string(),
                                ));
                            }
                            other => log::debug!("[STOMP] ignoring {other} before CONNECTED"),
                        }
                    }
                }
                Inbound::Idle => {}
                Inbound::Closed(reason) => return Err(TransportError::Connection(reason)),
            }
        }
        Err(TransportError::Connection("timed out waiting for CONNECTED".to_string()))
    }

    /// Handle a frame received on an established session.
    fn dispatch(&mut self, frame: Frame, events: &Sender<TransportEvent>) {
        match frame.command {
            Command::Message => {
                let Some(id) = frame.get("subscription") else {
                    log::warn!("[STOMP] MESSAGE without subscription header dropped");
                    return;
                };
                let Some(sub) = self.subscriptions.get_mut(id) else {
                    log::debug!("[STOMP] MESSAGE for inactive subscription {id} dropped");
                    return;
                };
                match UpdateMessage::from_json(&frame.body) {
                    Ok(update) => (sub.on_update)(update),
                    Err(e) => log::error!(
                        "[STOMP] invalid message on {}: {e}",
                        sub.destination
                    ),
                }
            }
            Command::Error => {
                let message = frame.get("message").unwrap_or("broker error").to_string();
                log::error!("[STOMP] ERROR frame: {message} {}", frame.body);
                let _ = events.send(TransportEvent::Error { message });
            }
            Command::Receipt => {
                log::trace!("[STOMP] receipt {}", frame.get("receipt-id").unwrap_or("?"));
            }
            other => log::debug!("[STOMP] ignoring {other}"),
        }
    }

    /// Apply a command on a live socket. `Ok(false)` means the owner closed.
    fn apply(&mut self, socket: &mut Socket, command: StompCommand) -> Result<bool, TransportError> {
        match command {
            StompCommand::Subscribe {
                id,
                destination,
                on_update,
            } => {
                self.send(socket, Self::subscribe_frame(&id, &destination))?;
                self.subscriptions.insert(
                    id,
                    ActiveSubscription {
                        destination,
                        on_update,
                    },
                );
            }
            StompCommand::Unsubscribe { id } => {
                if self.subscriptions.remove(&id).is_some() {
                    self.send(socket, Frame::new(Command::Unsubscribe).header("id", id))?;
                }
            }
            StompCommand::Send { destination, body } => {
                self.send(
                    socket,
                    Frame::new(Command::Send)
                        .header("destination", destination)
                        .header("content-type", "application/json")
                        .body(body),
                )?;
            }
            StompCommand::Close => {
                let _ = self.send(
                    socket,
                    Frame::new(Command::Disconnect).header("receipt", "close"),
                );
                link::close(socket);
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Session for StompSession {
    type Command = StompCommand;

    fn label(&self) -> &'static str {
        "STOMP"
    }

    fn run(&mut self, commands: &Receiver<StompCommand>, events: &Sender<TransportEvent>) -> Exit {
        let mut socket = match link::open(&self.url, "STOMP") {
            Ok(socket) => socket,
            Err(e) => return Exit::Unreachable(e.to_string()),
        };
        let broker = match self.handshake(&mut socket) {
            Ok(hb) => hb,
            Err(e) => {
                link::close(&mut socket);
                return Exit::Unreachable(e.to_string());
            }
        };
        let (send_every, expect_every) = self.heartbeat.negotiate(broker);
        log::info!(
            "[STOMP] connected (heart-beat out {:?}, in {:?})",
            send_every,
            expect_every
        );
        let _ = events.send(TransportEvent::Connected);

        let resubscribe: Vec<Frame> = self
            .subscriptions
            .iter()
            .map(|(id, sub)| Self::subscribe_frame(id, &sub.destination))
            .collect();
        for frame in resubscribe {
            if let Err(e) = self.send(&mut socket, frame) {
                return Exit::Dropped(e.to_string());
            }
        }

        let mut last_sent = Instant::now();
        let mut last_received = Instant::now();
        loop {
            loop {
                match commands.try_recv() {
                    Ok(command) => match self.apply(&mut socket, command) {
                        Ok(true) => last_sent = Instant::now(),
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

            if let Some(every) = send_every {
                if last_sent.elapsed() >= every {
                    log::trace!("[STOMP] >>> heart-beat");
                    if let Err(e) = link::send_text(&mut socket, "\n".to_string()) {
                        return Exit::Dropped(e.to_string());
                    }
                    last_sent = Instant::now();
                }
            }
            if let Some(every) = expect_every {
                if last_received.elapsed() > every * 2 {
                    link::close(&mut socket);
                    return Exit::Dropped("heart-beat timeout".to_string());
                }
            }

            match link::read(&mut socket) {
                Inbound::Text(text) => {
                    last_received = Instant::now();
                    log::debug!("[STOMP] <<< {}", text.trim_end_matches('\0'));
                    match frame::decode(&text) {
                        Ok(items) => {
                            for item in items {
                                if let Item::Frame(frame) = item {
                                    self.dispatch(frame, events);
                                }
                            }
                        }
                        Err(e) => log::error!("[STOMP] undecodable frame dropped: {e}"),
                    }
                }
                Inbound::Idle => {}
                Inbound::Closed(reason) => return Exit::Dropped(reason),
            }
        }
    }

    fn offline(&mut self, command: StompCommand) -> bool {
        match command {
            StompCommand::Subscribe {
                id,
                destination,
                on_update,
            } => {
                self.subscriptions.insert(
                    id,
                    ActiveSubscription {
                        destination,
                        on_update,
                    },
                );
            }
            StompCommand::Unsubscribe { id } => {
                self.subscriptions.remove(&id);
            }
            StompCommand::Send { destination, .. } => {
                log::warn!("[STOMP] offline, dropping publish to {destination}");
            }
            StompCommand::Close => return true,
        }
        false
    }
}
