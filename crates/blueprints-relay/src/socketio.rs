//! Socket.IO v5 endpoint (Engine.IO v4, WebSocket transport only).
//!
//! Peers emit `join-room` with a channel id and `draw-event` with
//! `{room, author, name, point}`. Every other member of the room receives a
//! `blueprint-update` carrying `{author, name, point}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use blueprints_core::PointPublish;
use blueprints_core::transport::socketio::packet::{
    DEFAULT_NAMESPACE, EnginePacket, Handshake, Packet,
};
use blueprints_core::transport::socketio::{DRAW_EVENT, JOIN_EVENT, UPDATE_EVENT};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::hub::{self, Relayed};

const MAX_PAYLOAD: u64 = 1_000_000;

/// `draw-event` payload.
#[derive(Debug, Deserialize)]
struct DrawEvent {
    room: String,
    #[serde(flatten)]
    point: PointPublish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

/// Protocol state of one Socket.IO peer.
pub(crate) struct IoConnection {
    sid: String,
    state: Arc<AppState>,
    outbox: mpsc::UnboundedSender<(String, Relayed)>,
    /// Joined rooms and their forwarding tasks.
    rooms: HashMap<String, JoinHandle<()>>,
    namespace_connected: bool,
    last_pong: Instant,
}

impl IoConnection {
    pub(crate) fn new(
        sid: String,
        state: Arc<AppState>,
        outbox: mpsc::UnboundedSender<(String, Relayed)>,
    ) -> Self {
        Self {
            sid,
            state,
            outbox,
            rooms: HashMap::new(),
            namespace_connected: false,
            last_pong: Instant::now(),
        }
    }

    /// The Engine.IO open packet sent right after the upgrade.
    pub(crate) fn open_packet(&self) -> String {
        let config = &self.state.config;
        EnginePacket::Open(Handshake {
            sid: self.sid.clone(),
            upgrades: Vec::new(),
            ping_interval: config.ping_interval.as_millis() as u64,
            ping_timeout: config.ping_timeout.as_millis() as u64,
            max_payload: MAX_PAYLOAD,
        })
        .encode()
    }

    /// Whether the peer stopped answering pings.
    fn timed_out(&self) -> bool {
        let config = &self.state.config;
        self.last_pong.elapsed() > config.ping_interval + config.ping_timeout
    }

    /// Handle one Engine.IO text packet, pushing replies to `out`.
    pub(crate) fn on_text(&mut self, text: &str, out: &mut Vec<String>) -> Flow {
        match EnginePacket::decode(text) {
            Ok(EnginePacket::Pong(_)) => {
                self.last_pong = Instant::now();
                Flow::Continue
            }
            Ok(EnginePacket::Ping(data)) => {
                out.push(EnginePacket::Pong(data).encode());
                Flow::Continue
            }
            Ok(EnginePacket::Message(data)) => self.on_message(&data, out),
            Ok(EnginePacket::Close) => Flow::Close,
            Ok(other) => {
                debug!("Socket.IO {} ignoring {:?}", self.sid, other);
                Flow::Continue
            }
            Err(e) => {
                warn!("Undecodable Engine.IO packet from {}: {}", self.sid, e);
                Flow::Continue
            }
        }
    }

    fn on_message(&mut self, data: &str, out: &mut Vec<String>) -> Flow {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Undecodable Socket.IO packet from {}: {}", self.sid, e);
                return Flow::Continue;
            }
        };
        match packet {
            Packet::Connect { namespace, .. } if namespace == DEFAULT_NAMESPACE => {
                self.namespace_connected = true;
                info!("Socket.IO peer {} connected", self.sid);
                out.push(
                    Packet::Connect {
                        namespace,
                        data: Some(json!({ "sid": self.sid })),
                    }
                    .to_message(),
                );
            }
            Packet::Connect { namespace, .. } => {
                out.push(
                    Packet::ConnectError {
                        namespace,
                        data: json!({ "message": "Invalid namespace" }),
                    }
                    .to_message(),
                );
            }
            Packet::Disconnect { .. } => return Flow::Close,
            Packet::Event { .. } if !self.namespace_connected => {
                warn!("Socket.IO {} emitted before connecting", self.sid);
            }
            Packet::Event { name, mut args, .. } => {
                let payload = if args.is_empty() {
                    Value::Null
                } else {
                    args.swap_remove(0)
                };
                self.on_event(&name, payload);
            }
            other => debug!("Socket.IO {} ignoring {:?}", self.sid, other),
        }
        Flow::Continue
    }

    fn on_event(&mut self, name: &str, payload: Value) {
        match name {
            JOIN_EVENT => match payload {
                Value::String(room) => self.join(room),
                other => warn!("{} with non-string room {} ignored", JOIN_EVENT, other),
            },
            DRAW_EVENT => match serde_json::from_value::<DrawEvent>(payload) {
                Ok(draw) => {
                    let receivers = self.state.hub.publish(&draw.room, &self.sid, draw.point);
                    debug!("Relayed point on {} to {} receivers", draw.room, receivers);
                }
                Err(e) => warn!("Invalid {} from {}: {}", DRAW_EVENT, self.sid, e),
            },
            other => debug!("Socket.IO {} ignoring event {}", self.sid, other),
        }
    }

    fn join(&mut self, room: String) {
        if self.rooms.contains_key(&room) {
            return;
        }
        let rx = self.state.hub.join(&room, &self.sid);
        let task = hub::forward(rx, self.sid.clone(), room.clone(), self.outbox.clone());
        info!("Socket.IO peer {} joined {}", self.sid, room);
        self.rooms.insert(room, task);
    }

    /// Turn a relayed point into a `blueprint-update` event.
    pub(crate) fn deliver(&self, room: &str, relayed: Relayed) -> Option<String> {
        if !self.rooms.contains_key(room) {
            return None;
        }
        let payload = serde_json::to_value(&relayed.point).ok()?;
        Some(Packet::event(UPDATE_EVENT, payload).to_message())
    }
}

impl Drop for IoConnection {
    fn drop(&mut self) {
        for (room, task) in self.rooms.drain() {
            task.abort();
            self.state.hub.leave(&room, &self.sid);
        }
    }
}

/// WebSocket upgrade handler. Long-polling is not offered.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let eio = params.get("EIO").map(String::as_str);
    let transport = params.get("transport").map(String::as_str);
    if eio != Some("4") || transport != Some("websocket") {
        return (
            StatusCode::BAD_REQUEST,
            "only EIO=4 with transport=websocket is supported",
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn text(packet: String) -> Message {
    Message::Text(packet.into())
}

/// Handle a Socket.IO WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let sid = Uuid::new_v4().simple().to_string();
    info!("New Socket.IO connection: {}", sid);

    let ping_interval = state.config.ping_interval;
    let (mut sender, mut receiver) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    let mut connection = IoConnection::new(sid.clone(), state, outbox_tx);

    if sender.send(text(connection.open_packet())).await.is_err() {
        return;
    }
    let mut pings = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );

    loop {
        let mut out = Vec::new();
        let mut flow = Flow::Continue;

        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(data))) => {
                        flow = connection.on_text(data.as_str(), &mut out);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Binary message from {} ignored", sid);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", sid, e);
                        break;
                    }
                }
            }

            Some((room, relayed)) = outbox_rx.recv() => {
                out.extend(connection.deliver(&room, relayed));
            }

            _ = pings.tick() => {
                if connection.timed_out() {
                    warn!("Socket.IO peer {} stopped answering pings", sid);
                    break;
                }
                out.push(EnginePacket::Ping(String::new()).encode());
            }
        }

        for packet in out {
            if sender.send(text(packet)).await.is_err() {
                flow = Flow::Close;
                break;
            }
        }
        if flow == Flow::Close {
            break;
        }
    }

    let _ = sender.close().await;
    drop(connection);
    info!("Socket.IO connection closed: {}", sid);
}
