//! STOMP 1.2 endpoint.
//!
//! Peers subscribe to `/topic/blueprints.<author>.<name>` and send drawn
//! points to the draw destination (`/app/draw`). Each point is delivered as
//! a `MESSAGE` with a `{author, name, point}` body to every other subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use blueprints_core::transport::stomp::frame::{self, Command, Frame, HeartBeat, Item};
use blueprints_core::{ChannelId, PointPublish};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::hub::{self, Relayed};

/// Housekeeping period for heart-beats.
const TICK: Duration = Duration::from_millis(500);

const VERSIONS: [&str; 3] = ["1.2", "1.1", "1.0"];

struct Membership {
    channel: String,
    destination: String,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

/// Protocol state of one STOMP peer.
pub(crate) struct StompConnection {
    peer: String,
    state: Arc<AppState>,
    outbox: mpsc::UnboundedSender<(String, Relayed)>,
    /// Subscriptions by client-chosen id.
    memberships: HashMap<String, Membership>,
    connected: bool,
    send_every: Option<Duration>,
    expect_every: Option<Duration>,
}

fn error_frame(message: &str, detail: impl Into<String>) -> Frame {
    Frame::new(Command::Error)
        .header("message", message)
        .header("content-type", "text/plain")
        .body(detail)
}

impl StompConnection {
    pub(crate) fn new(
        peer: String,
        state: Arc<AppState>,
        outbox: mpsc::UnboundedSender<(String, Relayed)>,
    ) -> Self {
        Self {
            peer,
            state,
            outbox,
            memberships: HashMap::new(),
            connected: false,
            send_every: None,
            expect_every: None,
        }
    }

    /// Handle one WebSocket text message, which may carry several frames.
    pub(crate) fn on_text(&mut self, text: &str, out: &mut Vec<Frame>) -> Flow {
        let items = match frame::decode(text) {
            Ok(items) => items,
            Err(e) => {
                warn!("Undecodable STOMP data from {}: {}", self.peer, e);
                out.push(error_frame("malformed frame", e.to_string()));
                return Flow::Close;
            }
        };
        for item in items {
            if let Item::Frame(frame) = item {
                if self.on_frame(frame, out) == Flow::Close {
                    return Flow::Close;
                }
            }
        }
        Flow::Continue
    }

    pub(crate) fn on_frame(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Flow {
        debug!("STOMP {} <<< {}", self.peer, frame.command);
        if !self.connected && !matches!(frame.command, Command::Connect | Command::Stomp) {
            out.push(error_frame(
                "not connected",
                format!("{} before CONNECT", frame.command),
            ));
            return Flow::Close;
        }

        let flow = match frame.command {
            Command::Connect | Command::Stomp => self.on_connect(&frame, out),
            Command::Subscribe => self.on_subscribe(&frame, out),
            Command::Unsubscribe => self.on_unsubscribe(&frame, out),
            Command::Send => self.on_send(&frame, out),
            Command::Disconnect => Flow::Close,
            other => {
                out.push(error_frame(
                    "unsupported",
                    format!("{other} is not supported by this relay"),
                ));
                return Flow::Close;
            }
        };

        if flow == Flow::Continue || frame.command == Command::Disconnect {
            if let Some(receipt) = frame.get("receipt") {
                out.push(Frame::new(Command::Receipt).header("receipt-id", receipt));
            }
        }
        flow
    }

    fn on_connect(&mut self, frame: &Frame, out: &mut Vec<Frame>) -> Flow {
        if self.connected {
            out.push(error_frame("already connected", "CONNECT sent twice"));
            return Flow::Close;
        }
        let offered = frame.get("accept-version").unwrap_or("1.0");
        let Some(version) = VERSIONS
            .into_iter()
            .find(|v| offered.split(',').any(|o| o.trim() == *v))
        else {
            out.push(
                error_frame("unsupported version", format!("offered {offered}"))
                    .header("version", VERSIONS.join(",")),
            );
            return Flow::Close;
        };
        let client = match frame.get("heart-beat").map(HeartBeat::parse) {
            Some(Ok(heartbeat)) => heartbeat,
            Some(Err(e)) => {
                out.push(error_frame("invalid heart-beat", e.to_string()));
                return Flow::Close;
            }
            None => HeartBeat::default(),
        };

        let heartbeat = self.state.config.heartbeat;
        let ours = HeartBeat::new(heartbeat, heartbeat);
        let (send, receive) = ours.negotiate(client);
        self.send_every = send;
        self.expect_every = receive;
        self.connected = true;

        info!("STOMP peer {} connected (version {})", self.peer, version);
        out.push(
            Frame::new(Command::Connected)
                .header("version", version)
                .header("heart-beat", ours.header_value())
                .header("session", &self.peer)
                .header("server", concat!("blueprints-relay/", env!("CARGO_PKG_VERSION"))),
        );
        Flow::Continue
    }

    fn on_subscribe(&mut self, frame: &Frame, out: &mut Vec<Frame>) -> Flow {
        let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination")) else {
            out.push(error_frame(
                "malformed SUBSCRIBE",
                "id and destination are required",
            ));
            return Flow::Close;
        };
        let Some(channel) = ChannelId::from_topic(destination) else {
            out.push(error_frame(
                "unknown destination",
                format!("cannot subscribe to {destination}"),
            ));
            return Flow::Close;
        };

        self.release(id);
        let rx = self.state.hub.join(channel.as_str(), &self.peer);
        let task = hub::forward(rx, self.peer.clone(), id.to_string(), self.outbox.clone());
        self.memberships.insert(
            id.to_string(),
            Membership {
                channel: channel.to_string(),
                destination: destination.to_string(),
                task,
            },
        );
        info!("STOMP peer {} subscribed to {}", self.peer, channel);
        Flow::Continue
    }

    fn on_unsubscribe(&mut self, frame: &Frame, out: &mut Vec<Frame>) -> Flow {
        let Some(id) = frame.get("id") else {
            out.push(error_frame("malformed UNSUBSCRIBE", "id is required"));
            return Flow::Close;
        };
        self.release(id);
        Flow::Continue
    }

    fn on_send(&mut self, frame: &Frame, out: &mut Vec<Frame>) -> Flow {
        let destination = frame.get("destination").unwrap_or_default();
        if destination != self.state.config.draw_destination {
            out.push(error_frame(
                "unknown destination",
                format!("cannot send to `{destination}`"),
            ));
            return Flow::Close;
        }
        match serde_json::from_str::<PointPublish>(&frame.body) {
            Ok(point) => {
                let channel = point.key().channel();
                let receivers = self.state.hub.publish(channel.as_str(), &self.peer, point);
                debug!("Relayed point on {} to {} receivers", channel, receivers);
                Flow::Continue
            }
            Err(e) => {
                warn!("Invalid point from {}: {}", self.peer, e);
                out.push(error_frame("malformed body", e.to_string()));
                Flow::Close
            }
        }
    }

    /// Turn a relayed point into a MESSAGE for the subscription it arrived on.
    pub(crate) fn deliver(&self, subscription: &str, relayed: Relayed) -> Option<Frame> {
        let membership = self.memberships.get(subscription)?;
        let body = serde_json::to_string(&relayed.point).ok()?;
        Some(
            Frame::new(Command::Message)
                .header("subscription", subscription)
                .header("message-id", Uuid::new_v4().to_string())
                .header("destination", &membership.destination)
                .header("content-type", "application/json")
                .body(body),
        )
    }

    fn release(&mut self, id: &str) {
        if let Some(membership) = self.memberships.remove(id) {
            membership.task.abort();
            self.state.hub.leave(&membership.channel, &self.peer);
        }
    }
}

impl Drop for StompConnection {
    fn drop(&mut self) {
        for (_, membership) in self.memberships.drain() {
            membership.task.abort();
            self.state.hub.leave(&membership.channel, &self.peer);
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.protocols(["v12.stomp", "v11.stomp", "v10.stomp"])
        .on_upgrade(move |socket| handle_socket(socket, state))
}

fn text(frame: String) -> Message {
    Message::Text(frame.into())
}

/// Handle a STOMP WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let peer = Uuid::new_v4().to_string();
    info!("New STOMP connection: {}", peer);

    let (mut sender, mut receiver) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    let mut connection = StompConnection::new(peer.clone(), state, outbox_tx);
    let mut ticker = tokio::time::interval(TICK);
    let mut last_seen = Instant::now();
    let mut last_sent = Instant::now();

    loop {
        let mut out = Vec::new();
        let mut flow = Flow::Continue;

        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(data))) => {
                        last_seen = Instant::now();
                        flow = connection.on_text(data.as_str(), &mut out);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Binary message from {} ignored", peer);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", peer, e);
                        break;
                    }
                }
            }

            Some((subscription, relayed)) = outbox_rx.recv() => {
                out.extend(connection.deliver(&subscription, relayed));
            }

            _ = ticker.tick() => {
                if connection
                    .expect_every
                    .is_some_and(|every| last_seen.elapsed() > every * 2)
                {
                    warn!("STOMP peer {} missed its heart-beats", peer);
                    break;
                }
                if connection
                    .send_every
                    .is_some_and(|every| last_sent.elapsed() >= every)
                {
                    if sender.send(text("\n".to_string())).await.is_err() {
                        break;
                    }
                    last_sent = Instant::now();
                }
            }
        }

        for frame in out {
            if sender.send(text(frame.encode())).await.is_err() {
                flow = Flow::Close;
                break;
            }
            last_sent = Instant::now();
        }
        if flow == Flow::Close {
            break;
        }
    }

    let _ = sender.close().await;
    drop(connection);
    info!("STOMP connection closed: {}", peer);
}
