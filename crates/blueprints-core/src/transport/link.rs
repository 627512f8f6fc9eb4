//! Blocking WebSocket plumbing shared by the adapter worker threads.

use std::net::TcpStream;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use super::{TransportError, TransportEvent};

pub(crate) type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Read timeout that keeps the worker loop responsive to commands.
const READ_TIMEOUT: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a WebSocket and switch it to short read timeouts.
pub(crate) fn open(url: &Url, label: &str) -> Result<Socket, TransportError> {
    log::info!("[{label}] connecting to {url}");
    let (mut socket, response) = tungstenite::connect(url.as_str())
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    log::info!("[{label}] socket open, status: {}", response.status());

    match socket.get_mut() {
        MaybeTlsStream::Plain(tcp) => {
            let _ = tcp.set_read_timeout(Some(READ_TIMEOUT));
            let _ = tcp.set_write_timeout(Some(WRITE_TIMEOUT));
        }
        #[allow(unreachable_patterns)]
        _ => {
            log::debug!("[{label}] TLS or other stream - using default timeout handling");
        }
    }
    Ok(socket)
}

/// Outcome of one read attempt.
pub(crate) enum Inbound {
    Text(String),
    /// Nothing arrived before the read timeout, or a control frame was handled.
    Idle,
    Closed(String),
}

pub(crate) fn read(socket: &mut Socket) -> Inbound {
    match socket.read() {
        Ok(Message::Text(text)) => Inbound::Text(text),
        Ok(Message::Ping(data)) => {
            let _ = socket.send(Message::Pong(data));
            Inbound::Idle
        }
        Ok(Message::Close(frame)) => Inbound::Closed(
            frame
                .map(|f| format!("closed by peer: {}", f.reason))
                .unwrap_or_else(|| "closed by peer".to_string()),
        ),
        Ok(_) => Inbound::Idle,
        Err(tungstenite::Error::Io(ref e))
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Inbound::Idle
        }
        Err(e) => Inbound::Closed(e.to_string()),
    }
}

pub(crate) fn send_text(socket: &mut Socket, text: String) -> Result<(), TransportError> {
    socket
        .send(Message::Text(text))
        .map_err(|e| TransportError::Send(e.to_string()))
}

/// Best-effort close handshake.
pub(crate) fn close(socket: &mut Socket) {
    let _ = socket.close(None);
    let _ = socket.flush();
}

/// How a connected session ended.
pub(crate) enum Exit {
    /// The owner asked to close; the worker must stop.
    Closed,
    /// The link was established and then lost.
    Dropped(String),
    /// The link could not be established.
    Unreachable(String),
}

/// One protocol session over a fresh socket.
pub(crate) trait Session {
    type Command: Send;

    fn label(&self) -> &'static str;

    /// Connect, handshake and serve until the link ends.
    fn run(&mut self, commands: &Receiver<Self::Command>, events: &Sender<TransportEvent>)
    -> Exit;

    /// Handle a command that arrived while offline. Returns `true` when the
    /// command asks the worker to stop.
    fn offline(&mut self, command: Self::Command) -> bool;
}

/// Run sessions back to back, waiting `reconnect_delay` between attempts,
/// until the owner closes the transport or drops its command sender.
pub(crate) fn supervise<S: Session>(
    mut session: S,
    commands: Receiver<S::Command>,
    events: Sender<TransportEvent>,
    reconnect_delay: Duration,
) {
    let label = session.label();
    loop {
        match session.run(&commands, &events) {
            Exit::Closed => break,
            Exit::Dropped(reason) => {
                log::warn!("[{label}] connection lost: {reason}");
                let _ = events.send(TransportEvent::Disconnected { reason });
            }
            Exit::Unreachable(message) => {
                log::error!("[{label}] connection failed: {message}");
                let _ = events.send(TransportEvent::Error { message });
            }
        }

        log::debug!("[{label}] reconnecting in {} ms", reconnect_delay.as_millis());
        let deadline = Instant::now() + reconnect_delay;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match commands.recv_timeout(deadline - now) {
                Ok(command) => {
                    if session.offline(command) {
                        log::info!("[{label}] worker exiting");
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    log::info!("[{label}] command channel disconnected");
                    return;
                }
            }
        }
    }
    log::info!("[{label}] worker exiting");
}
