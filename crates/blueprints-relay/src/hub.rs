//! Channel membership shared by the STOMP and Socket.IO endpoints.

use std::collections::HashMap;

use blueprints_core::PointPublish;
use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 256;

/// A point relayed to the members of a channel.
#[derive(Debug, Clone)]
pub struct Relayed {
    /// Peer that drew the point.
    pub from: String,
    pub point: PointPublish,
}

struct Channel {
    tx: broadcast::Sender<Relayed>,
    /// Members and how many memberships each holds.
    peers: HashMap<String, usize>,
}

impl Channel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            peers: HashMap::new(),
        }
    }
}

/// Active channels, keyed by channel id (`blueprints.<author>.<name>`).
#[derive(Default)]
pub struct Hub {
    channels: DashMap<String, Channel>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a membership for `peer` and return a receiver of the channel's points.
    pub fn join(&self, channel: &str, peer: &str) -> broadcast::Receiver<Relayed> {
        let mut entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new);
        *entry.peers.entry(peer.to_string()).or_default() += 1;
        entry.tx.subscribe()
    }

    /// Drop one membership of `peer`. Empty channels are removed.
    pub fn leave(&self, channel: &str, peer: &str) {
        if let Some(mut entry) = self.channels.get_mut(channel) {
            if let Some(count) = entry.peers.get_mut(peer) {
                *count -= 1;
                if *count == 0 {
                    entry.peers.remove(peer);
                }
            }
        }
        if self
            .channels
            .remove_if(channel, |_, c| c.peers.is_empty())
            .is_some()
        {
            debug!("Channel {} is empty, removed", channel);
        }
    }

    /// Relay a point to every member of `channel`. Returns how many
    /// receivers saw it, the sender's own included.
    pub fn publish(&self, channel: &str, from: &str, point: PointPublish) -> usize {
        match self.channels.get(channel) {
            Some(entry) => entry
                .tx
                .send(Relayed {
                    from: from.to_string(),
                    point,
                })
                .unwrap_or(0),
            None => 0,
        }
    }

    pub fn peer_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|entry| entry.peers.len())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Forward a channel's points to a connection's outbox, tagged so the
/// connection knows which membership they arrived on. Points drawn by `peer`
/// itself are not echoed back.
pub fn forward<T>(
    mut rx: broadcast::Receiver<Relayed>,
    peer: String,
    tag: T,
    outbox: mpsc::UnboundedSender<(T, Relayed)>,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(relayed) if relayed.from == peer => {}
                Ok(relayed) => {
                    if outbox.send((tag.clone(), relayed)).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Peer {} lagged, {} points skipped", peer, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
