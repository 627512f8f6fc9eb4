//! Collaboration management for real-time multi-user editing.
//!
//! [`CollaborationManager`] owns the open blueprint's point sequence and the
//! single active transport. It is driven from one owner thread: worker
//! threads (transport sockets, snapshot fetches, persistence) only post
//! messages to the manager inbox, and [`CollaborationManager::poll`] applies
//! them one at a time.
//!
//! Every inbox message carries the session and link epochs it was created
//! for. Opening another blueprint starts a new session; switching transport
//! starts a new link. Messages from a superseded epoch are discarded.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::SyncConfig;
use crate::message::{PointPublish, UpdateKind, UpdateMessage};
use crate::model::{Blueprint, BlueprintKey, ChannelId, Point, Surface};
use crate::snapshot::SnapshotLoader;
use crate::store::{BlueprintStore, FetchResult};
use crate::transport::{
    Subscription, Transport, TransportEvent, TransportFactory, TransportKind, UpdateCallback,
};

/// Misuse of the manager surface. Never affects the session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("No blueprint is open")]
    NotOpen,
    #[error("Point {point} lies outside the {width}x{height} surface")]
    OutOfBounds { point: Point, width: u32, height: u32 },
}

/// Where the open session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No blueprint open.
    Idle,
    /// Waiting for the snapshot.
    Loading,
    /// Snapshot settled, channel not (or no longer) joined.
    Connecting,
    /// Snapshot settled and channel joined on a connected transport.
    Live,
}

/// Events produced while processing [`CollaborationManager::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The active transport is connected.
    Connected { transport: TransportKind },
    /// The active transport dropped; it may reconnect on its own.
    Disconnected { reason: String },
    /// The channel of the open blueprint is joined.
    Joined { channel: ChannelId },
    /// The snapshot seeded the local sequence.
    SnapshotLoaded { points: usize },
    /// The snapshot failed; the session continues from an empty sequence.
    SnapshotFailed { error: String },
    /// The local point sequence changed.
    PointsChanged,
    /// A local point reached storage.
    Persisted { point: Point },
    /// A local point could not be stored. It stays in the local sequence.
    PersistFailed { point: Point, error: String },
    /// A completion from a superseded session or transport was ignored.
    StaleDiscarded,
    /// Transport level error.
    Error { message: String },
}

/// A change to the point sequence, kept while the snapshot is in flight.
#[derive(Debug, Clone)]
enum Delta {
    Append(Point),
    Replace(Vec<Point>),
}

impl Delta {
    fn apply(&self, points: &mut Vec<Point>) {
        match self {
            Delta::Append(point) => points.push(*point),
            Delta::Replace(replacement) => *points = replacement.clone(),
        }
    }
}

enum Inbox {
    Snapshot {
        session: u64,
        result: FetchResult<Blueprint>,
    },
    Update {
        session: u64,
        link: u64,
        update: UpdateMessage,
    },
    Persisted {
        session: u64,
        point: Point,
        result: FetchResult<Blueprint>,
    },
}

struct PersistJob {
    session: u64,
    key: BlueprintKey,
    point: Point,
}

/// The open blueprint and the resources held for it.
struct Session {
    id: u64,
    key: BlueprintKey,
    /// Deltas applied since open, replayed over the snapshot once it lands.
    /// `None` once the snapshot has settled.
    pending: Option<Vec<Delta>>,
    /// Local points drawn while loading. Stored once the snapshot is read so
    /// the snapshot never already contains them.
    held: Vec<Point>,
    subscription: Option<Subscription>,
    connected: bool,
}

/// Keeps the local point sequence of one blueprint in sync with peers.
pub struct CollaborationManager {
    surface: Surface,
    loader: SnapshotLoader,
    factory: Box<dyn TransportFactory>,
    kind: TransportKind,
    transport: Option<Box<dyn Transport>>,
    session: Option<Session>,
    points: Vec<Point>,
    /// Last issued session epoch.
    sessions: u64,
    /// Current link epoch. Bumped whenever a transport is created or released.
    link: u64,
    inbox_tx: Sender<Inbox>,
    inbox_rx: Receiver<Inbox>,
    persist_tx: Sender<PersistJob>,
    events: Vec<SyncEvent>,
}

impl CollaborationManager {
    /// Create a manager over the given storage service and transports.
    ///
    /// Nothing connects until [`open`](Self::open) is called.
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn BlueprintStore>,
        factory: Box<dyn TransportFactory>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let persist_tx = spawn_persister(Arc::clone(&store), inbox_tx.clone());
        Self {
            surface: config.surface,
            loader: SnapshotLoader::new(store),
            factory,
            kind: config.transport,
            transport: None,
            session: None,
            points: Vec::new(),
            sessions: 0,
            link: 0,
            inbox_tx,
            inbox_rx,
            persist_tx,
            events: Vec::new(),
        }
    }

    /// The current point sequence, in stroke order.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// The open blueprint, if any.
    pub fn key(&self) -> Option<&BlueprintKey> {
        self.session.as_ref().map(|s| &s.key)
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    pub fn state(&self) -> SessionState {
        match &self.session {
            None => SessionState::Idle,
            Some(s) if s.pending.is_some() => SessionState::Loading,
            Some(s) if s.connected && s.subscription.is_some() => SessionState::Live,
            Some(_) => SessionState::Connecting,
        }
    }

    /// Open a blueprint (switch channel).
    ///
    /// The previous session is torn down completely before the snapshot
    /// fetch and the new transport are started.
    pub fn open(&mut self, key: BlueprintKey) {
        self.teardown();
        self.points.clear();

        self.sessions += 1;
        let session = self.sessions;
        log::info!("Opening blueprint {key} (session {session})");

        let inbox = self.inbox_tx.clone();
        self.loader.spawn(key.clone(), move |result| {
            let _ = inbox.send(Inbox::Snapshot { session, result });
        });

        self.session = Some(Session {
            id: session,
            key,
            pending: Some(Vec::new()),
            held: Vec::new(),
            subscription: None,
            connected: false,
        });
        self.start_transport();
        self.emit(SyncEvent::PointsChanged);
    }

    /// Close the open blueprint and release the transport.
    pub fn close(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.teardown();
        self.points.clear();
        self.emit(SyncEvent::PointsChanged);
    }

    /// Swap the live transport, keeping the local sequence.
    ///
    /// The old subscription and connection are released before the new
    /// transport is created.
    pub fn switch_transport(&mut self, kind: TransportKind) {
        if kind == self.kind && self.transport.is_some() {
            return;
        }
        log::info!("Switching transport {} -> {kind}", self.kind);
        self.kind = kind;
        if self.session.is_none() {
            return;
        }
        self.release_link();
        self.start_transport();
    }

    /// Empty the local sequence, e.g. after the blueprint was deleted.
    ///
    /// Points drawn while loading and not yet stored are discarded too.
    pub fn clear(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.held.clear();
            if let Some(pending) = session.pending.as_mut() {
                pending.push(Delta::Replace(Vec::new()));
            }
        }
        self.points.clear();
        self.emit(SyncEvent::PointsChanged);
    }

    /// Add a point drawn locally.
    ///
    /// The point is appended at once, then published to peers and persisted.
    /// Neither outward effect rolls the append back when it fails.
    pub fn append_local_point(&mut self, point: Point) -> Result<(), SyncError> {
        let session = self.session.as_mut().ok_or(SyncError::NotOpen)?;
        if !self.surface.contains(point) {
            return Err(SyncError::OutOfBounds {
                point,
                width: self.surface.width,
                height: self.surface.height,
            });
        }

        let key = session.key.clone();
        let id = session.id;
        let persist_now = match session.pending.as_mut() {
            Some(pending) => {
                pending.push(Delta::Append(point));
                session.held.push(point);
                false
            }
            None => true,
        };
        self.points.push(point);

        match self.transport.as_mut() {
            Some(transport) if transport.is_connected() => {
                let payload = PointPublish::new(&key, point);
                if let Err(e) = transport.publish_point(&key.channel(), &payload) {
                    log::warn!("Failed to publish {point}: {e}");
                }
            }
            _ => log::info!("Transport not connected, {point} not published"),
        }

        if persist_now {
            self.persist(id, &key, point);
        }

        self.emit(SyncEvent::PointsChanged);
        Ok(())
    }

    fn persist(&self, session: u64, key: &BlueprintKey, point: Point) {
        let job = PersistJob {
            session,
            key: key.clone(),
            point,
        };
        if self.persist_tx.send(job).is_err() {
            log::error!("Persistence worker is gone, {point} not stored");
        }
    }

    /// Process pending transport events and completions.
    pub fn poll(&mut self) -> Vec<SyncEvent> {
        self.drain_transport();
        while let Ok(message) = self.inbox_rx.try_recv() {
            self.handle(message);
        }
        std::mem::take(&mut self.events)
    }

    /// Poll until something happens or `timeout` elapses.
    pub fn wait_events(&mut self, timeout: Duration) -> Vec<SyncEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let events = self.poll();
            if !events.is_empty() || Instant::now() >= deadline {
                return events;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn emit(&mut self, event: SyncEvent) {
        self.events.push(event);
    }

    fn start_transport(&mut self) {
        self.link += 1;
        let mut transport = self.factory.create(self.kind);
        if let Err(e) = transport.connect() {
            log::warn!("{} transport failed to start: {e}", self.kind);
            self.emit(SyncEvent::Error {
                message: e.to_string(),
            });
        }
        self.transport = Some(transport);
    }

    /// Leave the channel, then disconnect and drop the transport.
    fn release_link(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.connected = false;
            if let Some(subscription) = session.subscription.take() {
                subscription.unsubscribe();
            }
        }
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
            log::debug!("Released {} transport", transport.kind());
        }
        self.link += 1;
    }

    fn teardown(&mut self) {
        self.release_link();
        if let Some(session) = self.session.take() {
            for point in &session.held {
                self.persist(session.id, &session.key, *point);
            }
            log::info!("Closed blueprint {} (session {})", session.key, session.id);
        }
    }

    fn drain_transport(&mut self) {
        let events = match self.transport.as_mut() {
            Some(transport) => transport.poll_events(),
            None => return,
        };
        for event in events {
            match event {
                TransportEvent::Connected => self.on_connected(),
                TransportEvent::Disconnected { reason } => {
                    if let Some(session) = self.session.as_mut() {
                        session.connected = false;
                    }
                    self.emit(SyncEvent::Disconnected { reason });
                }
                TransportEvent::Error { message } => self.emit(SyncEvent::Error { message }),
            }
        }
    }

    /// Join the channel the first time the transport connects. Adapters
    /// restore membership themselves after a reconnect.
    fn on_connected(&mut self) {
        self.emit(SyncEvent::Connected {
            transport: self.kind,
        });
        let (Some(session), Some(transport)) = (self.session.as_mut(), self.transport.as_mut())
        else {
            return;
        };
        session.connected = true;
        if session.subscription.is_some() {
            return;
        }

        let channel = session.key.channel();
        let inbox = self.inbox_tx.clone();
        let (id, link) = (session.id, self.link);
        let on_update: UpdateCallback = Box::new(move |update| {
            let _ = inbox.send(Inbox::Update {
                session: id,
                link,
                update,
            });
        });

        match transport.join_channel(&channel, on_update) {
            Ok(subscription) => {
                log::info!("Joined {channel} over {}", transport.kind());
                session.subscription = Some(subscription);
                self.emit(SyncEvent::Joined { channel });
            }
            Err(e) => {
                log::warn!("Failed to join {channel}: {e}");
                self.emit(SyncEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    fn is_current(&self, session: u64, link: Option<u64>) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session)
            && link.is_none_or(|l| l == self.link)
    }

    fn handle(&mut self, message: Inbox) {
        match message {
            Inbox::Snapshot { session, result } => {
                if !self.is_current(session, None) {
                    log::debug!("Discarding snapshot of session {session}");
                    self.emit(SyncEvent::StaleDiscarded);
                    return;
                }
                self.settle_snapshot(result);
            }
            Inbox::Update {
                session,
                link,
                update,
            } => {
                if !self.is_current(session, Some(link)) {
                    log::debug!("Discarding update of session {session} link {link}");
                    self.emit(SyncEvent::StaleDiscarded);
                    return;
                }
                self.apply_remote(update);
            }
            Inbox::Persisted {
                session,
                point,
                result,
            } => {
                if let Err(e) = &result {
                    log::warn!("Failed to persist {point}: {e}");
                }
                if !self.is_current(session, None) {
                    self.emit(SyncEvent::StaleDiscarded);
                    return;
                }
                match result {
                    Ok(_) => self.emit(SyncEvent::Persisted { point }),
                    Err(e) => self.emit(SyncEvent::PersistFailed {
                        point,
                        error: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Rebuild the sequence as snapshot followed by the deltas seen so far.
    fn settle_snapshot(&mut self, result: FetchResult<Blueprint>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(deltas) = session.pending.take() else {
            return;
        };
        let (mut points, event) = match result {
            Ok(blueprint) => {
                let count = blueprint.points.len();
                (blueprint.points, SyncEvent::SnapshotLoaded { points: count })
            }
            Err(e) => {
                log::warn!("Snapshot of {} failed, starting empty: {e}", session.key);
                (
                    Vec::new(),
                    SyncEvent::SnapshotFailed {
                        error: e.to_string(),
                    },
                )
            }
        };
        for delta in &deltas {
            delta.apply(&mut points);
        }
        let held = std::mem::take(&mut session.held);
        let (id, key) = (session.id, session.key.clone());
        self.points = points;
        for point in held {
            self.persist(id, &key, point);
        }
        self.emit(event);
        self.emit(SyncEvent::PointsChanged);
    }

    fn apply_remote(&mut self, update: UpdateMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !update.addresses(&session.key) {
            log::debug!("Ignoring update addressed to another blueprint");
            return;
        }
        let delta = match update.kind {
            UpdateKind::Replace(points) => Delta::Replace(points),
            UpdateKind::Append(point) => Delta::Append(point),
        };
        if let Some(pending) = session.pending.as_mut() {
            pending.push(delta.clone());
        }
        delta.apply(&mut self.points);
        self.emit(SyncEvent::PointsChanged);
    }
}

impl Drop for CollaborationManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Stores local points one at a time so storage sees them in stroke order.
fn spawn_persister(store: Arc<dyn BlueprintStore>, inbox: Sender<Inbox>) -> Sender<PersistJob> {
    let (tx, rx) = mpsc::channel::<PersistJob>();
    let spawned = thread::Builder::new()
        .name("blueprint-persist".into())
        .spawn(move || {
            for job in rx {
                let result = store.append_point(&job.key, job.point);
                let message = Inbox::Persisted {
                    session: job.session,
                    point: job.point,
                    result,
                };
                if inbox.send(message).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        log::error!("Failed to spawn persistence worker: {e}");
    }
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FetchError, MemoryStore};
    use crate::transport::TransportError;
    use std::sync::Mutex;

    /// Everything a transport double did, shared with the test.
    #[derive(Default)]
    struct Tally {
        index: usize,
        connects: usize,
        disconnects: usize,
        joins: usize,
        unsubscribes: usize,
        /// Subscriptions handed out and not yet released.
        active: usize,
        connected: bool,
        events: Vec<TransportEvent>,
        published: Vec<(ChannelId, PointPublish)>,
        on_update: Option<UpdateCallback>,
    }

    type SharedTally = Arc<Mutex<Tally>>;

    struct MockTransport {
        kind: TransportKind,
        auto_connect: bool,
        tally: SharedTally,
        ops: Arc<Mutex<Vec<String>>>,
    }

    impl MockTransport {
        fn record(&self, op: &str) {
            let index = self.tally.lock().unwrap().index;
            self.ops.lock().unwrap().push(format!("{op}#{index}"));
        }
    }

    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn connect(&mut self) -> Result<(), TransportError> {
            self.record("connect");
            let mut tally = self.tally.lock().unwrap();
            tally.connects += 1;
            if self.auto_connect {
                tally.connected = true;
                tally.events.push(TransportEvent::Connected);
            }
            Ok(())
        }

        fn disconnect(&mut self) {
            self.record("disconnect");
            let mut tally = self.tally.lock().unwrap();
            tally.disconnects += 1;
            tally.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.tally.lock().unwrap().connected
        }

        fn join_channel(
            &mut self,
            channel: &ChannelId,
            on_update: UpdateCallback,
        ) -> Result<Subscription, TransportError> {
            self.record("join");
            {
                let mut tally = self.tally.lock().unwrap();
                tally.joins += 1;
                tally.active += 1;
                tally.on_update = Some(on_update);
            }
            let tally = Arc::clone(&self.tally);
            let ops = Arc::clone(&self.ops);
            Ok(Subscription::new(channel.clone(), move || {
                let mut tally = tally.lock().unwrap();
                tally.unsubscribes += 1;
                tally.active -= 1;
                tally.on_update = None;
                ops.lock().unwrap().push(format!("unsubscribe#{}", tally.index));
            }))
        }

        fn publish_point(
            &mut self,
            channel: &ChannelId,
            payload: &PointPublish,
        ) -> Result<(), TransportError> {
            let mut tally = self.tally.lock().unwrap();
            if !tally.connected {
                return Err(TransportError::NotConnected);
            }
            tally.published.push((channel.clone(), payload.clone()));
            Ok(())
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            std::mem::take(&mut self.tally.lock().unwrap().events)
        }
    }

    /// Hands out counting transports and remembers every one of them.
    #[derive(Clone)]
    struct MockFactory {
        auto_connect: bool,
        tallies: Arc<Mutex<Vec<(TransportKind, SharedTally)>>>,
        ops: Arc<Mutex<Vec<String>>>,
    }

    impl MockFactory {
        fn new(auto_connect: bool) -> Self {
            Self {
                auto_connect,
                tallies: Arc::default(),
                ops: Arc::default(),
            }
        }

        fn tally(&self, index: usize) -> SharedTally {
            Arc::clone(&self.tallies.lock().unwrap()[index].1)
        }

        fn kind(&self, index: usize) -> TransportKind {
            self.tallies.lock().unwrap()[index].0
        }

        fn created(&self) -> usize {
            self.tallies.lock().unwrap().len()
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        /// Deliver an update through the callback of transport `index`.
        fn deliver(&self, index: usize, update: UpdateMessage) {
            let tally = self.tally(index);
            let mut tally = tally.lock().unwrap();
            let on_update = tally.on_update.as_mut().expect("channel not joined");
            on_update(update);
        }
    }

    impl TransportFactory for MockFactory {
        fn create(&self, kind: TransportKind) -> Box<dyn Transport> {
            let mut tallies = self.tallies.lock().unwrap();
            let tally = Arc::new(Mutex::new(Tally {
                index: tallies.len(),
                ..Default::default()
            }));
            tallies.push((kind, Arc::clone(&tally)));
            self.ops
                .lock()
                .unwrap()
                .push(format!("create {kind}#{}", tallies.len() - 1));
            Box::new(MockTransport {
                kind,
                auto_connect: self.auto_connect,
                tally,
                ops: Arc::clone(&self.ops),
            })
        }
    }

    /// Storage that is down.
    struct FailingStore;

    impl BlueprintStore for FailingStore {
        fn list_by_author(&self, _author: &str) -> FetchResult<crate::model::AuthorBlueprints> {
            Err(FetchError::Status(500))
        }
        fn get(&self, _key: &BlueprintKey) -> FetchResult<Blueprint> {
            Err(FetchError::Status(500))
        }
        fn create(&self, _blueprint: &Blueprint) -> FetchResult<Blueprint> {
            Err(FetchError::Status(500))
        }
        fn replace_points(&self, _key: &BlueprintKey, _points: &[Point]) -> FetchResult<Blueprint> {
            Err(FetchError::Status(500))
        }
        fn append_point(&self, _key: &BlueprintKey, _point: Point) -> FetchResult<Blueprint> {
            Err(FetchError::Status(503))
        }
        fn delete(&self, _key: &BlueprintKey) -> FetchResult<()> {
            Err(FetchError::Status(500))
        }
    }

    /// Memory store whose `get` for one key blocks until released.
    struct GatedStore {
        inner: MemoryStore,
        gated: BlueprintKey,
        gate: Mutex<Option<Receiver<()>>>,
    }

    impl GatedStore {
        fn new(inner: MemoryStore, gated: BlueprintKey) -> (Self, Sender<()>) {
            let (tx, rx) = mpsc::channel();
            let store = Self {
                inner,
                gated,
                gate: Mutex::new(Some(rx)),
            };
            (store, tx)
        }
    }

    impl BlueprintStore for GatedStore {
        fn list_by_author(&self, author: &str) -> FetchResult<crate::model::AuthorBlueprints> {
            self.inner.list_by_author(author)
        }
        fn get(&self, key: &BlueprintKey) -> FetchResult<Blueprint> {
            if *key == self.gated {
                let gate = self.gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    let _ = gate.recv();
                }
            }
            self.inner.get(key)
        }
        fn create(&self, blueprint: &Blueprint) -> FetchResult<Blueprint> {
            self.inner.create(blueprint)
        }
        fn replace_points(&self, key: &BlueprintKey, points: &[Point]) -> FetchResult<Blueprint> {
            self.inner.replace_points(key, points)
        }
        fn append_point(&self, key: &BlueprintKey, point: Point) -> FetchResult<Blueprint> {
            self.inner.append_point(key, point)
        }
        fn delete(&self, key: &BlueprintKey) -> FetchResult<()> {
            self.inner.delete(key)
        }
    }

    fn p(x: u32, y: u32) -> Point {
        Point::new(x, y)
    }

    fn ana() -> BlueprintKey {
        BlueprintKey::new("ana", "p1")
    }

    fn seeded() -> MemoryStore {
        MemoryStore::with_blueprints([
            Blueprint::new(&ana(), vec![p(1, 1), p(2, 2)]),
            Blueprint::new(&BlueprintKey::new("bob", "p2"), vec![p(7, 7)]),
        ])
    }

    fn manager(store: Arc<dyn BlueprintStore>, factory: &MockFactory) -> CollaborationManager {
        let config = SyncConfig {
            transport: TransportKind::Stomp,
            ..Default::default()
        };
        CollaborationManager::new(&config, store, Box::new(factory.clone()))
    }

    /// Poll until `done` holds, collecting every event on the way.
    fn pump_until(
        manager: &mut CollaborationManager,
        mut done: impl FnMut(&CollaborationManager, &[SyncEvent]) -> bool,
    ) -> Vec<SyncEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        loop {
            events.extend(manager.poll());
            if done(&*manager, events.as_slice()) {
                return events;
            }
            assert!(Instant::now() < deadline, "timed out, events: {events:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn pump_live(manager: &mut CollaborationManager) -> Vec<SyncEvent> {
        pump_until(manager, |m, _| m.state() == SessionState::Live)
    }

    #[test]
    fn test_idle_until_opened() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(manager.key().is_none());
        assert_eq!(manager.append_local_point(p(1, 1)), Err(SyncError::NotOpen));
        assert!(manager.poll().is_empty());
        assert_eq!(factory.created(), 0);
    }

    #[test]
    fn test_open_loads_snapshot_and_goes_live() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        assert_eq!(manager.state(), SessionState::Loading);

        let events = pump_live(&mut manager);
        assert_eq!(manager.points(), &[p(1, 1), p(2, 2)]);
        assert!(events.contains(&SyncEvent::SnapshotLoaded { points: 2 }));
        assert!(events.contains(&SyncEvent::Joined {
            channel: ChannelId::from("blueprints.ana.p1")
        }));
        let tally = factory.tally(0);
        assert_eq!(tally.lock().unwrap().joins, 1);
        assert_eq!(factory.kind(0), TransportKind::Stomp);
    }

    #[test]
    fn test_append_publishes_and_persists() {
        let store = Arc::new(seeded());
        let factory = MockFactory::new(true);
        let mut manager = manager(store.clone(), &factory);
        manager.open(ana());
        pump_live(&mut manager);

        manager.append_local_point(p(3, 3)).unwrap();
        assert_eq!(manager.points(), &[p(1, 1), p(2, 2), p(3, 3)]);

        let published = factory.tally(0).lock().unwrap().published.clone();
        assert_eq!(
            published,
            vec![(
                ChannelId::from("blueprints.ana.p1"),
                PointPublish {
                    author: "ana".into(),
                    name: "p1".into(),
                    point: p(3, 3),
                }
            )]
        );

        pump_until(&mut manager, |_, events| {
            events.contains(&SyncEvent::Persisted { point: p(3, 3) })
        });
        assert_eq!(
            store.get(&ana()).unwrap().points,
            vec![p(1, 1), p(2, 2), p(3, 3)]
        );
    }

    #[test]
    fn test_local_appends_keep_call_order() {
        let store = Arc::new(seeded());
        let factory = MockFactory::new(true);
        let mut manager = manager(store.clone(), &factory);
        manager.open(BlueprintKey::new("bob", "p2"));
        pump_live(&mut manager);

        let drawn: Vec<Point> = (0..40).map(|i| p(i * 3 % 600, i * 7 % 400)).collect();
        for point in &drawn {
            manager.append_local_point(*point).unwrap();
        }
        let mut expected = vec![p(7, 7)];
        expected.extend(&drawn);
        assert_eq!(manager.points(), expected.as_slice());

        pump_until(&mut manager, |_, events| {
            events
                .iter()
                .filter(|e| matches!(e, SyncEvent::Persisted { .. }))
                .count()
                == drawn.len()
        });
        assert_eq!(
            store.get(&BlueprintKey::new("bob", "p2")).unwrap().points,
            expected
        );
    }

    #[test]
    fn test_append_rejects_points_off_surface() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);

        let result = manager.append_local_point(p(600, 10));
        assert_eq!(
            result,
            Err(SyncError::OutOfBounds {
                point: p(600, 10),
                width: 600,
                height: 400,
            })
        );
        assert_eq!(manager.points().len(), 2);
        assert!(factory.tally(0).lock().unwrap().published.is_empty());
    }

    #[test]
    fn test_append_while_disconnected_stays_local() {
        let store = Arc::new(seeded());
        let factory = MockFactory::new(false);
        let mut manager = manager(store.clone(), &factory);
        manager.open(ana());
        pump_until(&mut manager, |m, _| m.state() == SessionState::Connecting);

        manager.append_local_point(p(3, 3)).unwrap();
        assert_eq!(manager.points().len(), 3);
        assert!(factory.tally(0).lock().unwrap().published.is_empty());
        pump_until(&mut manager, |_, events| {
            events.contains(&SyncEvent::Persisted { point: p(3, 3) })
        });
        assert_eq!(store.get(&ana()).unwrap().points.len(), 3);
    }

    #[test]
    fn test_persist_failure_keeps_local_point() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(FailingStore), &factory);
        manager.open(ana());
        pump_live(&mut manager);

        manager.append_local_point(p(3, 3)).unwrap();
        let events = pump_until(&mut manager, |_, events| {
            events
                .iter()
                .any(|e| matches!(e, SyncEvent::PersistFailed { .. }))
        });
        assert!(events.contains(&SyncEvent::PersistFailed {
            point: p(3, 3),
            error: "HTTP 503".into(),
        }));
        assert_eq!(manager.points(), &[p(3, 3)]);
        assert_eq!(factory.tally(0).lock().unwrap().published.len(), 1);
    }

    #[test]
    fn test_remote_points_replace_local_sequence() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);
        manager.append_local_point(p(3, 3)).unwrap();
        assert_eq!(manager.points().len(), 3);

        factory.deliver(0, UpdateMessage::replace(&ana(), vec![p(9, 9)]));
        pump_until(&mut manager, |m, _| m.points().len() == 1);
        assert_eq!(manager.points(), &[p(9, 9)]);
    }

    #[test]
    fn test_remote_point_appends_one() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);

        factory.deliver(0, UpdateMessage::append(&ana(), p(5, 5)));
        pump_until(&mut manager, |m, _| m.points().len() == 3);
        assert_eq!(manager.points(), &[p(1, 1), p(2, 2), p(5, 5)]);
    }

    #[test]
    fn test_own_echo_is_appended_again() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);

        manager.append_local_point(p(3, 3)).unwrap();
        factory.deliver(0, UpdateMessage::append(&ana(), p(3, 3)));
        pump_until(&mut manager, |m, _| m.points().len() == 4);
        assert_eq!(manager.points()[2..], [p(3, 3), p(3, 3)]);
    }

    #[test]
    fn test_update_for_other_blueprint_is_ignored() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);

        factory.deliver(
            0,
            UpdateMessage::replace(&BlueprintKey::new("ana", "other"), vec![]),
        );
        let anonymous = UpdateMessage {
            author: None,
            name: None,
            kind: UpdateKind::Append(p(4, 4)),
        };
        factory.deliver(0, anonymous);
        pump_until(&mut manager, |m, _| m.points().len() == 3);
        assert_eq!(manager.points(), &[p(1, 1), p(2, 2), p(4, 4)]);
    }

    #[test]
    fn test_snapshot_failure_still_goes_live() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(FailingStore), &factory);
        manager.open(ana());

        let events = pump_live(&mut manager);
        assert!(manager.points().is_empty());
        assert!(events.contains(&SyncEvent::SnapshotFailed {
            error: "HTTP 500".into()
        }));
    }

    #[test]
    fn test_missing_blueprint_starts_empty() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(MemoryStore::new()), &factory);
        manager.open(ana());
        let events = pump_live(&mut manager);
        assert!(manager.points().is_empty());
        assert!(
            events
                .iter()
                .any(|e| matches!(e, SyncEvent::SnapshotFailed { .. }))
        );
    }

    #[test]
    fn test_deltas_during_loading_replay_over_snapshot() {
        let (store, gate) = GatedStore::new(seeded(), ana());
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(store), &factory);
        manager.open(ana());

        pump_until(&mut manager, |_, events| {
            events.iter().any(|e| matches!(e, SyncEvent::Joined { .. }))
        });
        assert_eq!(manager.state(), SessionState::Loading);

        manager.append_local_point(p(5, 5)).unwrap();
        factory.deliver(0, UpdateMessage::append(&ana(), p(6, 6)));
        pump_until(&mut manager, |m, _| m.points().len() == 2);
        assert_eq!(manager.points(), &[p(5, 5), p(6, 6)]);

        gate.send(()).unwrap();
        pump_live(&mut manager);
        assert_eq!(manager.points(), &[p(1, 1), p(2, 2), p(5, 5), p(6, 6)]);
    }

    #[test]
    fn test_replace_during_loading_wins_over_snapshot() {
        let (store, gate) = GatedStore::new(seeded(), ana());
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(store), &factory);
        manager.open(ana());
        pump_until(&mut manager, |_, events| {
            events.iter().any(|e| matches!(e, SyncEvent::Joined { .. }))
        });

        factory.deliver(0, UpdateMessage::replace(&ana(), vec![p(9, 9)]));
        factory.deliver(0, UpdateMessage::append(&ana(), p(8, 8)));
        gate.send(()).unwrap();
        pump_live(&mut manager);
        assert_eq!(manager.points(), &[p(9, 9), p(8, 8)]);
    }

    #[test]
    fn test_stale_snapshot_is_discarded() {
        let (store, gate) = GatedStore::new(seeded(), ana());
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(store), &factory);

        manager.open(ana());
        let bob = BlueprintKey::new("bob", "p2");
        manager.open(bob.clone());
        pump_live(&mut manager);
        assert_eq!(manager.points(), &[p(7, 7)]);

        gate.send(()).unwrap();
        pump_until(&mut manager, |_, events| {
            events.contains(&SyncEvent::StaleDiscarded)
        });
        assert_eq!(manager.key(), Some(&bob));
        assert_eq!(manager.points(), &[p(7, 7)]);
    }

    #[test]
    fn test_open_tears_down_before_reconnecting() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);
        manager.open(BlueprintKey::new("bob", "p2"));
        pump_live(&mut manager);

        let ops = factory.ops();
        let position = |op: &str| ops.iter().position(|o| o == op).unwrap();
        assert!(position("unsubscribe#0") < position("disconnect#0"));
        assert!(position("disconnect#0") < position("create stomp#1"));

        let old = factory.tally(0);
        let old = old.lock().unwrap();
        assert_eq!(old.active, 0);
        assert!(!old.connected);
        assert_eq!(factory.tally(1).lock().unwrap().active, 1);
        assert_eq!(manager.points(), &[p(7, 7)]);
    }

    #[test]
    fn test_switch_transport_releases_previous() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);
        manager.append_local_point(p(3, 3)).unwrap();

        manager.switch_transport(TransportKind::SocketIo);
        {
            let old = factory.tally(0);
            let old = old.lock().unwrap();
            assert_eq!(old.active, 0);
            assert_eq!(old.unsubscribes, 1);
            assert_eq!(old.connects, old.disconnects);
            assert!(!old.connected);
        }
        assert_eq!(factory.kind(1), TransportKind::SocketIo);
        assert_eq!(manager.transport_kind(), TransportKind::SocketIo);

        pump_live(&mut manager);
        assert_eq!(manager.points(), &[p(1, 1), p(2, 2), p(3, 3)]);
        assert_eq!(factory.tally(1).lock().unwrap().active, 1);
        assert_eq!(factory.created(), 2);

        let ops = factory.ops();
        let position = |op: &str| ops.iter().position(|o| o == op).unwrap();
        assert!(position("disconnect#0") < position("create socketio#1"));
    }

    #[test]
    fn test_switch_to_same_transport_is_noop() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);
        manager.switch_transport(TransportKind::Stomp);
        assert_eq!(factory.created(), 1);
        assert_eq!(manager.state(), SessionState::Live);
    }

    #[test]
    fn test_switch_while_idle_only_selects() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.switch_transport(TransportKind::SocketIo);
        assert_eq!(factory.created(), 0);
        manager.open(ana());
        assert_eq!(factory.kind(0), TransportKind::SocketIo);
    }

    #[test]
    fn test_late_update_from_old_transport_is_discarded() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);

        let mut old_callback = factory.tally(0).lock().unwrap().on_update.take().unwrap();
        manager.switch_transport(TransportKind::SocketIo);
        old_callback(UpdateMessage::replace(&ana(), vec![p(9, 9)]));

        pump_until(&mut manager, |m, events| {
            m.state() == SessionState::Live && events.contains(&SyncEvent::StaleDiscarded)
        });
        assert_eq!(manager.points(), &[p(1, 1), p(2, 2)]);
    }

    #[test]
    fn test_reconnect_keeps_subscription() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);

        {
            let tally = factory.tally(0);
            let mut tally = tally.lock().unwrap();
            tally.connected = false;
            tally.events.push(TransportEvent::Disconnected {
                reason: "reset".into(),
            });
        }
        let events = manager.poll();
        assert!(events.contains(&SyncEvent::Disconnected {
            reason: "reset".into()
        }));
        assert_eq!(manager.state(), SessionState::Connecting);

        {
            let tally = factory.tally(0);
            let mut tally = tally.lock().unwrap();
            tally.connected = true;
            tally.events.push(TransportEvent::Connected);
        }
        manager.poll();
        assert_eq!(manager.state(), SessionState::Live);
        assert_eq!(factory.tally(0).lock().unwrap().joins, 1);
    }

    #[test]
    fn test_close_releases_everything() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);

        manager.close();
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(manager.points().is_empty());
        let tally = factory.tally(0);
        let tally = tally.lock().unwrap();
        assert_eq!(tally.active, 0);
        assert_eq!(tally.disconnects, 1);
    }

    #[test]
    fn test_drop_releases_transport() {
        let factory = MockFactory::new(true);
        {
            let mut manager = manager(Arc::new(seeded()), &factory);
            manager.open(ana());
            pump_live(&mut manager);
        }
        let tally = factory.tally(0);
        let tally = tally.lock().unwrap();
        assert_eq!(tally.active, 0);
        assert!(!tally.connected);
    }

    #[test]
    fn test_clear_empties_sequence() {
        let factory = MockFactory::new(true);
        let mut manager = manager(Arc::new(seeded()), &factory);
        manager.open(ana());
        pump_live(&mut manager);
        manager.clear();
        assert!(manager.points().is_empty());
        assert_eq!(manager.state(), SessionState::Live);
    }

    /// Wait until storage holds `expected` for ana/p1.
    fn await_stored(store: &dyn BlueprintStore, expected: &[Point]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stored = store.get(&ana()).map(|b| b.points).unwrap_or_default();
            if stored == expected {
                return;
            }
            assert!(Instant::now() < deadline, "stored {stored:?}, want {expected:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_clear_while_loading_forgets_held_points() {
        let (store, gate) = GatedStore::new(seeded(), ana());
        let store = Arc::new(store);
        let factory = MockFactory::new(true);
        let mut manager = manager(store.clone(), &factory);
        manager.open(ana());
        assert_eq!(manager.state(), SessionState::Loading);

        manager.append_local_point(p(5, 5)).unwrap();
        store.delete(&ana()).unwrap();
        manager.clear();
        store.create(&Blueprint::new(&ana(), Vec::new())).unwrap();

        gate.send(()).unwrap();
        pump_live(&mut manager);
        assert!(manager.points().is_empty());

        // The persister is FIFO: once this point is stored nothing older is queued.
        manager.append_local_point(p(6, 6)).unwrap();
        await_stored(&*store, &[p(6, 6)]);
        assert_eq!(manager.points(), &[p(6, 6)]);
    }

    #[test]
    fn test_close_after_clear_stores_nothing_held() {
        let (store, gate) = GatedStore::new(seeded(), ana());
        let store = Arc::new(store);
        let factory = MockFactory::new(true);
        let mut manager = manager(store.clone(), &factory);
        manager.open(ana());

        manager.append_local_point(p(5, 5)).unwrap();
        store.replace_points(&ana(), &[]).unwrap();
        manager.clear();
        manager.close();
        gate.send(()).unwrap();

        manager.open(ana());
        pump_live(&mut manager);
        assert!(manager.points().is_empty());
        manager.append_local_point(p(6, 6)).unwrap();
        await_stored(&*store, &[p(6, 6)]);
    }
}
