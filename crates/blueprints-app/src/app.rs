//! Core application state and lifecycle.

use std::io::{self, BufRead};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::mpsc::{self, TryRecvError};
use std::thread;
use std::time::Duration;

use blueprints_core::{
    Blueprint, BlueprintKey, BlueprintStore, CollaborationManager, FetchError, HttpStore,
    NetworkTransports, SyncConfig, SyncEvent, TransportKind,
};

use crate::commands::{self, Command, CommandHelp};

pub const API_BASE_ENV: &str = "BLUEPRINTS_API_BASE";
pub const STOMP_BASE_ENV: &str = "BLUEPRINTS_STOMP_BASE";
pub const IO_BASE_ENV: &str = "BLUEPRINTS_IO_BASE";
pub const TRANSPORT_ENV: &str = "BLUEPRINTS_TRANSPORT";

/// How long one turn of the main loop waits for manager events.
const TICK: Duration = Duration::from_millis(50);

/// Application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub sync: SyncConfig,
}

impl AppConfig {
    /// Defaults overlaid with the `BLUEPRINTS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut sync = SyncConfig::default();
        if let Some(base) = lookup(API_BASE_ENV) {
            sync = sync.with_api_base(base);
        }
        if let Some(base) = lookup(STOMP_BASE_ENV) {
            sync.stomp.base_url = base;
        }
        if let Some(base) = lookup(IO_BASE_ENV) {
            sync.socketio.base_url = base;
        }
        if let Some(raw) = lookup(TRANSPORT_ENV) {
            match raw.parse::<TransportKind>() {
                Ok(kind) => sync.transport = kind,
                Err(e) => log::warn!("Ignoring {TRANSPORT_ENV}={raw}: {e}"),
            }
        }
        Self { sync }
    }
}

/// The terminal client: a collaboration manager plus direct storage access
/// for blueprint management.
pub struct App {
    manager: CollaborationManager,
    store: Arc<dyn BlueprintStore>,
}

impl App {
    pub fn new(manager: CollaborationManager, store: Arc<dyn BlueprintStore>) -> Self {
        Self { manager, store }
    }

    /// Client backed by the HTTP storage API and the network transports.
    pub fn from_config(config: &AppConfig) -> Result<Self, FetchError> {
        let store: Arc<dyn BlueprintStore> = Arc::new(HttpStore::new(
            &config.sync.api_base,
            config.sync.request_timeout,
        )?);
        let transports = NetworkTransports::new(config.sync.clone());
        let manager =
            CollaborationManager::new(&config.sync, Arc::clone(&store), Box::new(transports));
        Ok(Self::new(manager, store))
    }

    /// Read commands from stdin until `quit` or end of input.
    pub fn run(mut self) {
        let (tx, rx) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || {
                for line in io::stdin().lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = reader {
            log::error!("Failed to start stdin reader: {e}");
            return;
        }

        print_lines(&CommandHelp::lines());
        loop {
            for event in self.manager.wait_events(TICK) {
                if let Some(line) = describe(&event) {
                    println!("{line}");
                }
            }

            let line = match rx.try_recv() {
                Ok(line) => line,
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Disconnected) => break,
            };
            let command = match commands::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    println!("{e}");
                    continue;
                }
            };
            let mut out = Vec::new();
            let flow = self.execute(command, &mut out);
            print_lines(&out);
            if flow.is_break() {
                break;
            }
        }

        self.manager.close();
        log::info!("Bye");
    }

    /// Run one command, collecting what it prints into `out`.
    pub fn execute(&mut self, command: Command, out: &mut Vec<String>) -> ControlFlow<()> {
        match command {
            Command::Open(key) => {
                out.push(format!("Opening {key} over {}", self.manager.transport_kind()));
                self.manager.open(key);
            }
            Command::Tech(kind) => {
                self.manager.switch_transport(kind);
                out.push(format!("Transport: {kind}"));
            }
            Command::Draw(point) => match self.manager.append_local_point(point) {
                Ok(()) => out.push(format!("Drew {point}")),
                Err(e) => out.push(e.to_string()),
            },
            Command::Points => {
                let points = self.manager.points();
                out.push(format!("{} points", points.len()));
                out.extend(points.iter().map(|p| format!("  {p}")));
            }
            Command::List(author) => self.list(author, out),
            Command::Create { author, name } => self.create(author, name, out),
            Command::Save => self.save(out),
            Command::Delete { confirmed } => self.delete(confirmed, out),
            Command::Status => {
                let blueprint = self
                    .manager
                    .key()
                    .map(|key| key.to_string())
                    .unwrap_or_else(|| "-".to_string());
                out.push(format!(
                    "Blueprint: {blueprint}  State: {:?}  Transport: {}  Points: {}",
                    self.manager.state(),
                    self.manager.transport_kind(),
                    self.manager.points().len()
                ));
            }
            Command::Help => out.extend(CommandHelp::lines()),
            Command::Quit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn open_key(&self, out: &mut Vec<String>) -> Option<BlueprintKey> {
        let key = self.manager.key().cloned();
        if key.is_none() {
            out.push("No blueprint is open".to_string());
        }
        key
    }

    fn list(&self, author: Option<String>, out: &mut Vec<String>) {
        let Some(author) = author.or_else(|| self.manager.key().map(|k| k.author.clone())) else {
            out.push("Usage: list <author> (or open a blueprint first)".to_string());
            return;
        };
        match self.store.list_by_author(&author) {
            Ok(listing) => {
                out.push(format!(
                    "{} blueprints by {author}, {} points in total",
                    listing.blueprints.len(),
                    listing.total_points
                ));
                out.extend(
                    listing
                        .blueprints
                        .iter()
                        .map(|b| format!("  {} ({} points)", b.name, b.points.len())),
                );
            }
            Err(e) => out.push(format!("Failed to list {author}: {e}")),
        }
    }

    /// Create an empty blueprint. One created for the author being viewed
    /// is opened right away.
    fn create(&mut self, author: Option<String>, name: String, out: &mut Vec<String>) {
        let current = self.manager.key().map(|k| k.author.clone());
        let Some(author) = author.or_else(|| current.clone()) else {
            out.push("Usage: create <author> <name> (or open a blueprint first)".to_string());
            return;
        };
        let key = BlueprintKey::new(author, name);
        match self.store.create(&Blueprint::new(&key, Vec::new())) {
            Ok(_) => {
                out.push(format!("Created {key}"));
                if current.as_deref() == Some(key.author.as_str()) {
                    out.push(format!("Opening {key} over {}", self.manager.transport_kind()));
                    self.manager.open(key);
                }
            }
            Err(e) => out.push(format!("Failed to create {key}: {e}")),
        }
    }

    fn save(&self, out: &mut Vec<String>) {
        let Some(key) = self.open_key(out) else {
            return;
        };
        match self.store.replace_points(&key, self.manager.points()) {
            Ok(saved) => out.push(format!("Saved {key} ({} points)", saved.points.len())),
            Err(e) => out.push(format!("Failed to save {key}: {e}")),
        }
    }

    fn delete(&mut self, confirmed: bool, out: &mut Vec<String>) {
        let Some(key) = self.open_key(out) else {
            return;
        };
        if !confirmed {
            out.push(format!("Delete {key}? Confirm with `delete --yes`"));
            return;
        }
        match self.store.delete(&key) {
            Ok(()) => {
                self.manager.clear();
                out.push(format!("Deleted {key}"));
            }
            Err(e) => out.push(format!("Failed to delete {key}: {e}")),
        }
    }
}

/// Human readable line for a manager event, if it deserves one.
pub fn describe(event: &SyncEvent) -> Option<String> {
    match event {
        SyncEvent::Connected { transport } => Some(format!("Connected over {transport}")),
        SyncEvent::Disconnected { reason } => Some(format!("Disconnected: {reason}")),
        SyncEvent::Joined { channel } => Some(format!("Live on {channel}")),
        SyncEvent::SnapshotLoaded { points } => Some(format!("Loaded {points} points")),
        SyncEvent::SnapshotFailed { error } => {
            Some(format!("Could not load blueprint ({error}), starting empty"))
        }
        SyncEvent::PersistFailed { point, error } => {
            Some(format!("Could not store {point}: {error}"))
        }
        SyncEvent::Error { message } => Some(format!("Error: {message}")),
        SyncEvent::PointsChanged | SyncEvent::Persisted { .. } | SyncEvent::StaleDiscarded => {
            None
        }
    }
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blueprints_core::{
        ChannelId, MemoryStore, Point, PointPublish, SessionState, Subscription, Transport,
        TransportError, TransportEvent, TransportFactory,
    };
    use std::collections::HashMap;
    use std::time::Instant;

    /// A transport that never gets through.
    struct Offline(TransportKind);

    impl Transport for Offline {
        fn kind(&self) -> TransportKind {
            self.0
        }

        fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn is_connected(&self) -> bool {
            false
        }

        fn join_channel(
            &mut self,
            channel: &ChannelId,
            _on_update: blueprints_core::transport::UpdateCallback,
        ) -> Result<Subscription, TransportError> {
            Ok(Subscription::new(channel.clone(), || {}))
        }

        fn publish_point(
            &mut self,
            _channel: &ChannelId,
            _payload: &PointPublish,
        ) -> Result<(), TransportError> {
            Err(TransportError::NotConnected)
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            Vec::new()
        }
    }

    struct OfflineTransports;

    impl TransportFactory for OfflineTransports {
        fn create(&self, kind: TransportKind) -> Box<dyn Transport> {
            Box::new(Offline(kind))
        }
    }

    fn app_with(blueprints: Vec<Blueprint>) -> (App, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_blueprints(blueprints));
        let manager = CollaborationManager::new(
            &SyncConfig::default(),
            store.clone(),
            Box::new(OfflineTransports),
        );
        (App::new(manager, store.clone()), store)
    }

    fn run(app: &mut App, line: &str) -> Vec<String> {
        let mut out = Vec::new();
        let command = commands::parse(line).unwrap().unwrap();
        assert!(app.execute(command, &mut out).is_continue());
        out
    }

    /// Pump the manager until `done` holds.
    fn pump(app: &mut App, done: impl Fn(&App) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(app) {
            assert!(Instant::now() < deadline, "timed out");
            app.manager.wait_events(Duration::from_millis(20));
        }
    }

    fn key() -> BlueprintKey {
        BlueprintKey::new("ana", "p1")
    }

    #[test]
    fn test_config_overlay() {
        let vars: HashMap<&str, &str> = [
            (API_BASE_ENV, "http://api:9000"),
            (IO_BASE_ENV, "http://io:3001"),
            (TRANSPORT_ENV, "stomp"),
        ]
        .into_iter()
        .collect();
        let config = AppConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.sync.api_base, "http://api:9000");
        assert_eq!(config.sync.stomp.base_url, "http://api:9000");
        assert_eq!(config.sync.socketio.base_url, "http://io:3001");
        assert_eq!(config.sync.transport, TransportKind::Stomp);

        let config = AppConfig::from_lookup(|name| match name {
            STOMP_BASE_ENV => Some("http://broker:61613".to_string()),
            TRANSPORT_ENV => Some("pigeon".to_string()),
            _ => None,
        });
        assert_eq!(config.sync.api_base, SyncConfig::default().api_base);
        assert_eq!(config.sync.stomp.base_url, "http://broker:61613");
        assert_eq!(config.sync.transport, TransportKind::SocketIo);
    }

    #[test]
    fn test_draw_requires_open_blueprint() {
        let (mut app, _) = app_with(Vec::new());
        assert_eq!(run(&mut app, "draw 1 1"), vec!["No blueprint is open"]);
        assert_eq!(run(&mut app, "save"), vec!["No blueprint is open"]);
    }

    #[test]
    fn test_open_draw_and_save() {
        let (mut app, store) = app_with(vec![Blueprint::new(&key(), vec![Point::new(1, 1)])]);
        run(&mut app, "open ana p1");
        pump(&mut app, |app| app.manager.state() != SessionState::Loading);
        assert_eq!(app.manager.points(), &[Point::new(1, 1)]);

        assert_eq!(run(&mut app, "draw 2 3"), vec!["Drew (2, 3)"]);
        let out = run(&mut app, "draw 900 3");
        assert!(out[0].contains("outside"));

        let out = run(&mut app, "points");
        assert_eq!(out[0], "2 points");

        let stored = |_: &App| store.get(&key()).map(|b| b.points.len()).unwrap_or(0) == 2;
        pump(&mut app, stored);

        assert_eq!(run(&mut app, "save"), vec!["Saved ana/p1 (2 points)"]);
        assert_eq!(
            store.get(&key()).unwrap().points,
            vec![Point::new(1, 1), Point::new(2, 3)]
        );
    }

    #[test]
    fn test_delete_needs_confirmation() {
        let (mut app, store) = app_with(vec![Blueprint::new(&key(), vec![Point::new(1, 1)])]);
        run(&mut app, "open ana p1");
        pump(&mut app, |app| !app.manager.points().is_empty());

        let out = run(&mut app, "delete");
        assert!(out[0].contains("delete --yes"));
        assert!(store.get(&key()).is_ok());
        assert_eq!(app.manager.points().len(), 1);

        assert_eq!(run(&mut app, "delete --yes"), vec!["Deleted ana/p1"]);
        assert!(matches!(store.get(&key()), Err(FetchError::NotFound(_))));
        assert!(app.manager.points().is_empty());
    }

    #[test]
    fn test_list_and_create() {
        let (mut app, _) = app_with(vec![
            Blueprint::new(&key(), vec![Point::new(1, 1), Point::new(2, 2)]),
            Blueprint::new(&BlueprintKey::new("ana", "p2"), vec![Point::new(3, 3)]),
        ]);
        let out = run(&mut app, "list ana");
        assert_eq!(out[0], "2 blueprints by ana, 3 points in total");

        assert!(run(&mut app, "list")[0].starts_with("Usage"));
        assert!(run(&mut app, "create p3")[0].starts_with("Usage"));

        assert_eq!(run(&mut app, "create ana p3"), vec!["Created ana/p3"]);
        assert!(run(&mut app, "create ana p3")[0].starts_with("Failed"));

        run(&mut app, "open ana p3");
        assert!(run(&mut app, "list")[0].starts_with("3 blueprints by ana"));
    }

    #[test]
    fn test_create_for_current_author_opens_it() {
        let (mut app, _) = app_with(vec![Blueprint::new(&key(), vec![Point::new(1, 1)])]);
        run(&mut app, "open ana p1");
        pump(&mut app, |app| !app.manager.points().is_empty());

        assert_eq!(
            run(&mut app, "create p4"),
            vec!["Created ana/p4", "Opening ana/p4 over socketio"]
        );
        assert_eq!(app.manager.key(), Some(&BlueprintKey::new("ana", "p4")));
        pump(&mut app, |app| app.manager.state() != SessionState::Loading);
        assert!(app.manager.points().is_empty());

        // Another author's blueprint is created but the view stays put.
        assert_eq!(run(&mut app, "create bob b1"), vec!["Created bob/b1"]);
        assert_eq!(app.manager.key(), Some(&BlueprintKey::new("ana", "p4")));
    }

    #[test]
    fn test_status_and_tech() {
        let (mut app, _) = app_with(Vec::new());
        let out = run(&mut app, "status");
        assert_eq!(out[0], "Blueprint: -  State: Idle  Transport: socketio  Points: 0");

        run(&mut app, "tech stomp");
        assert_eq!(app.manager.transport_kind(), TransportKind::Stomp);

        let mut out = Vec::new();
        assert!(app.execute(Command::Quit, &mut out).is_break());
    }

    #[test]
    fn test_describe_events() {
        assert_eq!(
            describe(&SyncEvent::SnapshotLoaded { points: 4 }).as_deref(),
            Some("Loaded 4 points")
        );
        assert_eq!(describe(&SyncEvent::PointsChanged), None);
        assert_eq!(
            describe(&SyncEvent::Connected {
                transport: TransportKind::Stomp
            })
            .as_deref(),
            Some("Connected over stomp")
        );
    }
}
