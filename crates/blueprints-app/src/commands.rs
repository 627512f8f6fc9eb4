//! Command line parsing and the help table.

use blueprints_core::{BlueprintKey, Point, TransportKind};
use thiserror::Error;

/// A command typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a blueprint and join its channel.
    Open(BlueprintKey),
    /// Switch the live transport.
    Tech(TransportKind),
    /// Draw a point on the open blueprint.
    Draw(Point),
    /// Print the local point sequence.
    Points,
    /// List an author's blueprints. Defaults to the open blueprint's author.
    List(Option<String>),
    /// Create an empty blueprint.
    Create {
        author: Option<String>,
        name: String,
    },
    /// Replace the stored points with the local sequence.
    Save,
    /// Delete the open blueprint. Only runs when confirmed.
    Delete { confirmed: bool },
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command `{0}`, try `help`")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Invalid coordinate `{0}`")]
    InvalidCoordinate(String),
    #[error("Unknown transport `{0}`, expected stomp or socketio")]
    InvalidTransport(String),
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("open", [author, name]) => Command::Open(BlueprintKey::new(*author, *name)),
        ("open", _) => return Err(CommandError::Usage(usage("open"))),
        ("tech", [kind]) => Command::Tech(
            kind.parse()
                .map_err(|_| CommandError::InvalidTransport(kind.to_string()))?,
        ),
        ("tech", _) => return Err(CommandError::Usage(usage("tech"))),
        ("draw", [x, y]) => Command::Draw(Point::new(coordinate(x)?, coordinate(y)?)),
        ("draw", _) => return Err(CommandError::Usage(usage("draw"))),
        ("points", []) => Command::Points,
        ("list", []) => Command::List(None),
        ("list", [author]) => Command::List(Some(author.to_string())),
        ("create", [name]) => Command::Create {
            author: None,
            name: name.to_string(),
        },
        ("create", [author, name]) => Command::Create {
            author: Some(author.to_string()),
            name: name.to_string(),
        },
        ("create", _) => return Err(CommandError::Usage(usage("create"))),
        ("save", []) => Command::Save,
        ("delete", []) => Command::Delete { confirmed: false },
        ("delete", ["--yes" | "-y"]) => Command::Delete { confirmed: true },
        ("delete", _) => return Err(CommandError::Usage(usage("delete"))),
        ("status", []) => Command::Status,
        ("help" | "?", _) => Command::Help,
        ("quit" | "exit", []) => Command::Quit,
        (other, _) => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn coordinate(raw: &str) -> Result<u32, CommandError> {
    raw.parse()
        .map_err(|_| CommandError::InvalidCoordinate(raw.to_string()))
}

fn usage(verb: &str) -> &'static str {
    CommandHelp::all()
        .into_iter()
        .find(|help| help.usage.split_whitespace().next() == Some(verb))
        .map(|help| help.usage)
        .unwrap_or("help")
}

/// One line of the help table.
#[derive(Debug, Clone)]
pub struct CommandHelp {
    pub usage: &'static str,
    pub description: &'static str,
}

impl CommandHelp {
    pub const fn new(usage: &'static str, description: &'static str) -> Self {
        Self { usage, description }
    }

    /// Every command the client understands.
    pub fn all() -> Vec<CommandHelp> {
        vec![
            CommandHelp::new("open <author> <name>", "Open a blueprint and join its channel"),
            CommandHelp::new("tech <stomp|socketio>", "Switch the live transport"),
            CommandHelp::new("draw <x> <y>", "Draw a point"),
            CommandHelp::new("points", "Print the current points"),
            CommandHelp::new("list [author]", "List an author's blueprints"),
            CommandHelp::new("create [author] <name>", "Create an empty blueprint"),
            CommandHelp::new("save", "Store the current points, replacing the saved ones"),
            CommandHelp::new("delete [--yes]", "Delete the open blueprint"),
            CommandHelp::new("status", "Show the session state"),
            CommandHelp::new("help", "Show this table"),
            CommandHelp::new("quit", "Leave"),
        ]
    }

    /// The table as printable lines.
    pub fn lines() -> Vec<String> {
        let mut lines = vec!["=== Commands ===".to_string()];
        for help in Self::all() {
            lines.push(format!("  {:24} {}", help.usage, help.description));
        }
        lines
    }
}
