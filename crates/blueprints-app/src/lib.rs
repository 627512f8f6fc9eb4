//! Blueprints terminal client
//!
//! Line-driven shell over the collaboration core: opens blueprints, draws
//! points, switches transports and manages stored blueprints.

mod app;
mod commands;

pub use app::{App, AppConfig, describe};
pub use commands::{Command, CommandError, CommandHelp, parse};
