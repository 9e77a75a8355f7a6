//! Daemon components.
//!
//! - `session`, `registry`, `discovery`: connections to the mount instances
//! - `plugin`, `plugins`, `console`, `sink`: event dispatch and administration
//! - `anonmap`, `reconcile`: the export-name map and its upkeep
//! - `context`, `daemon`, `config`: process wiring

pub mod anonmap;
pub mod config;
pub mod console;
pub mod constants;
pub mod context;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod plugin;
pub mod plugins;
pub mod proto;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod sink;
