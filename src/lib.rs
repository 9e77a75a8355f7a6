#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! shepherd: control plane for per-user filesystem mount instances
//!
//! Every mount instance opens a control socket in a shared directory. The
//! daemon connects to each of them, receives their file-operation events and
//! sends commands back.
//!
//! ## Features
//!
//! - Socket discovery through inotify
//! - Single-slot request/response correlation per mount instance
//! - Plugins reacting to file operations, with a per-call timeout
//! - The anon map: collision-free public export names for private shares,
//!   persisted atomically
//! - An administrative console on stdin or TCP
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shepherd::{DaemonConfig, DaemonContext};
//! use std::path::Path;
//!
//! # async fn start() -> anyhow::Result<()> {
//! let config = DaemonConfig::load(Path::new("/etc/shepherd/shepherd.toml"))?;
//! let ctx = DaemonContext::new(config)?;
//! ctx.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod modules;

pub use modules::anonmap::{AnonMap, MapKey, MapStore};
pub use modules::config::DaemonConfig;
pub use modules::context::DaemonContext;
pub use modules::reconcile::Reconciler;
