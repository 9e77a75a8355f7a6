//! Built-in plugins, loaded by name from the config.

pub mod anonmap;
pub mod base;
pub mod help;

use super::context::DaemonContext;
use super::plugin::Plugin;
use std::sync::Arc;

/// Creates the plugin called `name` and registers its console commands.
///
/// Returns `None` for unknown names.
pub fn create(name: &str, ctx: &Arc<DaemonContext>) -> Option<Arc<dyn Plugin>> {
    match name {
        "help" => Some(help::HelpPlugin::init(ctx)),
        "base" => Some(base::BasePlugin::init(ctx)),
        "anonmap" => Some(anonmap::AnonMapPlugin::init(ctx)),
        _ => None,
    }
}
