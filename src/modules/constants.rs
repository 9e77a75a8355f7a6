//! Fixed values shared by the daemon components.

use std::time::Duration;

// Dispatch limits
/// Upper bound for a single plugin's `on_file_op` call.
pub const PLUGIN_CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// Capacity of the per-session file-operation and response queues.
pub const QUEUE_LIMIT: usize = 1000;

// Anon map naming
/// Default marker prepended to generated export names.
pub const DEFAULT_EXPORT_PREFIX: &str = "a_";
/// Number of random characters appended to an export name.
pub const SUFFIX_LEN: usize = 3;
/// Punctuation that survives leaf-name sanitizing, next to ASCII letters and digits.
pub const ALLOWED_PUNCTUATION: &str = "!&()+,-.=_";
/// Replacement for every character outside the allow-list.
pub const REPLACEMENT_CHAR: char = '_';

// Directory layout on a backing volume
/// Directory below a volume root holding the anonymous shares, one folder per user.
pub const ANONYM_DIR: &str = "anonym";
/// Directory below a volume root holding the public shares, one folder per user.
pub const PUBLIC_DIR: &str = "public";
/// User directories carrying one of these prefixes are being migrated between volumes.
pub const MIGRATION_PREFIXES: [&str; 2] = ["new_", "old_"];

// Report files
/// Mode of a freshly created per-user report directory.
pub const USER_REPORT_DIR_MODE: u32 = 0o775;
/// Mode of a freshly created module report directory.
pub const MODULE_REPORT_DIR_MODE: u32 = 0o755;

// Console
/// Default TCP port of the administrative console.
pub const DEFAULT_CONSOLE_PORT: u16 = 7766;
