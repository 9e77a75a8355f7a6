//! Wire records exchanged with mount instances.
//!
//! Both directions use newline-delimited UTF-8 records. Mount instances send
//! JSON objects; the daemon sends bare command lines.

use super::constants::{ANONYM_DIR, PUBLIC_DIR};
use super::error::SessionError;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Metadata announced by a mount instance in its first record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Hello {
    /// Owning user id.
    pub user: String,
    /// Mount point of the instance.
    pub mountpoint: String,
    /// Backing volume holding the user's anonymous shares, if announced.
    #[serde(default)]
    pub anonym_raid: Option<String>,
}

/// Parses the handshake record.
///
/// # Errors
///
/// Returns `SessionError::Protocol` for malformed JSON, a missing or different
/// `op`, or missing metadata.
pub fn parse_hello(line: &str) -> Result<Hello, SessionError> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| SessionError::Protocol(format!("invalid hello: {}", e)))?;
    if value.get("op").and_then(Value::as_str) != Some("hello") {
        return Err(SessionError::Protocol(format!(
            "expected hello, got: {}",
            line.trim()
        )));
    }
    serde_json::from_value(value)
        .map_err(|e| SessionError::Protocol(format!("incomplete hello: {}", e)))
}

/// File operations reported by a mount instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileOpKind {
    /// Directory created.
    Mkdir,
    /// Directory removed.
    Rmdir,
    /// File written.
    Write,
    /// File truncated.
    Truncate,
    /// File handle released.
    Release,
    /// File removed.
    Unlink,
    /// Entry renamed.
    Rename,
    /// File created.
    Create,
    /// Any operation this daemon does not know by name.
    #[serde(other)]
    Other,
}

/// A file-operation event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileOp {
    /// Operation kind.
    pub op: FileOpKind,
    /// Name of the filesystem module the operation happened in.
    pub module: String,
    /// Path relative to the module root of the instance's user.
    #[serde(default)]
    pub path: String,
}

impl FileOp {
    /// Non-empty path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty() && *s != ".")
    }

    /// First path segment, i.e. the shared directory the operation belongs to.
    pub fn top_level(&self) -> Option<&str> {
        self.segments().next()
    }

    /// Whether the path names a top-level directory itself.
    pub fn is_top_level(&self) -> bool {
        self.segments().count() == 1
    }

    /// The module this event belongs to, if it is one the daemon maps.
    pub fn module_kind(&self) -> Option<ModuleKind> {
        ModuleKind::from_name(&self.module)
    }
}

/// Filesystem modules whose directories appear in the anon map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
    /// Per-user anonymous shares, one export per top-level directory.
    Anonym,
    /// Per-user public share, one export per user.
    Public,
}

impl ModuleKind {
    /// Exact lookup by name; anything outside the known set is `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            ANONYM_DIR => Some(ModuleKind::Anonym),
            PUBLIC_DIR => Some(ModuleKind::Public),
            _ => None,
        }
    }

    /// Name used on the wire and as directory name on a volume.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Anonym => ANONYM_DIR,
            ModuleKind::Public => PUBLIC_DIR,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A display-name change of the instance's user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NameChange {
    /// Previous name.
    pub source: String,
    /// New name.
    pub dest: String,
}

/// Classification of a record received after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A bare `{"state": ...}` notification.
    Status(Value),
    /// A file-operation event, with the raw record kept for observers.
    FileOp(FileOp, Value),
    /// A name-change event.
    NameChange(NameChange),
    /// Anything else.
    Unknown(Value),
}

/// Sorts a decoded record into one of the inbound shapes.
///
/// A record with both `op` and `module` that does not deserialize into a
/// `FileOp` (for example a non-string path) is reported as `Unknown`.
pub fn classify(value: Value) -> Inbound {
    if value.get("state").is_some() {
        return Inbound::Status(value);
    }
    if value.get("op").is_some() && value.get("module").is_some() {
        return match serde_json::from_value::<FileOp>(value.clone()) {
            Ok(op) => Inbound::FileOp(op, value),
            Err(_) => Inbound::Unknown(value),
        };
    }
    if value.get("event").and_then(Value::as_str) == Some("namechange") {
        return match serde_json::from_value::<NameChange>(value.clone()) {
            Ok(change) => Inbound::NameChange(change),
            Err(_) => Inbound::Unknown(value),
        };
    }
    Inbound::Unknown(value)
}

/// Extracts the payload of a response record.
///
/// # Errors
///
/// Returns `SessionError::Rejected` unless the record says `"state":"success"`.
pub fn response_payload(record: Value) -> Result<Value, SessionError> {
    if record.get("state").and_then(Value::as_str) == Some("success") {
        Ok(record.get("response").cloned().unwrap_or(Value::Null))
    } else {
        Err(SessionError::Rejected(record))
    }
}

/// Commands sent from the daemon to a mount instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Drop the instance's caches.
    ClearCache,
    /// Reload mapping and configuration.
    ForceReload,
    /// Change a configuration value.
    SetConfig {
        /// Config key.
        key: String,
        /// New value.
        value: String,
    },
    /// Query a configuration value.
    Config(String),
    /// Query the owning user.
    User,
    /// Query the volume holding the anonymous shares.
    AnonymRaid,
    /// A raw line typed by an operator.
    Raw(String),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ClearCache => f.write_str("CLEARCACHE"),
            Command::ForceReload => f.write_str("FORCE-RELOAD"),
            Command::SetConfig { key, value } => write!(f, "SETCONFIG {}={}", key, value),
            Command::Config(key) => write!(f, "CONFIG {}", key),
            Command::User => f.write_str("user"),
            Command::AnonymRaid => f.write_str("anonym_raid"),
            Command::Raw(line) => f.write_str(line.trim()),
        }
    }
}

impl Command {
    /// The command as a single framed line.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}
