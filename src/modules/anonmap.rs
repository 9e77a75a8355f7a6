//! The anon map: private share directories and their public export names.
//!
//! Each entry maps a key derived from a directory (owning user plus top-level
//! share directory for the `anonym` module, owning user for `public`) to the
//! full source path and the export name shown to the outside world. Export
//! names are unique across the whole map.
//!
//! On disk the map is one `exportName:fullSourcePath` line per entry, sorted
//! by export name. The file is only ever replaced through a temporary file in
//! the same directory followed by an atomic rename.

use super::constants::{ALLOWED_PUNCTUATION, ANONYM_DIR, PUBLIC_DIR, REPLACEMENT_CHAR, SUFFIX_LEN};
use super::proto::ModuleKind;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Identity of a mapped directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKey {
    /// A top-level directory below a user's anonymous-share root.
    Anonym {
        /// Owning user id.
        user: String,
        /// Name of the top-level share directory.
        dir: String,
    },
    /// A user's public share.
    Public {
        /// Owning user id.
        user: String,
    },
}

impl MapKey {
    /// Key for an anonymous share directory.
    pub fn anonym(user: impl Into<String>, dir: impl Into<String>) -> Self {
        MapKey::Anonym {
            user: user.into(),
            dir: dir.into(),
        }
    }

    /// Key for a public share.
    pub fn public(user: impl Into<String>) -> Self {
        MapKey::Public { user: user.into() }
    }

    /// Derives the key for an event path below a user's module root.
    ///
    /// Only the first segment matters for `anonym`; nested changes map to the
    /// same key. Returns `None` for an empty anonymous path and for names
    /// that cannot be written to the map file.
    pub fn derive(module: ModuleKind, user: &str, path: &str) -> Option<Self> {
        let key = match module {
            ModuleKind::Anonym => MapKey::anonym(user, first_segment(path)?),
            ModuleKind::Public => MapKey::public(user),
        };
        if !key.is_storable() {
            warn!("Not mapping {:?}: name cannot be stored in the anon map", key);
            return None;
        }
        Some(key)
    }

    /// Whether the key survives a save and load of the map file unchanged.
    ///
    /// Line breaks would split an entry; a `:` or `/` in the user id would
    /// end the export name early or shift the path components.
    pub fn is_storable(&self) -> bool {
        let clean = |s: &str| !s.is_empty() && !s.contains(['\n', '\r']);
        match self {
            MapKey::Anonym { user, dir } => {
                clean(user) && !user.contains([':', '/']) && clean(dir) && !dir.contains('/')
            }
            MapKey::Public { user } => clean(user) && !user.contains([':', '/']),
        }
    }

    /// Recovers the key from a full source path
    /// (`…/anonym/<user>/<dir>` or `…/public/<user>`).
    pub fn from_source(path: &Path) -> Option<Self> {
        let mut names = path.iter().rev().map(|c| c.to_str());
        let leaf = names.next()??;
        let parent = names.next()??;
        if let Some(Some(grandparent)) = names.next() {
            if grandparent == ANONYM_DIR {
                return Some(MapKey::anonym(parent, leaf));
            }
        }
        if parent == PUBLIC_DIR {
            return Some(MapKey::public(leaf));
        }
        None
    }

    /// Module the key belongs to.
    pub fn module(&self) -> ModuleKind {
        match self {
            MapKey::Anonym { .. } => ModuleKind::Anonym,
            MapKey::Public { .. } => ModuleKind::Public,
        }
    }

    /// Owning user id.
    pub fn user(&self) -> &str {
        match self {
            MapKey::Anonym { user, .. } | MapKey::Public { user } => user,
        }
    }

    /// Where this key's directory lives on the given volume.
    pub fn source_on(&self, volume: &Path) -> PathBuf {
        match self {
            MapKey::Anonym { user, dir } => volume.join(ANONYM_DIR).join(user).join(dir),
            MapKey::Public { user } => volume.join(PUBLIC_DIR).join(user),
        }
    }

    /// The name the export is derived from.
    fn leaf(&self) -> &str {
        match self {
            MapKey::Anonym { dir, .. } => dir,
            MapKey::Public { user } => user,
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Anonym { user, dir } => write!(f, "({}, {})", user, dir),
            MapKey::Public { user } => write!(f, "(public, {})", user),
        }
    }
}

fn first_segment(path: &str) -> Option<&str> {
    path.split('/').find(|s| !s.is_empty() && *s != ".")
}

/// Value of an anon map entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    /// Full path of the private directory.
    pub source: PathBuf,
    /// Public export name.
    pub export: String,
}

/// Result of `AnonMap::add_entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new entry with this export name was created.
    Added(String),
    /// The key already mapped to the same source.
    Unchanged,
    /// The key existed with another source; the source was updated and the
    /// export name kept.
    Relocated {
        /// The previous source path.
        from: PathBuf,
    },
}

/// Source of the random export-name suffixes.
pub trait SuffixSource: Send {
    /// Produces the next candidate suffix.
    fn next_suffix(&mut self) -> String;
}

/// Suffixes of `SUFFIX_LEN` ASCII letters and digits.
pub struct RandomSuffix {
    rng: StdRng,
}

impl RandomSuffix {
    /// Seeds from the operating system.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Reproducible sequence, mostly for tests and dry runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomSuffix {
    fn default() -> Self {
        Self::new()
    }
}

impl SuffixSource for RandomSuffix {
    fn next_suffix(&mut self) -> String {
        (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(SUFFIX_LEN)
            .map(char::from)
            .collect()
    }
}

/// Replaces every character outside the allow-list with `_`.
pub fn sanitize_leaf(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || ALLOWED_PUNCTUATION.contains(c) {
                c
            } else {
                REPLACEMENT_CHAR
            }
        })
        .collect()
}

/// In-memory anon map.
pub struct AnonMap {
    entries: BTreeMap<MapKey, MapEntry>,
    exports: HashMap<String, MapKey>,
    prefix: String,
    suffixes: Box<dyn SuffixSource>,
}

impl fmt::Debug for AnonMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonMap")
            .field("prefix", &self.prefix)
            .field("entries", &self.entries)
            .finish()
    }
}

impl AnonMap {
    /// Creates an empty map using OS-seeded suffixes.
    ///
    /// # Arguments
    ///
    /// * `prefix` - Marker prepended to generated export names
    pub fn new(prefix: &str) -> Self {
        Self::with_suffix_source(prefix, Box::new(RandomSuffix::new()))
    }

    /// Creates an empty map drawing suffixes from `suffixes`.
    pub fn with_suffix_source(prefix: &str, suffixes: Box<dyn SuffixSource>) -> Self {
        Self {
            entries: BTreeMap::new(),
            exports: HashMap::new(),
            prefix: prefix.to_string(),
            suffixes,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for `key`.
    pub fn get(&self, key: &MapKey) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    /// Whether `key` is mapped.
    pub fn contains_key(&self, key: &MapKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether some entry already exports `name`.
    pub fn export_taken(&self, name: &str) -> bool {
        self.exports.contains_key(name)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&MapKey, &MapEntry)> {
        self.entries.iter()
    }

    /// Creates an entry for `key` unless one exists.
    ///
    /// An existing entry keeps its export name; if `source` differs from the
    /// recorded one, the source path is updated.
    pub fn add_entry(&mut self, key: MapKey, source: PathBuf) -> AddOutcome {
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.source == source {
                return AddOutcome::Unchanged;
            }
            let from = std::mem::replace(&mut entry.source, source);
            return AddOutcome::Relocated { from };
        }

        let export = match &key {
            MapKey::Public { user } if !self.exports.contains_key(user.as_str()) => user.clone(),
            _ => self.generate_export(key.leaf()),
        };
        let entry = MapEntry {
            source,
            export: export.clone(),
        };
        self.insert(key, entry);
        AddOutcome::Added(export)
    }

    /// Inserts an entry as-is. Used when reading a persisted map.
    ///
    /// Returns `false` and leaves the map untouched if the key or the export
    /// name is already present.
    pub fn insert_existing(&mut self, key: MapKey, entry: MapEntry) -> bool {
        if self.entries.contains_key(&key) || self.exports.contains_key(&entry.export) {
            return false;
        }
        self.insert(key, entry);
        true
    }

    fn insert(&mut self, key: MapKey, entry: MapEntry) {
        self.exports.insert(entry.export.clone(), key.clone());
        self.entries.insert(key, entry);
    }

    /// Removes the entry for `key`. Absence is not an error.
    pub fn remove_entry(&mut self, key: &MapKey) -> Option<MapEntry> {
        let entry = self.entries.remove(key)?;
        self.exports.remove(&entry.export);
        Some(entry)
    }

    /// Generates a fresh export name for a directory leaf name.
    ///
    /// The suffix is redrawn until the name collides with no existing export.
    pub fn generate_export(&mut self, leaf: &str) -> String {
        let base = sanitize_leaf(leaf);
        let mut attempts = 0usize;
        loop {
            let candidate = format!("{}{}_{}", self.prefix, base, self.suffixes.next_suffix());
            if !self.exports.contains_key(&candidate) {
                if attempts > 0 {
                    debug!("Export name for {} needed {} redraws", leaf, attempts);
                }
                return candidate;
            }
            attempts += 1;
        }
    }

    /// Translates a private path to its public counterpart.
    ///
    /// For `anonym` the first segment is replaced by the export name and the
    /// rest of the path is kept; for `public` the export name is prepended.
    pub fn translate(&self, module: ModuleKind, user: &str, private_path: &str) -> Option<PathBuf> {
        let key = MapKey::derive(module, user, private_path)?;
        let entry = self.entries.get(&key)?;
        let segments = private_path.split('/').filter(|s| !s.is_empty() && *s != ".");
        let rest = match module {
            ModuleKind::Anonym => segments.skip(1).collect::<Vec<_>>(),
            ModuleKind::Public => segments.collect::<Vec<_>>(),
        };
        let mut public = PathBuf::from(&entry.export);
        public.extend(rest);
        Some(public)
    }

    /// Moves every entry of `user` whose source lies below `from` to `to`.
    ///
    /// Export names are kept. Returns the number of rewritten entries.
    pub fn relocate_user(&mut self, user: &str, from: &Path, to: &Path) -> usize {
        let mut moved = 0;
        for (key, entry) in self.entries.iter_mut() {
            if key.user() != user {
                continue;
            }
            if let Ok(rest) = entry.source.strip_prefix(from) {
                let new_source = to.join(rest);
                info!("Relocating {}: {} -> {}", key, entry.source.display(), new_source.display());
                entry.source = new_source;
                moved += 1;
            }
        }
        moved
    }

    /// Parses the textual map.
    ///
    /// Lines that are empty, lack a `:`, or whose path does not identify a
    /// key are skipped with a warning, as are duplicate keys and exports.
    pub fn parse(prefix: &str, text: &str) -> Self {
        let mut map = AnonMap::new(prefix);
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let Some((export, source)) = line.split_once(':') else {
                warn!("anon map line {}: missing ':' separator", lineno + 1);
                continue;
            };
            let source = PathBuf::from(source.trim());
            let Some(key) = MapKey::from_source(&source) else {
                warn!("anon map line {}: cannot derive key from {}", lineno + 1, source.display());
                continue;
            };
            if !key.is_storable() {
                warn!("anon map line {}: unusable name in {}", lineno + 1, source.display());
                continue;
            }
            let entry = MapEntry {
                source,
                export: export.trim().to_string(),
            };
            if !map.insert_existing(key.clone(), entry) {
                warn!("anon map line {}: duplicate entry for {}", lineno + 1, key);
            }
        }
        map
    }

    /// Renders the map, one line per entry, sorted by export name.
    ///
    /// Entries whose key is not storable are left out.
    pub fn render(&self) -> String {
        let mut lines: Vec<(&str, &Path)> = self
            .entries
            .iter()
            .filter(|(key, _)| {
                let storable = key.is_storable();
                if !storable {
                    warn!("Leaving {:?} out of the anon map file", key);
                }
                storable
            })
            .map(|(_, e)| (e.export.as_str(), e.source.as_path()))
            .collect();
        lines.sort();
        lines
            .into_iter()
            .map(|(export, source)| format!("{}:{}\n", export, source.display()))
            .collect()
    }

    /// Reads a map file. A missing file yields an empty map.
    pub fn load(path: &Path, prefix: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let map = Self::parse(prefix, &text);
                debug!("Loaded {} anon map entries from {}", map.len(), path.display());
                Ok(map)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No anon map at {}, starting empty", path.display());
                Ok(Self::new(prefix))
            }
            Err(e) => Err(e).with_context(|| format!("reading anon map {}", path.display())),
        }
    }

    /// Atomically replaces the map file with this map.
    pub fn save(&self, path: &Path, backup: &BackupPolicy) -> Result<()> {
        let staged = stage(path, &self.render())?;
        commit(staged, path, backup)
    }
}

/// Where the previous live map is kept before it is replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupPolicy {
    /// Copy to `<file>.old` next to the live file.
    Sibling,
    /// Copy to `<dir>/<file name>.<timestamp>`.
    Directory(PathBuf),
}

impl BackupPolicy {
    /// Policy for an optional backup directory.
    pub fn from_dir(dir: Option<&Path>) -> Self {
        match dir {
            Some(d) => BackupPolicy::Directory(d.to_path_buf()),
            None => BackupPolicy::Sibling,
        }
    }

    fn target_for(&self, live: &Path) -> Result<PathBuf> {
        let name = live
            .file_name()
            .with_context(|| format!("{} has no file name", live.display()))?
            .to_string_lossy()
            .into_owned();
        Ok(match self {
            BackupPolicy::Sibling => live.with_file_name(format!("{}.old", name)),
            BackupPolicy::Directory(dir) => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating backup dir {}", dir.display()))?;
                let stamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");
                dir.join(format!("{}.{}", name, stamp))
            }
        })
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Writes `contents` to a synced temporary file next to `live`.
fn stage(live: &Path, contents: &str) -> Result<NamedTempFile> {
    let dir = parent_dir(live);
    let mut staged = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temporary file in {}", dir.display()))?;
    staged.write_all(contents.as_bytes())?;
    staged.flush()?;
    staged.as_file().sync_all()?;
    Ok(staged)
}

/// Backs up the live file and renames the staged file over it.
fn commit(staged: NamedTempFile, live: &Path, backup: &BackupPolicy) -> Result<()> {
    if live.exists() {
        let target = backup.target_for(live)?;
        fs::copy(live, &target)
            .with_context(|| format!("backing up {} to {}", live.display(), target.display()))?;
        debug!("Backed up {} to {}", live.display(), target.display());
    }
    staged
        .persist(live)
        .map_err(|e| e.error)
        .with_context(|| format!("replacing {}", live.display()))?;
    // Make the rename itself durable.
    File::open(parent_dir(live))?.sync_all()?;
    Ok(())
}

/// Exclusive claim on a map file, held for as long as the value lives.
///
/// Every process that rewrites the map (the daemon, `scan`, `relocate`)
/// takes it first, so none of them overwrites another's changes from a
/// stale copy. The lock is an `flock` on `<map file>.lock` and goes away
/// with the descriptor.
#[derive(Debug)]
pub struct MapLock {
    path: PathBuf,
    _file: File,
}

impl MapLock {
    /// Takes the lock for `map_file` without waiting.
    ///
    /// # Errors
    ///
    /// Fails if another process holds the lock or the lock file cannot be
    /// opened.
    pub fn acquire(map_file: &Path) -> Result<Self> {
        let mut name = map_file.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                debug!("Locked {}", path.display());
                Ok(MapLock { path, _file: file })
            }
            Err(Errno::EWOULDBLOCK) => bail!(
                "anon map {} is in use by another shepherd process ({} is locked)",
                map_file.display(),
                path.display()
            ),
            Err(e) => Err(e).with_context(|| format!("locking {}", path.display())),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The daemon's shared anon map together with its file.
pub struct MapStore {
    path: PathBuf,
    backup: BackupPolicy,
    map: Mutex<AnonMap>,
}

impl MapStore {
    /// Wraps an already loaded map.
    pub fn new(path: PathBuf, backup: BackupPolicy, map: AnonMap) -> Self {
        Self {
            path,
            backup,
            map: Mutex::new(map),
        }
    }

    /// Loads the map file (missing means empty).
    pub fn open(path: PathBuf, backup: BackupPolicy, prefix: &str) -> Result<Self> {
        let map = AnonMap::load(&path, prefix)?;
        Ok(Self::new(path, backup, map))
    }

    /// Path of the live map file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` with exclusive access to the map. Never hold this across I/O.
    pub fn with_map<R>(&self, f: impl FnOnce(&mut AnonMap) -> R) -> R {
        f(&mut self.map.lock())
    }

    /// Writes the current map to disk.
    pub fn persist(&self) -> Result<()> {
        let rendered = self.map.lock().render();
        let staged = stage(&self.path, &rendered)?;
        commit(staged, &self.path, &self.backup)?;
        info!("Persisted anon map to {}", self.path.display());
        Ok(())
    }

    /// Adds an entry and persists if anything changed.
    pub fn add_entry(&self, key: MapKey, source: PathBuf) -> Result<AddOutcome> {
        let outcome = self.with_map(|m| m.add_entry(key, source));
        if outcome != AddOutcome::Unchanged {
            self.persist()?;
        }
        Ok(outcome)
    }

    /// Removes an entry and persists if it existed.
    pub fn remove_entry(&self, key: &MapKey) -> Result<Option<MapEntry>> {
        let removed = self.with_map(|m| m.remove_entry(key));
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Swaps in a new map (after reconciliation) and persists it.
    pub fn replace(&self, map: AnonMap) -> Result<()> {
        *self.map.lock() = map;
        self.persist()
    }

    /// See `AnonMap::translate`.
    pub fn translate(&self, module: ModuleKind, user: &str, private_path: &str) -> Option<PathBuf> {
        self.map.lock().translate(module, user, private_path)
    }
}
