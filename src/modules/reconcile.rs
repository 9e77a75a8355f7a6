//! Reconciliation of the anon map against the live volume trees.
//!
//! Run at startup, from the `scan` subcommand and from the `anonmap-scan`
//! console command. Known entries whose directory vanished are dropped (or
//! follow their user to another volume); live, non-empty share directories
//! without an entry get one.

use super::anonmap::{AddOutcome, AnonMap, MapKey};
use super::constants::{ANONYM_DIR, MIGRATION_PREFIXES, MODULE_REPORT_DIR_MODE, PUBLIC_DIR, USER_REPORT_DIR_MODE};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// What a reconciliation run changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Entries whose directory is still where the map says.
    pub kept: usize,
    /// Entries that moved to another volume, with their new source.
    pub relocated: Vec<(MapKey, PathBuf)>,
    /// Entries removed because their directory is gone, with their export name.
    pub dropped: Vec<(MapKey, String)>,
    /// New entries with their export name.
    pub added: Vec<(MapKey, String)>,
}

impl ReconcileSummary {
    /// Whether the map differs from before the run.
    pub fn changed(&self) -> bool {
        !(self.relocated.is_empty() && self.dropped.is_empty() && self.added.is_empty())
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kept {}, relocated {}, dropped {}, added {}",
            self.kept,
            self.relocated.len(),
            self.dropped.len(),
            self.added.len()
        )
    }
}

/// Scans a fixed set of volumes.
#[derive(Debug, Clone)]
pub struct Reconciler {
    volumes: Vec<PathBuf>,
    report_dir: Option<PathBuf>,
}

impl Reconciler {
    /// Creates a reconciler.
    ///
    /// # Arguments
    ///
    /// * `volumes` - Backing volume roots; their order does not matter
    /// * `report_dir` - Root of the per-user report files, if any
    pub fn new(volumes: &[PathBuf], report_dir: Option<&Path>) -> Self {
        let mut volumes = volumes.to_vec();
        volumes.sort();
        volumes.dedup();
        Self {
            volumes,
            report_dir: report_dir.map(Path::to_path_buf),
        }
    }

    /// Brings `map` in line with the volumes.
    pub fn run(&self, map: &mut AnonMap) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        self.check_known(map, &mut summary);
        self.add_new(map, &mut summary);
        info!("Reconciled anon map: {}", summary);
        summary
    }

    fn check_known(&self, map: &mut AnonMap, summary: &mut ReconcileSummary) {
        let known: Vec<(MapKey, PathBuf)> = map
            .iter()
            .map(|(k, e)| (k.clone(), e.source.clone()))
            .collect();

        for (key, source) in known {
            if is_real_dir(&source) {
                summary.kept += 1;
                continue;
            }

            let moved_to = self
                .volumes
                .iter()
                .map(|v| key.source_on(v))
                .find(|candidate| is_real_dir(candidate));

            match moved_to {
                Some(new_source) => {
                    info!("{} now lives at {}", key, new_source.display());
                    map.add_entry(key.clone(), new_source.clone());
                    summary.relocated.push((key, new_source));
                }
                None => {
                    if let Some(entry) = map.remove_entry(&key) {
                        info!("{} ({}) is gone, dropping it", key, entry.export);
                        if let Some(dir) = &self.report_dir {
                            if let Err(e) = remove_report(dir, &key) {
                                warn!("Cannot remove report for {}: {:#}", key, e);
                            }
                        }
                        summary.dropped.push((key, entry.export));
                    }
                }
            }
        }
    }

    fn add_new(&self, map: &mut AnonMap, summary: &mut ReconcileSummary) {
        // First volume in sorted order wins a key found on several volumes.
        let mut candidates: BTreeMap<MapKey, PathBuf> = BTreeMap::new();
        for volume in &self.volumes {
            for (key, source) in scan_volume(volume) {
                if !map.contains_key(&key) {
                    candidates.entry(key).or_insert(source);
                }
            }
        }

        for (key, source) in candidates {
            if let AddOutcome::Added(export) = map.add_entry(key.clone(), source) {
                debug!("New export {} for {}", export, key);
                if let Some(dir) = &self.report_dir {
                    if let Err(e) = write_report(dir, &key, &export) {
                        warn!("Cannot write report for {}: {:#}", key, e);
                    }
                }
                summary.added.push((key, export));
            }
        }
    }
}

/// Every exportable directory on one volume.
fn scan_volume(volume: &Path) -> Vec<(MapKey, PathBuf)> {
    let mut found = Vec::new();

    for (user, user_dir) in user_dirs(&volume.join(ANONYM_DIR)) {
        for (dir, share) in subdirs(&user_dir) {
            if is_empty_dir(&share) {
                debug!("Skipping empty share {}", share.display());
                continue;
            }
            found.push((MapKey::anonym(&user, dir), share));
        }
    }

    for (user, public_dir) in user_dirs(&volume.join(PUBLIC_DIR)) {
        if is_empty_dir(&public_dir) {
            debug!("Skipping empty public folder {}", public_dir.display());
            continue;
        }
        found.push((MapKey::public(user), public_dir));
    }

    found.retain(|(key, source)| {
        if !key.is_storable() {
            warn!("Skipping {:?}: name cannot be stored in the anon map", source);
        }
        key.is_storable()
    });
    found
}

/// User directories below a module root, minus those being migrated.
fn user_dirs(root: &Path) -> Vec<(String, PathBuf)> {
    subdirs(root)
        .into_iter()
        .filter(|(name, _)| {
            let migrating = MIGRATION_PREFIXES.iter().any(|p| name.starts_with(p));
            if migrating {
                debug!("User dir {} is being migrated", name);
            }
            !migrating
        })
        .collect()
}

/// Real (non-symlink) subdirectories with UTF-8 names.
fn subdirs(dir: &Path) -> Vec<(String, PathBuf)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Cannot scan {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_real_dir(&path) {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => out.push((name, path)),
            Err(name) => warn!("Skipping non UTF-8 directory {:?}", name),
        }
    }
    out
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).map_or(false, |m| m.is_dir())
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).map_or(true, |mut entries| entries.next().is_none())
}

fn lexists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn report_path(report_dir: &Path, key: &MapKey) -> Option<PathBuf> {
    match key {
        MapKey::Anonym { user, dir } => Some(report_dir.join(user).join(ANONYM_DIR).join(dir)),
        MapKey::Public { .. } => None,
    }
}

/// Tells a user under which name their share is exported.
///
/// Writes `<report_dir>/<user>/anonym/<dir>` containing the export name.
/// Public entries have no report. A symlinked report folder is left alone.
pub fn write_report(report_dir: &Path, key: &MapKey, export: &str) -> Result<()> {
    let Some(path) = report_path(report_dir, key) else {
        return Ok(());
    };
    let user_dir = report_dir.join(key.user());
    if !lexists(&user_dir) {
        DirBuilder::new()
            .mode(USER_REPORT_DIR_MODE)
            .create(&user_dir)
            .with_context(|| format!("creating {}", user_dir.display()))?;
    }
    let module_dir = user_dir.join(ANONYM_DIR);
    if !lexists(&module_dir) {
        DirBuilder::new()
            .mode(MODULE_REPORT_DIR_MODE)
            .create(&module_dir)
            .with_context(|| format!("creating {}", module_dir.display()))?;
    }
    if !is_real_dir(&module_dir) {
        warn!("Not writing report into {}", module_dir.display());
        return Ok(());
    }
    fs::write(&path, format!("{}\n", export))
        .with_context(|| format!("writing report {}", path.display()))
}

/// Removes the report file of `key`, if it is a regular file.
pub fn remove_report(report_dir: &Path, key: &MapKey) -> Result<()> {
    let Some(path) = report_path(report_dir, key) else {
        return Ok(());
    };
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_file() => {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))
        }
        _ => Ok(()),
    }
}
