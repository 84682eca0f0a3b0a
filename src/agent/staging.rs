//! Durable Module Staging
//!
//! Each module owns up to three slots on persistent storage:
//!
//! - `active.bin`  - the binary the current session loaded code from
//! - `staging.bin` - a new binary being prepared
//! - `backup.bin`  - the previous active, kept until the update is finalized
//!
//! Commit publishes staging as the new active with a `.commit` journal
//! marker so a power failure always leaves a state that [`StagingStore::recover`]
//! can classify as either pre-commit or post-commit. The marker is written
//! durably after staging is in place and before any rename; recovery either
//! completes the commit or discards the staging slot, never half of each.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::manifest::valid_module_name;

const COMMIT_MARKER: &str = ".commit";

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("staging io error: {0}")]
    Io(#[from] io::Error),
    #[error("module {module}: staging slot already open")]
    Busy { module: String },
    #[error("module {module}: no staging slot to commit")]
    NoStaging { module: String },
    #[error("module {module}: no backup to roll back to")]
    NoBackup { module: String },
    #[error("module {module}: slot {slot} is missing")]
    MissingSlot { module: String, slot: Slot },
    #[error("invalid module name {module:?}")]
    InvalidName { module: String },
}

/// The three durable slots of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Active,
    Staging,
    Backup,
}

impl Slot {
    fn file_name(self) -> &'static str {
        match self {
            Slot::Active => "active.bin",
            Slot::Staging => "staging.bin",
            Slot::Backup => "backup.bin",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Per-module result of boot-time recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredModule {
    pub name: String,
    /// An interrupted commit was completed during recovery; the active slot
    /// now holds bytes the previous session never got to load.
    pub completed_commit: bool,
    /// The module has an active slot and can be loaded.
    pub has_active: bool,
}

/// Write handle for a staging slot; obtained from [`StagingStore::open_staging`]
/// and consumed by [`StagingStore::finalize_staging`].
pub struct StagingWriter {
    module: String,
    file: File,
    written: u64,
}

impl StagingWriter {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Write for StagingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Durable per-module slot store rooted at `<storage_root>/modules`.
///
/// The store exclusively owns the on-disk layout; nothing else reads or
/// writes under its root.
pub struct StagingStore {
    root: PathBuf,
    open_staging: HashSet<String>,
}

impl StagingStore {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            root: storage_root.into().join("modules"),
            open_staging: HashSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn module_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn slot_path(&self, name: &str, slot: Slot) -> PathBuf {
        self.module_dir(name).join(slot.file_name())
    }

    fn marker_path(&self, name: &str) -> PathBuf {
        self.module_dir(name).join(COMMIT_MARKER)
    }

    fn check_name(name: &str) -> Result<(), StagingError> {
        if valid_module_name(name) {
            Ok(())
        } else {
            Err(StagingError::InvalidName {
                module: name.to_string(),
            })
        }
    }

    /// Whether the slot exists on disk.
    pub fn has(&self, name: &str, slot: Slot) -> bool {
        self.slot_path(name, slot).exists()
    }

    /// Read a slot into memory.
    pub fn read(&self, name: &str, slot: Slot) -> Result<Vec<u8>, StagingError> {
        Self::check_name(name)?;
        match fs::read(self.slot_path(name, slot)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StagingError::MissingSlot {
                module: name.to_string(),
                slot,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Open (and truncate) the staging slot for writing.
    ///
    /// At most one staging write may be open per module; a second open
    /// fails with `Busy` until the first is finalized or discarded.
    pub fn open_staging(&mut self, name: &str) -> Result<StagingWriter, StagingError> {
        Self::check_name(name)?;
        if self.open_staging.contains(name) {
            return Err(StagingError::Busy {
                module: name.to_string(),
            });
        }
        fs::create_dir_all(self.module_dir(name))?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.slot_path(name, Slot::Staging))?;
        self.open_staging.insert(name.to_string());
        Ok(StagingWriter {
            module: name.to_string(),
            file,
            written: 0,
        })
    }

    /// Flush and durably persist the staging bytes.
    pub fn finalize_staging(&mut self, mut writer: StagingWriter) -> Result<(), StagingError> {
        writer.file.flush()?;
        writer.file.sync_all()?;
        let name = writer.module.clone();
        drop(writer);
        sync_dir(&self.module_dir(&name))?;
        self.open_staging.remove(&name);
        Ok(())
    }

    /// Drop the staging slot (and any open-write claim) for a module.
    pub fn discard_staging(&mut self, name: &str) -> Result<(), StagingError> {
        Self::check_name(name)?;
        self.open_staging.remove(name);
        remove_if_present(&self.slot_path(name, Slot::Staging))?;
        Ok(())
    }

    /// Publish staging as the new active, demoting the current active to
    /// backup.
    ///
    /// The `.commit` marker makes the sequence replayable: once it is on
    /// disk, recovery will finish the renames after any crash; before it is
    /// on disk, recovery discards the staging slot. There is no crash point
    /// from which both old and new bytes are lost.
    pub fn commit(&mut self, name: &str) -> Result<(), StagingError> {
        Self::check_name(name)?;
        let staging = self.slot_path(name, Slot::Staging);
        if !staging.exists() {
            return Err(StagingError::NoStaging {
                module: name.to_string(),
            });
        }

        let dir = self.module_dir(name);
        let marker = self.marker_path(name);
        let mut file = File::create(&marker)?;
        file.write_all(b"commit\n")?;
        file.sync_all()?;
        drop(file);
        sync_dir(&dir)?;

        let active = self.slot_path(name, Slot::Active);
        if active.exists() {
            fs::rename(&active, self.slot_path(name, Slot::Backup))?;
        }
        fs::rename(&staging, &active)?;
        fs::remove_file(&marker)?;
        sync_dir(&dir)?;

        debug!(module = name, "commit published staging as active");
        Ok(())
    }

    /// Restore the backup as the active slot, discarding the current active.
    pub fn rollback(&mut self, name: &str) -> Result<(), StagingError> {
        Self::check_name(name)?;
        let backup = self.slot_path(name, Slot::Backup);
        if !backup.exists() {
            return Err(StagingError::NoBackup {
                module: name.to_string(),
            });
        }
        fs::rename(&backup, self.slot_path(name, Slot::Active))?;
        sync_dir(&self.module_dir(name))?;
        debug!(module = name, "rollback restored backup as active");
        Ok(())
    }

    /// Delete the backup slot after the post-commit grace window.
    pub fn finalize_success(&mut self, name: &str) -> Result<(), StagingError> {
        Self::check_name(name)?;
        remove_if_present(&self.slot_path(name, Slot::Backup))?;
        sync_dir(&self.module_dir(name))?;
        Ok(())
    }

    /// Boot-time recovery: classify every module directory as pre- or
    /// post-commit and repair it.
    ///
    /// - marker + staging present: the commit was interrupted; finish it.
    /// - marker without staging: the renames finished; drop the marker.
    /// - staging without marker: an unfinished download; discard it.
    /// - a backup is always left in place; an unfinalized commit may still
    ///   need it if the new active fails to load.
    pub fn recover(&mut self) -> Result<Vec<RecoveredModule>, StagingError> {
        self.open_staging.clear();
        fs::create_dir_all(&self.root)?;

        let mut recovered = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) if valid_module_name(&name) => name,
                other => {
                    warn!(dir = ?other, "skipping non-module directory in staging root");
                    continue;
                }
            };
            recovered.push(self.recover_module(&name)?);
        }
        recovered.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(recovered)
    }

    fn recover_module(&mut self, name: &str) -> Result<RecoveredModule, StagingError> {
        let dir = self.module_dir(name);
        let marker = self.marker_path(name);
        let staging = self.slot_path(name, Slot::Staging);
        let active = self.slot_path(name, Slot::Active);

        let mut completed_commit = false;
        if marker.exists() {
            if staging.exists() {
                if active.exists() {
                    fs::rename(&active, self.slot_path(name, Slot::Backup))?;
                }
                fs::rename(&staging, &active)?;
                completed_commit = true;
                debug!(module = name, "recovery completed interrupted commit");
            }
            fs::remove_file(&marker)?;
            sync_dir(&dir)?;
        } else if staging.exists() {
            fs::remove_file(&staging)?;
            sync_dir(&dir)?;
            debug!(module = name, "recovery discarded uncommitted staging");
        }

        Ok(RecoveredModule {
            name: name.to_string(),
            completed_commit,
            has_active: active.exists(),
        })
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Flush directory metadata so renames survive power loss.
fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
