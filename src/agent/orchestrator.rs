//! Update Orchestrator
//!
//! The top-level state machine. Once per host main-loop iteration the host
//! calls [`UpdateOrchestrator::tick`]; the orchestrator advances one state
//! step, then runs every loaded module's `update` hook. Checks are periodic;
//! an update only starts inside the host's safe window; each update walks
//! download -> verify -> commit -> reload with rollback on any post-commit
//! failure. At most one update is in flight at a time, and all errors are
//! translated here - components below return typed errors and never touch
//! the host.

use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::catalog::Catalog;
use super::config::{AgentConfig, ConfigError};
use super::host::{Event, Host, LogLevel, Status};
use super::loader::interface::SystemApi;
use super::loader::ModuleLoader;
use super::manifest::{artifact_path, Manifest, Priority};
use super::staging::{Slot, StagingError, StagingStore};
use super::verify::{Verifier, VerifyError};
use super::version::{is_upgrade, SemVer, VersionTracker};

/// Retry backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("verifier setup failed: {0}")]
    Verifier(#[from] VerifyError),
}

/// A queued module update, produced by the manifest diff and consumed by
/// the apply sequence.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub module: String,
    pub from: Option<SemVer>,
    pub to: SemVer,
    pub digest: [u8; 32],
    pub size: u64,
    pub signature: Option<Vec<u8>>,
    pub priority: Priority,
}

#[derive(Debug)]
enum State {
    Init,
    Normal,
    Checking,
    UpdateAvailable,
    Downloading {
        /// Retries already consumed (not counting the initial attempt).
        retries: u32,
        retry_at: Option<Instant>,
    },
    Verifying,
    Applying,
    Rolling,
    ApplySuccess {
        module: String,
        since: Instant,
    },
    ApplyFailure {
        since: Instant,
    },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Init => "init",
            State::Normal => "normal-operation",
            State::Checking => "checking-updates",
            State::UpdateAvailable => "update-available",
            State::Downloading { .. } => "downloading",
            State::Verifying => "verifying",
            State::Applying => "applying",
            State::Rolling => "rolling-back",
            State::ApplySuccess { .. } => "apply-success",
            State::ApplyFailure { .. } => "apply-failure",
        }
    }
}

/// Host-queryable snapshot of the agent.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: &'static str,
    pub update_in_progress: bool,
    pub pending_updates: usize,
    pub last_check_age_secs: Option<u64>,
    pub modules: Vec<ModuleReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleReport {
    pub name: String,
    pub version: Option<String>,
}

/// The update orchestrator; owns the catalog client, verifier, staging
/// store, module loader and version tracker.
pub struct UpdateOrchestrator<C: Catalog> {
    config: AgentConfig,
    catalog: C,
    verifier: Verifier,
    staging: StagingStore,
    loader: ModuleLoader,
    tracker: VersionTracker,

    state: State,
    pending: Vec<PendingUpdate>,
    current: Option<PendingUpdate>,
    verified_image: Option<Vec<u8>>,
    last_check: Option<Instant>,
    unsafe_since: Option<Instant>,
    last_status: Option<Status>,
}

impl<C: Catalog> UpdateOrchestrator<C> {
    /// Build an orchestrator. Fails fast on invalid configuration or an
    /// unparseable signing key; nothing touches the disk until the first
    /// tick runs recovery.
    pub fn new(config: AgentConfig, catalog: C, api: SystemApi) -> Result<Self, InitError> {
        config.validate()?;
        let verifier = Verifier::new(
            config.max_artifact_size,
            config.signature_required,
            config.signing_public_key_pem.as_deref(),
        )?;
        let staging = StagingStore::new(&config.storage_root);
        let loader = ModuleLoader::new(api, config.max_modules);
        Ok(Self {
            config,
            catalog,
            verifier,
            staging,
            loader,
            tracker: VersionTracker::new(),
            state: State::Init,
            pending: Vec::new(),
            current: None,
            verified_image: None,
            last_check: None,
            unsafe_since: None,
            last_status: None,
        })
    }

    /// Advance the state machine one step, then run every active module's
    /// `update` hook. Must not be re-entered from any host callback.
    pub fn tick(&mut self, host: &mut dyn Host) {
        let now = host.now();
        match self.state {
            State::Init => self.step_init(host, now),
            State::Normal => self.step_normal(host, now),
            State::Checking => self.step_checking(host, now),
            State::UpdateAvailable => self.step_update_available(host, now),
            State::Downloading { .. } => self.step_downloading(host, now),
            State::Verifying => self.step_verifying(host, now),
            State::Applying => self.step_applying(host, now),
            State::Rolling => self.step_rolling(host, now),
            State::ApplySuccess { .. } => self.step_apply_success(host, now),
            State::ApplyFailure { .. } => self.step_apply_failure(host, now),
        }
        self.loader.tick();
    }

    // ------------------------------------------------------------------
    // host queries
    // ------------------------------------------------------------------

    /// The tracked version of a module, if it is loaded with a valid one.
    pub fn module_version(&self, name: &str) -> Option<SemVer> {
        self.tracker.get(name)
    }

    /// The module registry, for calling into module function tables.
    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn update_in_progress(&self) -> bool {
        matches!(
            self.state,
            State::Downloading { .. } | State::Verifying | State::Applying | State::Rolling
        )
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn status_report(&self, now: Instant) -> StatusReport {
        StatusReport {
            state: self.state.name(),
            update_in_progress: self.update_in_progress(),
            pending_updates: self.pending.len() + usize::from(self.current.is_some()),
            last_check_age_secs: self.last_check.map(|t| now.duration_since(t).as_secs()),
            modules: self
                .tracker
                .iter()
                .map(|(name, version)| ModuleReport {
                    name: name.to_string(),
                    version: version.map(|v| v.to_string()),
                })
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // state steps
    // ------------------------------------------------------------------

    fn step_init(&mut self, host: &mut dyn Host, now: Instant) {
        let recovered = match self.staging.recover() {
            Ok(recovered) => recovered,
            Err(e) => {
                host.log(LogLevel::Error, &format!("staging recovery failed: {e}"));
                self.set_status(host, Status::Error);
                self.state = State::Normal;
                return;
            }
        };

        let mut completed = Vec::new();
        for module in &recovered {
            if module.has_active {
                self.boot_module(host, &module.name);
            }
            if module.completed_commit && self.loader.contains(&module.name) {
                completed.push(module.name.clone());
            }
        }
        host.log(
            LogLevel::Info,
            &format!("init: {} module(s) recovered", recovered.len()),
        );

        // A commit replayed during recovery gets the usual success hold and
        // keeps its backup until the grace window passes.
        if let Some(last) = completed.pop() {
            for name in completed {
                if let Err(e) = self.staging.finalize_success(&name) {
                    host.log(LogLevel::Warn, &format!("finalize {name} failed: {e}"));
                }
            }
            self.set_status(host, Status::Success);
            self.state = State::ApplySuccess {
                module: last,
                since: now,
            };
        } else {
            self.set_status(host, Status::Idle);
            self.state = State::Normal;
        }
    }

    fn step_normal(&mut self, host: &mut dyn Host, now: Instant) {
        let due = match self.last_check {
            Some(t) => now.duration_since(t) >= self.config.check_interval(),
            None => true,
        };
        if due {
            host.log(LogLevel::Info, "checking for updates");
            self.set_status(host, Status::CheckingUpdates);
            self.state = State::Checking;
        }
    }

    fn step_checking(&mut self, host: &mut dyn Host, now: Instant) {
        self.last_check = Some(now);

        let manifest = match self
            .catalog
            .fetch_manifest()
            .map_err(|e| e.to_string())
            .and_then(|bytes| Manifest::parse(&bytes).map_err(|e| e.to_string()))
        {
            Ok(manifest) => manifest,
            Err(reason) => {
                self.emit(host, Event::CheckFailed { reason });
                self.set_status(host, Status::Idle);
                self.state = State::Normal;
                return;
            }
        };

        self.pending.clear();
        for (name, entry) in &manifest.modules {
            // Untracked modules install from the 0.0.0 baseline; a tracked
            // module with an unparseable version accepts any valid one.
            let current = if self.tracker.is_tracked(name) {
                self.tracker.get(name)
            } else {
                Some(SemVer::BASELINE)
            };
            if !is_upgrade(current, entry.latest_version) {
                continue;
            }
            debug!(
                module = name.as_str(),
                to = %entry.latest_version,
                "manifest offers upgrade"
            );
            self.pending.push(PendingUpdate {
                module: name.clone(),
                from: self.tracker.get(name),
                to: entry.latest_version,
                digest: entry.sha256,
                size: entry.file_size,
                signature: entry.signature.clone(),
                priority: entry.priority,
            });
        }
        self.pending
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.module.cmp(&b.module)));

        if self.pending.is_empty() {
            host.log(LogLevel::Info, "no updates available");
            self.set_status(host, Status::Idle);
            self.state = State::Normal;
        } else {
            for update in &self.pending {
                let event = Event::UpdateQueued {
                    module: update.module.clone(),
                    from: update.from,
                    to: update.to,
                };
                host.log(LogLevel::Info, &describe(&event));
                host.on_event(&event);
            }
            self.set_status(host, Status::UpdateAvailable);
            self.state = State::UpdateAvailable;
        }
    }

    fn step_update_available(&mut self, host: &mut dyn Host, now: Instant) {
        let Some(next) = self.pending.first() else {
            self.set_status(host, Status::Idle);
            self.state = State::Normal;
            return;
        };

        let gated_open = host.safe_window()
            || (next.priority == Priority::Critical && host.allow_critical_bypass());
        if !gated_open {
            return;
        }

        let update = self.pending.remove(0);

        // Fail fast without touching the network: a signature-required
        // deployment refuses unsigned manifest entries outright.
        if self.verifier.signature_required() && update.signature.is_none() {
            self.fail_update(host, now, update, "signature required but missing");
            return;
        }

        host.log(
            LogLevel::Info,
            &format!(
                "starting update of {} to v{} ({:?} priority)",
                update.module, update.to, update.priority
            ),
        );
        self.current = Some(update);
        self.unsafe_since = None;
        self.set_status(host, Status::Downloading);
        self.state = State::Downloading {
            retries: 0,
            retry_at: None,
        };
    }

    fn step_downloading(&mut self, host: &mut dyn Host, now: Instant) {
        let Some(update) = self.current.clone() else {
            self.state = State::Normal;
            return;
        };
        if self.cancellation_due(host, now, &update) {
            self.cancel_current(host);
            return;
        }
        let (retries, retry_at) = match self.state {
            State::Downloading { retries, retry_at } => (retries, retry_at),
            _ => return,
        };
        if let Some(t) = retry_at {
            if now < t {
                return;
            }
        }

        let path = artifact_path(&update.module, update.to);
        match self.catalog.fetch_artifact(&path) {
            Ok(bytes) => {
                if bytes.len() as u64 != update.size {
                    host.log(
                        LogLevel::Warn,
                        &format!(
                            "{}: artifact is {} bytes, manifest said {}",
                            update.module,
                            bytes.len(),
                            update.size
                        ),
                    );
                }
                match self.stage_bytes(&update.module, &bytes) {
                    Ok(()) => {
                        host.log(
                            LogLevel::Info,
                            &format!("{}: downloaded {} bytes", update.module, bytes.len()),
                        );
                        self.state = State::Verifying;
                    }
                    Err(e) => {
                        self.fail_update(host, now, update, &format!("staging failed: {e}"));
                    }
                }
            }
            Err(e) if e.is_retryable() && retries < self.config.download_retries => {
                let retries = retries + 1;
                let delay = backoff_delay(retries);
                host.log(
                    LogLevel::Warn,
                    &format!(
                        "{}: download failed ({e}); retry {}/{} in {}s",
                        update.module,
                        retries,
                        self.config.download_retries,
                        delay.as_secs()
                    ),
                );
                self.state = State::Downloading {
                    retries,
                    retry_at: Some(now + delay),
                };
            }
            Err(e) => {
                self.fail_update(host, now, update, &format!("download failed: {e}"));
            }
        }
    }

    fn step_verifying(&mut self, host: &mut dyn Host, now: Instant) {
        let Some(update) = self.current.clone() else {
            self.state = State::Normal;
            return;
        };
        if self.cancellation_due(host, now, &update) {
            self.cancel_current(host);
            return;
        }

        let bytes = match self.staging.read(&update.module, Slot::Staging) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail_update(host, now, update, &format!("staging read failed: {e}"));
                return;
            }
        };
        match self
            .verifier
            .verify(&bytes, &update.digest, update.signature.as_deref())
        {
            Ok(()) => {
                host.log(
                    LogLevel::Info,
                    &format!("{}: artifact verified against manifest", update.module),
                );
                self.verified_image = Some(bytes);
                self.set_status(host, Status::Applying);
                self.state = State::Applying;
            }
            Err(e) => {
                let _ = self.staging.discard_staging(&update.module);
                self.fail_update(host, now, update, &format!("verification failed: {e}"));
            }
        }
    }

    fn step_applying(&mut self, host: &mut dyn Host, now: Instant) {
        let Some(update) = self.current.clone() else {
            self.state = State::Normal;
            return;
        };

        // Point of no return: from the commit on, the update either
        // completes or rolls back, regardless of the safe window.
        if let Err(e) = self.staging.commit(&update.module) {
            let _ = self.staging.discard_staging(&update.module);
            self.fail_update(host, now, update, &format!("commit failed: {e}"));
            return;
        }
        self.set_status(host, Status::DownloadingFast);

        let image = match self.verified_image.take() {
            Some(image) => image,
            // Defensive fallback; the committed active is byte-equal to the
            // image that was just verified.
            None => match self.staging.read(&update.module, Slot::Active) {
                Ok(image) => image,
                Err(e) => {
                    host.log(LogLevel::Error, &format!("{}: {e}", update.module));
                    self.state = State::Rolling;
                    return;
                }
            },
        };

        match self.loader.reload(&update.module, &image) {
            Ok(version) => {
                self.tracker.set(&update.module, version.semver);
                let event = Event::UpdateApplied {
                    module: update.module.clone(),
                    version: version.semver.unwrap_or(update.to),
                };
                host.log(LogLevel::Info, &describe(&event));
                host.on_event(&event);
                self.set_status(host, Status::Success);
                self.state = State::ApplySuccess {
                    module: update.module.clone(),
                    since: now,
                };
                self.current = None;
            }
            Err(e) => {
                host.log(
                    LogLevel::Error,
                    &format!("{}: reload after commit failed: {e}", update.module),
                );
                self.state = State::Rolling;
            }
        }
    }

    fn step_rolling(&mut self, host: &mut dyn Host, now: Instant) {
        let Some(update) = self.current.take() else {
            self.state = State::ApplyFailure { since: now };
            return;
        };
        let module = update.module.clone();

        match self.staging.rollback(&module) {
            Ok(()) => match self
                .staging
                .read(&module, Slot::Active)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    self.loader
                        .reload(&module, &bytes)
                        .map_err(|e| e.to_string())
                }) {
                Ok(version) => {
                    self.tracker.set(&module, version.semver);
                    let event = Event::RolledBack {
                        module: module.clone(),
                        version: version.semver,
                    };
                    host.log(LogLevel::Warn, &describe(&event));
                    host.on_event(&event);
                }
                Err(reason) => {
                    host.log(
                        LogLevel::Error,
                        &format!("{module}: reload failed after rollback: {reason}"),
                    );
                    self.tracker.remove(&module);
                    let event = Event::ReloadFailedAfterRollback {
                        module: module.clone(),
                    };
                    host.on_event(&event);
                }
            },
            Err(e @ StagingError::NoBackup { .. }) => {
                // Fresh install: there is no previous version to restore.
                // The module stays unloaded and the next manifest check
                // treats it as a new install again.
                host.log(LogLevel::Warn, &format!("{module}: {e}"));
                self.tracker.remove(&module);
            }
            Err(e) => {
                host.log(LogLevel::Error, &format!("{module}: rollback failed: {e}"));
                self.tracker.remove(&module);
                let event = Event::ReloadFailedAfterRollback {
                    module: module.clone(),
                };
                host.on_event(&event);
            }
        }

        self.fail_update(host, now, update, "reload failed after commit");
    }

    fn step_apply_success(&mut self, host: &mut dyn Host, now: Instant) {
        let (module, since) = match &self.state {
            State::ApplySuccess { module, since } => (module.clone(), *since),
            _ => return,
        };
        if now.duration_since(since) < self.config.post_commit_grace() {
            return;
        }
        if let Err(e) = self.staging.finalize_success(&module) {
            host.log(LogLevel::Warn, &format!("{module}: finalize failed: {e}"));
        }
        host.log(
            LogLevel::Info,
            &format!("{module}: update finalized after grace window"),
        );
        self.leave_terminal_hold(host);
    }

    fn step_apply_failure(&mut self, host: &mut dyn Host, now: Instant) {
        let since = match &self.state {
            State::ApplyFailure { since } => *since,
            _ => return,
        };
        if now.duration_since(since) < self.config.failure_display() {
            return;
        }
        self.leave_terminal_hold(host);
    }

    /// After a success/failure hold, drain the next pending update or go
    /// back to normal operation.
    fn leave_terminal_hold(&mut self, host: &mut dyn Host) {
        if self.pending.is_empty() {
            self.set_status(host, Status::Idle);
            self.state = State::Normal;
        } else {
            self.set_status(host, Status::UpdateAvailable);
            self.state = State::UpdateAvailable;
        }
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    /// Load a module from its active slot at boot, falling back to an
    /// automatic rollback + reload if the active image will not come up.
    fn boot_module(&mut self, host: &mut dyn Host, name: &str) {
        let first_failure = match self
            .staging
            .read(name, Slot::Active)
            .map_err(|e| e.to_string())
            .and_then(|bytes| self.loader.load(name, &bytes).map_err(|e| e.to_string()))
        {
            Ok(version) => {
                self.tracker.set(name, version.semver);
                return;
            }
            Err(reason) => reason,
        };
        host.log(
            LogLevel::Warn,
            &format!("{name}: active image failed to load ({first_failure}); trying backup"),
        );

        if let Err(e) = self.staging.rollback(name) {
            host.log(LogLevel::Error, &format!("{name}: rollback failed: {e}"));
            self.emit_unavailable(host, name, &first_failure);
            return;
        }
        match self
            .staging
            .read(name, Slot::Active)
            .map_err(|e| e.to_string())
            .and_then(|bytes| self.loader.load(name, &bytes).map_err(|e| e.to_string()))
        {
            Ok(version) => {
                self.tracker.set(name, version.semver);
                let event = Event::RolledBack {
                    module: name.to_string(),
                    version: version.semver,
                };
                host.log(LogLevel::Warn, &describe(&event));
                host.on_event(&event);
            }
            Err(reason) => self.emit_unavailable(host, name, &reason),
        }
    }

    fn emit_unavailable(&mut self, host: &mut dyn Host, name: &str, reason: &str) {
        let event = Event::ModuleUnavailable {
            module: name.to_string(),
            reason: reason.to_string(),
        };
        host.log(LogLevel::Error, &describe(&event));
        host.on_event(&event);
    }

    /// Write artifact bytes into the staging slot and make them durable.
    fn stage_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<(), StagingError> {
        use std::io::Write;
        let mut writer = self.staging.open_staging(name)?;
        if let Err(e) = writer.write_all(bytes) {
            drop(writer);
            let _ = self.staging.discard_staging(name);
            return Err(e.into());
        }
        self.staging.finalize_staging(writer)
    }

    /// Track how long the safe window has been closed; once it exceeds the
    /// cancellation threshold, an uncommitted update is abandoned.
    fn cancellation_due(&mut self, host: &mut dyn Host, now: Instant, update: &PendingUpdate) -> bool {
        let window_open = host.safe_window()
            || (update.priority == Priority::Critical && host.allow_critical_bypass());
        if window_open {
            self.unsafe_since = None;
            return false;
        }
        let since = *self.unsafe_since.get_or_insert(now);
        now.duration_since(since) >= self.config.cancel_threshold()
    }

    fn cancel_current(&mut self, host: &mut dyn Host) {
        let Some(update) = self.current.take() else {
            return;
        };
        let _ = self.staging.discard_staging(&update.module);
        let event = Event::UpdateCancelled {
            module: update.module.clone(),
        };
        host.log(LogLevel::Warn, &describe(&event));
        host.on_event(&event);
        // The update stays pending; it resumes when the window reopens.
        self.pending.insert(0, update);
        self.unsafe_since = None;
        self.verified_image = None;
        self.set_status(host, Status::UpdateAvailable);
        self.state = State::UpdateAvailable;
    }

    fn fail_update(
        &mut self,
        host: &mut dyn Host,
        now: Instant,
        update: PendingUpdate,
        reason: &str,
    ) {
        let event = Event::UpdateFailed {
            module: update.module.clone(),
            reason: reason.to_string(),
        };
        host.log(LogLevel::Error, &describe(&event));
        host.on_event(&event);
        let _ = self.staging.discard_staging(&update.module);
        self.current = None;
        self.verified_image = None;
        self.unsafe_since = None;
        self.set_status(host, Status::Failure);
        self.state = State::ApplyFailure { since: now };
    }

    fn set_status(&mut self, host: &mut dyn Host, status: Status) {
        if self.last_status != Some(status) {
            self.last_status = Some(status);
            host.set_status(status);
        }
    }

    fn emit(&mut self, host: &mut dyn Host, event: Event) {
        let level = match &event {
            Event::CheckFailed { .. } | Event::UpdateFailed { .. } => LogLevel::Error,
            Event::UpdateCancelled { .. } | Event::RolledBack { .. } => LogLevel::Warn,
            Event::ReloadFailedAfterRollback { .. } | Event::ModuleUnavailable { .. } => {
                LogLevel::Error
            }
            _ => LogLevel::Info,
        };
        host.log(level, &describe(&event));
        host.on_event(&event);
    }
}

fn describe(event: &Event) -> String {
    match event {
        Event::CheckFailed { reason } => format!("update check failed: {reason}"),
        Event::UpdateQueued { module, from, to } => match from {
            Some(from) => format!("update queued: {module} v{from} -> v{to}"),
            None => format!("update queued: {module} (new install) -> v{to}"),
        },
        Event::UpdateApplied { module, version } => {
            format!("{module}: now running v{version}")
        }
        Event::UpdateFailed { module, reason } => format!("{module}: update failed: {reason}"),
        Event::UpdateCancelled { module } => {
            format!("{module}: update cancelled (safe window closed)")
        }
        Event::RolledBack { module, version } => match version {
            Some(version) => format!("{module}: rolled back to v{version}"),
            None => format!("{module}: rolled back"),
        },
        Event::ReloadFailedAfterRollback { module } => {
            format!("{module}: reload failed after rollback; module unloaded")
        }
        Event::ModuleUnavailable { module, reason } => {
            format!("{module}: unavailable at boot: {reason}")
        }
    }
}

/// Exponential backoff: 1, 2, 4, 8, ... seconds, capped at 30 s.
fn backoff_delay(retry: u32) -> Duration {
    let secs = 1u64
        .checked_shl(retry.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn test_pending_order_priority_then_name() {
        let mut pending: Vec<PendingUpdate> = ["sg", "ab", "ds"]
            .iter()
            .map(|name| PendingUpdate {
                module: name.to_string(),
                from: None,
                to: SemVer::new(1, 0, 0),
                digest: [0; 32],
                size: 0,
                signature: None,
                priority: if *name == "ds" {
                    Priority::Critical
                } else {
                    Priority::Normal
                },
            })
            .collect();
        pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.module.cmp(&b.module)));
        let order: Vec<&str> = pending.iter().map(|u| u.module.as_str()).collect();
        assert_eq!(order, ["ds", "ab", "sg"]);
    }
}
