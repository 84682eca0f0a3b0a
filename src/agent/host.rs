//! Host Interface
//!
//! The surrounding application supplies the clock, the safe-window predicate
//! and the diagnostic sinks. The orchestrator is the only component that
//! talks to the host; it reports every state transition and every error
//! through `set_status` / `log`, and the host decides how to render them
//! (LED patterns, serial console, ...).

use std::fmt;
use std::time::Instant;

use super::version::SemVer;

/// User-visible agent status, rendered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    CheckingUpdates,
    UpdateAvailable,
    Downloading,
    /// Post-commit apply phase: the point of no return, kept visually
    /// distinct so an operator knows not to cut power on purpose.
    DownloadingFast,
    Applying,
    Success,
    Failure,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Idle => "idle",
            Status::CheckingUpdates => "checking-updates",
            Status::UpdateAvailable => "update-available",
            Status::Downloading => "downloading",
            Status::DownloadingFast => "downloading-fast",
            Status::Applying => "applying",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// Severity for one-line diagnostics handed to the host's log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Notable orchestrator outcomes, delivered to the host alongside status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A manifest fetch or parse failed; the check was abandoned.
    CheckFailed { reason: String },
    /// A pending update was queued after a manifest diff.
    UpdateQueued {
        module: String,
        from: Option<SemVer>,
        to: SemVer,
    },
    /// A module was reloaded at a new version.
    UpdateApplied { module: String, version: SemVer },
    /// An update was abandoned before or during apply.
    UpdateFailed { module: String, reason: String },
    /// An in-flight update was cancelled because the safe window closed.
    UpdateCancelled { module: String },
    /// A post-commit reload failed and the previous version was restored.
    RolledBack {
        module: String,
        version: Option<SemVer>,
    },
    /// Rollback itself failed; the module is left unloaded.
    ReloadFailedAfterRollback { module: String },
    /// A module's active slot could not be loaded at boot.
    ModuleUnavailable { module: String, reason: String },
}

/// Everything the agent needs from the surrounding application.
///
/// The host owns the main loop and calls [`UpdateOrchestrator::tick`]
/// (see `orchestrator`) once per iteration, passing itself in. No method
/// may re-enter the orchestrator.
pub trait Host {
    /// Monotonic clock.
    fn now(&self) -> Instant;

    /// True while the device tolerates a module unload/reload (e.g. the
    /// vehicle is idle).
    fn safe_window(&self) -> bool;

    /// Render the agent status. Called only on changes.
    fn set_status(&mut self, status: Status);

    /// One-line diagnostic sink.
    fn log(&mut self, level: LogLevel, message: &str);

    /// Whether a critical-priority update may start outside the safe window.
    fn allow_critical_bypass(&self) -> bool {
        false
    }

    /// Notification of a notable outcome. Default: ignore.
    fn on_event(&mut self, _event: &Event) {}
}
