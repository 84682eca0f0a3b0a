//! OTA agent daemon - reference host
//!
//! A small host around the agent library: loads the config, builds the
//! `SystemApi` table over a simulated vehicle (mock sensors, an idle window
//! that opens and closes), installs the tracing subscriber as the log sink,
//! and drives the orchestrator from a plain tick loop. A real integration
//! replaces this binary; the library never depends on it.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{debug, error, info, warn};

use ota_agent::agent::catalog::CatalogClient;
use ota_agent::agent::loader::interface::{SystemApi, API_LOG_ERROR, API_LOG_INFO, API_LOG_WARN};
use ota_agent::agent::manifest::valid_module_name;
use ota_agent::{AgentConfig, Event, Host, LogLevel, Status, UpdateOrchestrator};

#[derive(Parser)]
#[command(name = "agentd", about = "Modular OTA update agent")]
struct Args {
    /// Path to the agent configuration file.
    #[arg(long, default_value = "agent.config.json")]
    config: PathBuf,

    /// Write a template configuration file and exit.
    #[arg(long)]
    write_config: bool,

    /// Main-loop tick period in milliseconds.
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Treat the vehicle as always idle, so updates start immediately.
    #[arg(long)]
    always_idle: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if args.write_config {
        let template = AgentConfig::for_device(
            "https://ota.example.com/storage/ota-modules",
            "replace-with-bearer-token",
            "vehicle-0001",
        );
        if let Err(e) = template.save(&args.config) {
            error!("could not write {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
        info!("wrote template config to {}", args.config.display());
        return ExitCode::SUCCESS;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::load(&args.config)?;

    let data_dir = config.storage_root.join("module_data");
    std::fs::create_dir_all(&data_dir)?;
    let _ = START.set(Instant::now());
    let _ = DEVICE_ID.set(CString::new(config.device_id.clone())?);
    let _ = DATA_DIR.set(data_dir);

    let catalog = CatalogClient::new(&config)?;
    let mut orchestrator = UpdateOrchestrator::new(config, catalog, build_system_api())?;
    let mut host = VehicleSim::new(args.always_idle);

    info!("agent starting (tick every {}ms)", args.tick_ms);
    let tick = Duration::from_millis(args.tick_ms.max(1));
    let mut last_report = Instant::now();
    loop {
        VEHICLE_IDLE.store(host.idle(), Ordering::Relaxed);
        orchestrator.tick(&mut host);

        let now = Instant::now();
        if now.duration_since(last_report) >= Duration::from_secs(10) {
            last_report = now;
            let report = orchestrator.status_report(now);
            debug!(
                state = report.state,
                pending = report.pending_updates,
                modules = report.modules.len(),
                "agent status"
            );
        }
        std::thread::sleep(tick);
    }
}

// ----------------------------------------------------------------------
// Host implementation
// ----------------------------------------------------------------------

/// Simulated vehicle: idle windows open on a fixed cadence, an LED would
/// render status. Here both are log lines.
struct VehicleSim {
    start: Instant,
    always_idle: bool,
}

impl VehicleSim {
    fn new(always_idle: bool) -> Self {
        Self {
            start: Instant::now(),
            always_idle,
        }
    }

    /// The vehicle parks for 30 s out of every 60 s.
    fn idle(&self) -> bool {
        self.always_idle || self.start.elapsed().as_secs() % 60 >= 30
    }
}

impl Host for VehicleSim {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn safe_window(&self) -> bool {
        self.idle()
    }

    fn set_status(&mut self, status: Status) {
        // Stands in for the LED patterns of a real dashboard.
        info!(status = %status, "agent status changed");
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "agent", "{message}"),
            LogLevel::Info => info!(target: "agent", "{message}"),
            LogLevel::Warn => warn!(target: "agent", "{message}"),
            LogLevel::Error => error!(target: "agent", "{message}"),
        }
    }

    fn on_event(&mut self, event: &Event) {
        // Keep the version table the SystemApi query hands to modules.
        match event {
            Event::UpdateApplied { module, version } | Event::RolledBack {
                module,
                version: Some(version),
            } => set_module_version(module, &version.to_string()),
            Event::ReloadFailedAfterRollback { module }
            | Event::ModuleUnavailable { module, .. } => clear_module_version(module),
            _ => {}
        }
    }
}

// ----------------------------------------------------------------------
// SystemApi table
//
// The table entries are plain C functions, so the state they need lives in
// process-wide cells initialized once in `run` before any module loads.
// ----------------------------------------------------------------------

static START: OnceLock<Instant> = OnceLock::new();
static DEVICE_ID: OnceLock<CString> = OnceLock::new();
static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();
static VEHICLE_IDLE: AtomicBool = AtomicBool::new(false);
// Version strings are leaked on replacement so pointers already handed to
// modules stay valid for the life of the process.
static VERSIONS: Mutex<BTreeMap<String, &'static CStr>> = Mutex::new(BTreeMap::new());

fn build_system_api() -> SystemApi {
    let mut api = SystemApi::noop();
    api.log_message = api_log_message;
    api.millis = api_millis;
    api.micros = api_micros;
    api.read_distance_sensor = api_read_distance;
    api.read_temperature_sensor = api_read_temperature;
    api.is_vehicle_idle = api_is_vehicle_idle;
    api.vehicle_speed = api_vehicle_speed;
    api.is_ignition_on = api_is_ignition_on;
    api.save_module_data = api_save_module_data;
    api.load_module_data = api_load_module_data;
    api.is_network_connected = api_is_network_connected;
    api.device_id = api_device_id;
    api.module_version = api_module_version;
    api
}

fn set_module_version(module: &str, version: &str) {
    if let (Ok(mut map), Ok(cstr)) = (VERSIONS.lock(), CString::new(version)) {
        map.insert(module.to_string(), &*Box::leak(cstr.into_boxed_c_str()));
    }
}

fn clear_module_version(module: &str) {
    if let Ok(mut map) = VERSIONS.lock() {
        map.remove(module);
    }
}

fn elapsed() -> Duration {
    START.get().map(|s| s.elapsed()).unwrap_or_default()
}

/// # Safety contract for the trampolines
///
/// Modules pass NUL-terminated strings they own; each trampoline checks for
/// null before touching a pointer and copies out of module memory before
/// the call returns.
extern "C" fn api_log_message(level: i32, tag: *const c_char, message: *const c_char) {
    let read = |ptr: *const c_char| -> String {
        if ptr.is_null() {
            return String::new();
        }
        // SAFETY: non-null, NUL-terminated per the ABI contract above.
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    };
    let tag = read(tag);
    let message = read(message);
    match level {
        API_LOG_ERROR => error!(target: "module", "{tag}: {message}"),
        API_LOG_WARN => warn!(target: "module", "{tag}: {message}"),
        API_LOG_INFO => info!(target: "module", "{tag}: {message}"),
        _ => debug!(target: "module", "{tag}: {message}"),
    }
}

extern "C" fn api_millis() -> u32 {
    elapsed().as_millis() as u32
}

extern "C" fn api_micros() -> u64 {
    elapsed().as_micros() as u64
}

extern "C" fn api_read_distance() -> f32 {
    // Mock ultrasonic sensor: drifts around 50 cm.
    50.0 + 10.0 * (api_millis() as f32 / 5000.0).sin()
}

extern "C" fn api_read_temperature() -> f32 {
    25.0 + 5.0 * (api_millis() as f32 / 8000.0).cos()
}

extern "C" fn api_is_vehicle_idle() -> bool {
    VEHICLE_IDLE.load(Ordering::Relaxed)
}

extern "C" fn api_vehicle_speed() -> u32 {
    if api_is_vehicle_idle() {
        0
    } else {
        65
    }
}

extern "C" fn api_is_ignition_on() -> bool {
    true
}

fn data_key(key: *const c_char) -> Option<PathBuf> {
    if key.is_null() {
        return None;
    }
    // SAFETY: non-null, NUL-terminated per the ABI contract.
    let key = unsafe { CStr::from_ptr(key) }.to_str().ok()?;
    // Same grammar as module names, so a key can never escape the data dir.
    if !valid_module_name(key) {
        return None;
    }
    Some(DATA_DIR.get()?.join(key))
}

extern "C" fn api_save_module_data(key: *const c_char, data: *const u8, len: usize) -> bool {
    let Some(path) = data_key(key) else {
        return false;
    };
    if data.is_null() {
        return false;
    }
    // SAFETY: the module promises `data` points at `len` readable bytes.
    let bytes = unsafe { std::slice::from_raw_parts(data, len) };
    std::fs::write(path, bytes).is_ok()
}

extern "C" fn api_load_module_data(key: *const c_char, out: *mut u8, cap: usize) -> isize {
    let Some(path) = data_key(key) else {
        return -1;
    };
    if out.is_null() {
        return -1;
    }
    let Ok(bytes) = std::fs::read(path) else {
        return -1;
    };
    if bytes.len() > cap {
        return -1;
    }
    // SAFETY: the module promises `out` points at `cap` writable bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
    }
    bytes.len() as isize
}

extern "C" fn api_is_network_connected() -> bool {
    true
}

extern "C" fn api_device_id() -> *const c_char {
    DEVICE_ID
        .get()
        .map(|id| id.as_ptr())
        .unwrap_or(b"unknown\0".as_ptr() as *const c_char)
}

extern "C" fn api_module_version(name: *const c_char) -> *const c_char {
    if name.is_null() {
        return std::ptr::null();
    }
    // SAFETY: non-null, NUL-terminated per the ABI contract.
    let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
        return std::ptr::null();
    };
    match VERSIONS.lock() {
        Ok(map) => map.get(name).map(|v| v.as_ptr()).unwrap_or(std::ptr::null()),
        Err(_) => std::ptr::null(),
    }
}
