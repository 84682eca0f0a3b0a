//! Module ABI
//!
//! Modules are independently compiled, position-independent blobs. The
//! stability boundary between them and the agent is a pair of C-layout
//! function-pointer tables, never a language-level trait object:
//!
//! - the agent hands every module a frozen [`SystemApi`] table at load time;
//! - the module's entry point (at offset 0 of the artifact) returns a
//!   [`ModuleInterface`] table describing its lifecycle and its
//!   driver-specific function table.
//!
//! Both tables are ABI-stable for the life of the device firmware.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};

/// Log severity passed through the [`SystemApi`] logging entry.
pub const API_LOG_DEBUG: i32 = 0;
pub const API_LOG_INFO: i32 = 1;
pub const API_LOG_WARN: i32 = 2;
pub const API_LOG_ERROR: i32 = 3;

/// Frozen table of host services handed to every module.
///
/// Read-only after process init; modules may call entries re-entrantly from
/// their `update` hook. All strings are NUL-terminated and borrowed.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SystemApi {
    // logging
    pub log_message: extern "C" fn(level: i32, tag: *const c_char, message: *const c_char),
    // time
    pub millis: extern "C" fn() -> u32,
    pub micros: extern "C" fn() -> u64,
    // sensor reads
    pub read_distance_sensor: extern "C" fn() -> f32,
    pub read_temperature_sensor: extern "C" fn() -> f32,
    // vehicle state
    pub is_vehicle_idle: extern "C" fn() -> bool,
    pub vehicle_speed: extern "C" fn() -> u32,
    pub is_ignition_on: extern "C" fn() -> bool,
    // per-module persistence
    pub save_module_data: extern "C" fn(key: *const c_char, data: *const u8, len: usize) -> bool,
    /// Returns the number of bytes written into `out`, or -1 if the key is
    /// unknown or the buffer is too small.
    pub load_module_data: extern "C" fn(key: *const c_char, out: *mut u8, cap: usize) -> isize,
    // network and identity
    pub is_network_connected: extern "C" fn() -> bool,
    pub device_id: extern "C" fn() -> *const c_char,
    // inter-module query
    pub module_version: extern "C" fn(name: *const c_char) -> *const c_char,
}

/// Table returned by a module's entry point.
///
/// `name`, `version` and `initialize` must be non-null; the loader rejects
/// the artifact otherwise. `functions` points at a driver-specific table
/// (for example [`SpeedGovernorVtbl`]) or is null.
#[repr(C)]
pub struct ModuleInterface {
    pub name: *const c_char,
    pub version: *const c_char,
    pub initialize: Option<extern "C" fn(api: *const SystemApi) -> bool>,
    pub deinitialize: Option<extern "C" fn()>,
    pub update: Option<extern "C" fn()>,
    pub functions: *const c_void,
}

/// The single exported entry point at offset 0 of every artifact.
pub type ModuleEntryFn = unsafe extern "C" fn(api: *const SystemApi) -> *const ModuleInterface;

impl ModuleInterface {
    /// Structural check performed right after the entry point returns.
    pub fn is_well_formed(&self) -> bool {
        !self.name.is_null() && !self.version.is_null() && self.initialize.is_some()
    }
}

/// Read a NUL-terminated UTF-8 string field out of a module table.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that outlives the
/// module's code region (the ABI requires the table's strings to be static
/// within the module).
pub unsafe fn table_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

impl SystemApi {
    /// A table whose entries all do nothing and report inert defaults.
    ///
    /// Hosts start from this and replace the entries their hardware
    /// actually backs, so adding a table field never breaks a host build.
    pub fn noop() -> SystemApi {
        SystemApi {
            log_message: noop_log,
            millis: noop_millis,
            micros: noop_micros,
            read_distance_sensor: noop_f32,
            read_temperature_sensor: noop_f32,
            is_vehicle_idle: noop_false,
            vehicle_speed: noop_u32,
            is_ignition_on: noop_false,
            save_module_data: noop_save,
            load_module_data: noop_load,
            is_network_connected: noop_false,
            device_id: noop_device_id,
            module_version: noop_module_version,
        }
    }
}

extern "C" fn noop_log(_level: i32, _tag: *const c_char, _message: *const c_char) {}

extern "C" fn noop_millis() -> u32 {
    0
}

extern "C" fn noop_micros() -> u64 {
    0
}

extern "C" fn noop_f32() -> f32 {
    0.0
}

extern "C" fn noop_false() -> bool {
    false
}

extern "C" fn noop_u32() -> u32 {
    0
}

extern "C" fn noop_save(_key: *const c_char, _data: *const u8, _len: usize) -> bool {
    false
}

extern "C" fn noop_load(_key: *const c_char, _out: *mut u8, _cap: usize) -> isize {
    -1
}

extern "C" fn noop_device_id() -> *const c_char {
    b"unknown\0".as_ptr() as *const c_char
}

extern "C" fn noop_module_version(_name: *const c_char) -> *const c_char {
    std::ptr::null()
}

/// Driver table exported by speed-governor modules.
#[repr(C)]
pub struct SpeedGovernorVtbl {
    pub get_speed_limit: extern "C" fn(current_speed: i32, road_conditions: i32) -> i32,
    pub set_speed_limit_override: extern "C" fn(new_limit: i32),
    pub is_speed_limiting_active: extern "C" fn() -> bool,
}

/// Driver table exported by distance-sensor modules.
#[repr(C)]
pub struct DistanceSensorVtbl {
    pub get_distance: extern "C" fn() -> f32,
    pub calibrate: extern "C" fn(),
    pub is_object_detected: extern "C" fn(threshold: f32) -> bool,
}
