//! Module Loader
//!
//! In-process registry of hot-swappable modules. `load` maps an artifact
//! into executable memory, resolves the entry point at offset 0, walks the
//! module lifecycle (`initialize` / `update` / `deinitialize`) and keeps at
//! most one loaded version per module name.
//!
//! Artifacts are raw position-independent code with no object-format
//! header; the build pipeline resolves all relocations, so the loader never
//! parses ELF. The first byte of the artifact is the first instruction of
//! the entry function.

pub mod exec;
pub mod interface;

use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::version::SemVer;
use exec::{ExecError, ExecRegion};
use interface::{table_str, ModuleEntryFn, ModuleInterface, SystemApi};

/// Anything shorter cannot hold an entry-point prologue.
pub const MIN_ARTIFACT_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("module {module} is already loaded")]
    AlreadyLoaded { module: String },
    #[error("module registry is full ({capacity} modules)")]
    CapacityExceeded { capacity: usize },
    #[error("executable memory error: {0}")]
    Memory(#[from] ExecError),
    #[error("module {module}: invalid artifact: {reason}")]
    InvalidArtifact {
        module: String,
        reason: &'static str,
    },
    #[error("module {module}: initialize reported failure")]
    InitFailed { module: String },
}

#[derive(Error, Debug)]
pub enum UnloadError {
    #[error("module {module} is not loaded")]
    NotFound { module: String },
}

/// Version reported by a freshly loaded module.
#[derive(Debug, Clone)]
pub struct LoadedVersion {
    /// Exactly what the module's table said.
    pub raw: String,
    /// Parsed triple, if the string is inside the version grammar.
    pub semver: Option<SemVer>,
}

/// Registry record for one loaded module.
///
/// Owns the module's code region; the interface table points into it, so
/// the record must outlive every call through the table. `deinitialize` is
/// the last call ever made into the region.
pub struct LoadedModule {
    name: String,
    version: LoadedVersion,
    region: ExecRegion,
    interface: *const ModuleInterface,
    loaded_at: Instant,
    active: bool,
}

impl LoadedModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &LoadedVersion {
        &self.version
    }

    pub fn code_size(&self) -> usize {
        self.region.len()
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The module's driver-specific function table, cast to `T`.
    ///
    /// # Safety
    ///
    /// `T` must be the `#[repr(C)]` table type this module actually exports
    /// (the module name is the only discriminator the ABI offers).
    pub unsafe fn functions<T>(&self) -> Option<&T> {
        let iface = &*self.interface;
        if iface.functions.is_null() {
            None
        } else {
            Some(&*iface.functions.cast::<T>())
        }
    }

    fn interface(&self) -> &ModuleInterface {
        // SAFETY: `interface` was validated non-null at load time and points
        // into `region`, which lives as long as `self`.
        unsafe { &*self.interface }
    }
}

/// The in-process module registry.
pub struct ModuleLoader {
    api: Box<SystemApi>,
    modules: Vec<LoadedModule>,
    capacity: usize,
}

impl ModuleLoader {
    /// Create a loader around a frozen [`SystemApi`] table.
    ///
    /// The table is boxed so its address stays stable for the life of the
    /// loader; modules keep the pointer they were initialized with.
    pub fn new(api: SystemApi, capacity: usize) -> Self {
        Self {
            api: Box::new(api),
            modules: Vec::new(),
            capacity,
        }
    }

    fn api_ptr(&self) -> *const SystemApi {
        &*self.api
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&LoadedModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedModule> {
        self.modules.iter()
    }

    /// Map `bytes` into executable memory, run the module lifecycle up to
    /// `initialize`, and register the module under `name`.
    pub fn load(&mut self, name: &str, bytes: &[u8]) -> Result<LoadedVersion, LoadError> {
        if self.contains(name) {
            return Err(LoadError::AlreadyLoaded {
                module: name.to_string(),
            });
        }
        if self.modules.len() >= self.capacity {
            return Err(LoadError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if bytes.len() < MIN_ARTIFACT_LEN {
            return Err(LoadError::InvalidArtifact {
                module: name.to_string(),
                reason: "artifact too small for an entry point",
            });
        }

        let mut region = ExecRegion::new(bytes.len())?;
        region.fill(bytes)?;
        region.seal()?;

        // SAFETY: the artifact contract puts a complete function with the C
        // calling convention at offset 0; the region was sealed read+execute
        // and the instruction cache synchronized before this first call.
        let entry: ModuleEntryFn = unsafe { std::mem::transmute(region.as_ptr()) };
        let iface_ptr = unsafe { entry(self.api_ptr()) };
        if iface_ptr.is_null() {
            return Err(LoadError::InvalidArtifact {
                module: name.to_string(),
                reason: "entry point returned null",
            });
        }

        // SAFETY: non-null, and the ABI requires the table to be static
        // within the module, so it lives as long as `region`.
        let iface = unsafe { &*iface_ptr };
        if !iface.is_well_formed() {
            return Err(LoadError::InvalidArtifact {
                module: name.to_string(),
                reason: "interface table has null required fields",
            });
        }

        // SAFETY: table strings were just checked non-null.
        let reported_name = unsafe { table_str(iface.name) }.ok_or(LoadError::InvalidArtifact {
            module: name.to_string(),
            reason: "module name is not valid UTF-8",
        })?;
        let version_raw =
            unsafe { table_str(iface.version) }.ok_or(LoadError::InvalidArtifact {
                module: name.to_string(),
                reason: "module version is not valid UTF-8",
            })?;
        if reported_name != name {
            warn!(
                requested = name,
                reported = reported_name,
                "module reports a different name than its artifact"
            );
        }

        let initialize = iface.initialize.ok_or(LoadError::InvalidArtifact {
            module: name.to_string(),
            reason: "initialize entry is null",
        })?;
        // The region is dropped (scrubbed and unmapped) on the error path.
        if !initialize(self.api_ptr()) {
            return Err(LoadError::InitFailed {
                module: name.to_string(),
            });
        }

        let version = LoadedVersion {
            raw: version_raw.to_string(),
            semver: SemVer::parse(version_raw),
        };
        info!(
            module = name,
            version = %version.raw,
            size = bytes.len(),
            "module loaded"
        );
        self.modules.push(LoadedModule {
            name: name.to_string(),
            version: version.clone(),
            region,
            interface: iface_ptr,
            loaded_at: Instant::now(),
            active: true,
        });
        Ok(version)
    }

    /// Deinitialize and unmap a module.
    pub fn unload(&mut self, name: &str) -> Result<(), UnloadError> {
        let index = self
            .modules
            .iter()
            .position(|m| m.name == name)
            .ok_or(UnloadError::NotFound {
                module: name.to_string(),
            })?;
        let mut module = self.modules.remove(index);
        module.active = false;
        if let Some(deinitialize) = module.interface().deinitialize {
            // Last call into the region; the drop below scrubs and unmaps it.
            deinitialize();
        }
        debug!(module = name, "module unloaded");
        drop(module);
        Ok(())
    }

    /// Unload (if present) then load. A failed load leaves the module
    /// absent; the orchestrator reacquires from backup when that matters.
    pub fn reload(&mut self, name: &str, bytes: &[u8]) -> Result<LoadedVersion, LoadError> {
        if self.contains(name) {
            // Only possible error is NotFound, excluded by the check above.
            let _ = self.unload(name);
        }
        self.load(name, bytes)
    }

    /// Run every active module's `update` hook once.
    pub fn tick(&mut self) {
        for module in &self.modules {
            if !module.active {
                continue;
            }
            if let Some(update) = module.interface().update {
                update();
            }
        }
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use std::os::raw::{c_char, c_void};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    static UPDATE_CALLS: AtomicU32 = AtomicU32::new(0);
    static DEINIT_CALLED: AtomicBool = AtomicBool::new(false);

    extern "C" fn init_ok(_api: *const SystemApi) -> bool {
        true
    }

    extern "C" fn init_fail(_api: *const SystemApi) -> bool {
        false
    }

    extern "C" fn deinit() {
        DEINIT_CALLED.store(true, Ordering::SeqCst);
    }

    extern "C" fn update() {
        UPDATE_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn leak_iface(
        name: &'static [u8],
        version: &'static [u8],
        initialize: extern "C" fn(*const SystemApi) -> bool,
    ) -> *const ModuleInterface {
        Box::leak(Box::new(ModuleInterface {
            name: name.as_ptr() as *const c_char,
            version: version.as_ptr() as *const c_char,
            initialize: Some(initialize),
            deinitialize: Some(deinit),
            update: Some(update),
            functions: std::ptr::null::<c_void>(),
        }))
    }

    /// A real x86-64 artifact: `mov rax, <iface>; ret`, padded past the
    /// minimum artifact length.
    fn artifact_for(iface: *const ModuleInterface) -> Vec<u8> {
        let mut code = vec![0x48, 0xb8];
        code.extend_from_slice(&(iface as u64).to_le_bytes());
        code.push(0xc3);
        code.resize(MIN_ARTIFACT_LEN, 0x90);
        code
    }

    fn loader(capacity: usize) -> ModuleLoader {
        ModuleLoader::new(SystemApi::noop(), capacity)
    }

    #[test]
    fn test_load_registers_and_reports_version() {
        let mut loader = loader(4);
        let iface = leak_iface(b"stub\0", b"1.0.0\0", init_ok);
        let version = loader.load("stub", &artifact_for(iface)).unwrap();
        assert_eq!(version.raw, "1.0.0");
        assert_eq!(version.semver, Some(SemVer::new(1, 0, 0)));
        assert!(loader.contains("stub"));
        assert_eq!(loader.len(), 1);
        assert_eq!(loader.get("stub").unwrap().code_size(), MIN_ARTIFACT_LEN);
    }

    #[test]
    fn test_duplicate_load_rejected() {
        let mut loader = loader(4);
        let iface = leak_iface(b"dup\0", b"1.0.0\0", init_ok);
        loader.load("dup", &artifact_for(iface)).unwrap();
        assert!(matches!(
            loader.load("dup", &artifact_for(iface)),
            Err(LoadError::AlreadyLoaded { .. })
        ));
    }

    #[test]
    fn test_capacity_enforced() {
        let mut loader = loader(1);
        let a = leak_iface(b"a\0", b"1.0.0\0", init_ok);
        let b = leak_iface(b"b\0", b"1.0.0\0", init_ok);
        loader.load("a", &artifact_for(a)).unwrap();
        assert!(matches!(
            loader.load("b", &artifact_for(b)),
            Err(LoadError::CapacityExceeded { capacity: 1 })
        ));
    }

    #[test]
    fn test_null_interface_rejected() {
        let mut loader = loader(4);
        assert!(matches!(
            loader.load("nil", &artifact_for(std::ptr::null())),
            Err(LoadError::InvalidArtifact { .. })
        ));
        assert!(!loader.contains("nil"));
    }

    #[test]
    fn test_tiny_artifact_rejected() {
        let mut loader = loader(4);
        assert!(matches!(
            loader.load("tiny", &[0xc3; 8]),
            Err(LoadError::InvalidArtifact { .. })
        ));
    }

    #[test]
    fn test_init_failure_frees_slot() {
        let mut loader = loader(4);
        let iface = leak_iface(b"bad\0", b"1.0.0\0", init_fail);
        assert!(matches!(
            loader.load("bad", &artifact_for(iface)),
            Err(LoadError::InitFailed { .. })
        ));
        assert!(!loader.contains("bad"));
        assert_eq!(loader.len(), 0);
    }

    #[test]
    fn test_tick_runs_update_hooks() {
        let mut loader = loader(4);
        let iface = leak_iface(b"ticker\0", b"1.0.0\0", init_ok);
        loader.load("ticker", &artifact_for(iface)).unwrap();
        let before = UPDATE_CALLS.load(Ordering::SeqCst);
        loader.tick();
        loader.tick();
        assert_eq!(UPDATE_CALLS.load(Ordering::SeqCst), before + 2);
    }

    #[test]
    fn test_unload_calls_deinitialize() {
        let mut loader = loader(4);
        let iface = leak_iface(b"gone\0", b"1.0.0\0", init_ok);
        loader.load("gone", &artifact_for(iface)).unwrap();
        DEINIT_CALLED.store(false, Ordering::SeqCst);
        loader.unload("gone").unwrap();
        assert!(DEINIT_CALLED.load(Ordering::SeqCst));
        assert!(!loader.contains("gone"));
        assert!(matches!(
            loader.unload("gone"),
            Err(UnloadError::NotFound { .. })
        ));
    }

    #[test]
    fn test_reload_swaps_version() {
        let mut loader = loader(4);
        let v1 = leak_iface(b"swap\0", b"1.0.0\0", init_ok);
        let v2 = leak_iface(b"swap\0", b"1.1.0\0", init_ok);
        loader.load("swap", &artifact_for(v1)).unwrap();
        let version = loader.reload("swap", &artifact_for(v2)).unwrap();
        assert_eq!(version.semver, Some(SemVer::new(1, 1, 0)));
        assert_eq!(loader.len(), 1);
    }

    #[test]
    fn test_reload_failure_leaves_module_absent() {
        let mut loader = loader(4);
        let v1 = leak_iface(b"frag\0", b"1.0.0\0", init_ok);
        let v2 = leak_iface(b"frag\0", b"1.1.0\0", init_fail);
        loader.load("frag", &artifact_for(v1)).unwrap();
        assert!(matches!(
            loader.reload("frag", &artifact_for(v2)),
            Err(LoadError::InitFailed { .. })
        ));
        assert!(!loader.contains("frag"));
    }
}
