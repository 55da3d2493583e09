//! Shared library loading for in-process modules.
//!
//! A module library exports `vm_main(fd)`: it receives one end of a socket
//! pair as its root channel, owns that descriptor, and returns when the
//! channel closes.
use crate::config::types::{Result, VmError};
use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};
use libloading::{Library, Symbol};
use std::os::raw::c_int;
use std::path::{Path, PathBuf};

pub const VM_MAIN_SYMBOL: &[u8] = b"vm_main\0";

pub type VmMainFn = unsafe extern "C" fn(root_fd: c_int) -> c_int;

pub struct SharedLibrary {
    library: Library,
    path: PathBuf,
}

impl SharedLibrary {
    /// Load `path` with every symbol resolved up front.
    pub fn open(path: &Path) -> Result<Self> {
        let library = unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL) }
            .map_err(|e| VmError::Startup(format!("failed to load {}: {}", path.display(), e)))?;
        log::info!("Loaded module library {}", path.display());
        Ok(Self {
            library: library.into(),
            path: path.to_path_buf(),
        })
    }

    pub fn entry_point(&self) -> Result<VmMainFn> {
        let symbol: Symbol<VmMainFn> = unsafe { self.library.get(VM_MAIN_SYMBOL) }.map_err(|e| {
            VmError::Startup(format!("{} does not export vm_main: {}", self.path.display(), e))
        })?;
        Ok(*symbol)
    }

    /// Keep the image mapped for the rest of the process. Used when a worker
    /// thread could not be stopped and may still execute library code.
    pub fn leak(self) {
        log::warn!("Leaking module library {}", self.path.display());
        std::mem::forget(self);
    }
}
