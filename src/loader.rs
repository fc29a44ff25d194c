//! Loading compiled artifacts into the process and resolving entry points

use crate::error::{CompilerError, Result};
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// File extension of dynamically loadable modules on this platform.
pub const DYLIB_EXTENSION: &str = if cfg!(target_os = "windows") {
    "dll"
} else if cfg!(target_os = "macos") {
    "dylib"
} else {
    "so"
};

/// Untyped address of a resolved symbol.
///
/// The address is only valid while the module it came from stays loaded,
/// i.e. until the owning `Version` is folded or dropped.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(NonNull<c_void>);

// The address itself is plain data; validity is tied to the owning Version.
unsafe impl Send for Symbol {}
unsafe impl Sync for Symbol {}

impl Symbol {
    pub fn address(self) -> *const c_void {
        self.0.as_ptr()
    }

    /// Reinterpret the address as a function pointer (or other pointer-sized type).
    ///
    /// # Safety
    /// `F` must match the real signature of the symbol, and the module it was
    /// resolved from must still be loaded whenever the result is used.
    pub unsafe fn cast<F: Copy>(self) -> F {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const c_void>(),
            "symbols can only be cast to pointer-sized types"
        );
        std::mem::transmute_copy(&self.0.as_ptr())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:p})", self.0.as_ptr())
    }
}

/// A shared object mapped into the current process.
pub struct LoadedModule {
    library: libloading::Library,
    path: PathBuf,
}

impl LoadedModule {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        // Loading runs the module's initializers; artifacts are produced by us.
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| CompilerError::load(path, e.to_string()))?;
        log::debug!("Loaded module {}", path.display());
        Ok(Self {
            library,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve `name`, returning `None` if the module does not export it.
    pub fn resolve(&self, name: &str) -> Option<Symbol> {
        let symbol = unsafe { self.library.get::<*mut c_void>(name.as_bytes()) };
        match symbol {
            Ok(symbol) => NonNull::new(*symbol).map(Symbol),
            Err(e) => {
                log::debug!("Symbol '{}' not found in {}: {}", name, self.path.display(), e);
                None
            }
        }
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        log::debug!("Unloading module {}", self.path.display());
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_missing_module_fails() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join(format!("missing.{}", DYLIB_EXTENSION));

        let err = LoadedModule::open(&missing).unwrap_err();
        assert!(matches!(err, CompilerError::Load { .. }));
    }

    #[test]
    fn test_open_garbage_module_fails() {
        let temp_dir = TempDir::new().unwrap();
        let garbage = temp_dir.path().join(format!("garbage.{}", DYLIB_EXTENSION));
        std::fs::write(&garbage, b"not a shared object").unwrap();

        assert!(LoadedModule::open(&garbage).is_err());
    }

    #[test]
    fn test_symbol_cast_round_trips_address() {
        extern "C" fn answer() -> i32 {
            42
        }
        let address = NonNull::new(answer as *mut c_void).unwrap();
        let symbol = Symbol(address);

        let f: extern "C" fn() -> i32 = unsafe { symbol.cast() };
        assert_eq!(f(), 42);
        assert_eq!(symbol.address(), answer as *const c_void);
    }
}
