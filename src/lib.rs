//! vcomp: a versioning compiler
//!
//! Builds many variants ("versions") of the same C source at runtime, each
//! with its own compiler options, loads them into the running process and
//! unloads ("folds") them again.
//!
//! # Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use vcomp::{make_keyed_option, Builder, SystemCompiler};
//!
//! let compiler = Arc::new(SystemCompiler::new("cc", "cc", "build/vc", None));
//! let mut builder = Builder::new();
//! builder
//!     .compiler(compiler)
//!     .add_source_file("gemm.c")
//!     .add_option(make_keyed_option("dataset", "-D", "MINI_DATASET"))
//!     .entry_point("main");
//!
//! let version = builder.build()?;
//! if version.compile() {
//!     type MainFn = unsafe extern "C" fn(i32, *mut *mut std::os::raw::c_char) -> i32;
//!     let code = version.with_symbol(|sym| unsafe {
//!         let main: MainFn = sym.cast();
//!         main(0, std::ptr::null_mut())
//!     });
//!     println!("exit code: {:?}", code);
//! }
//! version.fold();
//! # Ok::<(), vcomp::CompilerError>(())
//! ```
//!
//! # Lifecycle
//!
//! 1. **Build**: a [`Builder`] snapshots sources, options and a backend into a [`Version`]
//! 2. **Compile**: the backend produces `<work_dir>/<stem>.<dylib>` and `<stem>.log`
//! 3. **Load**: the first `get_symbol` maps the artifact and resolves entry points
//! 4. **Fold**: the mapping is released; the artifact stays on disk unless purged

pub mod builder;
pub mod cli;
pub mod compiler;
pub mod error;
pub mod loader;
pub mod option;
pub mod utils;
pub mod version;

pub use builder::{Builder, RetainPolicy};
#[cfg(feature = "tcc")]
pub use compiler::TccLibCompiler;
pub use compiler::{
    create_compiler, ArtifactRegistry, BackendKind, Compiler, CompilerSettings, SystemCompiler,
};
pub use error::{CompilerError, Result};
pub use loader::{LoadedModule, Symbol, DYLIB_EXTENSION};
pub use option::{make_keyed_option, make_option, merge_options, to_args, CompileOption};
pub use version::{Artifact, BuildRequest, Version, VersionId, VersionState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
