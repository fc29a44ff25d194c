//! Versions: an immutable build request plus the runtime state of its artifact

use crate::compiler::{self, Compiler};
use crate::error::{CompilerError, Result};
use crate::loader::{LoadedModule, Symbol};
use crate::option::CompileOption;
use crate::utils::lock;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Process-unique identity of a [`Version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionId(u64);

impl VersionId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Lifecycle state of a [`Version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionState {
    /// No artifact exists (fresh, failed, or purged).
    Unbuilt,
    Compiling,
    /// The artifact is on disk but not mapped into the process.
    Compiled,
    /// The artifact is mapped and entry points may be resolved.
    Loaded,
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VersionState::Unbuilt => "unbuilt",
            VersionState::Compiling => "compiling",
            VersionState::Compiled => "compiled",
            VersionState::Loaded => "loaded",
        };
        f.write_str(name)
    }
}

/// What to build: never changes once a [`Version`] exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    sources: Vec<PathBuf>,
    include_dirs: Vec<PathBuf>,
    options: Vec<CompileOption>,
    entry_points: Vec<String>,
}

impl BuildRequest {
    /// `options` must already be merged; include dirs are deduplicated here.
    pub(crate) fn new(
        sources: Vec<PathBuf>,
        include_dirs: Vec<PathBuf>,
        options: Vec<CompileOption>,
        entry_points: Vec<String>,
    ) -> Self {
        let mut unique_dirs: Vec<PathBuf> = Vec::with_capacity(include_dirs.len());
        for dir in include_dirs {
            if !unique_dirs.contains(&dir) {
                unique_dirs.push(dir);
            }
        }
        Self {
            sources,
            include_dirs: unique_dirs,
            options,
            entry_points,
        }
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn include_dirs(&self) -> &[PathBuf] {
        &self.include_dirs
    }

    pub fn options(&self) -> &[CompileOption] {
        &self.options
    }

    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    pub fn option_args(&self) -> Vec<String> {
        self.options.iter().map(CompileOption::flag_text).collect()
    }

    pub fn include_args(&self) -> Vec<String> {
        self.include_dirs
            .iter()
            .map(|dir| format!("-I{}", dir.display()))
            .collect()
    }

    /// Content fingerprint over everything that influences the artifact.
    ///
    /// Source files are read, so an edited source yields a new fingerprint
    /// even when its path is unchanged.
    pub fn fingerprint(&self, backend_id: &str) -> Result<String> {
        let mut context = md5::Context::new();
        let mut field = |tag: &str, bytes: &[u8]| {
            context.consume(tag.as_bytes());
            context.consume((bytes.len() as u64).to_le_bytes());
            context.consume(bytes);
        };

        field("backend", backend_id.as_bytes());
        for entry in &self.entry_points {
            field("entry", entry.as_bytes());
        }
        for arg in self.option_args() {
            field("option", arg.as_bytes());
        }
        for arg in self.include_args() {
            field("include", arg.as_bytes());
        }
        for source in &self.sources {
            let contents = fs::read(source).map_err(|e| CompilerError::FileNotFound {
                path: format!("{}: {}", source.display(), e),
            })?;
            field("source", source.to_string_lossy().as_bytes());
            field("contents", &contents);
        }

        Ok(hex::encode(context.compute().0))
    }
}

/// Location of a compiled artifact, its diagnostics log and its dependency manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub log: PathBuf,
    /// Headers the artifact was built from, with their content hashes.
    pub manifest: PathBuf,
    pub fingerprint: String,
}

impl Artifact {
    pub fn files(&self) -> [&Path; 3] {
        [&self.path, &self.log, &self.manifest]
    }
}

#[derive(Debug)]
pub(crate) struct RuntimeState {
    pub(crate) state: VersionState,
    pub(crate) artifact: Option<Artifact>,
    pub(crate) log: Option<PathBuf>,
    pub(crate) module: Option<LoadedModule>,
    pub(crate) symbols: Vec<Option<Symbol>>,
    pub(crate) last_compile_failed: bool,
}

impl RuntimeState {
    fn new(entry_points: usize) -> Self {
        Self {
            state: VersionState::Unbuilt,
            artifact: None,
            log: None,
            module: None,
            symbols: vec![None; entry_points],
            last_compile_failed: false,
        }
    }

    pub(crate) fn clear_symbols(&mut self) {
        self.symbols.iter_mut().for_each(|slot| *slot = None);
    }
}

/// A buildable, loadable variant of some source code.
///
/// Created by [`Builder::build`](crate::Builder::build). The build request is
/// fixed; only the runtime state moves. A `Version` that is dropped while
/// loaded is folded first.
pub struct Version {
    id: VersionId,
    label: Option<String>,
    request: BuildRequest,
    compiler: Arc<dyn Compiler>,
    autoremove_files: bool,
    compile_gate: Mutex<()>,
    runtime: Arc<Mutex<RuntimeState>>,
}

impl Version {
    pub(crate) fn new(
        request: BuildRequest,
        compiler: Arc<dyn Compiler>,
        label: Option<String>,
        autoremove_files: bool,
    ) -> Self {
        let runtime = RuntimeState::new(request.entry_points.len());
        Self {
            id: VersionId::next(),
            label,
            request,
            compiler,
            autoremove_files,
            compile_gate: Mutex::new(()),
            runtime: Arc::new(Mutex::new(runtime)),
        }
    }

    pub fn id(&self) -> VersionId {
        self.id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn request(&self) -> &BuildRequest {
        &self.request
    }

    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }

    /// The first (primary) entry point name.
    pub fn entry_point(&self) -> &str {
        self.request
            .entry_points
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn autoremove_files(&self) -> bool {
        self.autoremove_files
    }

    pub fn state(&self) -> VersionState {
        lock(&self.runtime).state
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.state(), VersionState::Compiled | VersionState::Loaded)
    }

    pub fn has_loaded_module(&self) -> bool {
        lock(&self.runtime).module.is_some()
    }

    /// Whether the most recent `compile()` call failed.
    pub fn last_compile_failed(&self) -> bool {
        lock(&self.runtime).last_compile_failed
    }

    pub fn artifact(&self) -> Option<Artifact> {
        lock(&self.runtime).artifact.clone()
    }

    /// Log of the most recent compilation attempt, kept on failure too.
    pub fn log_path(&self) -> Option<PathBuf> {
        lock(&self.runtime).log.clone()
    }

    pub fn diagnostics(&self) -> Option<String> {
        let log = self.log_path()?;
        fs::read_to_string(log).ok()
    }

    /// Compile through the backend. Returns `false` on any failure.
    pub fn compile(&self) -> bool {
        self.compiler.compile(self)
    }

    /// Resolve the primary entry point, loading the artifact on first use.
    pub fn get_symbol(&self) -> Option<Symbol> {
        self.compiler.get_symbol(self)
    }

    pub fn get_symbol_at(&self, index: usize) -> Option<Symbol> {
        self.compiler.get_symbol_at(self, index)
    }

    /// Resolve the primary entry point and run `f` with it while holding the
    /// version's runtime lock, so no `fold()` can unload the module meanwhile.
    pub fn with_symbol<R>(&self, f: impl FnOnce(Symbol) -> R) -> Option<R> {
        let mut runtime = lock(&self.runtime);
        let symbol = compiler::resolve_entry(self, &mut runtime, 0)?;
        Some(f(symbol))
    }

    /// Release the loaded module; the on-disk artifact is kept.
    pub fn fold(&self) {
        self.compiler.fold(self)
    }

    pub(crate) fn compile_gate(&self) -> MutexGuard<'_, ()> {
        lock(&self.compile_gate)
    }

    pub(crate) fn runtime(&self) -> MutexGuard<'_, RuntimeState> {
        lock(&self.runtime)
    }

    /// Handle the backend registry keeps so teardown can reach live versions.
    pub(crate) fn runtime_handle(&self) -> Weak<Mutex<RuntimeState>> {
        Arc::downgrade(&self.runtime)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} ({})", label, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Version")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("request", &self.request)
            .field("compiler", &self.compiler.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Version {
    fn drop(&mut self) {
        self.compiler.fold(self);
        let (artifact, log) = {
            let mut runtime = lock(&self.runtime);
            (runtime.artifact.take(), runtime.log.take())
        };
        compiler::release_artifact(
            self.compiler.registry(),
            self.id,
            artifact.as_ref(),
            log.as_deref(),
            self.autoremove_files,
        );
    }
}
