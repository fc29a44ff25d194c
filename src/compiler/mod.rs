//! Compiler backends and the compile / resolve / fold contract they share
//!
//! A backend only has to know how to turn a [`BuildRequest`] into a shared
//! object at a given path. Everything else (fingerprinting, artifact naming,
//! per-fingerprint locking, loading, symbol caching, folding and registry
//! bookkeeping) is provided here on top of that single operation.

pub mod deps;
pub mod process;
pub mod registry;
pub mod settings;
pub mod system;
#[cfg(feature = "tcc")]
pub mod tcc;

pub use registry::ArtifactRegistry;
pub use settings::{create_compiler, BackendKind, CompilerSettings};
pub use system::SystemCompiler;
#[cfg(feature = "tcc")]
pub use tcc::TccLibCompiler;

use crate::error::{CompilerError, Result};
use crate::loader::{LoadedModule, Symbol, DYLIB_EXTENSION};
use crate::utils::{artifact_stem, lock};
use crate::version::{Artifact, BuildRequest, RuntimeState, Version, VersionId, VersionState};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A backend capable of compiling [`Version`]s into loadable artifacts.
pub trait Compiler: Send + Sync {
    /// Identifier of this backend instance; part of every fingerprint.
    fn id(&self) -> &str;

    fn settings(&self) -> &CompilerSettings;

    /// Bookkeeping owned by this backend instance.
    fn registry(&self) -> &ArtifactRegistry;

    /// Produce a shared object for `request` at `output`, writing diagnostics to `log`.
    fn generate(&self, request: &BuildRequest, output: &Path, log: &Path) -> Result<()>;

    /// Files the last successful `generate` into `output` read, if the backend can tell.
    ///
    /// Backends returning `None` get a conservative header scan instead.
    fn dependencies(&self, _request: &BuildRequest, _output: &Path) -> Option<Vec<PathBuf>> {
        None
    }

    fn work_dir(&self) -> &Path {
        &self.settings().work_dir
    }

    /// Backend-wide log that accumulates every per-artifact log.
    fn log_file(&self) -> Option<&Path> {
        self.settings().log_file.as_deref()
    }

    /// Compile `version`.
    ///
    /// Already compiled (or loaded) versions are left untouched and report
    /// success. On failure the version goes back to `Unbuilt` and its log
    /// stays available through [`Version::log_path`].
    fn compile(&self, version: &Version) -> bool {
        let _gate = version.compile_gate();
        {
            let mut runtime = version.runtime();
            if matches!(runtime.state, VersionState::Compiled | VersionState::Loaded) {
                log::debug!("{} is already compiled", version);
                return true;
            }
            runtime.state = VersionState::Compiling;
        }

        let outcome = produce_artifact(self, version);

        let mut runtime = version.runtime();
        match outcome {
            Ok(artifact) => {
                log::info!("Compiled {} -> {}", version, artifact.path.display());
                runtime.log = Some(artifact.log.clone());
                runtime.artifact = Some(artifact);
                runtime.state = VersionState::Compiled;
                runtime.last_compile_failed = false;
                true
            }
            Err(e) => {
                log::warn!("Compilation of {} failed: {}", version, e);
                runtime.state = VersionState::Unbuilt;
                runtime.last_compile_failed = true;
                false
            }
        }
    }

    fn get_symbol(&self, version: &Version) -> Option<Symbol> {
        self.get_symbol_at(version, 0)
    }

    /// Resolve the entry point at `index`, loading the artifact if needed.
    fn get_symbol_at(&self, version: &Version, index: usize) -> Option<Symbol> {
        let mut runtime = version.runtime();
        resolve_entry(version, &mut runtime, index)
    }

    /// Unload the artifact of `version`. A no-op on versions that were never compiled.
    fn fold(&self, version: &Version) {
        let mut runtime = version.runtime();
        if runtime.module.take().is_some() {
            log::debug!("Folded {}", version);
        }
        runtime.clear_symbols();
        if runtime.state == VersionState::Loaded {
            runtime.state = VersionState::Compiled;
        }

        if self.settings().purge_on_fold && runtime.state == VersionState::Compiled {
            let artifact = runtime.artifact.take();
            runtime.state = VersionState::Unbuilt;
            release_artifact(self.registry(), version.id(), artifact.as_ref(), None, true);
        }
    }

    /// Versions this backend has compiled and that are still alive.
    fn compiled_versions(&self) -> Vec<VersionId> {
        self.registry().compiled_versions()
    }

    /// Empty the registry.
    ///
    /// With `purge_on_fold` set, versions that are still alive are unloaded and
    /// reset to `Unbuilt` before their artifacts are deleted.
    fn teardown(&self) {
        let records = self.registry().drain();
        log::debug!("Tearing down {} ({} compiled versions)", self.id(), records.len());
        if !self.settings().purge_on_fold {
            return;
        }
        for record in records {
            if let Some(runtime) = record.runtime.upgrade() {
                let mut runtime = lock(&runtime);
                runtime.module = None;
                runtime.clear_symbols();
                runtime.artifact = None;
                runtime.state = VersionState::Unbuilt;
            }
            let _in_flight = self.registry().lock_fingerprint(&record.artifact.fingerprint);
            remove_unreferenced(self.registry(), record.artifact.files());
        }
    }
}

/// Load (if needed) and resolve entry point `index` with the runtime lock held.
pub(crate) fn resolve_entry(
    version: &Version,
    runtime: &mut RuntimeState,
    index: usize,
) -> Option<Symbol> {
    let name = version.request().entry_points().get(index)?;

    match runtime.state {
        VersionState::Unbuilt | VersionState::Compiling => {
            log::warn!("Cannot resolve '{}' of {}: not compiled", name, version);
            return None;
        }
        VersionState::Compiled => {
            let path = runtime.artifact.as_ref()?.path.clone();
            match LoadedModule::open(&path) {
                Ok(module) => {
                    runtime.module = Some(module);
                    runtime.state = VersionState::Loaded;
                }
                Err(e) => {
                    log::warn!("{}", e);
                    return None;
                }
            }
        }
        VersionState::Loaded => {}
    }

    if let Some(Some(symbol)) = runtime.symbols.get(index) {
        return Some(*symbol);
    }

    let symbol = runtime.module.as_ref()?.resolve(name);
    if let Some(slot) = runtime.symbols.get_mut(index) {
        *slot = symbol;
    }
    symbol
}

fn produce_artifact<C: Compiler + ?Sized>(compiler: &C, version: &Version) -> Result<Artifact> {
    let request = version.request();
    let fingerprint = request.fingerprint(compiler.id())?;
    let stem = artifact_stem(version.label(), &fingerprint);

    let work_dir = compiler.work_dir();
    fs::create_dir_all(work_dir)?;
    let path = work_dir.join(format!("{}.{}", stem, DYLIB_EXTENSION));
    let artifact = Artifact {
        manifest: deps::manifest_path(&path),
        log: work_dir.join(format!("{}.log", stem)),
        path,
        fingerprint,
    };
    version.runtime().log = Some(artifact.log.clone());

    let registry = compiler.registry();
    let _in_flight = registry.lock_fingerprint(&artifact.fingerprint);

    if compiler.settings().reuse_artifacts && artifact.path.is_file() {
        if deps::manifest_is_current(&artifact.manifest) {
            log::info!("Reusing {} for {}", artifact.path.display(), version);
            registry.record(version.id(), &artifact, version.runtime_handle());
            return Ok(artifact);
        }
        log::info!("Dependencies of {} changed, recompiling", artifact.path.display());
    }

    let staging = staging_path(&artifact.path);
    log::info!("Compiling {} with {}", version, compiler.id());
    let generated = compiler.generate(request, &staging, &artifact.log);
    append_to_backend_log(compiler, &artifact.log);

    let finished = generated.and_then(|()| {
        if !staging.is_file() {
            return Err(CompilerError::compile_failed(
                compiler.id(),
                &artifact.log,
                "backend reported success but produced no artifact",
            ));
        }
        let headers = compiler
            .dependencies(request, &staging)
            .unwrap_or_else(|| deps::header_candidates(request));
        deps::write_manifest(&artifact.manifest, &headers)?;
        fs::rename(&staging, &artifact.path)?;
        Ok(())
    });
    let _ = fs::remove_file(deps::depfile_path(&staging));

    match finished {
        Ok(()) => {
            registry.record(version.id(), &artifact, version.runtime_handle());
            Ok(artifact)
        }
        Err(e) => {
            let _ = fs::remove_file(&staging);
            Err(e)
        }
    }
}

/// Private path a backend writes to before the artifact is renamed into place.
fn staging_path(final_path: &Path) -> PathBuf {
    let mut name: OsString = final_path.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    final_path.with_file_name(name)
}

fn append_to_backend_log<C: Compiler + ?Sized>(compiler: &C, artifact_log: &Path) {
    let Some(backend_log) = compiler.log_file() else {
        return;
    };
    let _serial = lock(compiler.registry().log_lock());

    let result = fs::read(artifact_log).and_then(|contents| {
        if let Some(parent) = backend_log.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(backend_log)?;
        writeln!(file, "== {} ==", artifact_log.display())?;
        file.write_all(&contents)?;
        if !contents.ends_with(b"\n") {
            writeln!(file)?;
        }
        file.flush()
    });

    if let Err(e) = result {
        log::warn!("Could not append to {}: {}", backend_log.display(), e);
    }
}

/// Forget `id`; with `delete`, also remove the files no other recorded version still uses.
pub(crate) fn release_artifact(
    registry: &ArtifactRegistry,
    id: VersionId,
    artifact: Option<&Artifact>,
    log: Option<&Path>,
    delete: bool,
) {
    let _in_flight = artifact.map(|a| registry.lock_fingerprint(&a.fingerprint));
    registry.forget(id);
    if delete {
        let files = artifact.into_iter().flat_map(Artifact::files).chain(log);
        remove_unreferenced(registry, files);
    }
}

fn remove_unreferenced<'a>(registry: &ArtifactRegistry, paths: impl IntoIterator<Item = &'a Path>) {
    for path in paths {
        if registry.is_referenced(path) {
            log::debug!("Keeping {}, still used by another version", path.display());
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => log::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}
