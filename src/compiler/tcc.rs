//! In-process backend: drives libtcc through its C API
//!
//! libtcc is opened at runtime, so the crate builds and runs on machines
//! without it; constructing a [`TccLibCompiler`] is what fails there.

use super::{ArtifactRegistry, Compiler, CompilerSettings};
use crate::error::{CompilerError, Result};
use crate::utils::lock;
use crate::version::BuildRequest;
use libloading::Library;
use std::ffi::{c_void, CStr, CString};
use std::fs::File;
use std::io::Write;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(target_os = "macos")]
const DEFAULT_LIBRARY_NAMES: &[&str] = &["libtcc.dylib"];
#[cfg(target_os = "windows")]
const DEFAULT_LIBRARY_NAMES: &[&str] = &["libtcc.dll"];
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const DEFAULT_LIBRARY_NAMES: &[&str] = &["libtcc.so", "libtcc.so.1"];

#[repr(C)]
struct TccState {
    _private: [u8; 0],
}

type ErrorFunc = unsafe extern "C" fn(opaque: *mut c_void, msg: *const c_char);

type TccNew = unsafe extern "C" fn() -> *mut TccState;
type TccDelete = unsafe extern "C" fn(*mut TccState);
type TccSetErrorFunc = unsafe extern "C" fn(*mut TccState, *mut c_void, Option<ErrorFunc>);
type TccSetLibPath = unsafe extern "C" fn(*mut TccState, *const c_char);
type TccSetOptions = unsafe extern "C" fn(*mut TccState, *const c_char);
type TccSetOutputType = unsafe extern "C" fn(*mut TccState, c_int) -> c_int;
type TccPathCall = unsafe extern "C" fn(*mut TccState, *const c_char) -> c_int;

/// Entry points of libtcc, copied out of the library once at load time.
#[derive(Clone, Copy)]
struct TccApi {
    new: TccNew,
    delete: TccDelete,
    set_error_func: TccSetErrorFunc,
    set_lib_path: TccSetLibPath,
    set_options: TccSetOptions,
    set_output_type: TccSetOutputType,
    add_include_path: TccPathCall,
    add_file: TccPathCall,
    output_file: TccPathCall,
}

impl TccApi {
    fn resolve(library: &Library) -> Result<Self> {
        unsafe fn get<T: Copy>(library: &Library, name: &str) -> Result<T> {
            library
                .get::<T>(name.as_bytes())
                .map(|symbol| *symbol)
                .map_err(|e| CompilerError::backend(format!("libtcc is missing {}: {}", name, e)))
        }

        unsafe {
            Ok(Self {
                new: get(library, "tcc_new")?,
                delete: get(library, "tcc_delete")?,
                set_error_func: get(library, "tcc_set_error_func")?,
                set_lib_path: get(library, "tcc_set_lib_path")?,
                set_options: get(library, "tcc_set_options")?,
                set_output_type: get(library, "tcc_set_output_type")?,
                add_include_path: get(library, "tcc_add_include_path")?,
                add_file: get(library, "tcc_add_file")?,
                output_file: get(library, "tcc_output_file")?,
            })
        }
    }
}

/// One compilation state; deleted on drop.
struct Session<'a> {
    api: &'a TccApi,
    state: *mut TccState,
}

impl<'a> Session<'a> {
    fn new(api: &'a TccApi) -> Result<Self> {
        let state = unsafe { (api.new)() };
        if state.is_null() {
            return Err(CompilerError::backend("tcc_new returned NULL"));
        }
        Ok(Self { api, state })
    }

    fn call_path(&self, f: TccPathCall, what: &str, arg: &CStr) -> std::result::Result<(), String> {
        let rc = unsafe { f(self.state, arg.as_ptr()) };
        if rc < 0 {
            Err(format!("{} failed for '{}'", what, arg.to_string_lossy()))
        } else {
            Ok(())
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.delete)(self.state) };
    }
}

unsafe extern "C" fn collect_diagnostic(opaque: *mut c_void, msg: *const c_char) {
    if opaque.is_null() || msg.is_null() {
        return;
    }
    let sink = &mut *(opaque as *mut Vec<String>);
    sink.push(CStr::from_ptr(msg).to_string_lossy().into_owned());
}

fn c_string(text: &str) -> Result<CString> {
    CString::new(text)
        .map_err(|_| CompilerError::invalid_format(format!("argument contains a NUL byte: {:?}", text)))
}

fn c_path(path: &Path) -> Result<CString> {
    let text = path.to_str().ok_or_else(|| {
        CompilerError::invalid_format(format!("path is not valid UTF-8: {}", path.display()))
    })?;
    c_string(text)
}

/// Compiles inside the host process with libtcc, emitting a shared object.
pub struct TccLibCompiler {
    id: String,
    settings: CompilerSettings,
    registry: ArtifactRegistry,
    api: TccApi,
    // libtcc keeps global state: one compilation at a time per instance.
    serial: Mutex<()>,
    library_path: PathBuf,
    _library: Library,
}

impl TccLibCompiler {
    /// Open libtcc from the default locations.
    pub fn new(work_dir: impl Into<PathBuf>, log_file: Option<PathBuf>) -> Result<Self> {
        Self::from_settings(CompilerSettings {
            backend: super::BackendKind::Tcc,
            work_dir: work_dir.into(),
            log_file,
            ..CompilerSettings::default()
        })
    }

    pub fn from_settings(settings: CompilerSettings) -> Result<Self> {
        let candidates: Vec<PathBuf> = match &settings.tcc_library {
            Some(path) => vec![path.clone()],
            None => DEFAULT_LIBRARY_NAMES.iter().map(PathBuf::from).collect(),
        };

        let mut failures = Vec::new();
        for candidate in &candidates {
            match unsafe { Library::new(candidate) } {
                Ok(library) => {
                    let api = TccApi::resolve(&library)?;
                    log::info!("Using libtcc from {}", candidate.display());
                    return Ok(Self {
                        id: settings.id.clone().unwrap_or_else(|| "libtcc".to_string()),
                        settings,
                        registry: ArtifactRegistry::new(),
                        api,
                        serial: Mutex::new(()),
                        library_path: candidate.clone(),
                        _library: library,
                    });
                }
                Err(e) => failures.push(format!("{}: {}", candidate.display(), e)),
            }
        }

        Err(CompilerError::backend(format!(
            "cannot open libtcc ({})",
            failures.join("; ")
        )))
    }

    pub fn library_path(&self) -> &Path {
        &self.library_path
    }

    /// Run one libtcc compilation, returning collected diagnostics and the first error.
    fn run_session(
        &self,
        request: &BuildRequest,
        output: &Path,
    ) -> Result<(Vec<String>, Option<String>)> {
        let include_dirs = request
            .include_dirs()
            .iter()
            .map(|dir| c_path(dir))
            .collect::<Result<Vec<_>>>()?;
        let options = request
            .option_args()
            .iter()
            .map(|arg| c_string(arg))
            .collect::<Result<Vec<_>>>()?;
        let sources = request
            .sources()
            .iter()
            .map(|src| c_path(src))
            .collect::<Result<Vec<_>>>()?;
        let output = c_path(output)?;
        let lib_path = self.settings.tcc_lib_path.as_deref().map(c_path).transpose()?;

        let _serial = lock(&self.serial);
        let mut diagnostics: Vec<String> = Vec::new();
        let session = Session::new(&self.api)?;

        // The sink outlives the session, which is dropped at the end of this scope.
        unsafe {
            (self.api.set_error_func)(
                session.state,
                &mut diagnostics as *mut Vec<String> as *mut c_void,
                Some(collect_diagnostic),
            );
        }

        let failure = (|| -> std::result::Result<(), String> {
            if let Some(lib_path) = &lib_path {
                unsafe { (self.api.set_lib_path)(session.state, lib_path.as_ptr()) };
            }
            for option in &options {
                unsafe { (self.api.set_options)(session.state, option.as_ptr()) };
            }
            let rc = unsafe { (self.api.set_output_type)(session.state, self.settings.tcc_output_type) };
            if rc < 0 {
                return Err("tcc_set_output_type failed".to_string());
            }
            for dir in &include_dirs {
                session.call_path(self.api.add_include_path, "tcc_add_include_path", dir)?;
            }
            for source in &sources {
                session.call_path(self.api.add_file, "tcc_add_file", source)?;
            }
            session.call_path(self.api.output_file, "tcc_output_file", &output)
        })()
        .err();

        drop(session);
        Ok((diagnostics, failure))
    }
}

impl Compiler for TccLibCompiler {
    fn id(&self) -> &str {
        &self.id
    }

    fn settings(&self) -> &CompilerSettings {
        &self.settings
    }

    fn registry(&self) -> &ArtifactRegistry {
        &self.registry
    }

    fn generate(&self, request: &BuildRequest, output: &Path, log_path: &Path) -> Result<()> {
        let mut log = File::create(log_path)?;
        writeln!(
            log,
            "libtcc ({}): {} {} {}",
            self.library_path.display(),
            request.option_args().join(" "),
            request.include_args().join(" "),
            request
                .sources()
                .iter()
                .map(|s| s.display().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        )?;

        let (diagnostics, failure) = self.run_session(request, output)?;
        for line in &diagnostics {
            writeln!(log, "{}", line)?;
        }

        match failure {
            None => Ok(()),
            Some(message) => {
                writeln!(log, "error: {}", message)?;
                Err(CompilerError::compile_failed(&self.id, log_path, message))
            }
        }
    }
}
