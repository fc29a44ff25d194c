//! Backend configuration and backend selection

use super::{Compiler, SystemCompiler};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Which backend implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Spawn a system toolchain (`cc`, `gcc`, `clang`, ...).
    #[default]
    System,
    /// Drive libtcc inside the current process.
    Tcc,
}

impl FromStr for BackendKind {
    type Err = crate::error::CompilerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" | "cc" => Ok(BackendKind::System),
            "tcc" | "libtcc" => Ok(BackendKind::Tcc),
            other => Err(crate::error::CompilerError::invalid_format(format!(
                "Unknown backend '{}' (expected 'system' or 'tcc')",
                other
            ))),
        }
    }
}

/// Settings shared by every backend, plus the knobs specific to each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    pub backend: BackendKind,

    /// Instance identifier; defaults to the executable name or "libtcc".
    pub id: Option<String>,

    /// Toolchain executable for the system backend.
    pub executable: String,

    /// Directory receiving artifacts and per-artifact logs.
    pub work_dir: PathBuf,

    /// Backend-wide log collecting every compilation's diagnostics.
    pub log_file: Option<PathBuf>,

    /// Wall-clock limit for one out-of-process compilation.
    pub timeout_secs: Option<u64>,

    /// Reuse an existing artifact with the same fingerprint instead of recompiling.
    pub reuse_artifacts: bool,

    /// Delete artifacts on fold and on teardown.
    pub purge_on_fold: bool,

    /// Path or name of the libtcc shared library.
    pub tcc_library: Option<PathBuf>,

    /// Directory holding libtcc1.a and tcc's own headers.
    pub tcc_lib_path: Option<PathBuf>,

    /// Value of TCC_OUTPUT_DLL for the installed libtcc (3 in 0.9.27).
    pub tcc_output_type: i32,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::System,
            id: None,
            executable: "cc".to_string(),
            work_dir: PathBuf::from("."),
            log_file: None,
            timeout_secs: None,
            reuse_artifacts: true,
            purge_on_fold: false,
            tcc_library: None,
            tcc_lib_path: None,
            tcc_output_type: 3,
        }
    }
}

impl CompilerSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Construct the backend selected by `settings.backend`.
pub fn create_compiler(settings: &CompilerSettings) -> Result<Arc<dyn Compiler>> {
    match settings.backend {
        BackendKind::System => Ok(Arc::new(SystemCompiler::from_settings(settings.clone()))),
        #[cfg(feature = "tcc")]
        BackendKind::Tcc => Ok(Arc::new(super::TccLibCompiler::from_settings(
            settings.clone(),
        )?)),
        #[cfg(not(feature = "tcc"))]
        BackendKind::Tcc => Err(crate::error::CompilerError::backend(
            "vcomp was built without the 'tcc' feature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_partial_toml() {
        let settings: CompilerSettings = toml::from_str(
            r#"
backend = "system"
executable = "gcc"
work_dir = "build/vc"
timeout_secs = 30
"#,
        )
        .unwrap();

        assert_eq!(settings.executable, "gcc");
        assert_eq!(settings.work_dir, PathBuf::from("build/vc"));
        assert_eq!(settings.timeout(), Some(Duration::from_secs(30)));
        assert!(settings.reuse_artifacts);
        assert!(!settings.purge_on_fold);
    }

    #[test]
    fn test_settings_from_json() {
        let settings: CompilerSettings =
            serde_json::from_str(r#"{"backend": "tcc", "purge_on_fold": true}"#).unwrap();
        assert_eq!(settings.backend, BackendKind::Tcc);
        assert!(settings.purge_on_fold);
        assert_eq!(settings.executable, "cc");
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("system".parse::<BackendKind>().unwrap(), BackendKind::System);
        assert_eq!("tcc".parse::<BackendKind>().unwrap(), BackendKind::Tcc);
        assert!("msvc".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_create_system_compiler() {
        let settings = CompilerSettings {
            executable: "gcc".to_string(),
            ..CompilerSettings::default()
        };
        let compiler = create_compiler(&settings).unwrap();
        assert_eq!(compiler.id(), "gcc");
        assert!(compiler.compiled_versions().is_empty());
    }
}
