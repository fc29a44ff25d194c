// FILE: src/cli/config.rs

use crate::compiler::{BackendKind, CompilerSettings};
use crate::error::{CompilerError, Result};
use crate::option::{make_option, CompileOption};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Defaults for every subcommand; command-line flags take precedence.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub backend: Option<BackendKind>,
    pub cc: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub reuse_artifacts: Option<bool>,
    pub purge_on_fold: Option<bool>,
    pub tcc_library: Option<PathBuf>,
    pub tcc_lib_path: Option<PathBuf>,
    pub tcc_output_type: Option<i32>,
    pub include_directories: Option<Vec<PathBuf>>,
    pub flags: Option<Vec<String>>,
}

impl ConfigFile {
    pub fn apply_to(&self, settings: &mut CompilerSettings) {
        if let Some(backend) = self.backend {
            settings.backend = backend;
        }
        if let Some(cc) = &self.cc {
            settings.executable = cc.clone();
        }
        if let Some(work_dir) = &self.work_dir {
            settings.work_dir = work_dir.clone();
        }
        if let Some(log_file) = &self.log_file {
            settings.log_file = Some(log_file.clone());
        }
        if let Some(timeout) = self.timeout_secs {
            settings.timeout_secs = Some(timeout);
        }
        if let Some(reuse) = self.reuse_artifacts {
            settings.reuse_artifacts = reuse;
        }
        if let Some(purge) = self.purge_on_fold {
            settings.purge_on_fold = purge;
        }
        if let Some(library) = &self.tcc_library {
            settings.tcc_library = Some(library.clone());
        }
        if let Some(lib_path) = &self.tcc_lib_path {
            settings.tcc_lib_path = Some(lib_path.clone());
        }
        if let Some(output_type) = self.tcc_output_type {
            settings.tcc_output_type = output_type;
        }
    }

    pub fn base_options(&self) -> Vec<CompileOption> {
        self.flags
            .iter()
            .flatten()
            .map(|flag| make_option(flag.as_str()))
            .collect()
    }
}

pub fn load(config_path: &str) -> Result<ConfigFile> {
    let config = parse_by_extension(Path::new(config_path))?;
    log::info!("Loaded configuration from {}", config_path);
    Ok(config)
}

fn parse_by_extension<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| CompilerError::FileNotFound {
        path: format!("{}: {}", path.display(), e),
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| CompilerError::InvalidFormat {
            message: format!("Invalid JSON in {}: {}", path.display(), e),
        }),
        Some("toml") => toml::from_str(&content).map_err(|e| CompilerError::InvalidFormat {
            message: format!("Invalid TOML in {}: {}", path.display(), e),
        }),
        _ => Err(CompilerError::InvalidFormat {
            message: format!("{} must be .json or .toml format", path.display()),
        }),
    }
}

/// One labelled value of an axis, e.g. `mini` = `-DMINI_DATASET`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisValue {
    pub label: String,
    pub flag: String,
}

/// A configuration dimension; its name is the merge key of its options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub values: Vec<AxisValue>,
}

fn default_entry_point() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kernel {
    pub label: String,
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Per-axis allow-list of value labels; axes not listed use every value.
    #[serde(default)]
    pub only: HashMap<String, Vec<String>>,
}

/// A single point of a kernel's configuration space.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub label: String,
    pub options: Vec<CompileOption>,
}

impl Kernel {
    fn allows(&self, axis: &Axis, value: &AxisValue) -> bool {
        self.only
            .get(&axis.name)
            .map_or(true, |allowed| allowed.contains(&value.label))
    }

    /// Cross product of the allowed axis values, first axis varying slowest.
    pub fn variants(&self, axes: &[Axis]) -> Vec<Variant> {
        let mut variants = vec![Variant {
            label: self.label.clone(),
            options: Vec::new(),
        }];

        for axis in axes {
            let values: Vec<&AxisValue> = axis
                .values
                .iter()
                .filter(|value| self.allows(axis, value))
                .collect();
            if values.is_empty() {
                log::warn!("Kernel '{}' allows no value of axis '{}'", self.label, axis.name);
                return Vec::new();
            }

            variants = variants
                .iter()
                .flat_map(|variant| {
                    values.iter().map(move |value| {
                        let mut options = variant.options.clone();
                        options.push(make_option(value.flag.as_str()).with_key(axis.name.as_str()));
                        Variant {
                            label: format!("{} - {}", variant.label, value.label),
                            options,
                        }
                    })
                })
                .collect();
        }

        variants
    }
}

/// A sweep description: shared flags, configuration axes and the kernels to build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub common: Vec<String>,
    #[serde(default)]
    pub axes: Vec<Axis>,
    pub kernels: Vec<Kernel>,
}

impl Catalog {
    pub fn common_options(&self) -> Vec<CompileOption> {
        self.common.iter().map(|flag| make_option(flag.as_str())).collect()
    }

    pub fn variant_count(&self) -> usize {
        self.kernels.iter().map(|k| k.variants(&self.axes).len()).sum()
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base_dir.join(&*path);
            }
        };
        for kernel in &mut self.kernels {
            kernel.sources.iter_mut().for_each(resolve);
            kernel.include_dirs.iter_mut().for_each(resolve);
        }
    }
}

/// Load a catalog; relative source and include paths are taken relative to its directory.
pub fn load_catalog(path: &Path) -> Result<Catalog> {
    let mut catalog: Catalog = parse_by_extension(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    catalog.resolve_paths(base_dir);
    log::info!(
        "Loaded catalog {} ({} kernels, {} variants)",
        path.display(),
        catalog.kernels.len(),
        catalog.variant_count()
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CATALOG: &str = r#"
common = ["-O2", "-Wall"]

[[axes]]
name = "dataset"
values = [
    { label = "mini", flag = "-DMINI_DATASET" },
    { label = "large", flag = "-DLARGE_DATASET" },
]

[[axes]]
name = "type"
values = [
    { label = "int", flag = "-DDATA_TYPE_IS_INT" },
    { label = "double", flag = "-DDATA_TYPE_IS_DOUBLE" },
]

[[kernels]]
label = "gemm"
sources = ["linear-algebra/gemm.c", "/abs/utilities.c"]
include_dirs = ["utilities"]

[[kernels]]
label = "atax"
sources = ["linear-algebra/atax.c"]
entry_point = "kernel_main"
only = { dataset = ["mini"] }
"#;

    fn write_catalog(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_catalog_resolves_relative_paths() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(&temp_dir, "polybench.toml", CATALOG);

        let catalog = load_catalog(&path).unwrap();
        let gemm = &catalog.kernels[0];
        assert_eq!(gemm.sources[0], temp_dir.path().join("linear-algebra/gemm.c"));
        assert_eq!(gemm.sources[1], PathBuf::from("/abs/utilities.c"));
        assert_eq!(gemm.include_dirs[0], temp_dir.path().join("utilities"));
        assert_eq!(gemm.entry_point, "main");
        assert_eq!(catalog.kernels[1].entry_point, "kernel_main");
        assert_eq!(catalog.common_options()[0].flag_text(), "-O2");
    }

    #[test]
    fn test_variants_cross_product_respects_allow_list() {
        let catalog: Catalog = toml::from_str(CATALOG).unwrap();
        assert_eq!(catalog.variant_count(), 4 + 2);

        let gemm = catalog.kernels[0].variants(&catalog.axes);
        let labels: Vec<&str> = gemm.iter().map(|v| v.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "gemm - mini - int",
                "gemm - mini - double",
                "gemm - large - int",
                "gemm - large - double",
            ]
        );
        assert_eq!(gemm[1].options[0].key(), Some("dataset"));
        assert_eq!(gemm[1].options[1].flag_text(), "-DDATA_TYPE_IS_DOUBLE");

        let atax = catalog.kernels[1].variants(&catalog.axes);
        assert!(atax.iter().all(|v| v.label.starts_with("atax - mini - ")));
    }

    #[test]
    fn test_empty_allow_list_yields_no_variants() {
        let mut catalog: Catalog = toml::from_str(CATALOG).unwrap();
        catalog.kernels[1]
            .only
            .insert("type".to_string(), vec!["float".to_string()]);
        assert!(catalog.kernels[1].variants(&catalog.axes).is_empty());
    }

    #[test]
    fn test_config_file_from_json_and_toml() {
        let temp_dir = TempDir::new().unwrap();
        let json = write_catalog(
            &temp_dir,
            "vcomp.json",
            r#"{"cc": "clang", "timeout_secs": 5, "flags": ["-O3"]}"#,
        );
        let config = load(json.to_str().unwrap()).unwrap();
        let mut settings = CompilerSettings::default();
        config.apply_to(&mut settings);
        assert_eq!(settings.executable, "clang");
        assert_eq!(settings.timeout_secs, Some(5));
        assert_eq!(config.base_options()[0].flag_text(), "-O3");

        let toml_path = write_catalog(&temp_dir, "vcomp.toml", "backend = \"tcc\"\npurge_on_fold = true\n");
        let config = load(toml_path.to_str().unwrap()).unwrap();
        let mut settings = CompilerSettings::default();
        config.apply_to(&mut settings);
        assert_eq!(settings.backend, BackendKind::Tcc);
        assert!(settings.purge_on_fold);
    }

    #[test]
    fn test_unknown_config_extension_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_catalog(&temp_dir, "vcomp.yaml", "cc: gcc\n");
        let err = load(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, CompilerError::InvalidFormat { .. }));
    }
}
