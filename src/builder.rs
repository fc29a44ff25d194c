//! Reusable staging object that stamps out [`Version`]s

use crate::compiler::Compiler;
use crate::error::{CompilerError, Result};
use crate::option::{merge_options, CompileOption};
use crate::version::{BuildRequest, Version};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which fields survive [`Builder::reset`].
///
/// Sources and per-configuration options are always cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainPolicy {
    pub compiler: bool,
    pub base_options: bool,
    pub include_dirs: bool,
    pub entry_points: bool,
    pub label: bool,
    pub autoremove_files: bool,
}

impl Default for RetainPolicy {
    fn default() -> Self {
        Self {
            compiler: true,
            base_options: true,
            include_dirs: false,
            entry_points: false,
            label: false,
            autoremove_files: true,
        }
    }
}

impl RetainPolicy {
    pub fn nothing() -> Self {
        Self {
            compiler: false,
            base_options: false,
            include_dirs: false,
            entry_points: false,
            label: false,
            autoremove_files: false,
        }
    }

    pub fn everything() -> Self {
        Self {
            compiler: true,
            base_options: true,
            include_dirs: true,
            entry_points: true,
            label: true,
            autoremove_files: true,
        }
    }
}

/// Accumulates sources, options and a backend, then snapshots them into a
/// [`Version`] with [`build`](Builder::build).
///
/// Built versions share nothing mutable with the builder, so it can be
/// modified and reused right away.
#[derive(Default)]
pub struct Builder {
    compiler: Option<Arc<dyn Compiler>>,
    sources: Vec<PathBuf>,
    include_dirs: Vec<PathBuf>,
    base_options: Vec<CompileOption>,
    options: Vec<CompileOption>,
    entry_points: Vec<String>,
    label: Option<String>,
    autoremove_files: bool,
    retain: RetainPolicy,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compiler(&mut self, compiler: Arc<dyn Compiler>) -> &mut Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn add_source_file(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.sources.push(path.as_ref().to_path_buf());
        self
    }

    pub fn add_include_dir(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.include_dirs.push(path.as_ref().to_path_buf());
        self
    }

    /// Replace the per-configuration options.
    pub fn options(&mut self, options: Vec<CompileOption>) -> &mut Self {
        self.options = options;
        self
    }

    pub fn add_option(&mut self, option: CompileOption) -> &mut Self {
        self.options.push(option);
        self
    }

    /// Replace the options shared by every configuration; merged before the others.
    pub fn base_options(&mut self, options: Vec<CompileOption>) -> &mut Self {
        self.base_options = options;
        self
    }

    pub fn add_base_option(&mut self, option: CompileOption) -> &mut Self {
        self.base_options.push(option);
        self
    }

    /// Make `name` the only entry point.
    pub fn entry_point(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry_points = vec![name.into()];
        self
    }

    pub fn add_entry_point(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry_points.push(name.into());
        self
    }

    pub fn label(&mut self, label: impl Into<String>) -> &mut Self {
        self.label = Some(label.into());
        self
    }

    /// Delete the artifact and its log when the built version is dropped.
    pub fn autoremove_files(&mut self, remove: bool) -> &mut Self {
        self.autoremove_files = remove;
        self
    }

    pub fn retain(&mut self, policy: RetainPolicy) -> &mut Self {
        self.retain = policy;
        self
    }

    pub fn reset(&mut self) -> &mut Self {
        let policy = self.retain;
        self.sources.clear();
        self.options.clear();
        if !policy.compiler {
            self.compiler = None;
        }
        if !policy.base_options {
            self.base_options.clear();
        }
        if !policy.include_dirs {
            self.include_dirs.clear();
        }
        if !policy.entry_points {
            self.entry_points.clear();
        }
        if !policy.label {
            self.label = None;
        }
        if !policy.autoremove_files {
            self.autoremove_files = false;
        }
        self
    }

    /// Snapshot the current configuration into a new, unbuilt [`Version`].
    pub fn build(&self) -> Result<Version> {
        if self.sources.is_empty() {
            return Err(CompilerError::MissingField {
                field: "source_files",
            });
        }
        let compiler = self
            .compiler
            .clone()
            .ok_or(CompilerError::MissingField { field: "compiler" })?;
        if self.entry_points.is_empty() {
            return Err(CompilerError::MissingField {
                field: "entry_point",
            });
        }

        let all_options: Vec<CompileOption> = self
            .base_options
            .iter()
            .chain(&self.options)
            .cloned()
            .collect();
        let request = BuildRequest::new(
            self.sources.clone(),
            self.include_dirs.clone(),
            merge_options(&all_options),
            self.entry_points.clone(),
        );

        let version = Version::new(request, compiler, self.label.clone(), self.autoremove_files);
        log::debug!("Built {} ({} sources)", version, version.request().sources().len());
        Ok(version)
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("compiler", &self.compiler.as_ref().map(|c| c.id().to_string()))
            .field("sources", &self.sources)
            .field("include_dirs", &self.include_dirs)
            .field("base_options", &self.base_options)
            .field("options", &self.options)
            .field("entry_points", &self.entry_points)
            .field("label", &self.label)
            .field("autoremove_files", &self.autoremove_files)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::testing::ScriptedCompiler;
    use crate::option::{make_keyed_option, make_option};
    use tempfile::TempDir;

    fn scripted(dir: &TempDir) -> Arc<dyn Compiler> {
        Arc::new(ScriptedCompiler::new(dir.path()))
    }

    fn missing_field(builder: &Builder) -> &'static str {
        match builder.build() {
            Err(CompilerError::MissingField { field }) => field,
            other => panic!("expected MissingField, got {:?}", other.map(|v| v.id())),
        }
    }

    #[test]
    fn test_build_reports_missing_fields_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let mut builder = Builder::new();
        assert_eq!(missing_field(&builder), "source_files");

        builder.add_source_file("k.c");
        assert_eq!(missing_field(&builder), "compiler");

        builder.compiler(scripted(&temp_dir));
        assert_eq!(missing_field(&builder), "entry_point");

        builder.entry_point("main");
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_built_version_is_isolated_from_later_changes() {
        let temp_dir = TempDir::new().unwrap();
        let mut builder = Builder::new();
        builder
            .compiler(scripted(&temp_dir))
            .add_source_file("k.c")
            .add_include_dir("inc")
            .add_option(make_option("-DN=4"))
            .entry_point("main");
        let version = builder.build().unwrap();

        builder
            .add_source_file("extra.c")
            .add_include_dir("other")
            .options(vec![make_option("-DN=8")])
            .entry_point("kernel");

        let request = version.request();
        assert_eq!(request.sources(), &[PathBuf::from("k.c")]);
        assert_eq!(request.include_args(), vec!["-Iinc"]);
        assert_eq!(request.option_args(), vec!["-DN=4"]);
        assert_eq!(version.entry_point(), "main");
    }

    #[test]
    fn test_options_replace_and_add_option_appends() {
        let temp_dir = TempDir::new().unwrap();
        let mut builder = Builder::new();
        builder
            .compiler(scripted(&temp_dir))
            .add_source_file("k.c")
            .entry_point("main")
            .options(vec![make_option("-Wall")])
            .options(vec![make_option("-O2")])
            .add_option(make_option("-DX"));

        let version = builder.build().unwrap();
        assert_eq!(version.request().option_args(), vec!["-O2", "-DX"]);
    }

    #[test]
    fn test_per_configuration_options_override_base() {
        let temp_dir = TempDir::new().unwrap();
        let mut builder = Builder::new();
        builder
            .compiler(scripted(&temp_dir))
            .add_source_file("k.c")
            .entry_point("main")
            .base_options(vec![CompileOption::optimization(0), make_option("-Wall")])
            .add_option(CompileOption::optimization(3))
            .add_option(make_keyed_option("dataset", "-D", "MINI_DATASET"));

        let version = builder.build().unwrap();
        assert_eq!(
            version.request().option_args(),
            vec!["-O3", "-Wall", "-DMINI_DATASET"]
        );
    }

    #[test]
    fn test_entry_point_replaces_and_add_entry_point_appends() {
        let temp_dir = TempDir::new().unwrap();
        let mut builder = Builder::new();
        builder
            .compiler(scripted(&temp_dir))
            .add_source_file("k.c")
            .entry_point("first")
            .entry_point("main")
            .add_entry_point("kernel_init");

        let version = builder.build().unwrap();
        assert_eq!(version.request().entry_points(), &["main", "kernel_init"]);
        assert_eq!(version.entry_point(), "main");
    }

    #[test]
    fn test_reset_with_default_policy() {
        let temp_dir = TempDir::new().unwrap();
        let mut builder = Builder::new();
        builder
            .compiler(scripted(&temp_dir))
            .add_source_file("k.c")
            .add_include_dir("inc")
            .base_options(vec![make_option("-Wall")])
            .add_option(make_option("-DX"))
            .entry_point("main")
            .label("gemm")
            .autoremove_files(true);

        builder.reset();
        assert_eq!(missing_field(&builder), "source_files");

        builder.add_source_file("k2.c");
        assert_eq!(missing_field(&builder), "entry_point");

        builder.entry_point("main");
        let version = builder.build().unwrap();
        assert_eq!(version.request().option_args(), vec!["-Wall"]);
        assert!(version.request().include_dirs().is_empty());
        assert!(version.label().is_none());
        assert!(version.autoremove_files());
    }

    #[test]
    fn test_reset_with_explicit_policies() {
        let temp_dir = TempDir::new().unwrap();
        let mut builder = Builder::new();
        builder
            .retain(RetainPolicy::everything())
            .compiler(scripted(&temp_dir))
            .add_source_file("k.c")
            .add_include_dir("inc")
            .entry_point("main")
            .label("gemm");

        builder.reset().add_source_file("k2.c");
        let version = builder.build().unwrap();
        assert_eq!(version.label(), Some("gemm"));
        assert_eq!(version.request().include_args(), vec!["-Iinc"]);

        builder.retain(RetainPolicy::nothing()).reset();
        builder.add_source_file("k3.c").entry_point("main");
        assert_eq!(missing_field(&builder), "compiler");
    }
}
