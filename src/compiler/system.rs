//! Out-of-process backend: spawns a system C toolchain

use super::deps::{depfile_path, parse_depfile};
use super::process::{isolate_process_group, render_command, wait_with_timeout};
use super::{ArtifactRegistry, Compiler, CompilerSettings};
use crate::error::{CompilerError, Result};
use crate::version::BuildRequest;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Flags that make the toolchain emit a loadable shared object.
pub const SHARED_OBJECT_FLAGS: [&str; 2] = ["-fPIC", "-shared"];

/// Compiles by running
/// `<executable> -fPIC -shared <options> -I<dirs> <sources> -MD -MF <out>.d -o <out>`.
///
/// The toolchain runs in its own process group so a timeout kills its workers too.
pub struct SystemCompiler {
    id: String,
    settings: CompilerSettings,
    registry: ArtifactRegistry,
}

impl SystemCompiler {
    /// `id` names this instance, `executable` is the toolchain to run.
    pub fn new(
        id: impl Into<String>,
        executable: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        log_file: Option<PathBuf>,
    ) -> Self {
        let id = id.into();
        Self::from_settings(CompilerSettings {
            id: Some(id),
            executable: executable.into(),
            work_dir: work_dir.into(),
            log_file,
            ..CompilerSettings::default()
        })
    }

    pub fn from_settings(settings: CompilerSettings) -> Self {
        let id = settings.id.clone().unwrap_or_else(|| {
            Path::new(&settings.executable)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| settings.executable.clone())
        });
        Self {
            id,
            settings,
            registry: ArtifactRegistry::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_purge_on_fold(mut self, purge: bool) -> Self {
        self.settings.purge_on_fold = purge;
        self
    }

    pub fn with_reuse_artifacts(mut self, reuse: bool) -> Self {
        self.settings.reuse_artifacts = reuse;
        self
    }

    pub fn executable(&self) -> &str {
        &self.settings.executable
    }

    fn command_for(&self, request: &BuildRequest, output: &Path) -> Command {
        let mut command = Command::new(&self.settings.executable);
        command
            .args(SHARED_OBJECT_FLAGS)
            .args(request.option_args())
            .args(request.include_args())
            .args(request.sources())
            .arg("-MD")
            .arg("-MF")
            .arg(depfile_path(output))
            .arg("-o")
            .arg(output)
            .stdin(Stdio::null());
        isolate_process_group(&mut command);
        command
    }
}

fn append_line(log: &Path, line: &str) {
    let result = OpenOptions::new()
        .append(true)
        .create(true)
        .open(log)
        .and_then(|mut file| writeln!(file, "{}", line));
    if let Err(e) = result {
        log::warn!("Could not write to {}: {}", log.display(), e);
    }
}

impl Compiler for SystemCompiler {
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
        let program = self.settings.executable.clone();
        let mut command = self.command_for(request, output);

        let mut log = File::create(log_path)?;
        writeln!(log, "$ {}", render_command(&command))?;
        log.flush()?;
        command
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));

        log::debug!("Spawning {}", render_command(&command));
        let mut child = command.spawn().map_err(|e| {
            append_line(log_path, &format!("error: cannot spawn '{}': {}", program, e));
            CompilerError::Spawn {
                program: program.clone(),
                message: e.to_string(),
            }
        })?;

        let status = match wait_with_timeout(&mut child, self.settings.timeout(), &program) {
            Ok(status) => status,
            Err(e) => {
                append_line(log_path, &format!("error: {}", e));
                return Err(e);
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(CompilerError::compile_failed(
                &self.id,
                log_path,
                format!("{} exited with {}", program, status),
            ))
        }
    }

    fn dependencies(&self, _request: &BuildRequest, output: &Path) -> Option<Vec<PathBuf>> {
        let depfile = depfile_path(output);
        match std::fs::read_to_string(&depfile) {
            Ok(text) => Some(parse_depfile(&text)),
            Err(e) => {
                log::debug!("No dependency file {}: {}", depfile.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::testing::system_cc_available;
    use crate::option::make_option;
    use crate::version::VersionState;
    use crate::Builder;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    type MainFn = unsafe extern "C" fn(i32, *mut *mut std::os::raw::c_char) -> i32;

    fn compiler_in(dir: &TempDir) -> Arc<SystemCompiler> {
        Arc::new(SystemCompiler::new(
            "test_cc",
            "cc",
            dir.path().join("work"),
            Some(dir.path().join("compilation.log")),
        ))
    }

    #[test]
    fn test_command_line_layout() {
        let compiler = SystemCompiler::new("gcc", "gcc", ".", None);
        let request = BuildRequest::new(
            vec![PathBuf::from("k.c"), PathBuf::from("util.c")],
            vec![PathBuf::from("inc")],
            vec![make_option("-O2"), make_option("-DN=4")],
            vec!["main".to_string()],
        );

        let command = compiler.command_for(&request, Path::new("out.so"));
        assert_eq!(
            render_command(&command),
            "gcc -fPIC -shared -O2 -DN=4 -Iinc k.c util.c -MD -MF out.so.d -o out.so"
        );
    }

    #[test]
    fn test_id_defaults_to_executable_name() {
        let compiler = SystemCompiler::from_settings(CompilerSettings {
            executable: "/usr/bin/clang".to_string(),
            ..CompilerSettings::default()
        });
        assert_eq!(compiler.id(), "clang");
    }

    #[test]
    fn test_main_returns_42() {
        if !system_cc_available() {
            eprintln!("skipping: no system C compiler");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("answer.c");
        fs::write(&source, "int main(int argc, char **argv) { return 42; }\n").unwrap();

        let mut builder = Builder::new();
        builder
            .compiler(compiler_in(&temp_dir))
            .add_source_file(&source)
            .entry_point("main");
        let version = builder.build().unwrap();

        assert!(version.compile());
        let symbol = version.get_symbol().expect("main should resolve");
        let main: MainFn = unsafe { symbol.cast() };
        assert_eq!(unsafe { main(0, std::ptr::null_mut()) }, 42);
        version.fold();
    }

    #[test]
    fn test_syntax_error_reports_failure_with_diagnostics() {
        if !system_cc_available() {
            eprintln!("skipping: no system C compiler");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("broken.c");
        fs::write(&source, "int main(int argc, char **argv) { return 42 }\n").unwrap();

        let compiler = compiler_in(&temp_dir);
        let mut builder = Builder::new();
        builder
            .compiler(compiler.clone())
            .add_source_file(&source)
            .entry_point("main");
        let version = builder.build().unwrap();

        assert!(!version.compile());
        assert_eq!(version.state(), VersionState::Unbuilt);
        assert!(version.get_symbol().is_none());

        let diagnostics = version.diagnostics().unwrap();
        assert!(diagnostics.lines().count() > 1, "log: {}", diagnostics);
        let combined = fs::read_to_string(temp_dir.path().join("compilation.log")).unwrap();
        assert!(combined.contains("broken.c"));
    }

    #[test]
    fn test_edited_header_is_picked_up_on_reuse() {
        if !system_cc_available() {
            eprintln!("skipping: no system C compiler");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let header = temp_dir.path().join("params.h");
        fs::write(&header, "#define ANSWER 1\n").unwrap();
        let source = temp_dir.path().join("answer.c");
        fs::write(
            &source,
            "#include \"params.h\"\nint main(int argc, char **argv) { return ANSWER; }\n",
        )
        .unwrap();

        let compiler = compiler_in(&temp_dir);
        let mut builder = Builder::new();
        builder
            .compiler(compiler)
            .add_source_file(&source)
            .entry_point("main");

        let run = |version: &crate::Version| {
            assert!(version.compile());
            version.with_symbol(|symbol| {
                let main: MainFn = unsafe { symbol.cast() };
                unsafe { main(0, std::ptr::null_mut()) }
            })
        };

        let first = builder.build().unwrap();
        assert_eq!(run(&first), Some(1));
        let manifest = fs::read_to_string(first.artifact().unwrap().manifest).unwrap();
        assert!(manifest.contains("params.h"));
        first.fold();
        drop(first);

        fs::write(&header, "#define ANSWER 2\n").unwrap();
        let second = builder.build().unwrap();
        assert_eq!(run(&second), Some(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_also_stops_driver_workers() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("late-output");
        let script = temp_dir.path().join("forking-cc");
        fs::write(
            &script,
            format!("#!/bin/sh\n(sleep 2; echo late > '{}') &\nwait\n", marker.display()),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let source = temp_dir.path().join("k.c");
        fs::write(&source, "int main(void) { return 0; }\n").unwrap();

        let compiler = Arc::new(
            SystemCompiler::new(
                "forking",
                script.to_string_lossy(),
                temp_dir.path().join("work"),
                None,
            )
            .with_timeout(Duration::from_secs(1)),
        );
        let mut builder = Builder::new();
        builder.compiler(compiler).add_source_file(&source).entry_point("main");
        let version = builder.build().unwrap();

        assert!(!version.compile());
        std::thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists(), "a worker of the killed toolchain kept running");
    }

    #[test]
    fn test_missing_toolchain_is_a_compile_failure() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("k.c");
        fs::write(&source, "int main(void) { return 0; }\n").unwrap();

        let compiler = Arc::new(SystemCompiler::new(
            "ghost",
            "/nonexistent/vcomp-ghost-cc",
            temp_dir.path(),
            None,
        ));
        let mut builder = Builder::new();
        builder.compiler(compiler).add_source_file(&source).entry_point("main");
        let version = builder.build().unwrap();

        assert!(!version.compile());
        assert!(version.diagnostics().unwrap().contains("cannot spawn"));
    }

    #[cfg(unix)]
    #[test]
    fn test_hanging_toolchain_is_killed() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("slow-cc");
        fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let source = temp_dir.path().join("k.c");
        fs::write(&source, "int main(void) { return 0; }\n").unwrap();

        let compiler = Arc::new(
            SystemCompiler::new(
                "slow",
                script.to_string_lossy(),
                temp_dir.path().join("work"),
                None,
            )
            .with_timeout(Duration::from_secs(1)),
        );
        let mut builder = Builder::new();
        builder.compiler(compiler).add_source_file(&source).entry_point("main");
        let version = builder.build().unwrap();

        let start = std::time::Instant::now();
        assert!(!version.compile());
        assert!(start.elapsed() < Duration::from_secs(20));
        assert!(version.diagnostics().unwrap().contains("killed"));

        let leftovers = fs::read_dir(temp_dir.path().join("work"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
