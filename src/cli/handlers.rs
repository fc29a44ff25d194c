// FILE: src/cli/handlers.rs
use super::config::{self, Catalog};
use super::Cli;
use crate::builder::Builder;
use crate::compiler::{create_compiler, Compiler};
use crate::error::{CompilerError, Result};
use crate::option::CompileOption;
use crate::version::Version;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::{Duration, Instant};

type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char) -> c_int;

/// Quiet period after a change before recompiling, so editors' multi-step saves settle.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Parse `NAME` or `NAME=VALUE` into a `-D` option.
///
/// Valued defines are keyed by the macro name, so a later `-DN=8` replaces `-DN=4`.
pub fn parse_define(define: &str) -> Result<CompileOption> {
    let (name, value) = match define.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (define, None),
    };
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(CompilerError::InvalidFormat {
            message: format!("Invalid define: '{}'. Use NAME or NAME=VALUE format.", define),
        });
    }
    Ok(match value {
        Some(value) => CompileOption::define_value(name, value),
        None => CompileOption::define(name),
    })
}

/// Resolve the primary entry point of `version` as `main(argc, argv)` and call it.
///
/// `argv[0]` is the version's label (or entry point name), followed by `args`.
/// Returns `None` when the symbol cannot be resolved.
pub fn invoke_main(version: &Version, args: &[String]) -> Result<Option<c_int>> {
    let program = version.label().unwrap_or(version.entry_point()).to_string();
    let owned: Vec<CString> = std::iter::once(program)
        .chain(args.iter().cloned())
        .map(|arg| {
            CString::new(arg).map_err(|e| CompilerError::InvalidFormat {
                message: format!("Argument contains a NUL byte: {}", e),
            })
        })
        .collect::<Result<_>>()?;
    let mut argv: Vec<*mut c_char> = owned.iter().map(|a| a.as_ptr() as *mut c_char).collect();
    argv.push(std::ptr::null_mut());
    Ok(call_main(version, &mut argv))
}

/// Call the entry point as `main(0, argv)` with an empty, NULL-terminated `argv`.
pub fn invoke_main_without_args(version: &Version) -> Option<c_int> {
    let mut argv: Vec<*mut c_char> = vec![std::ptr::null_mut()];
    call_main(version, &mut argv)
}

/// `argv` must end with a NULL pointer; `argc` excludes it.
fn call_main(version: &Version, argv: &mut [*mut c_char]) -> Option<c_int> {
    let argc = argv.len().saturating_sub(1) as c_int;
    version.with_symbol(|symbol| {
        let main: MainFn = unsafe { symbol.cast() };
        unsafe { main(argc, argv.as_mut_ptr()) }
    })
}

// --- RUN ---
pub fn handle_run_command(cli: &Cli, matches: &clap::ArgMatches) -> Result<()> {
    let settings = cli.compiler_settings(matches);
    let compiler = create_compiler(&settings)?;

    let sources: Vec<PathBuf> = matches
        .get_many::<String>("sources")
        .into_iter()
        .flatten()
        .map(PathBuf::from)
        .collect();
    let trailing: Vec<String> = matches
        .get_many::<String>("args")
        .into_iter()
        .flatten()
        .cloned()
        .collect();

    let mut builder = Builder::new();
    builder
        .compiler(compiler)
        .base_options(cli.base_options())
        .options(cli.run_options(matches)?);
    for source in &sources {
        builder.add_source_file(source);
    }
    for dir in cli
        .include_directories()
        .into_iter()
        .chain(matches.get_many::<String>("include").into_iter().flatten().map(PathBuf::from))
    {
        builder.add_include_dir(dir);
    }
    if let Some(entry) = matches.get_one::<String>("entry") {
        builder.entry_point(entry.as_str());
    }
    if let Some(label) = matches.get_one::<String>("label") {
        builder.label(label.as_str());
    }

    if matches.get_flag("watch") {
        watch_and_run(&builder, &sources, &trailing)
    } else {
        let version = builder.build()?;
        run_once(&version, &trailing)
    }
}

fn run_once(version: &Version, args: &[String]) -> Result<()> {
    println!("🔨 Compiling {}", version);
    let compile_start = Instant::now();
    if !version.compile() {
        if let Some(diagnostics) = version.diagnostics() {
            eprint!("{}", diagnostics);
        }
        let log = version.log_path().unwrap_or_default();
        return Err(CompilerError::compile_failed(
            version.compiler().id(),
            &log,
            format!("{} did not compile", version),
        ));
    }
    log::info!("Compiled {} in {}ms", version, compile_start.elapsed().as_millis());

    let outcome = invoke_main(version, args)?;
    version.fold();
    match outcome {
        Some(code) => {
            println!("✅ {} returned {}", version.entry_point(), code);
            Ok(())
        }
        None => Err(CompilerError::load(
            version.artifact().map(|a| a.path).unwrap_or_default(),
            format!("entry point '{}' not found", version.entry_point()),
        )),
    }
}

fn watch_and_run(builder: &Builder, sources: &[PathBuf], args: &[String]) -> Result<()> {
    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.send(event);
                }
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| {
        CompilerError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Failed to create file watcher: {}", e),
        ))
    })?;

    for source in sources {
        watcher
            .watch(Path::new(source), RecursiveMode::NonRecursive)
            .map_err(|e| {
                CompilerError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("Failed to watch {}: {}", source.display(), e),
                ))
            })?;
    }
    println!("👀 Watching {} source file(s) for changes...", sources.len());

    // Each round builds a fresh version: edited sources give a new fingerprint.
    let mut current = builder.build()?;
    if let Err(e) = run_once(&current, args) {
        eprintln!("❌ {}", e);
    }

    while rx.recv().is_ok() {
        std::thread::sleep(WATCH_DEBOUNCE);
        while rx.try_recv().is_ok() {}

        println!("🔄 Source changed, recompiling...");
        current = builder.build()?;
        if let Err(e) = run_once(&current, args) {
            eprintln!("❌ {}", e);
        }
    }

    Ok(())
}

// --- SWEEP ---

/// Outcome of a sweep over a catalog.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    /// Labels and return codes of variants that compiled and ran.
    pub succeeded: Vec<(String, i32)>,
    /// Labels of variants that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl SweepSummary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Compile, run and fold every variant of every kernel in `catalog`.
///
/// One builder is reused across variants; failures are logged and skipped.
pub fn sweep(
    catalog: &Catalog,
    compiler: Arc<dyn Compiler>,
    base_options: Vec<CompileOption>,
) -> SweepSummary {
    let mut summary = SweepSummary::default();
    let mut builder = Builder::new();
    builder
        .compiler(compiler)
        .base_options(base_options.into_iter().chain(catalog.common_options()).collect());

    for kernel in &catalog.kernels {
        for variant in kernel.variants(&catalog.axes) {
            builder.reset();
            for source in &kernel.sources {
                builder.add_source_file(source);
            }
            for dir in &kernel.include_dirs {
                builder.add_include_dir(dir);
            }
            builder
                .entry_point(kernel.entry_point.as_str())
                .options(variant.options.clone())
                .label(variant.label.as_str());

            match sweep_one(&builder) {
                Ok(code) => {
                    log::info!("{}: returned {}", variant.label, code);
                    summary.succeeded.push((variant.label, code));
                }
                Err(reason) => {
                    log::warn!("{}: {}", variant.label, reason);
                    summary.failed.push((variant.label, reason));
                }
            }
        }
    }

    summary
}

fn sweep_one(builder: &Builder) -> std::result::Result<i32, String> {
    let version = builder.build().map_err(|e| e.to_string())?;
    if !version.compile() {
        return Err(format!(
            "compilation failed (see {})",
            version.log_path().unwrap_or_default().display()
        ));
    }
    let code = invoke_main_without_args(&version);
    version.fold();
    code.ok_or_else(|| format!("entry point '{}' not found", version.entry_point()))
}

pub fn handle_sweep_command(cli: &Cli, matches: &clap::ArgMatches) -> Result<()> {
    let catalog_path = matches
        .get_one::<String>("catalog")
        .ok_or(CompilerError::MissingField { field: "catalog" })?;
    let catalog = config::load_catalog(Path::new(catalog_path))?;
    let compiler = create_compiler(&cli.compiler_settings(matches))?;

    println!("🔨 Sweeping {} variants of {} kernels", catalog.variant_count(), catalog.kernels.len());
    let summary = sweep(&catalog, compiler.clone(), cli.base_options());
    compiler.teardown();

    println!("\n📊 Sweep Summary:");
    println!("   Succeeded: {}", summary.succeeded.len());
    println!("   Failed: {}", summary.failed.len());
    for (label, reason) in &summary.failed {
        println!("   ❌ {}: {}", label, reason);
    }

    if matches.get_flag("strict") && !summary.failed.is_empty() {
        return Err(CompilerError::VariantsFailed {
            failed: summary.failed.len(),
            total: summary.total(),
        });
    }
    Ok(())
}
