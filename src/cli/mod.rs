// FILE: src/cli/mod.rs

pub mod config;
mod handlers;

pub use handlers::{invoke_main, invoke_main_without_args, parse_define, sweep, SweepSummary};

use crate::compiler::{BackendKind, CompilerSettings};
use crate::error::Result;
use crate::option::{make_option, CompileOption};
use clap::{Arg, ArgAction, Command, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Backend {
    System,
    Tcc,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::System => BackendKind::System,
            Backend::Tcc => BackendKind::Tcc,
        }
    }
}

/// Work directory used when neither the config file nor `--work-dir` names one.
pub const DEFAULT_WORK_DIR: &str = "vcomp-build";

pub struct Cli {
    config: config::ConfigFile,
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}

impl Cli {
    pub fn new() -> Self {
        Self {
            config: config::ConfigFile::default(),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let matches = self.build_cli().get_matches();

        if let Some(config_path) = matches.get_one::<String>("config") {
            self.config = config::load(config_path)?;
        }

        self.setup_logging(matches.get_count("verbose"));

        match matches.subcommand() {
            Some(("run", sub_matches)) => handlers::handle_run_command(self, sub_matches),
            Some(("sweep", sub_matches)) => handlers::handle_sweep_command(self, sub_matches),
            _ => {
                println!("No subcommand specified. Use --help for usage information.");
                Ok(())
            }
        }
    }

    fn build_cli(&self) -> Command {
        let backend_args = [
            Arg::new("backend").long("backend").value_parser(clap::value_parser!(Backend)).help("Compiler backend"),
            Arg::new("cc").long("cc").value_name("PROGRAM").help("System compiler executable"),
            Arg::new("work-dir").long("work-dir").value_name("DIR").help("Directory for artifacts and logs"),
            Arg::new("timeout").long("timeout").value_name("SECS").value_parser(clap::value_parser!(u64)).help("Kill a compilation after SECS seconds"),
            Arg::new("log-file").long("log-file").value_name("FILE").help("Backend-wide compilation log"),
            Arg::new("purge").long("purge").help("Delete artifacts when they are folded").action(ArgAction::SetTrue),
        ];

        Command::new(crate::NAME)
            .version(crate::VERSION)
            .about(crate::DESCRIPTION)
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path (.toml or .json)")
                    .action(ArgAction::Set),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .help("Increase verbosity (can be used multiple times)")
                    .action(ArgAction::Count),
            )
            .subcommand(
                Command::new("run")
                    .about("Compile C sources, call their entry point and fold them")
                    .arg(Arg::new("sources").help("C source files").required(true).num_args(1..).action(ArgAction::Append))
                    .arg(Arg::new("entry").short('e').long("entry").value_name("SYMBOL").default_value("main").help("Entry point, called as main(argc, argv)"))
                    .arg(Arg::new("include").short('I').long("include").value_name("DIR").help("Add include directory").action(ArgAction::Append))
                    .arg(Arg::new("define").short('D').long("define").value_name("NAME[=VALUE]").help("Define a preprocessor macro").action(ArgAction::Append))
                    .arg(Arg::new("opt-level").short('O').long("opt-level").value_name("LEVEL").help("Optimization level"))
                    .arg(Arg::new("flag").short('f').long("flag").value_name("FLAG").help("Raw compiler flag").allow_hyphen_values(true).action(ArgAction::Append))
                    .arg(Arg::new("label").long("label").value_name("LABEL").help("Human-readable artifact name"))
                    .arg(Arg::new("watch").short('w').long("watch").help("Recompile and rerun when a source changes").action(ArgAction::SetTrue))
                    .arg(Arg::new("args").help("Arguments passed to the entry point").last(true).num_args(0..))
                    .args(backend_args.clone()),
            )
            .subcommand(
                Command::new("sweep")
                    .about("Compile, run and fold every variant of a kernel catalog")
                    .arg(Arg::new("catalog").help("Catalog file (.toml or .json)").required(true).index(1))
                    .arg(Arg::new("strict").long("strict").help("Exit with an error if any variant fails").action(ArgAction::SetTrue))
                    .args(backend_args),
            )
    }

    fn setup_logging(&self, verbose_count: u8) {
        let log_level = match verbose_count {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        env_logger::Builder::from_default_env()
            .filter_level(log_level)
            .format_timestamp_secs()
            .init();
    }

    /// Backend settings: built-in defaults, then the config file, then flags.
    pub fn compiler_settings(&self, matches: &clap::ArgMatches) -> CompilerSettings {
        let mut settings = CompilerSettings {
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            ..CompilerSettings::default()
        };
        self.config.apply_to(&mut settings);

        if let Some(backend) = matches.get_one::<Backend>("backend") {
            settings.backend = (*backend).into();
        }
        if let Some(cc) = matches.get_one::<String>("cc") {
            settings.executable = cc.clone();
        }
        if let Some(work_dir) = matches.get_one::<String>("work-dir") {
            settings.work_dir = PathBuf::from(work_dir);
        }
        if let Some(timeout) = matches.get_one::<u64>("timeout") {
            settings.timeout_secs = Some(*timeout);
        }
        if let Some(log_file) = matches.get_one::<String>("log-file") {
            settings.log_file = Some(PathBuf::from(log_file));
        }
        if matches.get_flag("purge") {
            settings.purge_on_fold = true;
        }
        settings
    }

    /// Options shared by every version: config-file flags.
    pub fn base_options(&self) -> Vec<CompileOption> {
        self.config.base_options()
    }

    pub fn include_directories(&self) -> Vec<PathBuf> {
        self.config.include_directories.clone().unwrap_or_default()
    }

    /// Per-invocation options of `run`, in command-line order: -O, -D, -f.
    pub fn run_options(&self, matches: &clap::ArgMatches) -> Result<Vec<CompileOption>> {
        let mut options = Vec::new();
        if let Some(level) = matches.get_one::<String>("opt-level") {
            options.push(CompileOption::optimization(level));
        }
        for define in matches.get_many::<String>("define").into_iter().flatten() {
            options.push(parse_define(define)?);
        }
        for flag in matches.get_many::<String>("flag").into_iter().flatten() {
            options.push(make_option(flag.as_str()));
        }
        Ok(options)
    }
}
