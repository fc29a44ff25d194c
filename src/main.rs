//! vcomp binary

use std::process;
use vcomp::cli::Cli;

fn main() {
    let mut cli = Cli::new();
    if let Err(e) = cli.run() {
        eprintln!("❌ {}", e);
        process::exit(1);
    }
}
