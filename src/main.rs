// File: src/main.rs
//
// Command-line entry point for the Ember interpreter. Runs a script
// file, reads from stdin, or starts the REPL on a TTY; the `install`
// subcommand copies a source file into the per-user package store.

use clap::{Parser as ClapParser, Subcommand};
use ember::{package, repl, vm};
use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::time::Instant;

#[derive(ClapParser)]
#[command(
    name = "ember",
    about = "Ember: a lightweight embedded scripting language",
    version = env!("CARGO_PKG_VERSION"),
    disable_version_flag = true
)]
struct Cli {
    /// Script file to run; omit to start the REPL (or read stdin when
    /// not attached to a terminal)
    file: Option<PathBuf>,

    /// Mount a host directory: "virtual:host[:ro|:rw]" (repeatable)
    #[arg(long = "mount", value_name = "SPEC")]
    mounts: Vec<String>,

    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a source file into ~/.ember/packages under the given name
    Install {
        /// Package name (also the import name)
        name: String,
        /// Host path of the source file to install
        path: String,
    },
}

fn main() {
    let started = Instant::now();
    let cli = Cli::parse();
    let profile_startup = std::env::var("PROFILE_STARTUP").map(|v| v == "1").unwrap_or(false);

    if let Some(Commands::Install { name, path }) = cli.command {
        match package::install_library(&name, &path) {
            Ok(target) => {
                println!("Installed '{}' -> {}", name, target.display());
            }
            Err(err) => {
                eprintln!("{}", err.one_line());
                std::process::exit(1);
            }
        }
        return;
    }

    let mut vm = vm::Vm::new();
    for spec in &cli.mounts {
        if let Err(err) = vm.mount_spec(spec) {
            eprintln!("{}", err.one_line());
            std::process::exit(1);
        }
    }

    if profile_startup {
        eprintln!("[profile] startup: {:.3}ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    match cli.file {
        Some(file) => {
            let source = match std::fs::read_to_string(&file) {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("IO Error: failed to read '{}': {}", file.display(), err);
                    std::process::exit(1);
                }
            };
            let name = file.to_string_lossy().to_string();
            let eval_started = Instant::now();
            let result = vm.eval_file_source(&source, &name);
            if profile_startup {
                eprintln!(
                    "[profile] evaluation: {:.3}ms",
                    eval_started.elapsed().as_secs_f64() * 1000.0
                );
            }
            if let Err(err) = result {
                eprintln!("{}", err.one_line());
                std::process::exit(1);
            }
        }
        None => {
            if std::io::stdin().is_terminal() {
                match repl::Repl::new(vm) {
                    Ok(mut repl) => {
                        if let Err(err) = repl.run() {
                            eprintln!("REPL error: {}", err);
                            std::process::exit(1);
                        }
                    }
                    Err(err) => {
                        eprintln!("Failed to start REPL: {}", err);
                        std::process::exit(1);
                    }
                }
            } else {
                let mut source = String::new();
                if let Err(err) = std::io::stdin().read_to_string(&mut source) {
                    eprintln!("IO Error: failed to read stdin: {}", err);
                    std::process::exit(1);
                }
                if let Err(err) = vm.eval_file_source(&source, "<stdin>") {
                    eprintln!("{}", err.one_line());
                    std::process::exit(1);
                }
            }
        }
    }
}
