//! capturemock-shim: stands in for intercepted programs.
//!
//! Invoked under any other name (through a link created by `install`) it
//! intercepts that command directly. Invoked as itself it takes a
//! subcommand:
//!
//! - `exec -- ARGV...`: intercept an explicit command line
//! - `install --dir DIR CMD...`: create intercept links
//! - `probe HOST:PORT`: check whether a mock server is listening

use capturemock_core::transport::{connect_ex, DEFAULT_PROBE_TIMEOUT};
use capturemock_shim::{command, install, logging};
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

const SHIM_NAME: &str = env!("CARGO_BIN_NAME");

#[derive(Parser)]
#[command(name = "capturemock-shim")]
#[command(about = "CaptureMock client shim")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Intercept the given command line
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<OsString>,
    },

    /// Create links that route commands through the shim
    Install {
        /// Directory to put first on PATH
        #[arg(long)]
        dir: PathBuf,

        /// Command names to intercept
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Report whether a mock server listens at HOST:PORT
    Probe {
        #[arg(value_name = "HOST:PORT")]
        address: String,
    },
}

fn main() {
    logging::init();
    let argv = lossy(std::env::args_os());

    let code = if invoked_as_shim(&argv) {
        run_cli()
    } else {
        let link_dir = argv.first().and_then(|program| command::link_dir(program));
        command::run(argv, link_dir)
    };

    logging::flush();
    std::process::exit(code);
}

/// Arguments need not be UTF-8; undecodable bytes become U+FFFD.
fn lossy(args: impl IntoIterator<Item = OsString>) -> Vec<String> {
    args.into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

fn invoked_as_shim(argv: &[String]) -> bool {
    argv.first()
        .and_then(|program| Path::new(program).file_stem())
        .map_or(true, |stem| stem == SHIM_NAME)
}

fn run_cli() -> i32 {
    match Cli::parse().command {
        Commands::Exec { argv } => command::run(lossy(argv), None),
        Commands::Install { dir, commands } => {
            let shim = match std::env::current_exe() {
                Ok(shim) => shim,
                Err(err) => {
                    tracing::error!(error = %err, "Cannot locate shim executable");
                    eprintln!("Cannot locate shim executable: {}", err);
                    return 1;
                }
            };
            match install::install(&dir, &commands, &shim) {
                Ok(installed) => {
                    for path in installed {
                        println!("{}", path.display());
                    }
                    0
                }
                Err(err) => {
                    tracing::error!(error = %err, "Install failed");
                    eprintln!("{}", err);
                    1
                }
            }
        }
        Commands::Probe { address } => {
            let code = connect_ex(&address, DEFAULT_PROBE_TIMEOUT);
            tracing::debug!(address = %address, code, "Probed mock server");
            println!("{}", code);
            i32::from(code != 0)
        }
    }
}
