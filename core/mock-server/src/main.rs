//! CaptureMock server entrypoint.
//!
//! A single-process, single-threaded service that answers intercepted
//! commands, function calls and socket traffic from a replay script, or
//! forwards them to the real world and records what happened.
//!
//! The listening address is printed on stdout once bound; all diagnostics go
//! to stderr.

use capturemock_core::config::default_rc_path;
use capturemock_core::script;
use capturemock_core::{
    Engine, FunctionRegistry, Mode, RcConfig, RecordLog, ReplayItems, COMMAND_LINE_SECTION,
    FUNCTIONS_SECTION, GENERAL_SECTION,
};
use clap::Parser;
use fs_err as fs;
use std::env;
use std::io::Write;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod dispatcher;

use dispatcher::Dispatcher;

const DEBUG_ENV: &str = "CAPTUREMOCK_DEBUG_LOG";
const AUTO_REPLAY_ITEMS: &str = "auto";

#[derive(Parser, Debug)]
#[command(name = "capturemock-server")]
#[command(about = "Record/replay mock server for intercepted traffic")]
#[command(version)]
struct Cli {
    /// Script to replay responses from
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// File to record forwarded traffic into
    #[arg(long, value_name = "FILE")]
    record: Option<PathBuf>,

    /// Comma-separated intercepts to replay (everything else is recorded), or
    /// "auto" to take those configured intercepts that occur in the replay file
    #[arg(long, value_name = "ITEMS")]
    replay_items: Option<String>,

    /// Comma-separated rc files, later files overriding earlier ones
    #[arg(long, value_name = "FILES", value_delimiter = ',')]
    rcfiles: Vec<PathBuf>,

    /// replay, record or mixed (defaults to what --replay/--record imply)
    #[arg(long)]
    mode: Option<Mode>,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:0")]
    address: String,

    /// Write request numbers into the record file
    #[arg(long)]
    number_requests: bool,

    /// Real server for raw client socket traffic
    #[arg(long, value_name = "HOST:PORT")]
    destination: Option<String>,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let engine = match build_engine(&cli) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "Failed to start mock server");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&cli.address) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, address = %cli.address, "Failed to bind mock server");
            std::process::exit(1);
        }
    };

    let address = match listener.local_addr() {
        Ok(address) => address,
        Err(err) => {
            error!(error = %err, "Failed to resolve listening address");
            std::process::exit(1);
        }
    };
    if let Err(err) = announce(&address.to_string()) {
        error!(error = %err, "Failed to report listening address");
        std::process::exit(1);
    }
    info!(address = %address, mode = ?engine.mode(), "CaptureMock server started");

    let mut dispatcher = Dispatcher::new(listener, engine);
    if let Err(err) = dispatcher.run() {
        error!(error = %err, "Mock server stopped unexpectedly");
        std::process::exit(1);
    }
    info!(
        served = dispatcher.served(),
        recorded = dispatcher.engine().recorded(),
        "CaptureMock server terminated"
    );
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn announce(address: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", address)?;
    stdout.flush()
}

fn build_engine(cli: &Cli) -> Result<Engine, String> {
    let config = RcConfig::load(&cli.rcfiles)?;
    let mode = resolve_mode(cli, &config)?;

    let blocks = match &cli.replay {
        Some(path) if path.exists() => script::load(path)?,
        Some(path) => {
            info!(path = %path.display(), "Replay file not found; nothing to replay");
            Vec::new()
        }
        None => Vec::new(),
    };

    let record = match &cli.record {
        Some(path) => RecordLog::create(path, cli.number_requests)?,
        None => RecordLog::disabled(),
    };

    let items = replay_items(cli, &config)?;

    Ok(Engine::new(config, mode, blocks, record)?
        .with_functions(FunctionRegistry::with_builtins())
        .with_destination(cli.destination.clone())
        .with_replay_items(items))
}

/// The command line wins, then `[general] mode`, then whatever the supplied
/// script files imply.
fn resolve_mode(cli: &Cli, config: &RcConfig) -> Result<Mode, String> {
    if let Some(mode) = cli.mode {
        return Ok(mode);
    }
    if let Some(mode) = config.get_mode(&[GENERAL_SECTION])? {
        return Ok(mode);
    }
    Ok(Mode::from_files(cli.replay.is_some(), cli.record.is_some()))
}

fn replay_items(cli: &Cli, config: &RcConfig) -> Result<ReplayItems, String> {
    let Some(items) = cli.replay_items.as_deref() else {
        return Ok(ReplayItems::default());
    };
    if items.trim() != AUTO_REPLAY_ITEMS {
        return Ok(ReplayItems::new(
            items
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
        ));
    }

    let Some(path) = cli.replay.as_deref().filter(|path| path.exists()) else {
        return Ok(ReplayItems::default());
    };
    auto_replay_items(path, config)
}

fn auto_replay_items(path: &Path, config: &RcConfig) -> Result<ReplayItems, String> {
    let text = fs::read_to_string(path).map_err(|err| err.to_string())?;
    let items = ReplayItems::from_script(
        &config.get_intercepts(COMMAND_LINE_SECTION),
        &config.get_intercepts(FUNCTIONS_SECTION),
        text.lines(),
    )?;
    info!(items = ?items.items(), "Derived replay items from replay file");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("capturemock-server").chain(args.iter().copied()))
    }

    #[test]
    fn mode_follows_supplied_files() {
        let config = RcConfig::empty();
        assert_eq!(
            resolve_mode(&cli(&["--replay", "a"]), &config).unwrap(),
            Mode::ReplayOnly
        );
        assert_eq!(
            resolve_mode(&cli(&["--record", "b"]), &config).unwrap(),
            Mode::RecordOnly
        );
        assert_eq!(
            resolve_mode(&cli(&["--replay", "a", "--record", "b"]), &config).unwrap(),
            Mode::ReplayOldRecordNew
        );
    }

    #[test]
    fn explicit_mode_beats_rc_general_mode() {
        let config = RcConfig::parse("[general]\nmode = record\n", Path::new("rc")).unwrap();
        assert_eq!(
            resolve_mode(&cli(&["--replay", "a"]), &config).unwrap(),
            Mode::RecordOnly
        );
        assert_eq!(
            resolve_mode(&cli(&["--replay", "a", "--mode", "replay"]), &config).unwrap(),
            Mode::ReplayOnly
        );
    }

    #[test]
    fn rcfiles_are_comma_separated() {
        let parsed = cli(&["--rcfiles", "one.rc,two.rc"]);
        assert_eq!(
            parsed.rcfiles,
            vec![PathBuf::from("one.rc"), PathBuf::from("two.rc")]
        );
    }

    #[test]
    fn explicit_replay_items_are_split() {
        let parsed = cli(&["--replay-items", "ls, clock.now"]);
        let items = replay_items(&parsed, &RcConfig::empty()).unwrap();
        assert_eq!(items.items(), ["ls".to_string(), "clock.now".to_string()]);
    }

    #[test]
    fn auto_replay_items_come_from_replay_file() {
        let dir = tempfile::tempdir().unwrap();
        let replay = dir.path().join("replay.txt");
        std::fs::write(&replay, "<-CMD:['/usr/bin/ls','-l']\n->OUT:x\n").unwrap();
        let config = RcConfig::parse(
            "[command line]\nintercepts = ls, cat\n",
            Path::new("rc"),
        )
        .unwrap();
        let replay_arg = replay.to_string_lossy().into_owned();
        let parsed = cli(&["--replay", &replay_arg, "--replay-items", "auto"]);
        let items = replay_items(&parsed, &config).unwrap();
        assert_eq!(items.items(), ["ls".to_string()]);
    }
}
