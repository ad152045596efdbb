mod client;
mod server;

use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use nsmesh_core::{logging, Config};

#[derive(Parser, Debug)]
#[command(name = "nsmesh")]
#[command(about = "Network service mesh registry and connection healer", long_about = None)]
struct Cli {
    /// Configuration file (YAML); falls back to ./config.yaml when present
    #[arg(long, global = true, env = "NSMESH_CONFIG_PATH")]
    config: Option<String>,

    /// Registry address used by the client sub-commands
    #[arg(long, global = true, env = "NSMESH_ADDR", default_value = "127.0.0.1:5001")]
    addr: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the registry server (default)
    Serve(ServeArgs),
    /// Talk to a running registry
    #[command(flatten)]
    Client(client::ClientCommand),
}

/// Overrides for the core healing and probing knobs
#[derive(Args, Debug)]
struct ServeArgs {
    /// Heal failed connections instead of closing them
    #[arg(long, env = "NSMESH_HEALING_ENABLED")]
    healing_enabled: Option<bool>,

    /// Grace window between the first failed probe and healing (e.g. "5s")
    #[arg(long, env = "NSMESH_HEALING_SUSPECT_WAIT", value_parser = humantime::parse_duration)]
    healing_suspect_wait: Option<Duration>,

    /// Recovery attempts before a connection is closed
    #[arg(long, env = "NSMESH_HEALING_MAX_ATTEMPTS")]
    healing_max_attempts: Option<u32>,

    /// Interval between liveness probe rounds (e.g. "1s")
    #[arg(long, env = "NSMESH_PROBE_INTERVAL", value_parser = humantime::parse_duration)]
    probe_interval: Option<Duration>,
}

/// Bare `nsmesh` serves, still honouring the environment overrides
#[derive(Parser, Debug)]
struct DefaultServe {
    #[command(flatten)]
    args: ServeArgs,
}

impl ServeArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(enabled) = self.healing_enabled {
            config.healing.enabled = enabled;
        }
        if let Some(wait) = self.healing_suspect_wait {
            config.healing.suspect_wait_ms = millis(wait);
        }
        if let Some(max_attempts) = self.healing_max_attempts {
            config.healing.max_attempts = max_attempts;
        }
        if let Some(interval) = self.probe_interval {
            config.probe.interval_ms = millis(interval);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let path = path.map(str::to_string).or_else(|| {
        let cwd = "config.yaml";
        std::path::Path::new(cwd).exists().then(|| cwd.to_string())
    });

    if let Some(path) = &path {
        eprintln!("Loading config from {path}");
    }
    Config::load(path.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(DefaultServe::parse_from(["nsmesh"]).args));

    match command {
        Command::Serve(args) => {
            args.apply(&mut config);

            if let Err(errors) = config.validate() {
                for e in &errors {
                    eprintln!("Config validation error: {e}");
                }
                return Err(anyhow::anyhow!(
                    "Configuration validation failed with {} error(s)",
                    errors.len()
                ));
            }

            logging::init_logging(&config.logging)?;
            server::run(config).await
        }
        Command::Client(command) => client::run(&cli.addr, command).await,
    }
}
