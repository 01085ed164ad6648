use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rcebot")]
#[command(about = "Run allow-listed commands from Telegram", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a template config.
    Init {
        /// Config file path (default: RCEBOT_CONFIG_PATH or ~/.rcebot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the bot until SIGINT/SIGTERM. SIGUSR1 reloads the authorized users and commands.
    Run {
        /// Config file path (default: RCEBOT_CONFIG_PATH or ~/.rcebot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Ignore SIGUSR1 instead of reloading the config.
        #[arg(long)]
        no_reload: bool,

        /// Rewrite the config file in canonical form before starting.
        #[arg(long)]
        fmt_config: bool,
    },

    /// Validate the config file and exit.
    Check {
        /// Config file path (default: RCEBOT_CONFIG_PATH or ~/.rcebot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Rewrite the config file in canonical form after validating it.
        #[arg(long)]
        fmt_config: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("rcebot {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run {
            config,
            no_reload,
            fmt_config,
        }) => {
            if let Err(e) = run_bot(config, no_reload, fmt_config).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Check { config, fmt_config }) => {
            if let Err(e) = run_check(config, fmt_config) {
                log::error!("check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(rcebot::config::default_config_path);
    let dir = rcebot::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

/// Load and validate the config, optionally writing it back in canonical form.
fn load_checked(
    config_path: Option<PathBuf>,
    fmt_config: bool,
) -> anyhow::Result<(rcebot::config::Config, PathBuf)> {
    let path = config_path.unwrap_or_else(rcebot::config::default_config_path);
    rcebot::init::require_initialized(&path)?;
    let config = rcebot::config::load_config(&path)?;
    let table = rcebot::auth::AuthorizationTable::from_config(&config)?;
    log::info!(
        "config {} ok: {} user(s), {} command(s)",
        path.display(),
        table.user_count(),
        table.command_count()
    );
    if fmt_config {
        rcebot::config::save_config(&path, &config)?;
        log::info!("formatted config at {}", path.display());
    }
    Ok((config, path))
}

fn run_check(config_path: Option<PathBuf>, fmt_config: bool) -> anyhow::Result<()> {
    load_checked(config_path, fmt_config)?;
    Ok(())
}

async fn run_bot(
    config_path: Option<PathBuf>,
    no_reload: bool,
    fmt_config: bool,
) -> anyhow::Result<()> {
    let (config, path) = load_checked(config_path, fmt_config)?;
    let options = rcebot::gateway::RunOptions {
        reload_on_signal: !no_reload,
    };
    rcebot::gateway::run_gateway(config, path, options).await
}
