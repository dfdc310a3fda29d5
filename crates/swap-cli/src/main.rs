mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, simulate::Scenario};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "swapctl",
    about = "Inspect and exercise the swap proposal action coordinator",
    version,
    propagate_version = true
)]
struct Cli {
    /// Directory holding .swap/config.yaml (default: auto-detect from .swap/)
    #[arg(long, global = true, env = "SWAP_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a remote failure message the way the coordinator would
    Classify {
        /// Error message as reported by the remote
        message: String,

        /// Extra detail text, matched after the message
        #[arg(long)]
        detail: Option<String>,

        /// Structured error code; overrides text matching
        #[arg(long)]
        code: Option<String>,
    },

    /// Show or validate coordinator configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Replay a scripted scenario against an in-memory remote
    Simulate {
        #[arg(value_enum)]
        scenario: Scenario,

        /// Divide every configured duration by this factor
        #[arg(long, default_value_t = 1)]
        speed: u32,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Simulate { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Classify {
            message,
            detail,
            code,
        } => cmd::classify::run(&message, detail.as_deref(), code.as_deref(), cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Simulate { scenario, speed } => {
            cmd::simulate::run(&root, scenario, speed, cli.json)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
