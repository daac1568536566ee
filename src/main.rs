use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ledger_harness::config::HarnessConfig;
use ledger_harness::keys::generate_key_pair;
use ledger_harness::scenario;
use ledger_harness::scenarios::{self, SCENARIO_NAMES};

#[derive(Parser)]
#[command(author, version, about = "Multi-node ledger cluster test harness")]
struct Cli {
    /// Harness configuration file; defaults apply when it does not exist
    #[arg(short, long, global = true, default_value = "config/harness.toml")]
    config: PathBuf,

    /// Enable debug logging for the harness
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(flatten)]
    run: RunFlags,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the `[run]` section of the configuration.
#[derive(Args, Default)]
struct RunFlags {
    /// Keep the work directory even after a successful run
    #[arg(long, global = true)]
    keep_logs: bool,
    /// Leave nodes and the wallet daemon running after the scenario
    #[arg(long, global = true)]
    leave_running: bool,
    /// Kill stray node and wallet processes before and after the run
    #[arg(long, global = true)]
    clean_run: bool,
    /// Dump node stderr tails when the scenario fails
    #[arg(long, global = true)]
    dump_error_details: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one built-in scenario
    Run {
        /// Scenario name, see `list`
        scenario: String,
    },
    /// List built-in scenarios
    List,
    /// Write the default configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/harness.toml")]
        path: PathBuf,
    },
    /// Print freshly generated key pairs
    Keygen {
        #[arg(default_value_t = 1)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { scenario } => run_scenario(&cli.config, &cli.run, &scenario).await,
        Commands::List => {
            for name in SCENARIO_NAMES {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::GenerateConfig { path } => {
            HarnessConfig::default().save(&path)?;
            info!(?path, "wrote default configuration");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Keygen { count } => {
            for _ in 0..count {
                let pair = generate_key_pair();
                println!("Public key: {}", pair.public_key);
                println!("Private key: {}", pair.private_key.unwrap_or_default());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_scenario(config_path: &Path, flags: &RunFlags, name: &str) -> Result<ExitCode> {
    let mut config = if config_path.exists() {
        HarnessConfig::load(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        HarnessConfig::default()
    };
    config.run.keep_logs |= flags.keep_logs;
    config.run.leave_running |= flags.leave_running;
    config.run.clean_run |= flags.clean_run;
    config.run.dump_error_details |= flags.dump_error_details;

    let scenario = scenarios::by_name(name, &config).ok_or_else(|| {
        anyhow!("unknown scenario {name:?}, expected one of {}", SCENARIO_NAMES.join(", "))
    })?;
    let verdict = scenario::execute(scenario.as_ref(), config).await;
    println!("{verdict}");
    Ok(ExitCode::from(verdict.exit_code() as u8))
}
