use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use rust_decimal::Decimal;
use solbasket::core::log::init_logging;
use solbasket::core::tax::LotMethod;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl From<Commands> for solbasket::AppCommand {
    fn from(cmd: Commands) -> solbasket::AppCommand {
        match cmd {
            Commands::Quotes { json } => solbasket::AppCommand::Quotes { json },
            Commands::Rebalance => solbasket::AppCommand::Rebalance,
            Commands::Lots => solbasket::AppCommand::Lots,
            Commands::Tax {
                asset,
                quantity,
                method,
            } => solbasket::AppCommand::Tax {
                asset,
                quantity,
                method,
            },
            Commands::Setup => unreachable!("Setup command should be handled separately"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Show live quotes with cache and provider health
    Quotes {
        /// Print the quotes and health report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check guardrails and simulate a rebalance with its tax impact
    Rebalance,
    /// Show lot status and tax-loss harvesting candidates
    Lots,
    /// Simulate selling a quantity of one asset
    Tax {
        /// Asset symbol, e.g. SOL
        #[arg(short, long)]
        asset: String,
        /// Quantity to sell
        #[arg(short, long)]
        quantity: Decimal,
        /// fifo, lifo, hifo or id:<lot>,<lot>
        #[arg(short, long)]
        method: Option<LotMethod>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => match cli.config_path.as_deref() {
            Some(path) => solbasket::cli::setup::setup_at_path(path),
            None => solbasket::cli::setup::setup(),
        },
        Some(cmd) => solbasket::run_command(cmd.into(), cli.config_path.as_deref()).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}
