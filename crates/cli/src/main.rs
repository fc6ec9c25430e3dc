use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, builder::styling};
use clap_cargo::style;
use colored::Colorize;
use idn_adapters::SimNode;
use idn_flows::{FlowDeps, FlowKind};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod simulate;
mod validate;

use config::Config;

#[derive(Parser)]
#[command(author, version, long_about = None)]
#[command(about = "Inspect and simulate Idena client flows")]
#[command(styles = CLAP_STYLING)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "idena-flows.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

pub const CLAP_STYLING: styling::Styles = styling::Styles::styled()
    .header(style::HEADER)
    .usage(style::USAGE)
    .literal(style::LITERAL)
    .placeholder(style::PLACEHOLDER)
    .error(style::ERROR)
    .valid(style::VALID)
    .invalid(style::INVALID);

#[derive(Subcommand)]
enum Commands {
    /// Build every flow definition and report problems
    Validate {
        /// Show warnings
        #[arg(short, long)]
        verbose: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print the state tree of a flow
    Describe {
        /// Flow name (flip, ad, mining, invite, api-key)
        flow: FlowKind,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Run a flow end to end against a simulated node
    Simulate {
        /// Flow name (flip, ad, mining, invite, api-key)
        flow: FlowKind,

        /// Receipt polls before a transaction is mined
        #[arg(long)]
        mine_after: Option<u32>,

        /// Print the final context
        #[arg(long)]
        context: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Validate { verbose, json } => {
            let deps = FlowDeps::in_memory(Arc::new(SimNode::new()));
            let results = validate::validate_all(&deps);

            if json {
                validate::print_results_json(&results)?;
            } else {
                validate::print_results(&results, verbose);
            }

            if results.iter().any(|r| !r.success) {
                std::process::exit(1);
            }
        }
        Commands::Describe { flow, json } => {
            let deps = FlowDeps::in_memory(Arc::new(SimNode::new()));
            let outline = flow.outline(&deps)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outline)?);
            } else {
                validate::print_outline(&outline);
            }
        }
        Commands::Simulate {
            flow,
            mine_after,
            context,
            json,
        } => {
            if let Some(polls) = mine_after {
                config.simulation.mine_after = polls;
            }
            let report = simulate::run(flow, &config).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                simulate::print_report(&report, context);
            }

            if report.timed_out || report.error.is_some() {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            if !cli.config.exists() {
                eprintln!(
                    "{} {} not found, showing defaults",
                    "⚠".yellow(),
                    cli.config.display()
                );
            }
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
