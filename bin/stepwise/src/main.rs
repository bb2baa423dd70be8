mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stepwise_core::config::BrowserProfile;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Run natural-language browser tests", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ~/.stepwise/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Run one test case against a URL
    Run {
        /// Starting URL
        #[arg(short, long)]
        url: String,

        /// Test steps, one instruction per line
        #[arg(short, long, conflicts_with = "steps_file", required_unless_present = "steps_file")]
        steps: Option<String>,

        /// Read test steps from a file
        #[arg(long)]
        steps_file: Option<PathBuf>,

        /// Show the browser window
        #[arg(long)]
        headed: bool,

        /// Browser preset: debug, test, production or mobile
        #[arg(long)]
        profile: Option<BrowserProfile>,

        /// Print the full case result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the semantic snapshot of an HTML file
    Snapshot {
        /// HTML file to summarize
        file: PathBuf,

        /// Keep hidden elements, marked `visible: false`
        #[arg(long)]
        include_hidden: bool,
    },

    /// Check whether a command is allowed and how it parses
    Check {
        /// Command text, e.g. "page.get_by_role('button', name='Save').click()"
        command: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    // Logs go to stderr so `--json` output stays parseable.
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(cli.config, force).await?;
        }
        Commands::Run {
            url,
            steps,
            steps_file,
            headed,
            profile,
            json,
        } => {
            let passed = commands::run_cmd::run(cli.config, &url, steps, steps_file, headed, profile, json).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Snapshot { file, include_hidden } => {
            commands::snapshot_cmd::run(&file, include_hidden).await?;
        }
        Commands::Check { command } => {
            commands::check_cmd::run(cli.config, &command).await?;
        }
    }

    Ok(())
}
