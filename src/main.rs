//! datamove - script-driven record mover
//!
//! Moves records of several related entities from a source endpoint to a
//! target endpoint, keeping lookups between them intact.
//!
//! # Usage
//!
//! ```bash
//! # Copy the objects of ./export.json from the `prod` endpoint to CSV files
//! datamove run --sourceusername prod --targetusername csvfile --path .
//! ```

use tracing::{Level, warn};

use datamove::cli::{CliInterface, Commands};
use datamove::error::{ErrorReport, Result};
use datamove::pipeline::{Pipeline, RunContext};

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        match ErrorReport::from_error(&e).to_json_pretty() {
            Ok(report) => eprintln!("{}", report),
            Err(_) => eprintln!("Error: {}", e),
        }
        std::process::exit(1);
    }
}

/// Main application logic
///
/// 1. Parse command-line arguments
/// 2. Load configuration
/// 3. Initialize logging
/// 4. Handle subcommands or run the script
async fn run() -> Result<()> {
    let cli = CliInterface::new()?;

    initialize_logging(&cli);

    if cli.handle_subcommand()? {
        return Ok(());
    }

    let Commands::Run(run_args) = &cli.args().command else {
        return Ok(());
    };
    cli.validate_run_args(run_args)?;

    let source = cli.resolve_endpoint(&run_args.source_username, &run_args.path).await?;
    let target = cli.resolve_endpoint(&run_args.target_username, &run_args.path).await?;

    let context = RunContext::new(cli.config().clone(), &run_args.path).with_progress(!cli.args().quiet);
    let mut pipeline = Pipeline::new(context, source, target);
    let summary = pipeline.run().await?;

    if summary.failed() > 0 {
        warn!("{} records failed to write; see the status files", summary.failed());
    }
    if !cli.args().quiet {
        println!("{}", summary.to_json()?);
    }
    Ok(())
}

/// Initialize logging system based on verbosity level
///
/// # Arguments
/// * `cli` - CLI interface with verbosity settings
fn initialize_logging(cli: &CliInterface) {
    let level: Level = cli.config().logging.level.to_tracing_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if cli.config().logging.timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}
