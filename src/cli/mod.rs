//! Command-line interface for datamove
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Configuration loading and validation
//! - Endpoint resolution from `--sourceusername`/`--targetusername`

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, EndpointConfigKind, LogLevel};
use crate::endpoint::{CsvFileEndpoint, EndpointClient, EndpointKind};
use crate::error::{ConfigError, Result};

/// Endpoint name selecting the CSV files of the script directory
pub const CSV_FILE_ENDPOINT: &str = "csvfile";

/// Move related records between data stores
#[derive(Parser, Debug)]
#[command(
    name = "datamove",
    version,
    about = "Move related records between data stores",
    long_about = "Copies records of several related entities from a source endpoint to a target
endpoint, keeping lookups between them intact. Objects to move are declared in
an export.json script."
)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Quiet mode (errors only, no progress bars)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose mode (detailed logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Very verbose mode (trace logging)
    #[arg(long = "vv", global = true)]
    pub very_verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands for datamove
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the script of a directory
    Run(RunArgs),

    /// Show configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Source endpoint: a name from `[endpoints]` or `csvfile`
    #[arg(short = 's', long = "sourceusername", value_name = "NAME")]
    pub source_username: String,

    /// Target endpoint: a name from `[endpoints]` or `csvfile`
    #[arg(short = 'u', long = "targetusername", value_name = "NAME")]
    pub target_username: String,

    /// Directory holding export.json
    #[arg(short = 'p', long, value_name = "DIR", default_value = ".")]
    pub path: PathBuf,
}

/// CLI interface handler
pub struct CliInterface {
    /// Parsed command-line arguments
    args: CliArgs,

    /// Loaded configuration
    config: Config,
}

impl CliInterface {
    /// Create a new CLI interface from the process arguments
    ///
    /// # Returns
    /// * `Result<Self>` - New CLI interface or error
    pub fn new() -> Result<Self> {
        Self::from_args(CliArgs::parse())
    }

    /// Create a CLI interface from already parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Self::load_config(&args)?;
        Ok(Self { args, config })
    }

    /// Load configuration from file and apply argument overrides
    ///
    /// # Arguments
    /// * `args` - Command-line arguments
    ///
    /// # Returns
    /// * `Result<Config>` - Loaded configuration or error
    fn load_config(args: &CliArgs) -> Result<Config> {
        let mut config = Config::load_from_file(args.config_file.as_deref())?;
        config.validate()?;
        Self::apply_logging_args(&mut config, args);
        Ok(config)
    }

    /// Apply logging-related CLI arguments to configuration
    fn apply_logging_args(config: &mut Config, args: &CliArgs) {
        config.logging.level = if args.very_verbose {
            LogLevel::Trace
        } else if args.verbose {
            LogLevel::Debug
        } else if args.quiet {
            LogLevel::Error
        } else {
            config.logging.level
        };
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn args(&self) -> &CliArgs {
        &self.args
    }

    /// Resolve an endpoint name.
    ///
    /// `csvfile` opens the CSV files of `script_dir`; any other name must be
    /// declared under `[endpoints.<name>]`.
    ///
    /// # Arguments
    /// * `name` - Endpoint name given on the command line
    /// * `script_dir` - Directory of the script being run
    pub async fn resolve_endpoint(&self, name: &str, script_dir: &Path) -> Result<Arc<dyn EndpointClient>> {
        if name.eq_ignore_ascii_case(CSV_FILE_ENDPOINT) {
            return Ok(Arc::new(CsvFileEndpoint::open(CSV_FILE_ENDPOINT, script_dir).await?));
        }

        let endpoint = self
            .config
            .endpoints
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEndpoint(name.to_string()))?;

        match endpoint.kind {
            EndpointConfigKind::Csv => {
                let directory = endpoint
                    .directory
                    .as_deref()
                    .ok_or_else(|| ConfigError::MissingField(format!("endpoints.{name}.directory")))?;
                Ok(Arc::new(CsvFileEndpoint::open(name, directory).await?))
            }
        }
    }

    /// Kind of a named endpoint; `None` for names not configured.
    pub fn endpoint_kind(&self, name: &str) -> Option<EndpointKind> {
        if name.eq_ignore_ascii_case(CSV_FILE_ENDPOINT) {
            return Some(EndpointKind::File);
        }
        self.config.endpoints.get(name).map(|e| e.kind.endpoint_kind())
    }

    /// Check the endpoint pair of a run before anything is opened. Two
    /// flat-file endpoints have no schema to work from.
    pub fn validate_run_args(&self, run: &RunArgs) -> Result<()> {
        let source = self.endpoint_kind(&run.source_username);
        let target = self.endpoint_kind(&run.target_username);
        if source == Some(EndpointKind::File) && target == Some(EndpointKind::File) {
            return Err(ConfigError::InvalidValue {
                field: "targetusername".to_string(),
                value: run.target_username.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Handle the config subcommand
    ///
    /// # Returns
    /// * `Result<bool>` - True if a subcommand was handled, false to continue
    pub fn handle_subcommand(&self) -> Result<bool> {
        match &self.args.command {
            Commands::Config { show } => {
                if *show {
                    self.show_config()?;
                }
                Ok(true)
            }
            Commands::Run(_) => Ok(false),
        }
    }

    /// Show effective configuration
    fn show_config(&self) -> Result<()> {
        let path = self.get_config_path();
        println!("Configuration file: {}", path.display());
        println!();

        match toml::to_string_pretty(&self.config) {
            Ok(toml_str) => println!("{}", toml_str),
            Err(e) => {
                eprintln!("Error formatting configuration: {}", e);
                println!("{:#?}", self.config);
            }
        }
        Ok(())
    }

    /// Get configuration file path (from args or default)
    fn get_config_path(&self) -> PathBuf {
        self.args
            .config_file
            .clone()
            .unwrap_or_else(Config::default_path)
    }
}
