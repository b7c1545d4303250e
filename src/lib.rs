//! datamove library
//!
//! Moves records of several related entities between schema-described data
//! endpoints under a JSON script, resolving lookups between them.
//!
//! # Modules
//!
//! - `cli`: Command-line interface and argument parsing
//! - `config`: Configuration management
//! - `endpoint`: Endpoint client interface and its memory/CSV implementations
//! - `engine`: Transport selection by estimated cost
//! - `error`: Error types and handling
//! - `order`: Dependency ordering of script objects
//! - `pipeline`: The phased run over object sets
//! - `query`: Query parsing, clause building and field mapping
//! - `script`: Script loading and per-object state
//! - `transfer`: Streamed queries, CSV staging and batched writes
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use datamove::{Config, CsvFileEndpoint, Pipeline, RunContext};
//!
//! #[tokio::main]
//! async fn main() -> datamove::Result<()> {
//!     let script_dir = Path::new("./move");
//!     let source = CsvFileEndpoint::open("csvfile", script_dir).await?;
//!     let target = CsvFileEndpoint::open("archive", Path::new("./archive")).await?;
//!
//!     let context = RunContext::new(Config::default(), script_dir);
//!     let mut pipeline = Pipeline::new(context, Arc::new(source), Arc::new(target));
//!     let summary = pipeline.run().await?;
//!     println!("{}", summary.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod order;
pub mod pipeline;
pub mod query;
pub mod script;
pub mod transfer;

// Re-export commonly used types
pub use config::Config;
pub use endpoint::{CsvFileEndpoint, EndpointClient, MemoryEndpoint};
pub use error::{DataMoveError, Result};
pub use pipeline::{Pipeline, RunContext, RunSummary};
pub use script::{Operation, Script};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version string
///
/// # Returns
/// * `&str` - Version string
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
