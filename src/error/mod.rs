//! Error handling module for data-move operations.
//!
//! This module provides:
//! - Application-specific error kinds (configuration, schema, transport, stream)
//! - Context wrapping with the failing object set, entity and endpoint
//! - A JSON error report for fatal errors
//!
//! # Example
//!
//! ```rust,no_run
//! use datamove::error::{DataMoveError, ErrorReport, Result};
//!
//! fn report(err: &DataMoveError) {
//!     let report = ErrorReport::from_error(err);
//!     println!("{}", report.to_json_pretty().unwrap());
//! }
//! ```

pub mod kinds;
pub mod report;

// Re-export commonly used types
pub use kinds::{ConfigError, DataMoveError, Result, SchemaError, StreamError, TransportError};
pub use report::ErrorReport;
