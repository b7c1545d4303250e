use std::{fmt, io};

/// Crate-wide `Result` type using [`DataMoveError`] as the error.
///
/// This alias is re-exported by the parent `error` module and is intended
/// to be used throughout the crate for fallible operations.
pub type Result<T> = std::result::Result<T, DataMoveError>;

/// Top-level error type for data-move operations.
///
/// This type wraps more specific error kinds and provides a single
/// error type that can be used throughout the crate.
#[derive(Debug)]
pub enum DataMoveError {
    /// Script or configuration errors, raised before any network I/O.
    Config(ConfigError),

    /// Entity or field missing from an endpoint schema.
    Schema(SchemaError),

    /// Failed describe/query/update calls against an endpoint.
    Transport(TransportError),

    /// Failures of a streamed transfer (CSV sink or record source).
    Stream(StreamError),

    /// I/O errors.
    Io(io::Error),

    /// JSON decoding errors (script file, schema files).
    Json(serde_json::Error),

    /// TOML decoding errors (configuration file).
    Toml(toml::de::Error),

    /// An error annotated with the object set, entity and endpoint it came from.
    Context {
        object_set: usize,
        entity: String,
        endpoint: Option<String>,
        source: Box<DataMoveError>,
    },

    /// Generic error with a free-form message.
    Generic(String),
}

/// Configuration-specific errors.
#[derive(Debug)]
pub enum ConfigError {
    /// Config or script file not found.
    FileNotFound(String),

    /// Invalid file format.
    InvalidFormat(String),

    /// Missing required field.
    MissingField(String),

    /// Invalid field value.
    InvalidValue { field: String, value: String },

    /// Delete query selects from a different entity than the main query.
    DeleteQueryMismatch { expected: String, found: String },

    /// `deleteOldData` on an update-only object without an explicit delete query.
    DeleteQueryRequired(String),

    /// A written object looks up an object that is hard-deleted in the same run.
    HardDeleteReferenced { entity: String, referenced: String },

    /// Endpoint name not found in the configuration.
    UnknownEndpoint(String),
}

/// Schema-specific errors.
#[derive(Debug)]
pub enum SchemaError {
    /// Entity absent from an endpoint schema.
    EntityNotFound { entity: String, endpoint: String },

    /// A field that is part of an external ID is absent from the schema.
    ExternalIdFieldMissing {
        entity: String,
        field: String,
        endpoint: String,
    },

    /// A reference field names several targets and no explicit mapping was given.
    PolymorphicLookup { entity: String, field: String },
}

/// Transport-specific errors.
#[derive(Debug)]
pub enum TransportError {
    /// Schema describe call failed.
    DescribeFailed(String),

    /// Query call failed.
    QueryFailed(String),

    /// Insert/update/delete call failed.
    UpdateFailed(String),

    /// Bulk job call failed.
    JobFailed(String),

    /// Bulk job did not reach a terminal state in time.
    JobTimeout { job_id: String, elapsed_secs: u64 },

    /// Operation not supported by the endpoint.
    NotSupported(String),
}

/// Streamed transfer errors.
#[derive(Debug)]
pub enum StreamError {
    /// Writing to the CSV sink failed.
    WriteFailed(String),

    /// Reading from the record source or a CSV file failed.
    ReadFailed(String),

    /// The pipelined channel closed before the transfer finished.
    Closed,
}

impl DataMoveError {
    /// Wrap this error with the object set, entity and endpoint it occurred on.
    ///
    /// An error that already carries context is returned unchanged so the
    /// innermost (most specific) location wins.
    pub fn with_context(
        self,
        object_set: usize,
        entity: impl Into<String>,
        endpoint: Option<&str>,
    ) -> Self {
        match self {
            DataMoveError::Context { .. } => self,
            other => DataMoveError::Context {
                object_set,
                entity: entity.into(),
                endpoint: endpoint.map(str::to_string),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping context wrappers.
    pub fn root(&self) -> &DataMoveError {
        match self {
            DataMoveError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short machine-readable category name.
    pub fn kind_name(&self) -> &'static str {
        match self.root() {
            DataMoveError::Config(_) => "config",
            DataMoveError::Schema(_) => "schema",
            DataMoveError::Transport(_) => "transport",
            DataMoveError::Stream(_) => "stream",
            DataMoveError::Io(_) => "io",
            DataMoveError::Json(_) => "json",
            DataMoveError::Toml(_) => "toml",
            DataMoveError::Context { .. } | DataMoveError::Generic(_) => "generic",
        }
    }
}

/* ========================= Display & Error impls ========================= */

impl fmt::Display for DataMoveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataMoveError::Config(e) => write!(f, "Configuration error: {e}"),
            DataMoveError::Schema(e) => write!(f, "Schema error: {e}"),
            DataMoveError::Transport(e) => write!(f, "Transport error: {e}"),
            DataMoveError::Stream(e) => write!(f, "Stream error: {e}"),
            DataMoveError::Io(e) => write!(f, "I/O error: {e}"),
            DataMoveError::Json(e) => write!(f, "JSON error: {e}"),
            DataMoveError::Toml(e) => write!(f, "TOML error: {e}"),
            DataMoveError::Context {
                object_set,
                entity,
                endpoint,
                source,
            } => match endpoint {
                Some(ep) => write!(f, "[object set {object_set}] {entity} ({ep}): {source}"),
                None => write!(f, "[object set {object_set}] {entity}: {source}"),
            },
            DataMoveError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "File not found: {path}"),
            ConfigError::InvalidFormat(msg) => write!(f, "Invalid format: {msg}"),
            ConfigError::MissingField(field) => write!(f, "Missing required field: {field}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{value}' for field '{field}'")
            }
            ConfigError::DeleteQueryMismatch { expected, found } => write!(
                f,
                "Delete query must select from '{expected}', but selects from '{found}'"
            ),
            ConfigError::DeleteQueryRequired(entity) => write!(
                f,
                "Object '{entity}' deletes old data before an update and needs an explicit delete query"
            ),
            ConfigError::HardDeleteReferenced { entity, referenced } => write!(
                f,
                "Object '{entity}' references '{referenced}', which is hard-deleted in the same run"
            ),
            ConfigError::UnknownEndpoint(name) => write!(f, "Unknown endpoint: {name}"),
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::EntityNotFound { entity, endpoint } => {
                write!(f, "Entity '{entity}' not found on {endpoint}")
            }
            SchemaError::ExternalIdFieldMissing {
                entity,
                field,
                endpoint,
            } => write!(
                f,
                "External ID field '{field}' of '{entity}' not found on {endpoint}"
            ),
            SchemaError::PolymorphicLookup { entity, field } => write!(
                f,
                "Field '{field}' of '{entity}' references several entities; annotate it as '{field}%<Entity>'"
            ),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::DescribeFailed(msg) => write!(f, "Describe failed: {msg}"),
            TransportError::QueryFailed(msg) => write!(f, "Query failed: {msg}"),
            TransportError::UpdateFailed(msg) => write!(f, "Update failed: {msg}"),
            TransportError::JobFailed(msg) => write!(f, "Bulk job failed: {msg}"),
            TransportError::JobTimeout {
                job_id,
                elapsed_secs,
            } => write!(
                f,
                "Bulk job {job_id} did not finish after {elapsed_secs} seconds"
            ),
            TransportError::NotSupported(op) => write!(f, "Not supported: {op}"),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::WriteFailed(msg) => write!(f, "Write failed: {msg}"),
            StreamError::ReadFailed(msg) => write!(f, "Read failed: {msg}"),
            StreamError::Closed => write!(f, "Transfer channel closed"),
        }
    }
}

impl std::error::Error for DataMoveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataMoveError::Io(e) => Some(e),
            DataMoveError::Json(e) => Some(e),
            DataMoveError::Toml(e) => Some(e),
            DataMoveError::Context { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
impl std::error::Error for ConfigError {}
impl std::error::Error for SchemaError {}
impl std::error::Error for TransportError {}
impl std::error::Error for StreamError {}

/* ========================= Conversions to DataMoveError ========================= */

impl From<io::Error> for DataMoveError {
    fn from(err: io::Error) -> Self {
        DataMoveError::Io(err)
    }
}

impl From<serde_json::Error> for DataMoveError {
    fn from(err: serde_json::Error) -> Self {
        DataMoveError::Json(err)
    }
}

impl From<toml::de::Error> for DataMoveError {
    fn from(err: toml::de::Error) -> Self {
        DataMoveError::Toml(err)
    }
}

impl From<ConfigError> for DataMoveError {
    fn from(err: ConfigError) -> Self {
        DataMoveError::Config(err)
    }
}

impl From<SchemaError> for DataMoveError {
    fn from(err: SchemaError) -> Self {
        DataMoveError::Schema(err)
    }
}

impl From<TransportError> for DataMoveError {
    fn from(err: TransportError) -> Self {
        DataMoveError::Transport(err)
    }
}

impl From<StreamError> for DataMoveError {
    fn from(err: StreamError) -> Self {
        DataMoveError::Stream(err)
    }
}

impl From<String> for DataMoveError {
    fn from(msg: String) -> Self {
        DataMoveError::Generic(msg)
    }
}

impl From<&str> for DataMoveError {
    fn from(msg: &str) -> Self {
        DataMoveError::Generic(msg.to_owned())
    }
}
