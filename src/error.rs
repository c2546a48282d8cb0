use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrateError>;

/// Failures of the migration pipeline. Every variant aborts the run except
/// `Connection`, which the publisher recovers from once.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// A mandatory option is missing or invalid; raised before any stage runs.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The broker could not be reached or the channel broke.
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// A publish failed, the reconnect-and-retry failed too.
    #[error("Delivery failed after reconnect and retry: {0}")]
    DeliveryFailed(String),

    #[error("Observable type '{0}' has no STIX key mapping")]
    UnmappedObservableType(String),

    /// The source platform returned an error or an unusable response.
    #[error("Source fetch error: {0}")]
    Fetch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for MigrateError {
    fn from(err: reqwest::Error) -> Self {
        MigrateError::Fetch(err.to_string())
    }
}

impl From<lapin::Error> for MigrateError {
    fn from(err: lapin::Error) -> Self {
        MigrateError::Connection(err.to_string())
    }
}
