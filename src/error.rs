use thiserror::Error;

/// Defines all possible errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum ApolloError {
    /// Error reading or accessing the configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[source] std::io::Error),

    /// Filesystem error outside the configuration path (track directory,
    /// report file).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A mandatory configuration key is absent.
    #[error("Missing mandatory config key '{0}'")]
    MissingConfigKey(&'static str),

    /// A configuration value failed validation.
    #[error("Invalid value for config key '{key}': {reason}")]
    InvalidConfigValue {
        /// The key that failed validation.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// Transport-level failure talking to the Consul agent.
    #[error("Consul request failed: {0}")]
    ConsulTransportError(#[from] reqwest::Error),

    /// The Consul agent answered with a non-success status.
    #[error("Consul returned HTTP {status} for {path}")]
    ConsulStatusError {
        /// The request path.
        path: String,
        /// The HTTP status code received.
        status: u16,
    },

    /// Error reading or writing a retry ledger.
    #[error("Ledger I/O failed for check '{check}': {source}")]
    LedgerIoError {
        /// The check whose ledger failed.
        check: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A retry ledger file holds something other than ledger entries.
    #[error("Malformed ledger for check '{check}': {source}")]
    LedgerFormatError {
        /// The check whose ledger failed.
        check: String,
        /// The underlying error that occurred.
        #[source]
        source: serde_json::Error,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// Error for PID file.
    #[error("PID file error: {0}")]
    PidFileError(#[from] PidFileError),
}

impl<T> From<std::sync::PoisonError<T>> for ApolloError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ApolloError::MutexPoisonError(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("Failed to access PID file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse PID file: {0}")]
    ParseError(#[from] std::num::ParseIntError),

    #[error("apollo is already running with PID {0}")]
    AlreadyRunning(u32),
}
