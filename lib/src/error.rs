use thiserror::Error;

/// A failure which aborts the conversion of a whole profile.
///
/// Anything recoverable (odd frame locations, unresolvable addresses, missing optional data) is
/// handled where it occurs and never surfaces here.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("the profile has no meta object")]
    MissingMeta,
    #[error("meta.version is not a non-negative integer: {0}")]
    InvalidVersion(serde_json::Value),
    #[error(
        "profile version {version} is newer than the newest supported version {current}; \
         this build needs to be updated"
    )]
    VersionTooNew { version: u64, current: u64 },
    #[error("profile version {version} cannot be converted: {reason}")]
    UnsupportedVersion { version: u64, reason: &'static str },
    #[error("failed to upgrade the profile to version {version}: {message}")]
    Upgrade { version: u64, message: String },
    #[error(transparent)]
    InvalidJson(#[from] serde_path_to_error::Error<serde_json::Error>),
    #[error("invalid value in column {column}: {source}")]
    InvalidColumn {
        column: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("column {table}.{column} has {actual} rows but the table has {expected}")]
    TableLength {
        table: &'static str,
        column: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("marker {index} of thread {thread:?} has neither a start nor an end time")]
    MarkerTimeMissing { thread: String, index: usize },
    #[error("the stack table of thread {thread:?} is malformed: {message}")]
    MalformedStackTable { thread: String, message: String },
}

impl ProcessError {
    /// Returns the path to the field in the JSON document at which the error occurred.
    ///
    /// This is only available for [`InvalidJson`](Self::InvalidJson). Returns `""` otherwise.
    pub fn path(&self) -> String {
        match self {
            Self::InvalidJson(err) => err.path().to_string(),
            _ => "".into(),
        }
    }

    pub(crate) fn upgrade(version: u64, message: impl Into<String>) -> Self {
        Self::Upgrade {
            version,
            message: message.into(),
        }
    }
}
