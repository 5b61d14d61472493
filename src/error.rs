//! Error taxonomy for the fetch/aggregate pipeline.
//!
//! Nothing here is process-fatal. Primary-path errors propagate to the
//! dashboard, which falls back to the last known-good artifact; auxiliary
//! fetch errors are logged and discarded at their call site.

use chrono::NaiveDate;
use thiserror::Error;

/// Errors produced by the pipeline components.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Upstream answered with a non-2xx status.
    #[error("remote service '{endpoint}' returned HTTP {status}")]
    RemoteService { endpoint: String, status: u16 },

    /// Upstream body was not valid JSON.
    #[error("malformed JSON from '{endpoint}': {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// Connection failure or timeout, after the retry budget was spent.
    #[error("request to '{endpoint}' failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// Well-formed JSON that lacks an expected field.
    #[error("record {record} does not match the expected shape: {reason}")]
    Schema { record: String, reason: String },

    /// No records fall inside the requested date window.
    #[error("no records between {start} and {end}")]
    EmptyRange { start: NaiveDate, end: NaiveDate },

    /// No cached table within the freshness window, even after regeneration.
    #[error("no fresh {level} table available")]
    StaleTable {
        level: String,
        /// Age of the table on disk, if there is one.
        age_secs: Option<u64>,
    },

    /// The external transcoder exited unsuccessfully.
    #[error("video encoder exited with status {status}")]
    Encoder { status: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    /// Whether a fresh attempt at the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Transport { .. } => true,
            PipelineError::RemoteService { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transient() {
        let err = PipelineError::RemoteService {
            endpoint: "dxy".to_string(),
            status: 503,
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_client_errors_are_not_transient() {
        let err = PipelineError::RemoteService {
            endpoint: "dxy".to_string(),
            status: 404,
        };
        assert!(!err.is_transient());

        let err = PipelineError::Schema {
            record: "#0".to_string(),
            reason: "missing field".to_string(),
        };
        assert!(!err.is_transient());
    }
}
