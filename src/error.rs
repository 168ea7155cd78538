use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CdsError {
    #[error("invalid UniProt accession: {0}")]
    InvalidUniprotId(String),

    #[error("invalid configuration: {0}")]
    #[diagnostic(help("check kira-cds.json and the command line flags"))]
    InvalidConfig(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to read input sequences from {path}: {message}")]
    InputRead { path: String, message: String },

    #[error("malformed input record #{index} ({id}): {message}")]
    InputParse {
        index: usize,
        id: String,
        message: String,
    },

    #[error("NCBI request failed: {0}")]
    EntrezHttp(String),

    #[error("NCBI returned status {status}: {message}")]
    EntrezStatus { status: u16, message: String },

    #[error("failed to parse GenBank response: {0}")]
    GenbankParse(String),

    #[error("NCBI response could not be decoded: {0}")]
    EntrezDecode(String),

    #[error("remote service unreachable during {stage}: all {batches} batches failed (last error: {last_error})")]
    #[diagnostic(help("check network connectivity and NCBI service status, then rerun with --keep-cache"))]
    ServiceUnreachable {
        stage: String,
        batches: usize,
        last_error: String,
    },

    #[error("retrieval cancelled before the batch was issued")]
    Cancelled,

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl CdsError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CdsError::EntrezHttp(_) => true,
            CdsError::EntrezStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, CdsError::EntrezHttp(_))
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(CdsError::EntrezHttp("connection reset".to_string()).is_retryable());
        assert!(
            CdsError::EntrezStatus {
                status: 429,
                message: "too many requests".to_string()
            }
            .is_retryable()
        );
        assert!(
            !CdsError::EntrezStatus {
                status: 400,
                message: "bad request".to_string()
            }
            .is_retryable()
        );
        assert!(!CdsError::GenbankParse("truncated".to_string()).is_retryable());
    }
}
