// crates/retrovue-core/src/error.rs
//
// PlayoutError: the typed error surface the teacher's anyhow::Result doesn't
// need (VeloCut only ever reports text to a status banner) but a control-
// plane response boundary does. One variant per row of SPEC_FULL.md §7.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlayoutError {
    #[error("channel {channel_id} already exists")]
    AlreadyExists { channel_id: i32 },

    #[error("channel {channel_id} not found")]
    NotFound { channel_id: i32 },

    #[error("failed precondition: {reason}")]
    FailedPrecondition { reason: String },

    #[error("deadline exceeded: {reason}")]
    DeadlineExceeded { reason: String },

    #[error("decode failed for asset '{asset_id}': {reason}")]
    DecodeFailed { asset_id: String, reason: String },

    #[error("io error: {reason}")]
    IoError { reason: String },

    #[error("invalid time: {reason}")]
    InvalidTime { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl PlayoutError {
    /// Matches the error-kind names used on the wire in SPEC_FULL.md §6.1.
    pub fn kind_name(&self) -> &'static str {
        match self {
            PlayoutError::AlreadyExists { .. } => "AlreadyExists",
            PlayoutError::NotFound { .. } => "NotFound",
            PlayoutError::FailedPrecondition { .. } => "FailedPrecondition",
            PlayoutError::DeadlineExceeded { .. } => "DeadlineExceeded",
            PlayoutError::DecodeFailed { .. } => "DecodeFailed",
            PlayoutError::IoError { .. } => "IoError",
            PlayoutError::InvalidTime { .. } => "InvalidTime",
            PlayoutError::Internal { .. } => "Internal",
        }
    }
}
