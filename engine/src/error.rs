//! Error types for the sync engine.

use crate::RecordId;
use thiserror::Error;

/// Distinguished failure codes surfaced to callers for sync-level handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    /// The server holds data written by a newer engine version.
    VersionOutOfDate,
    /// Downloading incoming records failed.
    EngineDownloadFail,
    /// Uploading outgoing records failed.
    EngineUploadFail,
}

/// All possible errors from the sync engine.
#[derive(Debug, Error)]
pub enum Error {
    // Crypto errors
    #[error("HMAC mismatch: expected {expected}, computed {computed}")]
    HmacMismatch { expected: String, computed: String },

    #[error("no ciphertext: nothing to decrypt")]
    MissingCiphertext,

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("record id mismatch: {expected} != {actual}")]
    RecordIdMismatch {
        expected: RecordId,
        actual: String,
    },

    #[error("no keys available for collection: {0}")]
    MissingKeys(String),

    // Protocol errors
    #[error("server has newer data for {engine}: version {remote} > {local}")]
    VersionOutOfDate {
        engine: String,
        local: u32,
        remote: u32,
    },

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("{code:?}: {source}")]
    Failed {
        code: FailureCode,
        #[source]
        source: Box<Error>,
    },

    // Local errors
    #[error("store error: {0}")]
    Store(String),

    #[error("aborting incoming processing: {0}")]
    AbortApplyIncoming(Box<Error>),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),
}

impl Error {
    /// Wrap `cause` as a signal that no further incoming records should be
    /// processed in this sync.
    pub fn abort(cause: Error) -> Self {
        Error::AbortApplyIncoming(Box::new(cause))
    }

    /// Tag an error with a failure code.
    pub fn with_code(self, code: FailureCode) -> Self {
        match self {
            // Keep the innermost code.
            e @ Error::Failed { .. } => e,
            e => Error::Failed {
                code,
                source: Box::new(e),
            },
        }
    }

    /// The failure code carried by this error, if any.
    pub fn failure_code(&self) -> Option<FailureCode> {
        match self {
            Error::VersionOutOfDate { .. } => Some(FailureCode::VersionOutOfDate),
            Error::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_hmac_mismatch(&self) -> bool {
        matches!(self, Error::HmacMismatch { .. })
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Error::AbortApplyIncoming(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
