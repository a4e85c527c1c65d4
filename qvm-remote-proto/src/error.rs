//! Error taxonomy shared by the submitter and the executor daemon.

/// Alias for `Result<T, qvm_remote_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the protocol, key store, or audit log.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The command body failed an input-validation check (size, NUL byte,
    /// disallowed control character, empty after trimming).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No key is on file for the domain in question.
    #[error("no key for domain {domain}")]
    NoKey {
        /// Domain name with no key on file.
        domain: String,
    },

    /// A key file did not match `/^[0-9a-f]{64}$/`.
    #[error("malformed key material for domain {domain}")]
    MalformedKey {
        /// Domain whose key file failed validation.
        domain: String,
    },

    /// The submitter's wall-clock deadline elapsed before a result appeared.
    #[error("timed out waiting for result")]
    Timeout,

    /// Enqueuing the request onto the pending queue failed.
    #[error("submit failed: {0}")]
    SubmitFailed(String),

    /// An I/O error from the queue, key store, or audit log.
    #[error("{context}: {source}")]
    Io {
        /// What was being done when the I/O error occurred.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wraps an [`std::io::Error`] with the operation that produced it.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Exit code this error maps to per the submitter's CLI contract (§7).
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) => 2,
            Self::NoKey { .. } | Self::MalformedKey { .. } => 3,
            Self::SubmitFailed(_) => 4,
            Self::Timeout => 124,
            Self::Io { .. } => 5,
        }
    }
}
