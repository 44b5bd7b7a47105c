use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Envelope could not be parsed into a message.
    #[error("message parse failed: {message}")]
    Parse { message: String },

    /// The backend AI call failed. Captured as the tracked result so the
    /// user still receives a textual reply.
    #[error("backend call failed: {message}")]
    Backend { message: String },

    /// Out-of-band credential issuance or validation failed.
    #[error("out-of-band auth failed: {message}")]
    PushAuthFailed { message: String },

    /// The push endpoint throttled us.
    #[error("out-of-band delivery rate limited")]
    PushRateLimited,

    /// The push endpoint could not be reached at all.
    #[error("out-of-band endpoint unreachable: {source}")]
    PushUnreachable {
        #[source]
        source: reqwest::Error,
    },

    /// Push rejected for any other platform reason.
    #[error("out-of-band delivery failed: {message}")]
    Push { message: String },
}

impl Error {
    #[must_use]
    pub fn parse(message: impl std::fmt::Display) -> Self {
        Self::Parse {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn backend(message: impl std::fmt::Display) -> Self {
        Self::Backend {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn push(message: impl std::fmt::Display) -> Self {
        Self::Push {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn push_auth(message: impl std::fmt::Display) -> Self {
        Self::PushAuthFailed {
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
