use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Broad classification of a failure, as seen by the presentation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No wallet provider is available to sign or list accounts.
    ProviderUnavailable,
    /// The user declined a connection or transaction request.
    UserRejected,
    /// A submitted transaction reverted or was never confirmed.
    TransactionFailed,
    /// A contract read failed or timed out.
    ReadFailed,
    /// The caller supplied an unusable argument.
    InvalidInput,
    /// Another write is already in flight.
    Busy,
    /// The requested capability is disabled in this session.
    Unsupported,
    /// An error internal to the client.
    Internal,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable => "provider unavailable",
            Self::UserRejected => "user rejected",
            Self::TransactionFailed => "transaction failed",
            Self::ReadFailed => "read failed",
            Self::InvalidInput => "invalid input",
            Self::Busy => "busy",
            Self::Unsupported => "unsupported",
            Self::Internal => "internal error",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Error {
    message: String,
    kind: ErrorKind,
}

impl Error {
    /// Extend an error message with additional context, keeping the same kind.
    pub fn context(self, context: impl Display) -> Self {
        Self {
            message: format!("{context}: {}", self.message),
            kind: self.kind,
        }
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The error message, including any context that has been added.
    pub fn message(&self) -> &str {
        &self.message
    }

    fn new(kind: ErrorKind) -> Self {
        Self {
            message: kind.as_str().to_string(),
            kind,
        }
    }

    /// Stock error for when no wallet provider is present.
    ///
    /// The presentation layer is expected to turn this into a blocking "install a wallet" prompt;
    /// every other kind is informational.
    pub fn provider_unavailable() -> Self {
        Self::new(ErrorKind::ProviderUnavailable)
    }

    /// The user declined a request in their wallet.
    pub fn user_rejected() -> Self {
        Self::new(ErrorKind::UserRejected)
    }

    /// A transaction was submitted but did not succeed on chain.
    ///
    /// It is generally best practice to extend the error message with the operation and
    /// transaction hash using [`context`](Self::context).
    pub fn transaction_failed() -> Self {
        Self::new(ErrorKind::TransactionFailed)
    }

    /// A read from one of the contracts failed.
    pub fn read_failed() -> Self {
        Self::new(ErrorKind::ReadFailed)
    }

    /// An error arising from the caller's request, such as an unparseable amount.
    pub fn bad_request() -> Self {
        Self::new(ErrorKind::InvalidInput)
    }

    /// A write was requested while another write is still in flight.
    pub fn busy() -> Self {
        Self::new(ErrorKind::Busy)
    }

    /// The operation is disabled by the session configuration.
    pub fn unsupported() -> Self {
        Self::new(ErrorKind::Unsupported)
    }

    /// An error internal to the client.
    ///
    /// This can either indicate an internal consistency error, or a transient failure of some inner
    /// component that is out of the caller's control.
    pub fn internal() -> Self {
        Self::new(ErrorKind::Internal)
    }
}

impl Error {
    /// Log a failed operation at the level its kind warrants.
    pub(crate) fn log(&self, op: &str) {
        match self.kind {
            ErrorKind::ProviderUnavailable | ErrorKind::TransactionFailed | ErrorKind::Internal => {
                tracing::error!(op, "{self}")
            }
            _ => tracing::warn!(op, "{self}"),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::internal().context(format!("{err:#}"))
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Extension functions for converting other result types into [`Result`].
pub trait ResultExt {
    type Ok;

    /// Wrap an error with an [`ErrorKind`], preserving the original error context.
    fn context(self, f: impl FnOnce() -> Error) -> Result<Self::Ok>;
}

impl<T, E> ResultExt for Result<T, E>
where
    E: std::error::Error,
{
    type Ok = T;

    fn context(self, f: impl FnOnce() -> Error) -> Result<<Self as ResultExt>::Ok> {
        self.map_err(|err| f().context(err))
    }
}

macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}
pub(crate) use ensure;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_context_keeps_kind() {
        let err = Error::read_failed()
            .context("calculateReward")
            .context("refreshing stake details");
        assert_eq!(err.kind(), ErrorKind::ReadFailed);
        assert_eq!(
            err.message(),
            "refreshing stake details: calculateReward: read failed"
        );
        assert_eq!(
            err.to_string(),
            "read failed: refreshing stake details: calculateReward: read failed"
        );
    }

    #[test]
    fn test_result_ext() {
        let res: Result<u64, std::num::ParseIntError> = "x".parse::<u64>();
        let err = res.context(Error::bad_request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.message().ends_with(": invalid input"), "{err}");
    }

    #[test]
    fn test_from_anyhow() {
        let err = Error::from(anyhow::anyhow!("boom"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.message(), "boom: internal error");
    }
}
