use thiserror::Error;

/// Internal error type. Nothing here crosses the public API boundary: the
/// store treats every variant as fatal and aborts after dumping state.
#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Bail out with `Error::Invariant` when a condition does not hold.
macro_rules! ensure {
    ($cond:expr, $($msg:tt)+) => {
        if !($cond) {
            return Err($crate::errors::Error::Invariant(format!($($msg)+)));
        }
    };
}

pub(crate) use ensure;
