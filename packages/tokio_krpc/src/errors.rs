use failure::{Backtrace, Context, Fail};
use krpc_encoding::KRPCError;
use std::fmt;
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, Fail, PartialEq, Eq)]
pub enum ErrorKind {
    #[fail(display = "failed to bind socket")]
    BindError,

    #[fail(display = "failed to send to {}", to)]
    SendError { to: SocketAddr },

    #[fail(display = "failed to encode message")]
    EncodeError,

    #[fail(display = "Timeout exceeded waiting for {}", to)]
    Timeout { to: SocketAddr },

    #[fail(display = "peer returned error: {}", error)]
    Remote { error: KRPCError },

    #[fail(display = "response is missing the {} field", field)]
    MalformedResponse { field: &'static str },

    #[fail(display = "transaction map lock poisoned")]
    LockPoisoned,

    #[fail(display = "transport is disposing")]
    Disposed,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }

    /// True for the failures an iterative lookup absorbs as a non-response:
    /// timeouts and remote-signalled errors.
    pub fn is_non_response(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout { .. } | ErrorKind::Remote { .. }
        )
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}
