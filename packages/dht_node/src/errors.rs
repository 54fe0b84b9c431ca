use failure::{Backtrace, Context, Fail};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, Fail, PartialEq, Eq)]
pub enum ErrorKind {
    #[fail(display = "failed to bind the node's socket")]
    BindError,

    #[fail(display = "transport failure")]
    TransportError,

    #[fail(display = "value is {} bytes, the limit is 1000", length)]
    ValueTooLarge { length: usize },

    #[fail(display = "salt is {} bytes, the limit is 64", length)]
    SaltTooLarge { length: usize },

    #[fail(display = "public key must be 32 bytes")]
    InvalidPublicKey,

    #[fail(display = "signature does not verify")]
    InvalidSignature,

    #[fail(display = "failed to read or write the state file at {}", path)]
    StateFile { path: String },

    #[fail(display = "malformed state document")]
    MalformedState,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
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
