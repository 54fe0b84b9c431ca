use failure::{Backtrace, Context, Fail};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "failed to encode message: {}", cause)]
    EncodeError { cause: serde_bencode::Error },

    #[fail(display = "failed to decode message: {}", cause)]
    DecodeError { cause: serde_bencode::Error },

    #[fail(display = "node list length {} is not a multiple of 26", length)]
    InvalidNodeList { length: usize },

    #[fail(display = "compact address must be 6 bytes, got {}", length)]
    InvalidCompactAddr { length: usize },

    #[fail(display = "node id must be 20 bytes, got {}", length)]
    InvalidNodeID { length: usize },
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
