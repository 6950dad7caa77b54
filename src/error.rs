//! Crate-level error type.

use std::{error, fmt, io};

use crate::template::TemplateError;

//------------ Error ---------------------------------------------------------

/// An error preventing a load run from starting or continuing.
#[derive(Debug)]
pub enum Error {
    /// The query template could not be built or loaded.
    Template(TemplateError),

    /// A name did not resolve to a usable address.
    NoAddress(String),

    /// An I/O operation failed in a way the driver cannot absorb.
    Io(io::Error),
}

impl Error {
    /// The process exit code this error maps onto.
    ///
    /// Problems with the command line surface, addresses, or the template
    /// are usage errors; everything else is a general failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Template(_) | Error::NoAddress(_) => 2,
            Error::Io(_) => 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Template(err) => err.fmt(f),
            Error::NoAddress(name) => {
                write!(f, "no usable address for '{}'", name)
            }
            Error::Io(err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Template(err) => Some(err),
            Error::NoAddress(_) => None,
            Error::Io(err) => Some(err),
        }
    }
}

impl From<TemplateError> for Error {
    fn from(err: TemplateError) -> Self {
        Error::Template(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
