//! Errors raised while decoding an image

use alloc::string::String;
use core::fmt;
use core::result;
#[cfg(feature = "std")]
use std::{error, io};

#[non_exhaustive]
#[derive(Debug)]
/// Everything that can go wrong while decoding an image
pub enum Error {
    /// A read of `size` bytes at `offset` would run past the end of a buffer of `len` bytes
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },
    /// The binary is malformed somehow
    Malformed(String),
    /// The binary's magic is unknown or bad
    BadMagic(u64),
    /// A relative virtual address is not owned by any section
    Unmapped(u64),
    /// A recognized construct that this parser does not interpret
    Unsupported(String),
    /// The input exceeds the largest buffer the parser accepts
    TooLarge { size: usize, max: usize },
    /// An error emanating from reading and interpreting bytes
    Scroll(scroll::Error),
    /// An IO based error
    #[cfg(feature = "std")]
    IO(io::Error),
}

impl Error {
    /// Builds an [`Error::OutOfBounds`] for a read of `size` bytes at `offset`.
    pub(crate) fn out_of_bounds(offset: usize, size: usize, len: usize) -> Self {
        Error::OutOfBounds { offset, size, len }
    }

    /// Whether this error came from a bounds check.
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(self, Error::OutOfBounds { .. })
    }
}

#[cfg(feature = "std")]
impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::IO(ref io) => Some(io),
            Error::Scroll(ref scroll) => Some(scroll),
            _ => None,
        }
    }
}

#[cfg(feature = "std")]
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        match err {
            scroll::Error::TooBig { size, len } => Error::OutOfBounds {
                offset: 0,
                size,
                len,
            },
            scroll::Error::BadOffset(offset) => Error::OutOfBounds {
                offset,
                size: 0,
                len: offset,
            },
            err => Error::Scroll(err),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::OutOfBounds { offset, size, len } => write!(
                fmt,
                "Out of bounds: cannot read {size:#x} bytes at offset {offset:#x} (buffer length {len:#x})"
            ),
            Error::Malformed(ref msg) => write!(fmt, "Malformed entity: {msg}"),
            Error::BadMagic(magic) => write!(fmt, "Invalid magic number: 0x{magic:x}"),
            Error::Unmapped(rva) => write!(fmt, "RVA {rva:#x} is not mapped by any section"),
            Error::Unsupported(ref msg) => write!(fmt, "Unsupported: {msg}"),
            Error::TooLarge { size, max } => {
                write!(fmt, "Input of {size:#x} bytes exceeds the maximum of {max:#x}")
            }
            Error::Scroll(ref err) => write!(fmt, "{err}"),
            #[cfg(feature = "std")]
            Error::IO(ref err) => write!(fmt, "{err}"),
        }
    }
}

/// A decoding result
pub type Result<T> = result::Result<T, Error>;
