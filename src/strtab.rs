//! A byte-offset based string table.
//! Used by the COFF symbol table of PE images for names longer than 8 bytes.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::str;

use scroll::{Pread, ctx};

use crate::cursor::Cursor;
use crate::error;

/// A common string table format which is indexed by byte offsets (and not
/// member index). Constructed using [`parse`](#method.parse)
/// with your choice of delimiter. Please be careful.
#[derive(Default, Clone, Copy)]
pub struct Strtab<'a> {
    bytes: &'a [u8],
    delim: u8,
}

impl<'a> Strtab<'a> {
    /// Creates a `Strtab` directly without bounds check and without parsing it.
    pub fn new(bytes: &'a [u8], delim: u8) -> Self {
        Strtab { delim, bytes }
    }

    /// Parses a `Strtab` of `len` bytes at `offset`, checking it fits in the buffer.
    pub fn parse(cursor: &Cursor<'a>, offset: usize, len: usize, delim: u8) -> error::Result<Self> {
        let bytes = cursor.read_fixed(offset, len)?;
        Ok(Strtab::new(bytes, delim))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Safely gets a str reference from the backing bytes starting at byte `offset`.
    ///
    /// `None` if `offset` is out of bounds or the string is not valid UTF-8.
    pub fn get_at(&self, offset: usize) -> Option<&'a str> {
        if offset >= self.bytes.len() {
            return None;
        }
        self.bytes
            .pread_with::<&str>(offset, ctx::StrCtx::Delimiter(self.delim))
            .ok()
    }

    /// Every delimited string in the table, in order.
    ///
    /// Invalid UTF-8 in one string is replaced with U+FFFD; the others are unaffected.
    pub fn to_vec(&self) -> Vec<String> {
        let mut strings = Vec::new();
        let mut rest = self.bytes;
        while !rest.is_empty() {
            let end = rest
                .iter()
                .position(|&b| b == self.delim)
                .unwrap_or(rest.len());
            strings.push(String::from_utf8_lossy(&rest[..end]).into_owned());
            rest = rest.get(end + 1..).unwrap_or_default();
        }
        strings
    }
}

impl fmt::Debug for Strtab<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Strtab")
            .field("delim", &self.delim)
            .field("bytes", &str::from_utf8(self.bytes))
            .finish()
    }
}
