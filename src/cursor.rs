//! A bounded, read-only view over an untrusted byte buffer.
//!
//! Every read validates `offset + size <= len` with overflow-checked arithmetic
//! before any byte is touched, and reports [`Error::OutOfBounds`] instead of
//! panicking. Counts taken from the input are never trusted to size an
//! allocation: see [`Cursor::clamp_count`].

use core::str;

use scroll::{Pread, ctx};

use crate::error::{self, Error};

/// A bounds-checked reader over the raw image.
#[derive(Debug, Copy, Clone)]
pub struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes }
    }

    /// The whole underlying buffer.
    pub fn as_slice(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of bytes available from `offset` to the end of the buffer.
    pub fn remaining(&self, offset: usize) -> usize {
        self.bytes.len().saturating_sub(offset)
    }

    /// Returns the `count` bytes at `offset`.
    pub fn read_fixed(&self, offset: usize, count: usize) -> error::Result<&'a [u8]> {
        let end = offset
            .checked_add(count)
            .ok_or_else(|| Error::out_of_bounds(offset, count, self.len()))?;
        self.bytes
            .get(offset..end)
            .ok_or_else(|| Error::out_of_bounds(offset, count, self.len()))
    }

    /// Reads a little-endian fixed-layout record at `offset`.
    pub fn read_at<T>(&self, offset: usize) -> error::Result<T>
    where
        T: ctx::TryFromCtx<'a, scroll::Endian, Error = scroll::Error>,
    {
        self.read_with(offset, scroll::LE)
    }

    /// Reads a record whose layout depends on `ctx`, e.g. an
    /// [`AddressingWidth`](crate::pe::ctx::AddressingWidth).
    pub fn read_with<T, C>(&self, offset: usize, ctx: C) -> error::Result<T>
    where
        C: Copy,
        T: ctx::TryFromCtx<'a, C, Error = scroll::Error>,
    {
        if offset >= self.len() {
            return Err(Error::out_of_bounds(offset, 1, self.len()));
        }
        self.bytes
            .pread_with::<T>(offset, ctx)
            .map_err(|err| match err {
                scroll::Error::TooBig { size, .. } => {
                    Error::out_of_bounds(offset, size, self.len())
                }
                scroll::Error::BadOffset(_) => Error::out_of_bounds(offset, 0, self.len()),
                err => err.into(),
            })
    }

    /// Reads a little-endian record at `*offset` and advances past it.
    pub fn gread<T>(&self, offset: &mut usize) -> error::Result<T>
    where
        T: ctx::TryFromCtx<'a, scroll::Endian, Error = scroll::Error>,
    {
        self.gread_with(offset, scroll::LE)
    }

    /// Reads a context-driven record at `*offset` and advances past it.
    pub fn gread_with<T, C>(&self, offset: &mut usize, ctx: C) -> error::Result<T>
    where
        C: Copy,
        T: ctx::TryFromCtx<'a, C, Error = scroll::Error>,
    {
        let start = *offset;
        let mut cursor = start;
        let value = self
            .bytes
            .gread_with::<T>(&mut cursor, ctx)
            .map_err(|err| match err {
                scroll::Error::TooBig { size, .. } => Error::out_of_bounds(start, size, self.len()),
                scroll::Error::BadOffset(_) => Error::out_of_bounds(start, 0, self.len()),
                err => err.into(),
            })?;
        *offset = cursor;
        Ok(value)
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes at `offset`.
    ///
    /// Stops at the first NUL or after `max_len` bytes, whichever comes first. Running
    /// into the end of the buffer before either is an out of bounds read; bytes that are
    /// not UTF-8 are malformed.
    pub fn read_c_string(&self, offset: usize, max_len: usize) -> error::Result<&'a str> {
        if offset >= self.len() {
            return Err(Error::out_of_bounds(offset, 1, self.len()));
        }
        let window = &self.bytes[offset..];
        let limit = window.len().min(max_len);
        let raw = match window[..limit].iter().position(|&b| b == 0) {
            Some(nul) => &window[..nul],
            None if limit == max_len => &window[..limit],
            None => return Err(Error::out_of_bounds(offset, max_len, self.len())),
        };
        str::from_utf8(raw).map_err(|_| {
            Error::Malformed(format!("string at offset {offset:#x} is not valid UTF-8"))
        })
    }

    /// Clamps an attacker-supplied element `count` to what can fit between `offset`
    /// and the end of the buffer.
    pub fn clamp_count(&self, offset: usize, count: usize, elem_size: usize) -> usize {
        if elem_size == 0 {
            return 0;
        }
        count.min(self.remaining(offset) / elem_size)
    }
}
