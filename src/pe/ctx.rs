use scroll::{Pread, ctx};

use crate::cursor::Cursor;
use crate::error;
use crate::pe::{options, section_table, utils};

/// The addressing width of an image, fixed by the optional header magic.
///
/// This is also the `scroll` context used to read every record whose layout
/// differs between PE32 and PE32+ (thunks, TLS directory, load config, ...).
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum AddressingWidth {
    /// PE32, 4 byte pointers
    Width32,
    /// PE32+, 8 byte pointers
    Width64,
}

impl AddressingWidth {
    /// Size in bytes of a pointer-sized field
    pub fn pointer_size(self) -> usize {
        match self {
            AddressingWidth::Width32 => 4,
            AddressingWidth::Width64 => 8,
        }
    }

    pub fn is_64(self) -> bool {
        self == AddressingWidth::Width64
    }

    /// The bit marking an import thunk as an ordinal import
    pub fn ordinal_flag(self) -> u64 {
        match self {
            AddressingWidth::Width32 => 0x8000_0000,
            AddressingWidth::Width64 => 0x8000_0000_0000_0000,
        }
    }
}

/// A pointer-sized value, widened to `u64`.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub struct Address(pub u64);

impl<'a> ctx::TryFromCtx<'a, AddressingWidth> for Address {
    type Error = scroll::Error;

    fn try_from_ctx(bytes: &'a [u8], width: AddressingWidth) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let value = match width {
            AddressingWidth::Width32 => bytes.gread_with::<u32>(offset, scroll::LE)? as u64,
            AddressingWidth::Width64 => bytes.gread_with::<u64>(offset, scroll::LE)?,
        };
        Ok((Address(value), *offset))
    }
}

/// Everything a directory parser needs: the bounded view of the image, the section
/// table, the addressing width and the caller's options.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ParseCtx<'a> {
    pub(crate) cursor: Cursor<'a>,
    pub(crate) sections: &'a [section_table::SectionTable],
    pub(crate) width: AddressingWidth,
    pub(crate) image_base: u64,
    pub(crate) opts: options::ParseOptions,
}

impl<'a> ParseCtx<'a> {
    pub(crate) fn new(
        cursor: Cursor<'a>,
        sections: &'a [section_table::SectionTable],
        width: AddressingWidth,
        image_base: u64,
        opts: options::ParseOptions,
    ) -> Self {
        Self {
            cursor,
            sections,
            width,
            image_base,
            opts,
        }
    }

    /// Translates `rva` into a file offset honoring [`options::ParseOptions`].
    pub(crate) fn rva_to_offset(&self, rva: u32) -> error::Result<usize> {
        let len = self.cursor.len();
        if !self.opts.resolve_rva {
            let offset = rva as usize;
            return if offset < len {
                Ok(offset)
            } else {
                Err(error::Error::Unmapped(rva as u64))
            };
        }
        if self.opts.parse_mode.is_permissive() {
            utils::rva_to_offset_with_header_fallback(rva, self.sections, len)
        } else {
            utils::rva_to_offset(rva, self.sections, len)
        }
    }

    /// Converts a virtual address into an RVA relative to the image base.
    pub(crate) fn va_to_rva(&self, va: u64) -> error::Result<u32> {
        va.checked_sub(self.image_base)
            .and_then(|rva| u32::try_from(rva).ok())
            .ok_or_else(|| {
                error::Error::Malformed(format!(
                    "virtual address {va:#x} is outside of the image based at {:#x}",
                    self.image_base
                ))
            })
    }

    /// Translates a virtual address straight to a file offset.
    pub(crate) fn va_to_offset(&self, va: u64) -> error::Result<usize> {
        self.rva_to_offset(self.va_to_rva(va)?)
    }

    /// Reads a pointer-sized value at `offset`.
    pub(crate) fn read_address(&self, offset: usize) -> error::Result<u64> {
        self.cursor
            .read_with::<Address, _>(offset, self.width)
            .map(|address| address.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{Address, AddressingWidth};
    use scroll::Pread;

    #[test]
    fn address_follows_width() {
        let bytes = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80];
        let narrow: Address = bytes.pread_with(0, AddressingWidth::Width32).unwrap();
        let wide: Address = bytes.pread_with(0, AddressingWidth::Width64).unwrap();
        assert_eq!(narrow.0, 0x4030_2010);
        assert_eq!(wide.0, 0x8070_6050_4030_2010);
    }

    #[test]
    fn pointer_sizes() {
        assert_eq!(AddressingWidth::Width32.pointer_size(), 4);
        assert_eq!(AddressingWidth::Width64.pointer_size(), 8);
        assert!(AddressingWidth::Width64.is_64());
    }
}
