use alloc::vec::Vec;
use core::ops::Range;

use log::{debug, warn};
use scroll::{Pread, ctx};

use crate::error;
use crate::pe::ctx::{AddressingWidth, ParseCtx};
use crate::pe::data_directories::DataDirectory;

/// The most callbacks read from a TLS callback array
pub const MAX_TLS_CALLBACKS: usize = 3000;

/// Indicates 1-byte alignment in [`TlsDirectory::characteristics`]
pub const TLS_CHARACTERISTICS_ALIGN_1BYTES: u32 = 0x0010_0000;
/// Indicates 4-byte alignment in [`TlsDirectory::characteristics`]
pub const TLS_CHARACTERISTICS_ALIGN_4BYTES: u32 = 0x0030_0000;
/// Indicates 8-byte alignment in [`TlsDirectory::characteristics`]
pub const TLS_CHARACTERISTICS_ALIGN_8BYTES: u32 = 0x0040_0000;
/// Indicates 16-byte alignment in [`TlsDirectory::characteristics`]
pub const TLS_CHARACTERISTICS_ALIGN_16BYTES: u32 = 0x0050_0000;
/// Mask isolating the alignment nibble of [`TlsDirectory::characteristics`]
pub const TLS_CHARACTERISTICS_ALIGN_MASK: u32 = 0x00F0_0000;

/// `IMAGE_TLS_DIRECTORY32` or `IMAGE_TLS_DIRECTORY64`, with the pointer-sized fields
/// widened to `u64`.
///
/// Read with an [`AddressingWidth`] context.
#[derive(Debug, PartialEq, Copy, Clone, Default)]
#[doc(alias("IMAGE_TLS_DIRECTORY32", "IMAGE_TLS_DIRECTORY64"))]
pub struct TlsDirectory {
    /// VA of the first byte of the TLS template
    pub start_address_of_raw_data: u64,
    /// VA one past the last byte of the TLS template
    pub end_address_of_raw_data: u64,
    /// VA of the slot the loader writes the TLS index into
    pub address_of_index: u64,
    /// VA of the null-terminated array of callback VAs
    pub address_of_callbacks: u64,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

impl TlsDirectory {
    pub fn size(width: AddressingWidth) -> usize {
        4 * width.pointer_size() + 8
    }

    /// The alignment requested by the characteristics, in bytes.
    pub fn alignment(&self) -> Option<u32> {
        match (self.characteristics & TLS_CHARACTERISTICS_ALIGN_MASK) >> 20 {
            0 => None,
            shift @ 1..=14 => Some(1 << (shift - 1)),
            _ => None,
        }
    }
}

impl<'a> ctx::TryFromCtx<'a, AddressingWidth> for TlsDirectory {
    type Error = scroll::Error;

    fn try_from_ctx(bytes: &'a [u8], width: AddressingWidth) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let address = |offset: &mut usize| -> Result<u64, scroll::Error> {
            Ok(match width {
                AddressingWidth::Width32 => bytes.gread_with::<u32>(offset, scroll::LE)? as u64,
                AddressingWidth::Width64 => bytes.gread_with::<u64>(offset, scroll::LE)?,
            })
        };
        let start_address_of_raw_data = address(offset)?;
        let end_address_of_raw_data = address(offset)?;
        let address_of_index = address(offset)?;
        let address_of_callbacks = address(offset)?;
        let size_of_zero_fill = bytes.gread_with(offset, scroll::LE)?;
        let characteristics = bytes.gread_with(offset, scroll::LE)?;
        Ok((
            TlsDirectory {
                start_address_of_raw_data,
                end_address_of_raw_data,
                address_of_index,
                address_of_callbacks,
                size_of_zero_fill,
                characteristics,
            },
            *offset,
        ))
    }
}

/// The thread local storage directory of an image
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsData {
    pub directory: TlsDirectory,
    /// File range of the TLS template, when it lies in the buffer
    pub raw_data_range: Option<Range<usize>>,
    /// Current value of the TLS index slot, if it has file backing
    pub slot: Option<u32>,
    /// Callback VAs in array order, at most [`MAX_TLS_CALLBACKS`]
    pub callbacks: Vec<u64>,
}

impl TlsData {
    pub(crate) fn parse(ctx: &ParseCtx, dd: DataDirectory) -> error::Result<Self> {
        let offset = ctx.rva_to_offset(dd.virtual_address)?;
        let directory = ctx.cursor.read_with::<TlsDirectory, _>(offset, ctx.width)?;
        debug!("{directory:#x?}");

        let start = directory.start_address_of_raw_data;
        let end = directory.end_address_of_raw_data;
        if start > end {
            return Err(error::Error::Malformed(format!(
                "tls raw data starts at {start:#x} after it ends at {end:#x}"
            )));
        }
        let raw_data_range = if start != 0 {
            match template_range(ctx, start, end) {
                Ok(range) => Some(range),
                Err(err) => {
                    warn!("tls raw data is not backed by the file: {err}");
                    None
                }
            }
        } else {
            None
        };

        // MSVC can place the index in .bss, with no file backing at all
        let slot = if directory.address_of_index != 0 {
            ctx.va_to_offset(directory.address_of_index)
                .and_then(|offset| ctx.cursor.read_at::<u32>(offset))
                .ok()
        } else {
            None
        };

        let callbacks = if directory.address_of_callbacks != 0 {
            read_callbacks(ctx, directory.address_of_callbacks)?
        } else {
            Vec::new()
        };
        debug!("{} tls callbacks", callbacks.len());

        Ok(TlsData {
            directory,
            raw_data_range,
            slot,
            callbacks,
        })
    }

    /// The TLS template bytes inside `bytes`, the buffer this was parsed from.
    pub fn raw_data<'a>(&self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        self.raw_data_range.clone().and_then(|range| bytes.get(range))
    }
}

fn template_range(ctx: &ParseCtx, start: u64, end: u64) -> error::Result<Range<usize>> {
    let offset = ctx.va_to_offset(start)?;
    let size = usize::try_from(end - start)
        .map_err(|_| error::Error::Malformed(format!("tls raw data of {:#x} bytes", end - start)))?;
    ctx.cursor.read_fixed(offset, size)?;
    Ok(offset..offset + size)
}

/// Reads callback VAs until a null entry, [`MAX_TLS_CALLBACKS`] entries or the end of
/// the buffer.
fn read_callbacks(ctx: &ParseCtx, address_of_callbacks: u64) -> error::Result<Vec<u64>> {
    let mut offset = ctx.va_to_offset(address_of_callbacks)?;
    let pointer_size = ctx.width.pointer_size();
    let mut callbacks = Vec::new();
    while callbacks.len() < MAX_TLS_CALLBACKS {
        let callback = match ctx.read_address(offset) {
            Ok(callback) => callback,
            Err(err) => {
                warn!("tls callback array runs off the buffer: {err}");
                break;
            }
        };
        if callback == 0 {
            break;
        }
        callbacks.push(callback);
        offset += pointer_size;
    }
    if callbacks.len() == MAX_TLS_CALLBACKS {
        warn!("tls callback array truncated at {MAX_TLS_CALLBACKS} entries");
    }
    Ok(callbacks)
}
