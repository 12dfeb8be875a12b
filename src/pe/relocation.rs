//! The base relocation directory (`.reloc`): the fixups the loader applies when an image
//! cannot be mapped at its preferred base.

use alloc::vec::Vec;

use log::{debug, warn};
use scroll::{Pread, Pwrite, SizeWith};

use crate::error;
use crate::pe::ctx::ParseCtx;
use crate::pe::data_directories::DataDirectory;

/// Padding entry, skipped by the loader
pub const IMAGE_REL_BASED_ABSOLUTE: u8 = 0;
/// High 16 bits of a 32-bit fixup
pub const IMAGE_REL_BASED_HIGH: u8 = 1;
/// Low 16 bits of a 32-bit fixup
pub const IMAGE_REL_BASED_LOW: u8 = 2;
/// Full 32-bit fixup
pub const IMAGE_REL_BASED_HIGHLOW: u8 = 3;
/// High 16 bits adjusted by the following entry
pub const IMAGE_REL_BASED_HIGHADJ: u8 = 4;
/// ARM `movw`/`movt` pair
pub const IMAGE_REL_BASED_ARM_MOV32: u8 = 5;
/// Thumb `movw`/`movt` pair
pub const IMAGE_REL_BASED_THUMB_MOV32: u8 = 7;
/// Full 64-bit fixup
pub const IMAGE_REL_BASED_DIR64: u8 = 10;

/// Size of the `IMAGE_BASE_RELOCATION` block header
pub const SIZEOF_RELOCATION_BLOCK_HEADER: usize = 8;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_BASE_RELOCATION"))]
pub struct RelocationBlockHeader {
    /// RVA of the 4 KiB page the entries patch
    pub page_rva: u32,
    /// Size of the block including this header
    pub block_size: u32,
}

/// One 16-bit relocation word
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct RelocationEntry {
    /// `IMAGE_REL_BASED_*`, the high 4 bits
    pub typ: u8,
    /// Offset into the page, the low 12 bits
    pub offset: u16,
}

impl From<u16> for RelocationEntry {
    fn from(word: u16) -> Self {
        RelocationEntry {
            typ: (word >> 12) as u8,
            offset: word & 0x0fff,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct RelocationBlock {
    pub page_rva: u32,
    pub block_size: u32,
    pub entries: Vec<RelocationEntry>,
}

impl RelocationBlock {
    /// The RVAs patched by this block, padding entries excluded.
    pub fn rvas(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.typ != IMAGE_REL_BASED_ABSOLUTE)
            .map(move |entry| self.page_rva.wrapping_add(entry.offset as u32))
    }
}

/// The base relocation directory of an image
#[derive(Debug, PartialEq, Clone, Default)]
pub struct RelocationData {
    pub blocks: Vec<RelocationBlock>,
}

impl RelocationData {
    /// Walks relocation blocks inside the directory.
    ///
    /// Every block advances the walk by exactly its declared size and entries never
    /// extend past the directory's last byte. A block declaring fewer bytes than its own
    /// header is malformed.
    pub(crate) fn parse(ctx: &ParseCtx, dd: DataDirectory) -> error::Result<Self> {
        let start = ctx.rva_to_offset(dd.virtual_address)?;
        let end = start + (dd.size as usize).min(ctx.cursor.remaining(start));
        if end - start < dd.size as usize {
            warn!(
                "relocation directory of {:#x} bytes clipped to {:#x}",
                dd.size,
                end - start
            );
        }
        let mut blocks = Vec::new();
        let mut offset = start;
        while end - offset >= SIZEOF_RELOCATION_BLOCK_HEADER {
            let header = ctx.cursor.read_at::<RelocationBlockHeader>(offset)?;
            let block_size = header.block_size as usize;
            if block_size < SIZEOF_RELOCATION_BLOCK_HEADER {
                return Err(error::Error::Malformed(format!(
                    "relocation block at {offset:#x} declares {block_size:#x} bytes"
                )));
            }
            let entries_start = offset + SIZEOF_RELOCATION_BLOCK_HEADER;
            let available = (end - entries_start) / 2;
            let count = (block_size - SIZEOF_RELOCATION_BLOCK_HEADER) / 2;
            if count > available {
                warn!(
                    "relocation block at {offset:#x} claims {count} entries, only {available} fit"
                );
            }
            let count = count.min(available);
            let mut entries = Vec::with_capacity(count);
            let mut entry_offset = entries_start;
            for _ in 0..count {
                let word = ctx.cursor.gread::<u16>(&mut entry_offset)?;
                entries.push(RelocationEntry::from(word));
            }
            blocks.push(RelocationBlock {
                page_rva: header.page_rva,
                block_size: header.block_size,
                entries,
            });
            match offset.checked_add(block_size) {
                Some(next) if next <= end => offset = next,
                _ => break,
            }
        }
        debug!("{} relocation blocks in [{start:#x}, {end:#x})", blocks.len());
        Ok(RelocationData { blocks })
    }
}
