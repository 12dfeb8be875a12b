use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{debug, warn};
use scroll::{Pread, Pwrite, SizeWith};

use crate::error;
use crate::pe::ctx::ParseCtx;
use crate::pe::data_directories::DataDirectory;
use crate::pe::utils;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_EXPORT_DIRECTORY"))]
pub struct ExportDirectoryTable {
    pub export_flags: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name_rva: u32,
    pub ordinal_base: u32,
    pub address_table_entries: u32,
    pub number_of_name_pointers: u32,
    pub export_address_table_rva: u32,
    pub name_pointer_rva: u32,
    pub ordinal_table_rva: u32,
}

pub const SIZEOF_EXPORT_DIRECTORY_TABLE: usize = 40;
pub const SIZEOF_EXPORT_ADDRESS_TABLE_ENTRY: usize = 4;

/// What a forwarder names in the target DLL
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ForwarderSymbol {
    Name(String),
    Ordinal(u32),
}

/// PE binaries have two kinds of reexports, either specifying the dll's name, or the ordinal value of the dll
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Forwarder {
    /// The forwarder string as stored, e.g. `NTDLL.RtlAllocateHeap`
    pub raw: String,
    pub library: String,
    pub symbol: ForwarderSymbol,
}

impl Forwarder {
    /// Splits `DLL.Symbol` or `DLL.#N` at the first dot.
    pub fn parse(raw: &str) -> error::Result<Self> {
        let malformed =
            || error::Error::Malformed(format!("forwarder {raw:?} is not of the form DLL.Symbol"));
        let (library, rest) = raw.split_once('.').ok_or_else(malformed)?;
        if library.is_empty() || rest.is_empty() {
            return Err(malformed());
        }
        let symbol = match rest.strip_prefix('#') {
            Some(ordinal) => ForwarderSymbol::Ordinal(ordinal.parse::<u32>().map_err(|err| {
                error::Error::Malformed(format!("forwarder {raw:?} has a bad ordinal: {err}"))
            })?),
            None => ForwarderSymbol::Name(rest.to_string()),
        };
        Ok(Forwarder {
            raw: raw.to_string(),
            library: library.to_string(),
            symbol,
        })
    }
}

/// An exported symbol in this binary, contains synthetic data (name offset, etc., are computed)
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Export {
    /// `ordinal_base` plus the index into the address table
    pub ordinal: u32,
    pub rva: u32,
    /// Set when the name pointer table names this address
    pub name: Option<String>,
    /// Set when `rva` points inside the export directory itself
    pub forwarder: Option<Forwarder>,
}

/// Export data contains the `dll` name which other libraries can import symbols by (two-level namespace), as well as other important indexing data allowing symbol lookups
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ExportData {
    pub name: Option<String>,
    pub export_directory_table: ExportDirectoryTable,
    pub exports: Vec<Export>,
}

impl ExportData {
    pub(crate) fn parse(ctx: &ParseCtx, dd: DataDirectory) -> error::Result<Self> {
        let export_offset = ctx.rva_to_offset(dd.virtual_address)?;
        let export_directory_table = ctx.cursor.read_at::<ExportDirectoryTable>(export_offset)?;
        debug!("{export_directory_table:#?}");

        let name = match ctx
            .rva_to_offset(export_directory_table.name_rva)
            .and_then(|offset| ctx.cursor.read_c_string(offset, utils::MAX_DLL_NAME_SIZE + 1))
        {
            Ok(name) => Some(name.to_string()),
            Err(err) => {
                warn!("cannot read export DLL name: {err}");
                None
            }
        };

        let addresses = read_u32_table(
            ctx,
            export_directory_table.export_address_table_rva,
            export_directory_table.address_table_entries as usize,
        )?;
        let names = name_table(ctx, &export_directory_table, addresses.len());

        let range = dd.range();
        let mut exports = Vec::new();
        for (idx, (&rva, name)) in addresses.iter().zip(names).enumerate() {
            if rva == 0 {
                continue;
            }
            let forwarder = if range.contains(&rva) {
                match forwarder(ctx, rva) {
                    Ok(forwarder) => Some(forwarder),
                    Err(err) => {
                        warn!("export {idx}: {err}");
                        None
                    }
                }
            } else {
                None
            };
            exports.push(Export {
                ordinal: export_directory_table.ordinal_base.wrapping_add(idx as u32),
                rva,
                name,
                forwarder,
            });
        }
        debug!("{} exports", exports.len());
        Ok(ExportData {
            name,
            export_directory_table,
            exports,
        })
    }
}

fn read_u32_table(ctx: &ParseCtx, rva: u32, count: usize) -> error::Result<Vec<u32>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut offset = ctx.rva_to_offset(rva)?;
    let count = ctx.cursor.clamp_count(offset, count, SIZEOF_EXPORT_ADDRESS_TABLE_ENTRY);
    let mut table = Vec::with_capacity(count);
    for _ in 0..count {
        table.push(ctx.cursor.gread::<u32>(&mut offset)?);
    }
    Ok(table)
}

/// Joins the name pointer table and the ordinal table into a name per address table slot.
///
/// Damage to either table costs the names, not the exports.
fn name_table(ctx: &ParseCtx, table: &ExportDirectoryTable, naddresses: usize) -> Vec<Option<String>> {
    let mut names = vec![None; naddresses];
    let count = table.number_of_name_pointers as usize;
    if count == 0 {
        return names;
    }
    let (pointers, ordinals) = match (
        ctx.rva_to_offset(table.name_pointer_rva),
        ctx.rva_to_offset(table.ordinal_table_rva),
    ) {
        (Ok(pointers), Ok(ordinals)) => (pointers, ordinals),
        (Err(err), _) | (_, Err(err)) => {
            warn!("export names are unreadable: {err}");
            return names;
        }
    };
    let count = ctx
        .cursor
        .clamp_count(pointers, count, 4)
        .min(ctx.cursor.clamp_count(ordinals, count, 2));
    for i in 0..count {
        let (Ok(name_rva), Ok(ordinal)) = (
            ctx.cursor.read_at::<u32>(pointers + i * 4),
            ctx.cursor.read_at::<u16>(ordinals + i * 2),
        ) else {
            break;
        };
        let Some(slot) = names.get_mut(ordinal as usize) else {
            warn!("export name {i} has out of range ordinal index {ordinal}");
            continue;
        };
        match ctx
            .rva_to_offset(name_rva)
            .and_then(|offset| ctx.cursor.read_c_string(offset, utils::MAX_IMPORT_NAME_SIZE))
        {
            Ok(name) => {
                slot.get_or_insert_with(|| name.to_string());
            }
            Err(err) => warn!("export name {i}: {err}"),
        }
    }
    names
}

fn forwarder(ctx: &ParseCtx, rva: u32) -> error::Result<Forwarder> {
    let offset = ctx.rva_to_offset(rva)?;
    let raw = ctx.cursor.read_c_string(offset, utils::MAX_IMPORT_NAME_SIZE)?;
    Forwarder::parse(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use crate::pe::ctx::AddressingWidth;
    use crate::pe::options::ParseOptions;
    use crate::pe::section_table::SectionTable;
    use scroll::Pwrite;

    #[test]
    fn size_export_directory_table() {
        assert_eq!(
            core::mem::size_of::<ExportDirectoryTable>(),
            SIZEOF_EXPORT_DIRECTORY_TABLE
        );
    }

    #[test]
    fn forwarders() {
        let forwarder = Forwarder::parse("NTDLL.RtlAllocateHeap").unwrap();
        assert_eq!(forwarder.library, "NTDLL");
        assert_eq!(
            forwarder.symbol,
            ForwarderSymbol::Name("RtlAllocateHeap".into())
        );
        let forwarder = Forwarder::parse("api-ms-win-core.#12").unwrap();
        assert_eq!(forwarder.symbol, ForwarderSymbol::Ordinal(12));
        assert!(Forwarder::parse("NTDLL").is_err());
        assert!(Forwarder::parse(".Foo").is_err());
        assert!(Forwarder::parse("NTDLL.#x").is_err());
    }

    /// Export directory at RVA 0x1000 (size 0x100) for "demo.dll" with three address
    /// slots: a named function, an empty slot and a forwarder.
    fn image() -> alloc::vec::Vec<u8> {
        let mut bytes = vec![0u8; 0x200];
        let table = ExportDirectoryTable {
            name_rva: 0x1080,
            ordinal_base: 5,
            address_table_entries: 3,
            number_of_name_pointers: 2,
            export_address_table_rva: 0x1040,
            name_pointer_rva: 0x1050,
            ordinal_table_rva: 0x1060,
            ..Default::default()
        };
        bytes.pwrite_with(table, 0, scroll::LE).unwrap();
        // addresses
        bytes.pwrite_with(0x1500u32, 0x40, scroll::LE).unwrap();
        bytes.pwrite_with(0u32, 0x44, scroll::LE).unwrap();
        bytes.pwrite_with(0x10a0u32, 0x48, scroll::LE).unwrap();
        // names
        bytes.pwrite_with(0x1090u32, 0x50, scroll::LE).unwrap();
        bytes.pwrite_with(0x1098u32, 0x54, scroll::LE).unwrap();
        // ordinal indices
        bytes.pwrite_with(0u16, 0x60, scroll::LE).unwrap();
        bytes.pwrite_with(2u16, 0x62, scroll::LE).unwrap();
        bytes[0x80..0x89].copy_from_slice(b"demo.dll\0");
        bytes[0x90..0x95].copy_from_slice(b"Init\0");
        bytes[0x98..0x9d].copy_from_slice(b"Heap\0");
        bytes[0xa0..0xb6].copy_from_slice(b"NTDLL.RtlAllocateHeap\0");
        bytes
    }

    #[test]
    fn exports_and_forwarders() {
        let bytes = image();
        let sections = [SectionTable {
            virtual_address: 0x1000,
            virtual_size: 0x200,
            size_of_raw_data: 0x200,
            ..Default::default()
        }];
        let ctx = ParseCtx::new(
            Cursor::new(&bytes),
            &sections,
            AddressingWidth::Width32,
            0,
            ParseOptions::default(),
        );
        let dd = DataDirectory {
            virtual_address: 0x1000,
            size: 0x100,
        };
        let data = ExportData::parse(&ctx, dd).unwrap();
        assert_eq!(data.name.as_deref(), Some("demo.dll"));
        assert_eq!(data.exports.len(), 2);

        let init = &data.exports[0];
        assert_eq!(init.ordinal, 5);
        assert_eq!(init.rva, 0x1500);
        assert_eq!(init.name.as_deref(), Some("Init"));
        assert_eq!(init.forwarder, None);

        let heap = &data.exports[1];
        assert_eq!(heap.ordinal, 7);
        assert_eq!(heap.name.as_deref(), Some("Heap"));
        let forwarder = heap.forwarder.as_ref().unwrap();
        assert_eq!(forwarder.library, "NTDLL");
        assert_eq!(forwarder.raw, "NTDLL.RtlAllocateHeap");
    }

    #[test]
    fn huge_counts_are_clamped() {
        let mut bytes = image();
        bytes.pwrite_with(0xffff_ffffu32, 20, scroll::LE).unwrap();
        bytes.pwrite_with(0xffff_ffffu32, 24, scroll::LE).unwrap();
        let sections = [SectionTable {
            virtual_address: 0x1000,
            virtual_size: 0x200,
            size_of_raw_data: 0x200,
            ..Default::default()
        }];
        let ctx = ParseCtx::new(
            Cursor::new(&bytes),
            &sections,
            AddressingWidth::Width32,
            0,
            ParseOptions::default(),
        );
        let dd = DataDirectory {
            virtual_address: 0x1000,
            size: 0x100,
        };
        let data = ExportData::parse(&ctx, dd).unwrap();
        // every non-zero dword from the address table to the end of the buffer
        assert!(data.exports.len() <= (0x200 - 0x40) / 4);
        assert_eq!(data.exports[0].name.as_deref(), Some("Init"));
    }
}
