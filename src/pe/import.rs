use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{debug, warn};
use scroll::{Pread, Pwrite, SizeWith};

use crate::error;
use crate::pe::ctx::ParseCtx;
use crate::pe::data_directories::DataDirectory;
use crate::pe::utils;

/// Mask for the RVA of a hint/name entry, bits 0..31 in both widths
pub const IMPORT_RVA_MASK: u64 = 0x7fff_ffff;
/// An ordinal import keeps its ordinal in the low 16 bits
pub const IMPORT_ORDINAL_MASK: u64 = 0xffff;
/// Thunks read over the whole import directory, every descriptor included
pub const MAX_IMPORTED_FUNCTIONS: usize = 0x10000;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_IMPORT_DESCRIPTOR"))]
pub struct ImportDirectoryEntry {
    pub import_lookup_table_rva: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name_rva: u32,
    pub import_address_table_rva: u32,
}

pub const SIZEOF_IMPORT_DIRECTORY_ENTRY: usize = 20;

impl ImportDirectoryEntry {
    pub fn is_null(&self) -> bool {
        (self.import_lookup_table_rva == 0)
            && (self.time_date_stamp == 0)
            && (self.forwarder_chain == 0)
            && (self.name_rva == 0)
            && (self.import_address_table_rva == 0)
    }

    /// The thunk array to walk: the lookup table, or the IAT when a linker left the lookup
    /// table out.
    pub fn thunk_table_rva(&self) -> u32 {
        if self.import_lookup_table_rva != 0 {
            self.import_lookup_table_rva
        } else {
            self.import_address_table_rva
        }
    }
}

/// A hint/name table entry
#[derive(Debug, PartialEq, Clone)]
pub struct HintNameTableEntry {
    pub hint: u16,
    pub name: String,
}

/// A single function imported from a DLL
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ImportedFunction {
    /// Set when imported by name
    pub name: Option<String>,
    /// Set when imported by ordinal
    pub ordinal: Option<u16>,
    /// Index hint into the exporting DLL's name pointer table
    pub hint: u16,
    /// The raw thunk value
    pub thunk: u64,
    /// RVA of the IAT slot the loader patches for this function
    pub iat_rva: u32,
}

/// Everything imported from one DLL
#[derive(Debug, PartialEq, Clone)]
pub struct Import {
    /// The validated DLL name
    pub name: String,
    pub descriptor: ImportDirectoryEntry,
    pub functions: Vec<ImportedFunction>,
}

/// The import directory of an image
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ImportData {
    pub imports: Vec<Import>,
}

impl ImportData {
    /// Walks import descriptors until an all-zero descriptor or the end of the directory.
    ///
    /// A descriptor whose DLL name cannot be read or is not a plausible file name is
    /// dropped, and so is any function whose name fails the same check. At most
    /// [`MAX_IMPORTED_FUNCTIONS`] thunks are read in total, so descriptors sharing one
    /// long thunk array cannot multiply the work.
    pub(crate) fn parse(ctx: &ParseCtx, dd: DataDirectory) -> error::Result<Self> {
        let mut offset = ctx.rva_to_offset(dd.virtual_address)?;
        let count = ctx.cursor.clamp_count(
            offset,
            dd.size as usize / SIZEOF_IMPORT_DIRECTORY_ENTRY,
            SIZEOF_IMPORT_DIRECTORY_ENTRY,
        );
        debug!("import directory at {offset:#x}, up to {count} descriptors");
        let mut imports = Vec::new();
        let mut budget = MAX_IMPORTED_FUNCTIONS;
        for i in 0..count {
            let descriptor = ctx.cursor.gread::<ImportDirectoryEntry>(&mut offset)?;
            if descriptor.is_null() {
                break;
            }
            let name = match dll_name(ctx, descriptor.name_rva) {
                Ok(name) => name,
                Err(err) => {
                    warn!("skipping import descriptor {i}: {err}");
                    continue;
                }
            };
            let functions = parse_thunks(ctx, &descriptor, &name, &mut budget);
            debug!("{name}: {} functions", functions.len());
            imports.push(Import {
                name,
                descriptor,
                functions,
            });
        }
        Ok(ImportData { imports })
    }
}

fn dll_name(ctx: &ParseCtx, name_rva: u32) -> error::Result<String> {
    let offset = ctx.rva_to_offset(name_rva)?;
    let name = ctx.cursor.read_c_string(offset, utils::MAX_DLL_NAME_SIZE + 1)?;
    if !utils::is_valid_dll_name(name) {
        return Err(error::Error::Malformed(format!(
            "invalid DLL name {name:?} at {offset:#x}"
        )));
    }
    Ok(name.to_string())
}

fn hint_name(ctx: &ParseCtx, rva: u32) -> error::Result<HintNameTableEntry> {
    let offset = ctx.rva_to_offset(rva)?;
    let hint = ctx.cursor.read_at::<u16>(offset)?;
    let name = ctx
        .cursor
        .read_c_string(offset + 2, utils::MAX_IMPORT_NAME_SIZE + 1)?;
    if !utils::is_valid_import_name(name) {
        return Err(error::Error::Malformed(format!(
            "invalid import name {name:?} at {offset:#x}"
        )));
    }
    Ok(HintNameTableEntry {
        hint,
        name: name.to_string(),
    })
}

/// Reads width-sized thunks until a zero thunk, the end of the buffer or the end of
/// `budget`, which counts down once per non-zero thunk.
fn parse_thunks(
    ctx: &ParseCtx,
    descriptor: &ImportDirectoryEntry,
    dll: &str,
    budget: &mut usize,
) -> Vec<ImportedFunction> {
    let mut functions = Vec::new();
    let table_rva = descriptor.thunk_table_rva();
    if table_rva == 0 {
        return functions;
    }
    let mut offset = match ctx.rva_to_offset(table_rva) {
        Ok(offset) => offset,
        Err(err) => {
            warn!("{dll}: cannot locate thunk table: {err}");
            return functions;
        }
    };
    let pointer_size = ctx.width.pointer_size();
    let ordinal_flag = ctx.width.ordinal_flag();
    let mut iat_rva = descriptor.import_address_table_rva;
    loop {
        let thunk = match ctx.read_address(offset) {
            Ok(thunk) => thunk,
            Err(err) => {
                warn!("{dll}: thunk table runs off the buffer: {err}");
                break;
            }
        };
        if thunk == 0 {
            break;
        }
        if *budget == 0 {
            warn!("{dll}: {MAX_IMPORTED_FUNCTIONS} import thunks already read, skipping the rest");
            break;
        }
        *budget -= 1;
        let function = if thunk & ordinal_flag != 0 {
            Some(ImportedFunction {
                name: None,
                ordinal: Some((thunk & IMPORT_ORDINAL_MASK) as u16),
                hint: 0,
                thunk,
                iat_rva,
            })
        } else {
            match hint_name(ctx, (thunk & IMPORT_RVA_MASK) as u32) {
                Ok(entry) => Some(ImportedFunction {
                    name: Some(entry.name),
                    ordinal: None,
                    hint: entry.hint,
                    thunk,
                    iat_rva,
                }),
                Err(err) => {
                    warn!("{dll}: skipping thunk {thunk:#x}: {err}");
                    None
                }
            }
        };
        functions.extend(function);
        offset += pointer_size;
        iat_rva = iat_rva.wrapping_add(pointer_size as u32);
    }
    functions
}
