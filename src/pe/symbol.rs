use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{debug, warn};
use scroll::{Pread, Pwrite, SizeWith};

use crate::cursor::Cursor;
use crate::error;
use crate::pe::header::CoffHeader;
use crate::strtab;

/// Size of a single symbol in the COFF Symbol Table.
pub const COFF_SYMBOL_SIZE: usize = 18;

/// Size of the length field that opens the COFF string table.
const STRING_TABLE_LENGTH_SIZE: usize = 4;

// Values for `Symbol::section_number`.

/// The symbol record is not yet assigned a section.
pub const IMAGE_SYM_UNDEFINED: i16 = 0;
/// The symbol has an absolute (non-relocatable) `value` and is not an address.
pub const IMAGE_SYM_ABSOLUTE: i16 = -1;
/// The symbol provides general type or debugging information but does not
/// correspond to a section.
pub const IMAGE_SYM_DEBUG: i16 = -2;

pub const IMAGE_SYM_TYPE_MASK: u16 = 0xf;
pub const IMAGE_SYM_DTYPE_SHIFT: usize = 4;
/// The symbol is a function that returns a base type.
pub const IMAGE_SYM_DTYPE_FUNCTION: u16 = 2;

// Values for `Symbol::storage_class`.

/// A value that Microsoft tools use for external symbols.
pub const IMAGE_SYM_CLASS_EXTERNAL: u8 = 2;
/// A static symbol.
pub const IMAGE_SYM_CLASS_STATIC: u8 = 3;
/// A code label that is defined within the module.
pub const IMAGE_SYM_CLASS_LABEL: u8 = 6;
/// A value that Microsoft tools use for symbol records that define the extent of a function.
pub const IMAGE_SYM_CLASS_FUNCTION: u8 = 101;
/// The source-file symbol record, followed by auxiliary records that name the file.
pub const IMAGE_SYM_CLASS_FILE: u8 = 103;
/// A weak external.
pub const IMAGE_SYM_CLASS_WEAK_EXTERNAL: u8 = 105;

/// A COFF symbol record as stored on disk.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Default, Pread, Pwrite, SizeWith)]
pub struct Symbol {
    /// The name of the symbol.
    ///
    /// An array of 8 bytes is used if the name is not more than 8 bytes long.
    /// For longer names, the first 4 bytes are all zeros, and the second 4 bytes
    /// are an offset into the string table.
    pub name: [u8; 8],
    /// The value that is associated with the symbol.
    pub value: u32,
    /// A one-based index into the section table. Zero and negative values have special meanings.
    pub section_number: i16,
    /// Microsoft tools set this field to 0x20 (function) or 0x0 (not a function).
    pub typ: u16,
    pub storage_class: u8,
    /// The number of 18 byte auxiliary records that follow this one.
    pub number_of_aux_symbols: u8,
}

impl Symbol {
    /// Return the strtab offset of the symbol name.
    ///
    /// Returns `None` if the name is inline.
    pub fn name_offset(&self) -> Option<u32> {
        if self.name[0] == 0 {
            self.name.pread_with(4, scroll::LE).ok()
        } else {
            None
        }
    }

    /// Returns the symbol name, inline or from the string table.
    pub fn name<'a>(&'a self, strtab: &strtab::Strtab<'a>) -> error::Result<&'a str> {
        match self.name_offset() {
            // string table offsets count the length field
            Some(offset) => (offset as usize)
                .checked_sub(STRING_TABLE_LENGTH_SIZE)
                .and_then(|offset| strtab.get_at(offset))
                .ok_or_else(|| {
                    error::Error::Malformed(format!("Invalid Symbol name offset {offset:#x}"))
                }),
            None => {
                let len = self.name.iter().position(|&b| b == 0).unwrap_or(8);
                core::str::from_utf8(&self.name[..len]).map_err(|_| {
                    error::Error::Malformed("inline symbol name is not valid UTF-8".into())
                })
            }
        }
    }

    /// Return the base type of the symbol.
    pub fn base_type(&self) -> u16 {
        self.typ & IMAGE_SYM_TYPE_MASK
    }

    /// Return the derived type of the symbol.
    pub fn derived_type(&self) -> u16 {
        self.typ >> IMAGE_SYM_DTYPE_SHIFT
    }
}

/// A decoded COFF symbol with its name resolved.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoffSymbol {
    /// `None` when a long name points outside the string table
    pub name: Option<String>,
    pub value: u32,
    pub section_number: i16,
    pub typ: u16,
    pub storage_class: u8,
    pub number_of_aux_symbols: u8,
}

/// A COFF symbol table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolTable<'a> {
    symbols: &'a [u8],
}

impl<'a> SymbolTable<'a> {
    /// Parse a COFF symbol table at the given offset.
    ///
    /// `number` comes from the COFF header and is clamped to the records that fit.
    pub fn parse(cursor: &Cursor<'a>, offset: usize, number: usize) -> error::Result<Self> {
        let fits = cursor.clamp_count(offset, number, COFF_SYMBOL_SIZE);
        if fits < number {
            warn!("COFF symbol table claims {number} symbols but only {fits} fit");
        }
        let symbols = cursor.read_fixed(offset, Self::size(fits))?;
        Ok(SymbolTable { symbols })
    }

    /// Get the size in bytes of the symbol table.
    pub fn size(number: usize) -> usize {
        number * COFF_SYMBOL_SIZE
    }

    /// Return an iterator for the COFF symbols.
    ///
    /// This iterator skips over auxiliary symbol records.
    pub fn iter(&self) -> SymbolIterator<'a> {
        SymbolIterator {
            index: 0,
            symbols: self.symbols,
        }
    }
}

/// An iterator for COFF symbols.
///
/// This iterator skips over auxiliary symbol records.
#[derive(Default)]
pub struct SymbolIterator<'a> {
    index: usize,
    symbols: &'a [u8],
}

impl Iterator for SymbolIterator<'_> {
    type Item = (usize, Symbol);
    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.index.checked_mul(COFF_SYMBOL_SIZE)?;
        if offset >= self.symbols.len() {
            None
        } else {
            let index = self.index;
            let symbol = self.symbols.pread_with::<Symbol>(offset, scroll::LE).ok()?;
            self.index += 1 + symbol.number_of_aux_symbols as usize;
            Some((index, symbol))
        }
    }
}

/// Reads the COFF string table at `offset`: a `u32` length that counts itself, then
/// NUL-terminated strings.
pub fn parse_string_table<'a>(cursor: &Cursor<'a>, offset: usize) -> error::Result<strtab::Strtab<'a>> {
    let length = cursor.read_at::<u32>(offset)? as usize;
    if length < STRING_TABLE_LENGTH_SIZE {
        return Ok(strtab::Strtab::default());
    }
    strtab::Strtab::parse(
        cursor,
        offset + STRING_TABLE_LENGTH_SIZE,
        length - STRING_TABLE_LENGTH_SIZE,
        0,
    )
}

/// Decodes the deprecated COFF symbol table and string table an image may still carry.
///
/// Both are empty when the COFF header has no symbol table pointer. An unreadable
/// string table only costs the long names: those symbols keep a `None` name.
pub fn parse(cursor: &Cursor, coff_header: &CoffHeader) -> error::Result<(Vec<CoffSymbol>, Vec<String>)> {
    let Some(string_table_offset) = coff_header.string_table_offset() else {
        return Ok((Vec::new(), Vec::new()));
    };
    let offset = coff_header.pointer_to_symbol_table as usize;
    let table = SymbolTable::parse(cursor, offset, coff_header.number_of_symbol_table as usize)?;
    let strtab = match parse_string_table(cursor, string_table_offset) {
        Ok(strtab) => strtab,
        Err(err) => {
            warn!("COFF string table at {string_table_offset:#x}: {err}");
            strtab::Strtab::default()
        }
    };

    let mut symbols = Vec::new();
    for (index, symbol) in table.iter() {
        let name = match symbol.name(&strtab) {
            Ok(name) => Some(name.to_string()),
            Err(err) => {
                warn!("COFF symbol {index}: {err}");
                None
            }
        };
        symbols.push(CoffSymbol {
            name,
            value: symbol.value,
            section_number: symbol.section_number,
            typ: symbol.typ,
            storage_class: symbol.storage_class,
            number_of_aux_symbols: symbol.number_of_aux_symbols,
        });
    }
    let strings = strtab.to_vec();
    debug!("{} COFF symbols, {} strings", symbols.len(), strings.len());
    Ok((symbols, strings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::Pwrite;
    use scroll::ctx::SizeWith;

    const TABLE_OFFSET: usize = 0x10;

    fn symbol_table(symbols: &[Symbol], strings: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; TABLE_OFFSET + symbols.len() * COFF_SYMBOL_SIZE];
        let mut offset = TABLE_OFFSET;
        for symbol in symbols {
            bytes.gwrite_with(*symbol, &mut offset, scroll::LE).unwrap();
        }
        bytes.extend_from_slice(&((strings.len() + 4) as u32).to_le_bytes());
        bytes.extend_from_slice(strings);
        bytes
    }

    fn long_name(offset: u32) -> [u8; 8] {
        let mut name = [0u8; 8];
        name[4..].copy_from_slice(&offset.to_le_bytes());
        name
    }

    #[test]
    fn sizeof_symbol() {
        assert_eq!(Symbol::size_with(&scroll::LE), COFF_SYMBOL_SIZE);
    }

    #[test]
    fn names_and_aux_records() {
        let file = Symbol {
            name: *b".file\0\0\0",
            section_number: IMAGE_SYM_DEBUG,
            storage_class: IMAGE_SYM_CLASS_FILE,
            number_of_aux_symbols: 1,
            ..Default::default()
        };
        let aux = Symbol {
            name: *b"main.c\0\0",
            ..Default::default()
        };
        let function = Symbol {
            name: long_name(4),
            value: 0x10,
            section_number: 1,
            typ: IMAGE_SYM_DTYPE_FUNCTION << IMAGE_SYM_DTYPE_SHIFT,
            storage_class: IMAGE_SYM_CLASS_EXTERNAL,
            ..Default::default()
        };
        let bytes = symbol_table(&[file, aux, function], b"a_rather_long_name\0");
        let cursor = Cursor::new(&bytes);
        let mut coff_header = CoffHeader {
            pointer_to_symbol_table: 0,
            number_of_symbol_table: 3,
            ..Default::default()
        };
        // no pointer, no table
        let (symbols, strings) = parse(&cursor, &coff_header).unwrap();
        assert!(symbols.is_empty() && strings.is_empty());

        let table = SymbolTable::parse(&cursor, TABLE_OFFSET, 3).unwrap();
        let strtab =
            parse_string_table(&cursor, TABLE_OFFSET + 3 * COFF_SYMBOL_SIZE).unwrap();
        let decoded = table.iter().collect::<Vec<_>>();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].1.name(&strtab).unwrap(), ".file");
        assert_eq!(decoded[1].0, 2);
        assert_eq!(decoded[1].1.name(&strtab).unwrap(), "a_rather_long_name");
        assert_eq!(decoded[1].1.derived_type(), IMAGE_SYM_DTYPE_FUNCTION);

        coff_header.pointer_to_symbol_table = TABLE_OFFSET as u32;
        let (symbols, strings) = parse(&cursor, &coff_header).unwrap();
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[1].name.as_deref(), Some("a_rather_long_name"));
        assert_eq!(symbols[1].value, 0x10);
        assert_eq!(symbols[0].number_of_aux_symbols, 1);
        assert_eq!(strings, ["a_rather_long_name"]);
    }

    #[test]
    fn truncated_string_table_keeps_symbols() {
        let symbols = [
            Symbol {
                name: *b"main\0\0\0\0",
                ..Default::default()
            },
            Symbol {
                name: long_name(4),
                ..Default::default()
            },
        ];
        let mut bytes = symbol_table(&symbols, b"abc\0");
        bytes.truncate(bytes.len() - 2);
        let cursor = Cursor::new(&bytes);
        let coff_header = CoffHeader {
            pointer_to_symbol_table: TABLE_OFFSET as u32,
            number_of_symbol_table: 2,
            ..Default::default()
        };
        let (symbols, strings) = parse(&cursor, &coff_header).unwrap();
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].name.as_deref(), Some("main"));
        assert_eq!(symbols[1].name, None);
        assert!(strings.is_empty());
    }

    #[test]
    fn string_table_past_a_clamped_count() {
        let bytes = symbol_table(&[Symbol::default()], b"abc\0");
        let cursor = Cursor::new(&bytes);
        let coff_header = CoffHeader {
            pointer_to_symbol_table: TABLE_OFFSET as u32,
            number_of_symbol_table: 0x10_0000,
            ..Default::default()
        };
        let (symbols, strings) = parse(&cursor, &coff_header).unwrap();
        assert!(!symbols.is_empty());
        assert!(strings.is_empty());
    }

    #[test]
    fn one_bad_long_name_spares_the_rest() {
        let symbols = [
            Symbol {
                name: *b".text\0\0\0",
                ..Default::default()
            },
            Symbol {
                name: long_name(4),
                ..Default::default()
            },
            // "good_long_name\0" is 15 bytes
            Symbol {
                name: long_name(4 + 15),
                ..Default::default()
            },
        ];
        let bytes = symbol_table(&symbols, b"good_long_name\0\xff\xfe_bad\0");
        let cursor = Cursor::new(&bytes);
        let coff_header = CoffHeader {
            pointer_to_symbol_table: TABLE_OFFSET as u32,
            number_of_symbol_table: 3,
            ..Default::default()
        };
        let (symbols, strings) = parse(&cursor, &coff_header).unwrap();
        let names: Vec<_> = symbols.iter().map(|symbol| symbol.name.as_deref()).collect();
        assert_eq!(names, [Some(".text"), Some("good_long_name"), None]);
        assert_eq!(strings, ["good_long_name", "\u{fffd}\u{fffd}_bad"]);
    }

    #[test]
    fn bad_long_name_offset() {
        let symbol = Symbol {
            name: long_name(0x400),
            ..Default::default()
        };
        let strtab = strtab::Strtab::new(b"abc\0", 0);
        assert!(symbol.name(&strtab).is_err());
        let symbol = Symbol {
            name: long_name(2),
            ..Default::default()
        };
        assert!(symbol.name(&strtab).is_err());
    }

    #[test]
    fn count_clamped_to_buffer() {
        let bytes = vec![0u8; COFF_SYMBOL_SIZE * 2 + 5];
        let cursor = Cursor::new(&bytes);
        let table = SymbolTable::parse(&cursor, 0, 1_000_000).unwrap();
        assert_eq!(table.iter().count(), 2);
    }
}
