//! A PE32 and PE32+ parser
//!

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use log::{debug, warn};

use crate::cursor::Cursor;
use crate::error;

pub mod authenticode;
pub mod certificate_table;
pub mod ctx;
pub mod data_directories;
pub mod debug;
pub mod export;
pub mod header;
pub mod import;
pub mod load_config;
pub mod optional_header;
pub mod options;
pub mod relocation;
pub mod resource;
pub mod rich_header;
pub mod section_table;
pub mod symbol;
pub mod tls;
pub mod utils;

use self::ctx::{AddressingWidth, ParseCtx};
use self::data_directories::{DataDirectories, DirectoryKind};

/// The largest buffer [`parse`] accepts, 3 GiB
pub const MAX_DATA_SIZE: usize = 3 * 1024 * 1024 * 1024;

/// The part of an image a [`ParseFailure`] was recorded against
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Component {
    /// One of the sixteen data directories
    Directory(DirectoryKind),
    /// The COFF symbol and string tables
    SymbolTable,
    RichHeader,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Component::Directory(kind) => write!(f, "{kind}"),
            Component::SymbolTable => f.write_str("COFF symbol table"),
            Component::RichHeader => f.write_str("rich header"),
        }
    }
}

/// A component that could not be decoded; the rest of the image was still parsed.
#[derive(Debug)]
pub struct ParseFailure {
    pub component: Component,
    pub error: error::Error,
}

/// Bytes appended after the raw data of the last section
#[derive(Debug, PartialEq, Clone)]
pub struct Overlay {
    /// File offset where the overlay starts
    pub offset: usize,
    pub data: Vec<u8>,
}

impl Overlay {
    fn parse(cursor: &Cursor, sections: &[section_table::SectionTable]) -> Option<Self> {
        let end = sections
            .iter()
            .filter(|section| section.size_of_raw_data != 0)
            .map(|section| section.raw_data_end())
            .max()?;
        let offset = usize::try_from(end).ok()?;
        if offset >= cursor.len() {
            return None;
        }
        let data = cursor.read_fixed(offset, cursor.remaining(offset)).ok()?.to_vec();
        debug!("overlay at {offset:#x}: {:#x} bytes", data.len());
        Some(Overlay { offset, data })
    }
}

#[derive(Debug)]
/// An analyzed PE binary
pub struct Binary {
    /// The name this image was parsed under, usually its file name
    pub name: String,
    /// The PE header
    pub header: header::Header,
    /// PE32 or PE32+
    pub width: AddressingWidth,
    /// A list of the sections in this PE binary
    pub sections: Vec<section_table::SectionTable>,
    pub data_directories: DataDirectories,
    /// The DOS program between the DOS header and the PE header
    pub dos_stub: Vec<u8>,
    pub rich_header: Option<rich_header::RichHeader>,
    /// The import table, one entry per imported DLL
    pub imports: Vec<import::Import>,
    /// The DLLs this image imports from, sorted and deduplicated
    pub libraries: Vec<String>,
    pub exports: Option<export::ExportData>,
    pub tls: Option<tls::TlsData>,
    pub load_config: Option<load_config::LoadConfigData>,
    pub relocations: Option<relocation::RelocationData>,
    pub resources: Option<resource::ResourceTree>,
    pub debug: Option<debug::DebugData>,
    /// The attribute certificate table, if present and requested
    pub signature: Option<certificate_table::Signature>,
    pub symbols: Vec<symbol::CoffSymbol>,
    pub strings: Vec<String>,
    pub overlay: Option<Overlay>,
    /// Components that failed to decode
    pub failures: Vec<ParseFailure>,
    /// Whether this is a `dll` or not
    pub is_lib: bool,
    /// the entry point of the binary
    pub entry: usize,
    /// The binary's preferred base address, used to turn virtual addresses into RVAs
    pub image_base: u64,
    authenticode_excluded_sections: Option<authenticode::ExcludedSections>,
}

impl Binary {
    /// Whether this is a PE32+ image
    pub fn is_64(&self) -> bool {
        self.width.is_64()
    }

    /// The name of this `dll` according to its export directory, if it has one
    pub fn dll_name(&self) -> Option<&str> {
        self.exports.as_ref().and_then(|exports| exports.name.as_deref())
    }

    /// Whether decoding `component` failed
    pub fn failed(&self, component: Component) -> bool {
        self.failures.iter().any(|failure| failure.component == component)
    }
}

/// Reads a PE binary from the underlying `bytes`
pub fn parse(bytes: &[u8], name_hint: &str) -> error::Result<Binary> {
    parse_with_opts(bytes, name_hint, &options::ParseOptions::default())
}

/// Reads a PE binary from the underlying `bytes` with the given options.
///
/// Only the headers and the section table are fatal: a directory, the rich header or the
/// COFF symbol table that fails to decode is recorded in [`Binary::failures`] and left
/// empty.
pub fn parse_with_opts(
    bytes: &[u8],
    name_hint: &str,
    opts: &options::ParseOptions,
) -> error::Result<Binary> {
    if bytes.len() > MAX_DATA_SIZE {
        return Err(error::Error::TooLarge {
            size: bytes.len(),
            max: MAX_DATA_SIZE,
        });
    }
    let cursor = Cursor::new(bytes);
    let header = header::Header::parse(&cursor)?;
    let width = header.optional_header.width()?;
    debug!("{name_hint}: {width:?} image, {header:#?}");

    let mut offset = header.section_table_offset;
    let sections = header.coff_header.sections(
        &cursor,
        &mut offset,
        opts.parse_mode.is_permissive(),
    )?;
    let is_lib = header.coff_header.is_dll();
    let entry = header.optional_header.standard_fields.address_of_entry_point as usize;
    let image_base = header.optional_header.windows_fields.image_base;
    let data_directories = header.optional_header.data_directories;
    let dos_stub = header.dos_header.stub(&cursor);

    let mut failures = Vec::new();
    let rich_header = recorded(
        &mut failures,
        Component::RichHeader,
        rich_header::RichHeader::parse(&cursor, &header.dos_header),
    )
    .flatten();

    let ctx = ParseCtx::new(cursor, &sections, width, image_base, *opts);
    let mut imports = Vec::new();
    let mut exports = None;
    let mut tls = None;
    let mut load_config = None;
    let mut relocations = None;
    let mut resources = None;
    let mut debug = None;
    let mut signature = None;
    for (kind, dd) in data_directories.dirs() {
        if dd.size == 0 {
            debug!("{kind} is empty, skipping");
            continue;
        }
        let component = Component::Directory(kind);
        match kind {
            DirectoryKind::ExportTable => {
                exports = recorded(&mut failures, component, export::ExportData::parse(&ctx, dd));
            }
            DirectoryKind::ImportTable => {
                if let Some(data) =
                    recorded(&mut failures, component, import::ImportData::parse(&ctx, dd))
                {
                    imports = data.imports;
                }
            }
            DirectoryKind::ResourceTable => {
                resources =
                    recorded(&mut failures, component, resource::ResourceTree::parse(&ctx, dd));
            }
            DirectoryKind::CertificateTable => {
                if !opts.parse_attribute_certificates {
                    debug!("attribute certificates are not requested, skipping");
                    continue;
                }
                signature = recorded(
                    &mut failures,
                    component,
                    certificate_table::Signature::parse(&cursor, dd),
                );
            }
            DirectoryKind::BaseRelocationTable => {
                relocations = recorded(
                    &mut failures,
                    component,
                    relocation::RelocationData::parse(&ctx, dd),
                );
            }
            DirectoryKind::DebugTable => {
                debug = recorded(&mut failures, component, debug::DebugData::parse(&ctx, dd));
            }
            DirectoryKind::TlsTable => {
                tls = recorded(&mut failures, component, tls::TlsData::parse(&ctx, dd));
            }
            DirectoryKind::LoadConfigTable => {
                load_config = recorded(
                    &mut failures,
                    component,
                    load_config::LoadConfigData::parse(&ctx, dd),
                );
            }
            _ => debug!("{kind} at {:#x} is kept undecoded", dd.virtual_address),
        }
    }

    let (symbols, strings) = recorded(
        &mut failures,
        Component::SymbolTable,
        symbol::parse(&cursor, &header.coff_header),
    )
    .unwrap_or_default();

    let mut libraries: Vec<String> = imports.iter().map(|import| import.name.to_string()).collect();
    libraries.sort();
    libraries.dedup();

    let overlay = Overlay::parse(&cursor, &sections);
    let authenticode_excluded_sections =
        authenticode::ExcludedSections::new(&header, width, bytes.len());

    Ok(Binary {
        name: name_hint.to_string(),
        header,
        width,
        sections,
        data_directories,
        dos_stub,
        rich_header,
        imports,
        libraries,
        exports,
        tls,
        load_config,
        relocations,
        resources,
        debug,
        signature,
        symbols,
        strings,
        overlay,
        failures,
        is_lib,
        entry,
        image_base,
        authenticode_excluded_sections,
    })
}

/// Reads the PE binary at `path`, named after its file name.
#[cfg(feature = "std")]
pub fn parse_file<P: AsRef<std::path::Path>>(path: P) -> error::Result<Binary> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)?.len();
    if size > MAX_DATA_SIZE as u64 {
        return Err(error::Error::TooLarge {
            size: usize::try_from(size).unwrap_or(usize::MAX),
            max: MAX_DATA_SIZE,
        });
    }
    let bytes = std::fs::read(path)?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    parse(&bytes, &name)
}

/// Keeps the value of `result`, or records its error against `component`.
fn recorded<T>(
    failures: &mut Vec<ParseFailure>,
    component: Component,
    result: error::Result<T>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            warn!("failed to parse the {component}: {error}");
            failures.push(ParseFailure { component, error });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::header::tests::CRSS_HEADER;
    use crate::pe::options::ParseOptions;
    use crate::pe::section_table::SectionTable;

    #[test]
    fn too_small() {
        let bytes = [0x4d, 0x5a, 0, 0];
        assert!(matches!(parse(&bytes, "tiny"), Err(error::Error::Malformed(_))));
    }

    #[test]
    fn headers_only_image() {
        // the section table is intact but every directory points past the headers
        let binary = parse(&CRSS_HEADER, "csrss.exe").unwrap();
        assert_eq!(binary.name, "csrss.exe");
        assert_eq!(binary.width, AddressingWidth::Width32);
        assert_eq!(binary.sections.len(), 5);
        assert_eq!(binary.dos_stub.len(), 0xd0 - 0x40);
        assert!(binary.rich_header.is_some());
        assert!(!binary.failures.is_empty());
        assert!(binary.imports.is_empty());
        assert!(binary.overlay.is_none());
    }

    #[test]
    fn permissive_keeps_a_short_section_table() {
        // the fifth section header ends at 0x280
        let bytes = &CRSS_HEADER[..0x276];
        assert!(parse(bytes, "").unwrap_err().is_out_of_bounds());
        let binary = parse_with_opts(bytes, "", &ParseOptions::permissive()).unwrap();
        assert_eq!(binary.sections.len(), 4);
    }

    #[test]
    fn overlay_follows_the_last_raw_byte() {
        let bytes = [0xaau8; 0x300];
        let cursor = Cursor::new(&bytes);
        let sections = [
            SectionTable {
                pointer_to_raw_data: 0x200,
                size_of_raw_data: 0x80,
                ..Default::default()
            },
            SectionTable {
                pointer_to_raw_data: 0x100,
                size_of_raw_data: 0x100,
                ..Default::default()
            },
            // no raw data
            SectionTable {
                pointer_to_raw_data: 0x2000,
                ..Default::default()
            },
        ];
        let overlay = Overlay::parse(&cursor, &sections).unwrap();
        assert_eq!(overlay.offset, 0x280);
        assert_eq!(overlay.data.len(), 0x80);
        assert!(Overlay::parse(&cursor, &sections[..0]).is_none());
    }

    #[test]
    fn failures_are_recorded_per_component() {
        let mut failures = Vec::new();
        let kind = DirectoryKind::ResourceTable;
        let value: Option<u32> = recorded(
            &mut failures,
            Component::Directory(kind),
            Err(error::Error::Unmapped(0x9000)),
        );
        assert!(value.is_none());
        assert_eq!(recorded(&mut failures, Component::RichHeader, Ok(7)), Some(7));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].component.to_string(), "resource table");
    }

    #[test]
    fn authenticode_ranges_skip_the_checksum() {
        let binary = parse(&CRSS_HEADER, "csrss.exe").unwrap();
        let chunks: Vec<&[u8]> = binary.authenticode_ranges(&CRSS_HEADER).collect();
        // 0xd0 + 4 + 20 + 64
        assert_eq!(chunks[0].len(), 0x128);
        // up to the certificate table slot, fifth data directory
        assert_eq!(chunks[1].len(), 0x168 - 0x12c);
        let total: usize = chunks.iter().map(|chunk| chunk.len()).sum();
        assert!(total < CRSS_HEADER.len());
    }
}
