use alloc::vec::Vec;

use log::{debug, warn};
use scroll::{Pread, Pwrite, SizeWith};

use crate::cursor::Cursor;
use crate::error;
use crate::options::Permissive;
use crate::pe::{optional_header, section_table, symbol};

/// In `winnt.h` and `pe.h`, it's `IMAGE_DOS_HEADER`. It's a DOS header present in all PE binaries.
///
/// Only two fields still matter to a Windows loader: [`signature` (aka `e_magic`)](DosHeader::signature)
/// and [`pe_pointer` (aka `e_lfanew`)](DosHeader::pe_pointer). The rest is kept for completeness.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_DOS_HEADER"))]
pub struct DosHeader {
    /// Magic number: "MZ", for Mark Zbikowski
    #[doc(alias("e_magic"))]
    pub signature: u16,
    #[doc(alias("e_cblp"))]
    pub bytes_on_last_page: u16,
    #[doc(alias("e_cp"))]
    pub pages_in_file: u16,
    #[doc(alias("e_crlc"))]
    pub relocations: u16,
    #[doc(alias("e_cparhdr"))]
    pub size_of_header_in_paragraphs: u16,
    #[doc(alias("e_minalloc"))]
    pub minimum_extra_paragraphs_needed: u16,
    #[doc(alias("e_maxalloc"))]
    pub maximum_extra_paragraphs_needed: u16,
    #[doc(alias("e_ss"))]
    pub initial_relative_ss: u16,
    #[doc(alias("e_sp"))]
    pub initial_sp: u16,
    #[doc(alias("e_csum"))]
    pub checksum: u16,
    #[doc(alias("e_ip"))]
    pub initial_ip: u16,
    #[doc(alias("e_cs"))]
    pub initial_relative_cs: u16,
    #[doc(alias("e_lfarlc"))]
    pub file_address_of_relocation_table: u16,
    #[doc(alias("e_ovno"))]
    pub overlay_number: u16,
    #[doc(alias("e_res"))]
    pub reserved: [u16; 4],
    #[doc(alias("e_oemid"))]
    pub oem_id: u16,
    #[doc(alias("e_oeminfo"))]
    pub oem_info: u16,
    #[doc(alias("e_res2"))]
    pub reserved2: [u16; 10],
    /// File offset of the `PE\0\0` signature, always stored at offset 0x3c
    #[doc(alias("e_lfanew"))]
    pub pe_pointer: u32,
}

#[doc(alias("IMAGE_DOS_SIGNATURE"))]
pub const DOS_MAGIC: u16 = 0x5a4d;
pub const SIZEOF_DOS_HEADER: usize = 0x40;
pub const PE_POINTER_OFFSET: u32 = 0x3c;

impl DosHeader {
    pub fn parse(cursor: &Cursor) -> error::Result<Self> {
        if cursor.len() < SIZEOF_DOS_HEADER {
            return Err(error::Error::Malformed(format!(
                "buffer of {:#x} bytes is too small for a DOS header",
                cursor.len()
            )));
        }
        let dos_header = cursor.read_at::<DosHeader>(0)?;
        if dos_header.signature != DOS_MAGIC {
            return Err(error::Error::BadMagic(dos_header.signature as u64));
        }
        if dos_header.pe_pointer as usize >= cursor.len() {
            return Err(error::Error::Malformed(format!(
                "PE header pointer {:#x} is past the end of the buffer ({:#x})",
                dos_header.pe_pointer,
                cursor.len()
            )));
        }
        Ok(dos_header)
    }

    /// Copies the DOS stub program that sits between the DOS header and the PE signature.
    ///
    /// Empty when `e_lfanew` points into the DOS header itself.
    pub fn stub(&self, cursor: &Cursor) -> Vec<u8> {
        let start = SIZEOF_DOS_HEADER;
        let end = core::cmp::min(self.pe_pointer as usize, cursor.len());
        if end <= start {
            return Vec::new();
        }
        cursor
            .read_fixed(start, end - start)
            .map(|stub| stub.to_vec())
            .unwrap_or_default()
    }
}

/// COFF Header
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_FILE_HEADER"))]
pub struct CoffHeader {
    /// The machine type
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbol_table: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

pub const SIZEOF_COFF_HEADER: usize = 20;
/// PE\0\0, little endian
pub const PE_MAGIC: u32 = 0x0000_4550;
pub const SIZEOF_PE_MAGIC: usize = 4;
/// The contents of this field are assumed to be applicable to any machine type
pub const COFF_MACHINE_UNKNOWN: u16 = 0x0;
/// Matsushita AM33
pub const COFF_MACHINE_AM33: u16 = 0x1d3;
/// x64
pub const COFF_MACHINE_X86_64: u16 = 0x8664;
/// ARM little endian
pub const COFF_MACHINE_ARM: u16 = 0x1c0;
/// ARM64 little endian
pub const COFF_MACHINE_ARM64: u16 = 0xaa64;
/// ARM Thumb-2 little endian
pub const COFF_MACHINE_ARMNT: u16 = 0x1c4;
/// EFI byte code
pub const COFF_MACHINE_EBC: u16 = 0xebc;
/// Intel 386 or later processors and compatible processors
pub const COFF_MACHINE_X86: u16 = 0x14c;
/// Intel Itanium processor family
pub const COFF_MACHINE_IA64: u16 = 0x200;
/// LoongArch 64-bit
pub const COFF_MACHINE_LOONGARCH64: u16 = 0x6264;
/// MIPS little endian
pub const COFF_MACHINE_R4000: u16 = 0x166;
/// RISC-V 64-bit address space
pub const COFF_MACHINE_RISCV64: u16 = 0x5064;
/// Thumb
pub const COFF_MACHINE_THUMB: u16 = 0x1c2;

/// The image is a DLL
pub const IMAGE_FILE_DLL: u16 = 0x2000;
/// The image is valid and can be run
pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;

impl CoffHeader {
    pub fn parse(cursor: &Cursor, offset: &mut usize) -> error::Result<Self> {
        cursor.gread::<CoffHeader>(offset)
    }

    /// Whether the `IMAGE_FILE_DLL` characteristic is set
    pub fn is_dll(&self) -> bool {
        self.characteristics & IMAGE_FILE_DLL != 0
    }

    /// File offset of the COFF string table, which follows the symbol records.
    pub fn string_table_offset(&self) -> Option<usize> {
        if self.pointer_to_symbol_table == 0 {
            return None;
        }
        (self.number_of_symbol_table as usize)
            .checked_mul(symbol::COFF_SYMBOL_SIZE)
            .and_then(|size| size.checked_add(self.pointer_to_symbol_table as usize))
    }

    /// Parse the section headers starting at `offset`.
    ///
    /// A table that does not fit in the buffer is an error, unless `permissive` is set, in
    /// which case only the sections that fit are kept.
    pub fn sections(
        &self,
        cursor: &Cursor,
        offset: &mut usize,
        permissive: bool,
    ) -> error::Result<Vec<section_table::SectionTable>> {
        let nsections = self.number_of_sections as usize;
        let fits = cursor.clamp_count(*offset, nsections, section_table::SIZEOF_SECTION_TABLE);
        let nsections = if fits < nsections {
            Err(error::Error::out_of_bounds(
                *offset,
                nsections * section_table::SIZEOF_SECTION_TABLE,
                cursor.len(),
            ))
        } else {
            Ok(nsections)
        }
        .or_permissive_and_then(permissive, "section table", || fits)?;

        let string_table_offset = self.string_table_offset();
        let mut sections = Vec::with_capacity(nsections);
        for i in 0..nsections {
            let section = section_table::SectionTable::parse(cursor, offset, string_table_offset)?;
            debug!("({i}) {section:#?}");
            sections.push(section);
        }
        Ok(sections)
    }
}

/// The decoded headers of a PE image: everything up to the section table
#[derive(Debug, PartialEq, Clone)]
pub struct Header {
    pub dos_header: DosHeader,
    /// PE Magic: PE\0\0, little endian
    pub signature: u32,
    pub coff_header: CoffHeader,
    pub optional_header: optional_header::OptionalHeader,
    /// File offset of the first section header
    pub section_table_offset: usize,
}

impl Header {
    pub fn parse(cursor: &Cursor) -> error::Result<Self> {
        let dos_header = DosHeader::parse(cursor)?;
        let mut offset = dos_header.pe_pointer as usize;
        let signature = cursor.gread::<u32>(&mut offset).map_err(|_| {
            error::Error::Malformed(format!("cannot parse PE signature (offset {offset:#x})"))
        })?;
        if signature != PE_MAGIC {
            return Err(error::Error::BadMagic(signature as u64));
        }
        let coff_header = CoffHeader::parse(cursor, &mut offset)?;
        debug!("{coff_header:#?}");
        if coff_header.size_of_optional_header == 0 {
            return Err(error::Error::Malformed(
                "image has no optional header".into(),
            ));
        }
        let optional_header_offset = offset;
        let section_table_offset = offset + coff_header.size_of_optional_header as usize;
        let optional_header = optional_header::OptionalHeader::parse(cursor, &mut offset)?;
        if offset > section_table_offset {
            warn!(
                "optional header overruns its declared size ({:#x} > {:#x})",
                offset - optional_header_offset,
                coff_header.size_of_optional_header
            );
        }
        Ok(Header {
            dos_header,
            signature,
            coff_header,
            optional_header,
            section_table_offset,
        })
    }
}

/// Convert machine to str representation
pub fn machine_to_str(machine: u16) -> &'static str {
    match machine {
        COFF_MACHINE_UNKNOWN => "UNKNOWN",
        COFF_MACHINE_AM33 => "AM33",
        COFF_MACHINE_X86_64 => "X86_64",
        COFF_MACHINE_ARM => "ARM",
        COFF_MACHINE_ARM64 => "ARM64",
        COFF_MACHINE_ARMNT => "ARM_NT",
        COFF_MACHINE_EBC => "EBC",
        COFF_MACHINE_X86 => "X86",
        COFF_MACHINE_IA64 => "IA64",
        COFF_MACHINE_LOONGARCH64 => "LOONGARCH64",
        COFF_MACHINE_R4000 => "R4000",
        COFF_MACHINE_RISCV64 => "RISC-V_64",
        COFF_MACHINE_THUMB => "THUMB",
        _ => "COFF_UNKNOWN",
    }
}
