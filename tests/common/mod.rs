//! A tiny PE writer for tests: lays out the headers at fixed offsets and places each
//! section's raw data after them, aligned to [`FILE_ALIGNMENT`].

#![allow(dead_code)]

use kobold::pe::ctx::AddressingWidth;
use kobold::pe::data_directories::{
    DataDirectory, DirectoryKind, NUM_DATA_DIRECTORIES, SIZEOF_DATA_DIRECTORY,
};
use kobold::pe::header::{
    COFF_MACHINE_X86, COFF_MACHINE_X86_64, CoffHeader, DOS_MAGIC, DosHeader,
    IMAGE_FILE_DLL, IMAGE_FILE_EXECUTABLE_IMAGE, PE_MAGIC,
};
use kobold::pe::import::ImportDirectoryEntry;
use kobold::pe::optional_header::{
    MAGIC_32, MAGIC_64, SIZEOF_STANDARD_FIELDS_32, SIZEOF_STANDARD_FIELDS_64,
    SIZEOF_WINDOWS_FIELDS_32, SIZEOF_WINDOWS_FIELDS_64, StandardFields32, StandardFields64,
    WindowsFields32, WindowsFields64,
};
use scroll::Pwrite;

pub const PE_POINTER: u32 = 0x80;
pub const HEADERS_SIZE: usize = 0x400;
pub const FILE_ALIGNMENT: usize = 0x200;
pub const SECTION_ALIGNMENT: u32 = 0x1000;

pub const IMAGE_BASE_32: u64 = 0x40_0000;
pub const IMAGE_BASE_64: u64 = 0x1_4000_0000;

struct Section {
    name: [u8; 8],
    virtual_address: u32,
    virtual_size: u32,
    data: Vec<u8>,
}

pub struct ImageBuilder {
    width: AddressingWidth,
    characteristics: u16,
    entry: u32,
    sections: Vec<Section>,
    directories: [DataDirectory; NUM_DATA_DIRECTORIES],
    overlay: Vec<u8>,
}

impl ImageBuilder {
    pub fn new(width: AddressingWidth) -> Self {
        ImageBuilder {
            width,
            characteristics: IMAGE_FILE_EXECUTABLE_IMAGE,
            entry: 0x1000,
            sections: Vec::new(),
            directories: [DataDirectory::default(); NUM_DATA_DIRECTORIES],
            overlay: Vec::new(),
        }
    }

    pub fn image_base(&self) -> u64 {
        match self.width {
            AddressingWidth::Width32 => IMAGE_BASE_32,
            AddressingWidth::Width64 => IMAGE_BASE_64,
        }
    }

    pub fn dll(mut self) -> Self {
        self.characteristics |= IMAGE_FILE_DLL;
        self
    }

    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    /// Adds a section whose virtual size is its data length
    pub fn section(mut self, name: &str, virtual_address: u32, data: Vec<u8>) -> Self {
        let mut raw = [0u8; 8];
        for (dst, src) in raw.iter_mut().zip(name.bytes()) {
            *dst = src;
        }
        self.sections.push(Section {
            name: raw,
            virtual_address,
            virtual_size: data.len() as u32,
            data,
        });
        self
    }

    pub fn directory(mut self, kind: DirectoryKind, virtual_address: u32, size: u32) -> Self {
        self.directories[kind.index()] = DataDirectory {
            virtual_address,
            size,
        };
        self
    }

    pub fn overlay(mut self, overlay: &[u8]) -> Self {
        self.overlay = overlay.to_vec();
        self
    }

    /// File offset of the raw data of section `index`
    pub fn raw_offset(&self, index: usize) -> usize {
        let mut offset = HEADERS_SIZE;
        for section in &self.sections[..index] {
            offset += align(section.data.len());
        }
        offset
    }

    fn size_of_optional_header(&self) -> usize {
        let fields = match self.width {
            AddressingWidth::Width32 => SIZEOF_STANDARD_FIELDS_32 + SIZEOF_WINDOWS_FIELDS_32,
            AddressingWidth::Width64 => SIZEOF_STANDARD_FIELDS_64 + SIZEOF_WINDOWS_FIELDS_64,
        };
        fields + NUM_DATA_DIRECTORIES * SIZEOF_DATA_DIRECTORY
    }

    pub fn build(&self) -> Vec<u8> {
        let raw_end = self.raw_offset(self.sections.len());
        let mut bytes = vec![0u8; raw_end];
        let dos_header = DosHeader {
            signature: DOS_MAGIC,
            pe_pointer: PE_POINTER,
            ..Default::default()
        };
        bytes.pwrite_with(dos_header, 0, scroll::LE).unwrap();

        let offset = &mut (PE_POINTER as usize);
        bytes.gwrite_with(PE_MAGIC, offset, scroll::LE).unwrap();
        let coff_header = CoffHeader {
            machine: match self.width {
                AddressingWidth::Width32 => COFF_MACHINE_X86,
                AddressingWidth::Width64 => COFF_MACHINE_X86_64,
            },
            number_of_sections: self.sections.len() as u16,
            size_of_optional_header: self.size_of_optional_header() as u16,
            characteristics: self.characteristics,
            ..Default::default()
        };
        bytes.gwrite_with(coff_header, offset, scroll::LE).unwrap();

        let size_of_image = self
            .sections
            .iter()
            .map(|section| section.virtual_address + section.virtual_size)
            .max()
            .unwrap_or(SECTION_ALIGNMENT);
        match self.width {
            AddressingWidth::Width32 => {
                let standard = StandardFields32 {
                    magic: MAGIC_32,
                    address_of_entry_point: self.entry,
                    ..Default::default()
                };
                let windows = WindowsFields32 {
                    image_base: IMAGE_BASE_32 as u32,
                    section_alignment: SECTION_ALIGNMENT,
                    file_alignment: FILE_ALIGNMENT as u32,
                    size_of_image,
                    size_of_headers: HEADERS_SIZE as u32,
                    number_of_rva_and_sizes: NUM_DATA_DIRECTORIES as u32,
                    ..Default::default()
                };
                bytes.gwrite_with(standard, offset, scroll::LE).unwrap();
                bytes.gwrite_with(windows, offset, scroll::LE).unwrap();
            }
            AddressingWidth::Width64 => {
                let standard = StandardFields64 {
                    magic: MAGIC_64,
                    address_of_entry_point: self.entry,
                    ..Default::default()
                };
                let windows = WindowsFields64 {
                    image_base: IMAGE_BASE_64,
                    section_alignment: SECTION_ALIGNMENT,
                    file_alignment: FILE_ALIGNMENT as u32,
                    size_of_image,
                    size_of_headers: HEADERS_SIZE as u32,
                    number_of_rva_and_sizes: NUM_DATA_DIRECTORIES as u32,
                    ..Default::default()
                };
                bytes.gwrite_with(standard, offset, scroll::LE).unwrap();
                bytes.gwrite_with(windows, offset, scroll::LE).unwrap();
            }
        }
        for dd in self.directories {
            bytes.gwrite_with(dd, offset, scroll::LE).unwrap();
        }

        for (index, section) in self.sections.iter().enumerate() {
            let pointer_to_raw_data = self.raw_offset(index);
            bytes[*offset..*offset + 8].copy_from_slice(&section.name);
            *offset += 8;
            bytes.gwrite_with(section.virtual_size, offset, scroll::LE).unwrap();
            bytes.gwrite_with(section.virtual_address, offset, scroll::LE).unwrap();
            bytes.gwrite_with(align(section.data.len()) as u32, offset, scroll::LE).unwrap();
            bytes.gwrite_with(pointer_to_raw_data as u32, offset, scroll::LE).unwrap();
            // relocations, line numbers and their counts
            *offset += 12;
            bytes.gwrite_with(0x4000_0040u32, offset, scroll::LE).unwrap();
            bytes[pointer_to_raw_data..pointer_to_raw_data + section.data.len()]
                .copy_from_slice(&section.data);
        }
        assert!(*offset <= HEADERS_SIZE, "headers overflow");

        bytes.extend_from_slice(&self.overlay);
        bytes
    }
}

fn align(size: usize) -> usize {
    size.div_ceil(FILE_ALIGNMENT) * FILE_ALIGNMENT
}

/// Writes a pointer-sized `value` at `offset`.
pub fn write_address(bytes: &mut [u8], offset: usize, value: u64, width: AddressingWidth) {
    match width {
        AddressingWidth::Width32 => bytes.pwrite_with(value as u32, offset, scroll::LE),
        AddressingWidth::Width64 => bytes.pwrite_with(value, offset, scroll::LE),
    }
    .unwrap();
}

/// An import directory for a section at `base`: descriptors first, then one lookup table
/// and one IAT per DLL, then the names from offset 0x800.
pub fn import_section(base: u32, width: AddressingWidth, dlls: &[(&str, &[&str])]) -> Vec<u8> {
    let pointer_size = width.pointer_size();
    let mut bytes = vec![0u8; 0x1000];
    let mut tables = (dlls.len() + 1) * 20;
    let mut strings = 0x800;
    for (i, (dll, functions)) in dlls.iter().enumerate() {
        let lookup_table = tables;
        let iat = lookup_table + (functions.len() + 1) * pointer_size;
        tables = iat + (functions.len() + 1) * pointer_size;

        let name_rva = base + strings as u32;
        bytes[strings..strings + dll.len()].copy_from_slice(dll.as_bytes());
        strings += dll.len() + 1;

        for (j, function) in functions.iter().enumerate() {
            strings += strings % 2;
            let hint_name_rva = base + strings as u32;
            bytes.pwrite_with(j as u16, strings, scroll::LE).unwrap();
            bytes[strings + 2..strings + 2 + function.len()].copy_from_slice(function.as_bytes());
            strings += 2 + function.len() + 1;
            write_address(&mut bytes, lookup_table + j * pointer_size, hint_name_rva as u64, width);
            write_address(&mut bytes, iat + j * pointer_size, hint_name_rva as u64, width);
        }

        let descriptor = ImportDirectoryEntry {
            import_lookup_table_rva: base + lookup_table as u32,
            name_rva,
            import_address_table_rva: base + iat as u32,
            ..Default::default()
        };
        bytes.pwrite_with(descriptor, i * 20, scroll::LE).unwrap();
    }
    bytes
}

/// Size of the descriptor table [`import_section`] writes for `count` DLLs
pub fn import_directory_size(count: usize) -> u32 {
    ((count + 1) * 20) as u32
}
