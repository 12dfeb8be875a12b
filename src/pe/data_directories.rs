use log::warn;
use scroll::{Pread, Pwrite, SizeWith};

use crate::cursor::Cursor;
use crate::error;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_DATA_DIRECTORY"))]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

pub const SIZEOF_DATA_DIRECTORY: usize = 8;
pub const NUM_DATA_DIRECTORIES: usize = 16;

impl DataDirectory {
    pub fn parse(cursor: &Cursor, offset: &mut usize) -> error::Result<Self> {
        cursor.gread::<DataDirectory>(offset)
    }

    /// `[virtual_address, virtual_address + size)`, saturating at `u32::MAX`
    pub fn range(&self) -> core::ops::Range<u32> {
        self.virtual_address..self.virtual_address.saturating_add(self.size)
    }
}

/// The slot a [`DataDirectory`] occupies in the optional header
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub enum DirectoryKind {
    ExportTable = 0,
    ImportTable = 1,
    ResourceTable = 2,
    ExceptionTable = 3,
    CertificateTable = 4,
    BaseRelocationTable = 5,
    DebugTable = 6,
    Architecture = 7,
    GlobalPtr = 8,
    TlsTable = 9,
    LoadConfigTable = 10,
    BoundImportTable = 11,
    ImportAddressTable = 12,
    DelayImportDescriptor = 13,
    ClrRuntimeHeader = 14,
    Reserved = 15,
}

impl DirectoryKind {
    pub const ALL: [DirectoryKind; NUM_DATA_DIRECTORIES] = [
        DirectoryKind::ExportTable,
        DirectoryKind::ImportTable,
        DirectoryKind::ResourceTable,
        DirectoryKind::ExceptionTable,
        DirectoryKind::CertificateTable,
        DirectoryKind::BaseRelocationTable,
        DirectoryKind::DebugTable,
        DirectoryKind::Architecture,
        DirectoryKind::GlobalPtr,
        DirectoryKind::TlsTable,
        DirectoryKind::LoadConfigTable,
        DirectoryKind::BoundImportTable,
        DirectoryKind::ImportAddressTable,
        DirectoryKind::DelayImportDescriptor,
        DirectoryKind::ClrRuntimeHeader,
        DirectoryKind::Reserved,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl core::fmt::Display for DirectoryKind {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let name = match self {
            DirectoryKind::ExportTable => "export table",
            DirectoryKind::ImportTable => "import table",
            DirectoryKind::ResourceTable => "resource table",
            DirectoryKind::ExceptionTable => "exception table",
            DirectoryKind::CertificateTable => "certificate table",
            DirectoryKind::BaseRelocationTable => "base relocation table",
            DirectoryKind::DebugTable => "debug table",
            DirectoryKind::Architecture => "architecture",
            DirectoryKind::GlobalPtr => "global pointer",
            DirectoryKind::TlsTable => "TLS table",
            DirectoryKind::LoadConfigTable => "load config table",
            DirectoryKind::BoundImportTable => "bound import table",
            DirectoryKind::ImportAddressTable => "import address table",
            DirectoryKind::DelayImportDescriptor => "delay import descriptor",
            DirectoryKind::ClrRuntimeHeader => "CLR runtime header",
            DirectoryKind::Reserved => "reserved",
        };
        f.write_str(name)
    }
}

#[derive(Debug, PartialEq, Copy, Clone, Default)]
pub struct DataDirectories {
    pub data_directories: [Option<DataDirectory>; NUM_DATA_DIRECTORIES],
}

macro_rules! make_data_directory_getters {(
    $(
        $name:ident => $kind:ident;
    )*
) => (
    $(
        #[inline]
        pub fn $name(&self) -> Option<&DataDirectory> {
            self.get(DirectoryKind::$kind)
        }
    )*
)}

impl DataDirectories {
    /// Reads `count` directory entries at `*offset`.
    ///
    /// Counts above 16 are clamped: the loader never looks past the sixteenth slot. An
    /// entry with a zero RVA and a zero size is absent.
    pub fn parse(cursor: &Cursor, count: usize, offset: &mut usize) -> error::Result<Self> {
        let mut data_directories = [None; NUM_DATA_DIRECTORIES];
        if count > NUM_DATA_DIRECTORIES {
            warn!(
                "data directory count ({count}) is greater than maximum number of data directories ({NUM_DATA_DIRECTORIES}), clamping"
            );
        }
        for dir in data_directories.iter_mut().take(count) {
            let dd = DataDirectory::parse(cursor, offset)?;
            *dir = if dd.virtual_address == 0 && dd.size == 0 {
                None
            } else {
                Some(dd)
            };
        }
        Ok(DataDirectories { data_directories })
    }

    pub fn get(&self, kind: DirectoryKind) -> Option<&DataDirectory> {
        self.data_directories[kind.index()].as_ref()
    }

    /// Present entries, in slot order
    pub fn dirs(&self) -> impl Iterator<Item = (DirectoryKind, DataDirectory)> + '_ {
        DirectoryKind::ALL
            .into_iter()
            .zip(self.data_directories.iter())
            .filter_map(|(kind, dd)| (*dd).map(|dd| (kind, dd)))
    }

    make_data_directory_getters! {
        get_export_table            => ExportTable;
        get_import_table            => ImportTable;
        get_resource_table          => ResourceTable;
        get_exception_table         => ExceptionTable;
        get_certificate_table       => CertificateTable;
        get_base_relocation_table   => BaseRelocationTable;
        get_debug_table             => DebugTable;
        get_architecture            => Architecture;
        get_global_ptr              => GlobalPtr;
        get_tls_table               => TlsTable;
        get_load_config_table       => LoadConfigTable;
        get_bound_import_table      => BoundImportTable;
        get_import_address_table    => ImportAddressTable;
        get_delay_import_descriptor => DelayImportDescriptor;
        get_clr_runtime_header      => ClrRuntimeHeader;
    }
}
