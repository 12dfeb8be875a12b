use alloc::vec::Vec;

use log::debug;
use scroll::{Pread, Pwrite, SizeWith, ctx};

use crate::error;
use crate::pe::ctx::{AddressingWidth, ParseCtx};
use crate::pe::data_directories::DataDirectory;

/// Bytes of `IMAGE_LOAD_CONFIG_DIRECTORY32` this parser knows the layout of
pub const LOAD_CONFIG_SIZE_32: usize = 192;
/// Bytes of `IMAGE_LOAD_CONFIG_DIRECTORY64` this parser knows the layout of
pub const LOAD_CONFIG_SIZE_64: usize = 320;

// GuardFlags: bitflags for LoadConfiguration::guard_flags.

/// Module performs control flow integrity checks using system-supplied support.
pub const IMAGE_GUARD_CF_INSTRUMENTED: u32 = 0x0000_0100;
/// Module performs control flow and write integrity checks.
pub const IMAGE_GUARD_CFW_INSTRUMENTED: u32 = 0x0000_0200;
/// Module contains valid control flow target metadata.
pub const IMAGE_GUARD_CF_FUNCTION_TABLE_PRESENT: u32 = 0x0000_0400;
/// Module does not make use of the /GS security cookie.
pub const IMAGE_GUARD_SECURITY_COOKIE_UNUSED: u32 = 0x0000_0800;
/// Module supports read only delay load IAT.
pub const IMAGE_GUARD_PROTECT_DELAYLOAD_IAT: u32 = 0x0000_1000;
/// Delayload import table in its own .didat section.
pub const IMAGE_GUARD_DELAYLOAD_IAT_IN_ITS_OWN_SECTION: u32 = 0x0000_2000;
/// Module contains suppressed export information.
pub const IMAGE_GUARD_CF_EXPORT_SUPPRESSION_INFO_PRESENT: u32 = 0x0000_4000;
/// Module enables suppression of exports.
pub const IMAGE_GUARD_CF_ENABLE_EXPORT_SUPPRESSION: u32 = 0x0000_8000;
/// Module contains longjmp target information.
pub const IMAGE_GUARD_CF_LONGJUMP_TABLE_PRESENT: u32 = 0x0001_0000;
/// Module contains EH continuation target information.
pub const IMAGE_GUARD_EH_CONTINUATION_TABLE_PRESENT: u32 = 0x0040_0000;
/// Module was built with xfg.
pub const IMAGE_GUARD_XFG_ENABLED: u32 = 0x0080_0000;
/// Module has CastGuard instrumentation present.
pub const IMAGE_GUARD_CASTGUARD_PRESENT: u32 = 0x0100_0000;
/// Module has Guarded Memcpy instrumentation present.
pub const IMAGE_GUARD_MEMCPY_PRESENT: u32 = 0x0200_0000;

/// `DependentLoadFlags` bit restricting dependency search to `System32`.
pub const LOAD_LIBRARY_SEARCH_SYSTEM32: u16 = 0x0800;

/// The code integrity record embedded in the load configuration.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith, Eq, PartialEq)]
pub struct LoadConfigCodeIntegrity {
    pub flags: u16,
    pub catalog: u16,
    pub catalog_offset: u32,
    pub reserved: u32,
}

/// `IMAGE_LOAD_CONFIG_DIRECTORY32` or `IMAGE_LOAD_CONFIG_DIRECTORY64`, with every
/// pointer-sized field widened to `u64`.
///
/// The record has grown with nearly every Windows release and linkers only write as much
/// of it as they know about. Fields past the interpreted size read as zero; see
/// [`LoadConfigData::parsed_size`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[doc(alias("IMAGE_LOAD_CONFIG_DIRECTORY32", "IMAGE_LOAD_CONFIG_DIRECTORY64"))]
pub struct LoadConfiguration {
    pub size: u32,
    pub time_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub global_flags_clear: u32,
    pub global_flags_set: u32,
    pub critical_section_default_timeout: u32,
    pub de_commit_free_block_threshold: u64,
    pub de_commit_total_free_threshold: u64,
    pub lock_prefix_table: u64,
    pub maximum_allocation_size: u64,
    pub virtual_memory_threshold: u64,
    pub process_affinity_mask: u64,
    pub process_heap_flags: u32,
    pub csd_version: u16,
    pub dependent_load_flags: u16,
    pub edit_list: u64,
    /// VA of the `/GS` security cookie
    pub security_cookie: u64,
    /// VA of the sorted table of SEH handler RVAs (x86 only)
    pub se_handler_table: u64,
    pub se_handler_count: u64,
    pub guard_cf_check_function_pointer: u64,
    pub guard_cf_dispatch_function_pointer: u64,
    pub guard_cf_function_table: u64,
    pub guard_cf_function_count: u64,
    /// `IMAGE_GUARD_*` bits
    pub guard_flags: u32,
    pub code_integrity: LoadConfigCodeIntegrity,
    pub guard_address_taken_iat_entry_table: u64,
    pub guard_address_taken_iat_entry_count: u64,
    pub guard_long_jump_target_table: u64,
    pub guard_long_jump_target_count: u64,
    pub dynamic_value_reloc_table: u64,
    pub chpe_metadata_pointer: u64,
    pub guard_rf_failure_routine: u64,
    pub guard_rf_failure_routine_function_pointer: u64,
    pub dynamic_value_reloc_table_offset: u32,
    pub dynamic_value_reloc_table_section: u16,
    pub reserved2: u16,
    pub guard_rf_verify_stack_pointer_function_pointer: u64,
    pub hot_patch_table_offset: u32,
    pub reserved3: u32,
    pub enclave_configuration_pointer: u64,
    pub volatile_metadata_pointer: u64,
    pub guard_eh_continuation_table: u64,
    pub guard_eh_continuation_count: u64,
    pub guard_xfg_check_function_pointer: u64,
    pub guard_xfg_dispatch_function_pointer: u64,
    pub guard_xfg_table_dispatch_function_pointer: u64,
    pub cast_guard_os_determined_failure_mode: u64,
    pub guard_memcpy_function_pointer: u64,
}

impl LoadConfiguration {
    /// The size of the layout known for `width`.
    pub fn size_with(width: AddressingWidth) -> usize {
        match width {
            AddressingWidth::Width32 => LOAD_CONFIG_SIZE_32,
            AddressingWidth::Width64 => LOAD_CONFIG_SIZE_64,
        }
    }
}

impl<'a> ctx::TryFromCtx<'a, AddressingWidth> for LoadConfiguration {
    type Error = scroll::Error;

    fn try_from_ctx(bytes: &'a [u8], width: AddressingWidth) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let address = |offset: &mut usize| -> Result<u64, scroll::Error> {
            Ok(match width {
                AddressingWidth::Width32 => bytes.gread_with::<u32>(offset, scroll::LE)? as u64,
                AddressingWidth::Width64 => bytes.gread_with::<u64>(offset, scroll::LE)?,
            })
        };
        let mut config = LoadConfiguration {
            size: bytes.gread_with(offset, scroll::LE)?,
            time_stamp: bytes.gread_with(offset, scroll::LE)?,
            major_version: bytes.gread_with(offset, scroll::LE)?,
            minor_version: bytes.gread_with(offset, scroll::LE)?,
            global_flags_clear: bytes.gread_with(offset, scroll::LE)?,
            global_flags_set: bytes.gread_with(offset, scroll::LE)?,
            critical_section_default_timeout: bytes.gread_with(offset, scroll::LE)?,
            de_commit_free_block_threshold: address(offset)?,
            de_commit_total_free_threshold: address(offset)?,
            lock_prefix_table: address(offset)?,
            maximum_allocation_size: address(offset)?,
            virtual_memory_threshold: address(offset)?,
            ..Default::default()
        };
        // the two layouts disagree on the order of these
        match width {
            AddressingWidth::Width32 => {
                config.process_heap_flags = bytes.gread_with(offset, scroll::LE)?;
                config.process_affinity_mask = address(offset)?;
            }
            AddressingWidth::Width64 => {
                config.process_affinity_mask = address(offset)?;
                config.process_heap_flags = bytes.gread_with(offset, scroll::LE)?;
            }
        }
        config.csd_version = bytes.gread_with(offset, scroll::LE)?;
        config.dependent_load_flags = bytes.gread_with(offset, scroll::LE)?;
        config.edit_list = address(offset)?;
        config.security_cookie = address(offset)?;
        config.se_handler_table = address(offset)?;
        config.se_handler_count = address(offset)?;
        config.guard_cf_check_function_pointer = address(offset)?;
        config.guard_cf_dispatch_function_pointer = address(offset)?;
        config.guard_cf_function_table = address(offset)?;
        config.guard_cf_function_count = address(offset)?;
        config.guard_flags = bytes.gread_with(offset, scroll::LE)?;
        config.code_integrity = bytes.gread_with(offset, scroll::LE)?;
        config.guard_address_taken_iat_entry_table = address(offset)?;
        config.guard_address_taken_iat_entry_count = address(offset)?;
        config.guard_long_jump_target_table = address(offset)?;
        config.guard_long_jump_target_count = address(offset)?;
        config.dynamic_value_reloc_table = address(offset)?;
        config.chpe_metadata_pointer = address(offset)?;
        config.guard_rf_failure_routine = address(offset)?;
        config.guard_rf_failure_routine_function_pointer = address(offset)?;
        config.dynamic_value_reloc_table_offset = bytes.gread_with(offset, scroll::LE)?;
        config.dynamic_value_reloc_table_section = bytes.gread_with(offset, scroll::LE)?;
        config.reserved2 = bytes.gread_with(offset, scroll::LE)?;
        config.guard_rf_verify_stack_pointer_function_pointer = address(offset)?;
        config.hot_patch_table_offset = bytes.gread_with(offset, scroll::LE)?;
        config.reserved3 = bytes.gread_with(offset, scroll::LE)?;
        config.enclave_configuration_pointer = address(offset)?;
        config.volatile_metadata_pointer = address(offset)?;
        config.guard_eh_continuation_table = address(offset)?;
        config.guard_eh_continuation_count = address(offset)?;
        config.guard_xfg_check_function_pointer = address(offset)?;
        config.guard_xfg_dispatch_function_pointer = address(offset)?;
        config.guard_xfg_table_dispatch_function_pointer = address(offset)?;
        config.cast_guard_os_determined_failure_mode = address(offset)?;
        config.guard_memcpy_function_pointer = address(offset)?;
        Ok((config, *offset))
    }
}

/// The load configuration directory of an image
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadConfigData {
    pub directory: LoadConfiguration,
    /// The size the record claims for itself in its first field
    pub declared_size: u32,
    /// How many bytes of the record were actually read from the file
    pub parsed_size: usize,
}

impl LoadConfigData {
    /// Reads the load configuration, interpreting no more than
    /// `min(declared size, known layout, directory size, buffer)` bytes.
    pub(crate) fn parse(ctx: &ParseCtx, dd: DataDirectory) -> error::Result<Self> {
        let offset = ctx.rva_to_offset(dd.virtual_address)?;
        let declared_size = ctx.cursor.read_at::<u32>(offset)?;
        let layout_size = LoadConfiguration::size_with(ctx.width);
        let parsed_size = (declared_size as usize)
            .min(layout_size)
            .min(dd.size as usize)
            .min(ctx.cursor.remaining(offset));
        let mut padded: Vec<u8> = vec![0; layout_size];
        padded[..parsed_size].copy_from_slice(ctx.cursor.read_fixed(offset, parsed_size)?);
        let mut directory = padded.pread_with::<LoadConfiguration>(0, ctx.width)?;
        directory.size = declared_size;
        debug!(
            "load config at {offset:#x}: declares {declared_size:#x} bytes, interpreting {parsed_size:#x}"
        );
        Ok(LoadConfigData {
            directory,
            declared_size,
            parsed_size,
        })
    }

    /// Whether the field ending at byte `end` of the record was present in the file.
    pub fn covers(&self, end: usize) -> bool {
        end <= self.parsed_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use crate::pe::options::ParseOptions;
    use crate::pe::section_table::SectionTable;

    const LOADCONFIG64_DATA0: &[u8; 320] = &[
        0x40, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x98, 0x45,
        0x1E, 0x80, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x12, 0x1E, 0x80, 0x01, 0x00, 0x00, 0x00,
        0x00, 0x50, 0x1E, 0x80, 0x01, 0x00, 0x00, 0x00, 0xA0, 0x02, 0x17, 0x80, 0x01, 0x00, 0x00,
        0x00, 0x87, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x75, 0x41, 0x10, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xA0,
        0x06, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x38, 0xFF, 0x16, 0x80, 0x01, 0x00,
        0x00, 0x00, 0xAE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x50, 0x1E, 0x80, 0x01,
        0x00, 0x00, 0x00, 0x10, 0x50, 0x1E, 0x80, 0x01, 0x00, 0x00, 0x00, 0x18, 0x50, 0x1E, 0x80,
        0x01, 0x00, 0x00, 0x00, 0x20, 0x50, 0x1E, 0x80, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    const LOADCONFIG32_DATA0: &[u8; 192] = &[
        0xBC, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x08, 0xD0, 0x41, 0x00, 0xD4, 0xB6, 0x41, 0x00, 0x10, 0x00, 0x00, 0x00, 0x70, 0x51, 0x41,
        0x00, 0x00, 0x00, 0x00, 0x00, 0xBC, 0x51, 0x41, 0x00, 0x3F, 0x00, 0x00, 0x00, 0x00, 0x75,
        0x01, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0xD4, 0xDC, 0x41, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];


    fn parse(bytes: &[u8], width: AddressingWidth, dd_size: u32) -> error::Result<LoadConfigData> {
        let sections = [SectionTable {
            virtual_address: 0x1000,
            virtual_size: 0x1000,
            size_of_raw_data: 0x1000,
            pointer_to_raw_data: 0,
            ..Default::default()
        }];
        let ctx = ParseCtx::new(Cursor::new(bytes), &sections, width, 0, ParseOptions::default());
        let dd = DataDirectory {
            virtual_address: 0x1000,
            size: dd_size,
        };
        LoadConfigData::parse(&ctx, dd)
    }

    #[test]
    fn load_config_64() {
        let data = parse(LOADCONFIG64_DATA0, AddressingWidth::Width64, 320).unwrap();
        assert_eq!(data.declared_size, 320);
        assert_eq!(data.parsed_size, 320);
        let config = data.directory;
        assert_eq!(config.dependent_load_flags, LOAD_LIBRARY_SEARCH_SYSTEM32);
        assert_eq!(config.security_cookie, 0x1801e4598);
        assert_eq!(config.guard_cf_check_function_pointer, 0x1801e1218);
        assert_eq!(config.guard_cf_dispatch_function_pointer, 0x1801e5000);
        assert_eq!(config.guard_cf_function_table, 0x1801702a0);
        assert_eq!(config.guard_cf_function_count, 2183);
        assert_eq!(config.guard_flags, 0x10417500);
        const FLAGS: u32 = IMAGE_GUARD_CF_INSTRUMENTED
            | IMAGE_GUARD_CF_FUNCTION_TABLE_PRESENT
            | IMAGE_GUARD_PROTECT_DELAYLOAD_IAT
            | IMAGE_GUARD_DELAYLOAD_IAT_IN_ITS_OWN_SECTION
            | IMAGE_GUARD_CF_EXPORT_SUPPRESSION_INFO_PRESENT
            | IMAGE_GUARD_CF_LONGJUMP_TABLE_PRESENT
            | IMAGE_GUARD_EH_CONTINUATION_TABLE_PRESENT;
        assert_eq!(config.guard_flags & FLAGS, FLAGS);
        assert_eq!(config.code_integrity, LoadConfigCodeIntegrity::default());
        assert_eq!(config.dynamic_value_reloc_table_offset, 0x6a0);
        assert_eq!(config.dynamic_value_reloc_table_section, 15);
        assert_eq!(config.guard_eh_continuation_table, 0x18016ff38);
        assert_eq!(config.guard_eh_continuation_count, 174);
        assert_eq!(config.guard_xfg_table_dispatch_function_pointer, 0x1801e5018);
        assert_eq!(config.cast_guard_os_determined_failure_mode, 0x1801e5020);
        assert_eq!(config.guard_memcpy_function_pointer, 0);
    }

    #[test]
    fn load_config_32_is_zero_filled() {
        let data = parse(LOADCONFIG32_DATA0, AddressingWidth::Width32, 192).unwrap();
        assert_eq!(data.declared_size, 188);
        assert_eq!(data.parsed_size, 188);
        assert!(data.covers(188));
        assert!(!data.covers(192));
        let config = data.directory;
        assert_eq!(config.security_cookie, 0x41d008);
        assert_eq!(config.se_handler_table, 0x41b6d4);
        assert_eq!(config.se_handler_count, 16);
        assert_eq!(config.guard_cf_function_table, 0x4151bc);
        assert_eq!(config.guard_cf_function_count, 63);
        assert_eq!(config.guard_flags, 0x10017500);
        assert_eq!(config.cast_guard_os_determined_failure_mode, 0x41dcd4);
        assert_eq!(config.guard_memcpy_function_pointer, 0);
    }

    #[test]
    fn directory_size_limits_interpretation() {
        let data = parse(LOADCONFIG64_DATA0, AddressingWidth::Width64, 0x60).unwrap();
        assert_eq!(data.parsed_size, 0x60);
        // the cookie lives at 0x58..0x60, the SEH table right after it
        assert_eq!(data.directory.security_cookie, 0x1801e4598);
        assert_eq!(data.directory.guard_cf_check_function_pointer, 0);
    }

    #[test]
    fn truncated_buffer() {
        let data = parse(&LOADCONFIG64_DATA0[..0x40], AddressingWidth::Width64, 320).unwrap();
        assert_eq!(data.parsed_size, 0x40);
        assert_eq!(data.declared_size, 320);
        assert!(parse(&LOADCONFIG64_DATA0[..2], AddressingWidth::Width64, 320).is_err());
    }

    #[test]
    fn huge_declared_size() {
        let mut bytes = LOADCONFIG64_DATA0.to_vec();
        bytes[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        let data = parse(&bytes, AddressingWidth::Width64, u32::MAX).unwrap();
        assert_eq!(data.declared_size, u32::MAX);
        assert_eq!(data.parsed_size, LOAD_CONFIG_SIZE_64);
    }
}
