use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, warn};
use scroll::{Pread, Pwrite, SizeWith};

use crate::error;
use crate::pe::ctx::ParseCtx;
use crate::pe::data_directories::DataDirectory;
use crate::pe::utils;

// https://learn.microsoft.com/en-us/windows/win32/debug/pe-format#debug-directory-image-only
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_DEBUG_DIRECTORY"))]
pub struct ImageDebugDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub data_type: u32,
    pub size_of_data: u32,
    pub address_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

pub const SIZEOF_IMAGE_DEBUG_DIRECTORY: usize = 28;

pub const IMAGE_DEBUG_TYPE_UNKNOWN: u32 = 0;
pub const IMAGE_DEBUG_TYPE_COFF: u32 = 1;
pub const IMAGE_DEBUG_TYPE_CODEVIEW: u32 = 2;
pub const IMAGE_DEBUG_TYPE_FPO: u32 = 3;
pub const IMAGE_DEBUG_TYPE_MISC: u32 = 4;
pub const IMAGE_DEBUG_TYPE_EXCEPTION: u32 = 5;
pub const IMAGE_DEBUG_TYPE_FIXUP: u32 = 6;
pub const IMAGE_DEBUG_TYPE_BORLAND: u32 = 9;
pub const IMAGE_DEBUG_TYPE_REPRO: u32 = 16;
pub const IMAGE_DEBUG_TYPE_POGO: u32 = 13;
pub const IMAGE_DEBUG_TYPE_EX_DLLCHARACTERISTICS: u32 = 20;

/// `RSDS`
pub const CODEVIEW_PDB70_MAGIC: u32 = 0x5344_5352;
/// `NB10`
pub const CODEVIEW_PDB20_MAGIC: u32 = 0x3031_424e;

/// `PGU\0`, written by the MSVC linker for PGO builds
pub const POGO_PGU_MAGIC: u32 = 0x5047_5500;
/// `LTCG`, written for link-time code generation builds
pub const POGO_LTCG_MAGIC: u32 = 0x4C54_4347;

/// A CodeView record pointing at the PDB holding the image's debug info
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CodeView {
    /// `RSDS`: PDB 7.0, matched by GUID and age
    Pdb70 {
        guid: [u8; 16],
        age: u32,
        path: String,
    },
    /// `NB10`: PDB 2.0, matched by timestamp signature and age
    Pdb20 {
        offset: u32,
        signature: u32,
        age: u32,
        path: String,
    },
}

impl CodeView {
    pub fn path(&self) -> &str {
        match self {
            CodeView::Pdb70 { path, .. } | CodeView::Pdb20 { path, .. } => path,
        }
    }

    fn parse(payload: &[u8]) -> error::Result<Self> {
        let offset = &mut 0;
        let magic: u32 = payload.gread_with(offset, scroll::LE)?;
        match magic {
            CODEVIEW_PDB70_MAGIC => {
                let mut guid = [0u8; 16];
                guid.copy_from_slice(payload.gread_with::<&[u8]>(offset, 16)?);
                let age = payload.gread_with(offset, scroll::LE)?;
                Ok(CodeView::Pdb70 {
                    guid,
                    age,
                    path: nul_terminated(&payload[*offset..]),
                })
            }
            CODEVIEW_PDB20_MAGIC => {
                let cv_offset = payload.gread_with(offset, scroll::LE)?;
                let signature = payload.gread_with(offset, scroll::LE)?;
                let age = payload.gread_with(offset, scroll::LE)?;
                Ok(CodeView::Pdb20 {
                    offset: cv_offset,
                    signature,
                    age,
                    path: nul_terminated(&payload[*offset..]),
                })
            }
            magic => Err(error::Error::Unsupported(format!(
                "CodeView signature {magic:#x}"
            ))),
        }
    }
}

/// One section contribution recorded by the profile-guided optimizer
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PogoEntry {
    pub rva: u32,
    pub size: u32,
    pub name: String,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Pogo {
    /// [`POGO_PGU_MAGIC`], [`POGO_LTCG_MAGIC`] or something newer
    pub signature: u32,
    pub entries: Vec<PogoEntry>,
}

impl Pogo {
    fn parse(payload: &[u8]) -> error::Result<Self> {
        let mut offset = 0;
        let signature = payload.gread_with(&mut offset, scroll::LE)?;
        let mut entries = Vec::new();
        // rva, size and at least a NUL
        while payload.len() - offset >= 9 {
            let rva = payload.gread_with(&mut offset, scroll::LE)?;
            let size = payload.gread_with(&mut offset, scroll::LE)?;
            let rest = &payload[offset..];
            let len = rest.iter().position(|&b| b == 0).ok_or_else(|| {
                error::Error::Malformed(format!("POGO name at {offset:#x} is not terminated"))
            })?;
            let name = String::from_utf8_lossy(&rest[..len]).into_owned();
            entries.push(PogoEntry { rva, size, name });
            offset = match utils::align_up(offset + len + 1, 4) {
                Some(next) => next.min(payload.len()),
                None => break,
            };
        }
        Ok(Pogo { signature, entries })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DebugPayload {
    CodeView(CodeView),
    Pogo(Pogo),
    /// A debug type this parser does not decode, or one whose payload failed to decode
    Unsupported,
}

#[derive(Debug, PartialEq, Clone)]
pub struct DebugEntry {
    pub directory: ImageDebugDirectory,
    pub payload: DebugPayload,
}

/// The debug directory of an image
#[derive(Debug, PartialEq, Clone, Default)]
pub struct DebugData {
    pub entries: Vec<DebugEntry>,
}

impl DebugData {
    pub(crate) fn parse(ctx: &ParseCtx, dd: DataDirectory) -> error::Result<Self> {
        let mut offset = ctx.rva_to_offset(dd.virtual_address)?;
        let count = ctx.cursor.clamp_count(
            offset,
            dd.size as usize / SIZEOF_IMAGE_DEBUG_DIRECTORY,
            SIZEOF_IMAGE_DEBUG_DIRECTORY,
        );
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let directory = ctx.cursor.gread::<ImageDebugDirectory>(&mut offset)?;
            let payload = match decode_payload(ctx, &directory) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(
                        "debug entry of type {} could not be decoded: {err}",
                        directory.data_type
                    );
                    DebugPayload::Unsupported
                }
            };
            debug!("{directory:?}: {payload:?}");
            entries.push(DebugEntry { directory, payload });
        }
        Ok(DebugData { entries })
    }

    /// The first CodeView record, if any.
    pub fn codeview(&self) -> Option<&CodeView> {
        self.entries.iter().find_map(|entry| match &entry.payload {
            DebugPayload::CodeView(codeview) => Some(codeview),
            _ => None,
        })
    }

    /// Return this executable's debugging GUID, suitable for matching against a PDB file.
    pub fn guid(&self) -> Option<[u8; 16]> {
        match self.codeview()? {
            CodeView::Pdb70 { guid, .. } => Some(*guid),
            CodeView::Pdb20 { .. } => None,
        }
    }

    pub fn pogo(&self) -> Option<&Pogo> {
        self.entries.iter().find_map(|entry| match &entry.payload {
            DebugPayload::Pogo(pogo) => Some(pogo),
            _ => None,
        })
    }
}

/// Locates the payload of a debug entry inside the buffer.
///
/// `pointer_to_raw_data` is a file offset; an in-memory image is addressed by
/// `address_of_raw_data` instead.
fn payload<'a>(ctx: &ParseCtx<'a>, directory: &ImageDebugDirectory) -> error::Result<&'a [u8]> {
    let offset = if !ctx.opts.resolve_rva {
        directory.address_of_raw_data as usize
    } else if directory.pointer_to_raw_data != 0 {
        directory.pointer_to_raw_data as usize
    } else {
        ctx.rva_to_offset(directory.address_of_raw_data)?
    };
    ctx.cursor.read_fixed(offset, directory.size_of_data as usize)
}

fn decode_payload(ctx: &ParseCtx, directory: &ImageDebugDirectory) -> error::Result<DebugPayload> {
    match directory.data_type {
        IMAGE_DEBUG_TYPE_CODEVIEW => Ok(DebugPayload::CodeView(CodeView::parse(payload(
            ctx, directory,
        )?)?)),
        IMAGE_DEBUG_TYPE_POGO => Ok(DebugPayload::Pogo(Pogo::parse(payload(ctx, directory)?)?)),
        _ => Ok(DebugPayload::Unsupported),
    }
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
