//! The resource directory: a tree of type, name and language tables whose leaves point at
//! resource data.
//!
//! Every child offset in the tree comes from the file, so a hostile image can point a
//! table back at one of its ancestors or nest tables arbitrarily deep. The walker
//! refuses to enter a table twice, stops at [`MAX_RESOURCE_DEPTH`] and decodes at most
//! [`MAX_RESOURCE_ENTRIES`] entries over the whole tree. Every branch it refuses is
//! recorded in [`ResourceTree::truncated`] and the rest of the tree is kept.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::str;

use log::{debug, warn};
use scroll::{Pread, Pwrite, SizeWith};

use crate::error;
use crate::pe::ctx::ParseCtx;
use crate::pe::data_directories::DataDirectory;
use crate::pe::utils;

/// The deepest table the walker enters; the root is depth 0
pub const MAX_RESOURCE_DEPTH: usize = 16;

/// Directory entries decoded per tree, counted over every table and depth
pub const MAX_RESOURCE_ENTRIES: usize = 0x10000;

/// Hardware-dependent cursor resource.
pub const RT_CURSOR: u16 = 1;
/// Bitmap resource.
pub const RT_BITMAP: u16 = 2;
/// Hardware-dependent icon resource.
pub const RT_ICON: u16 = 3;
/// Menu resource.
pub const RT_MENU: u16 = 4;
/// Dialog box.
pub const RT_DIALOG: u16 = 5;
/// String-table entry.
pub const RT_STRING: u16 = 6;
/// Font directory resource.
pub const RT_FONTDIR: u16 = 7;
/// Font resource.
pub const RT_FONT: u16 = 8;
/// Accelerator table.
pub const RT_ACCELERATOR: u16 = 9;
/// Application-defined resource (raw data).
pub const RT_RCDATA: u16 = 10;
/// Message-table entry.
pub const RT_MESSAGETABLE: u16 = 11;
/// Hardware-independent cursor resource.
pub const RT_GROUP_CURSOR: u16 = 12;
/// Hardware-independent icon resource.
pub const RT_GROUP_ICON: u16 = 14;
/// Version resource.
pub const RT_VERSION: u16 = 16;
/// HTML resource.
pub const RT_HTML: u16 = 23;
/// Side-by-Side Assembly Manifest.
pub const RT_MANIFEST: u16 = 24;

/// [`ResourceDirectoryEntry::name_or_id`]: the name is a string
pub const IMAGE_RESOURCE_NAME_IS_STRING: u32 = 0x8000_0000;
/// [`ResourceDirectoryEntry::offset_to_data_or_directory`]: the child is a table
pub const IMAGE_RESOURCE_DATA_IS_DIRECTORY: u32 = 0x8000_0000;
/// Masks the flag bit off either field of [`ResourceDirectoryEntry`]
pub const IMAGE_RESOURCE_MASK: u32 = 0x7FFF_FFFF;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_RESOURCE_DIRECTORY"))]
pub struct ImageResourceDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub number_of_named_entries: u16,
    pub number_of_id_entries: u16,
}

pub const SIZEOF_RESOURCE_DIRECTORY: usize = 16;

impl ImageResourceDirectory {
    /// Named and ID entries together
    pub fn count(&self) -> usize {
        self.number_of_named_entries as usize + self.number_of_id_entries as usize
    }
}

#[repr(C)]
#[derive(PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_RESOURCE_DIRECTORY_ENTRY"))]
pub struct ResourceDirectoryEntry {
    pub name_or_id: u32,
    pub offset_to_data_or_directory: u32,
}

pub const SIZEOF_RESOURCE_DIRECTORY_ENTRY: usize = 8;

impl fmt::Debug for ResourceDirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResourceDirectoryEntry")
            .field("name_is_string", &self.name_is_string())
            .field("name_offset", &format_args!("{:#x}", self.name_offset()))
            .field("data_is_directory", &self.data_is_directory())
            .field("offset", &format_args!("{:#x}", self.offset()))
            .finish()
    }
}

impl ResourceDirectoryEntry {
    pub fn name_is_string(&self) -> bool {
        self.name_or_id & IMAGE_RESOURCE_NAME_IS_STRING != 0
    }

    /// Offset of the name string from the start of the resource directory, or the id.
    pub fn name_offset(&self) -> u32 {
        self.name_or_id & IMAGE_RESOURCE_MASK
    }

    pub fn data_is_directory(&self) -> bool {
        self.offset_to_data_or_directory & IMAGE_RESOURCE_DATA_IS_DIRECTORY != 0
    }

    /// Offset of the child table or data entry from the start of the resource directory.
    pub fn offset(&self) -> u32 {
        self.offset_to_data_or_directory & IMAGE_RESOURCE_MASK
    }
}

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_RESOURCE_DATA_ENTRY"))]
pub struct ResourceDataEntry {
    /// Despite the name, an RVA
    pub offset_to_data: u32,
    pub size: u32,
    pub code_page: u32,
    pub reserved: u32,
}

pub const SIZEOF_RESOURCE_DATA_ENTRY: usize = 16;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ResourceId {
    Id(u16),
    Name(String),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResourceId::Id(id) => write!(f, "#{id}"),
            ResourceId::Name(name) => f.write_str(name),
        }
    }
}

/// A leaf of the resource tree
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ResourceData {
    pub data_rva: u32,
    /// File offset of the content, when the RVA maps into the buffer
    pub offset: Option<usize>,
    pub size: u32,
    pub code_page: u32,
    pub reserved: u32,
    /// The id of the language table entry leading here, for leaves at the usual depth
    pub language: Option<u16>,
}

impl ResourceData {
    /// The content inside `bytes`, the buffer the image was parsed from.
    pub fn content<'a>(&self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        let offset = self.offset?;
        bytes.get(offset..offset.checked_add(self.size as usize)?)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResourceNode {
    Directory(ResourceDirectory),
    Data(ResourceData),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ResourceEntry {
    pub id: ResourceId,
    pub node: ResourceNode,
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct ResourceDirectory {
    pub header: ImageResourceDirectory,
    pub entries: Vec<ResourceEntry>,
}

impl ResourceDirectory {
    pub fn find_by_id(&self, id: u16) -> Option<&ResourceEntry> {
        self.entries
            .iter()
            .find(|entry| entry.id == ResourceId::Id(id))
    }
}

/// Why a branch of the tree was not entered
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TruncationReason {
    /// The table was already visited on this walk
    Cycle,
    /// The table is deeper than [`MAX_RESOURCE_DEPTH`]
    DepthLimit,
    /// The table, or its entries, run off the buffer
    OutOfBounds,
    /// [`MAX_RESOURCE_ENTRIES`] entries were already decoded; the walk stops here
    Budget,
}

/// A branch the walker refused to enter
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct TruncatedBranch {
    /// Offset of the refused table from the start of the resource directory
    pub offset: u32,
    pub depth: usize,
    pub reason: TruncationReason,
}

/// The decoded resource directory of an image
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ResourceTree {
    pub root: ResourceDirectory,
    pub truncated: Vec<TruncatedBranch>,
}

impl ResourceTree {
    pub(crate) fn parse(ctx: &ParseCtx, dd: DataDirectory) -> error::Result<Self> {
        let base = ctx.rva_to_offset(dd.virtual_address)?;
        // an unreadable root is a failure of the whole directory, not a truncated branch
        ctx.cursor.read_at::<ImageResourceDirectory>(base)?;
        let mut walker = ResourceWalker::new(ctx, base);
        let root = match walker.directory(0, 0) {
            Some(root) => root,
            None => {
                return Err(error::Error::Malformed(format!(
                    "resource root at {base:#x} cannot be walked"
                )));
            }
        };
        debug!(
            "resource tree at {base:#x}: {} types, {} truncated branches",
            root.entries.len(),
            walker.truncated.len()
        );
        Ok(ResourceTree {
            root,
            truncated: walker.truncated,
        })
    }

    /// Every leaf of the tree, depth first.
    pub fn leaves(&self) -> Vec<&ResourceData> {
        let mut leaves = Vec::new();
        let mut stack = vec![&self.root];
        while let Some(directory) = stack.pop() {
            for entry in directory.entries.iter().rev() {
                match &entry.node {
                    ResourceNode::Directory(child) => stack.push(child),
                    ResourceNode::Data(data) => leaves.push(data),
                }
            }
        }
        leaves
    }

    /// The first leaf under the top level table of type `typ`, e.g. [`RT_MANIFEST`].
    pub fn first_of_type(&self, typ: u16) -> Option<&ResourceData> {
        let mut node = &self.root.find_by_id(typ)?.node;
        loop {
            match node {
                ResourceNode::Directory(directory) => node = &directory.entries.first()?.node,
                ResourceNode::Data(data) => return Some(data),
            }
        }
    }

    /// The side-by-side assembly manifest, if the image embeds a UTF-8 one.
    pub fn manifest<'a>(&self, bytes: &'a [u8]) -> Option<&'a str> {
        let content = self.first_of_type(RT_MANIFEST)?.content(bytes)?;
        str::from_utf8(content).ok()
    }
}

/// A single walk over a resource tree.
///
/// Holds the tables visited so far and the branches refused along the way.
pub(crate) struct ResourceWalker<'a, 'c> {
    ctx: &'c ParseCtx<'a>,
    /// File offset of the root table; every offset in the tree is relative to it
    base: usize,
    visited: BTreeSet<u32>,
    truncated: Vec<TruncatedBranch>,
    /// Entries decoded so far, against [`MAX_RESOURCE_ENTRIES`]
    entries: usize,
}

impl<'a, 'c> ResourceWalker<'a, 'c> {
    pub(crate) fn new(ctx: &'c ParseCtx<'a>, base: usize) -> Self {
        ResourceWalker {
            ctx,
            base,
            visited: BTreeSet::new(),
            truncated: Vec::new(),
            entries: 0,
        }
    }

    fn truncate(&mut self, offset: u32, depth: usize, reason: TruncationReason) {
        warn!("resource table at {offset:#x} (depth {depth}) not entered: {reason:?}");
        self.truncated.push(TruncatedBranch {
            offset,
            depth,
            reason,
        });
    }

    /// Whether the entry budget ran out, recorded once as a [`TruncationReason::Budget`] branch
    fn exhausted(&self) -> bool {
        self.truncated
            .last()
            .is_some_and(|branch| branch.reason == TruncationReason::Budget)
    }

    /// Decodes the table at `offset`, or records why it was refused and returns `None`.
    fn directory(&mut self, offset: u32, depth: usize) -> Option<ResourceDirectory> {
        if self.exhausted() {
            return None;
        }
        if self.visited.contains(&offset) {
            self.truncate(offset, depth, TruncationReason::Cycle);
            return None;
        }
        if depth > MAX_RESOURCE_DEPTH {
            self.truncate(offset, depth, TruncationReason::DepthLimit);
            return None;
        }
        let cursor = self.ctx.cursor;
        let start = self.base.checked_add(offset as usize);
        let header = match start.map(|start| cursor.read_at::<ImageResourceDirectory>(start)) {
            Some(Ok(header)) => header,
            _ => {
                self.truncate(offset, depth, TruncationReason::OutOfBounds);
                return None;
            }
        };
        self.visited.insert(offset);

        let entries_offset = self.base + offset as usize + SIZEOF_RESOURCE_DIRECTORY;
        let declared = header.count();
        let count = cursor.clamp_count(entries_offset, declared, SIZEOF_RESOURCE_DIRECTORY_ENTRY);
        if count < declared {
            warn!("resource table at {offset:#x} declares {declared} entries, only {count} fit");
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            if self.exhausted() {
                break;
            }
            if self.entries == MAX_RESOURCE_ENTRIES {
                self.truncate(offset, depth, TruncationReason::Budget);
                break;
            }
            self.entries += 1;
            let at = entries_offset + i * SIZEOF_RESOURCE_DIRECTORY_ENTRY;
            let Ok(raw) = cursor.read_at::<ResourceDirectoryEntry>(at) else {
                break;
            };
            let id = match self.name(&raw) {
                Ok(id) => id,
                Err(err) => {
                    warn!("resource entry {raw:?} has an unreadable name: {err}");
                    continue;
                }
            };
            let node = if raw.data_is_directory() {
                match self.directory(raw.offset(), depth + 1) {
                    Some(child) => ResourceNode::Directory(child),
                    None => continue,
                }
            } else {
                let language = match (&id, depth) {
                    (ResourceId::Id(language), 2) => Some(*language),
                    _ => None,
                };
                match self.data(raw.offset(), language) {
                    Ok(data) => ResourceNode::Data(data),
                    Err(err) => {
                        warn!("resource data entry at {:#x}: {err}", raw.offset());
                        continue;
                    }
                }
            };
            entries.push(ResourceEntry { id, node });
        }
        Some(ResourceDirectory { header, entries })
    }

    /// Names are a u16 count of UTF-16 code units followed by the units, not terminated.
    fn name(&self, raw: &ResourceDirectoryEntry) -> error::Result<ResourceId> {
        if !raw.name_is_string() {
            return Ok(ResourceId::Id(raw.name_or_id as u16));
        }
        let offset = self.base.saturating_add(raw.name_offset() as usize);
        let len = self.ctx.cursor.read_at::<u16>(offset)? as usize;
        let units = self.ctx.cursor.read_fixed(offset.saturating_add(2), len * 2)?;
        Ok(ResourceId::Name(utils::to_utf16_string(units)))
    }

    fn data(&self, offset: u32, language: Option<u16>) -> error::Result<ResourceData> {
        let entry = self
            .ctx
            .cursor
            .read_at::<ResourceDataEntry>(self.base.saturating_add(offset as usize))?;
        let content = self
            .ctx
            .rva_to_offset(entry.offset_to_data)
            .and_then(|start| {
                self.ctx.cursor.read_fixed(start, entry.size as usize)?;
                Ok(start)
            });
        let content = match content {
            Ok(start) => Some(start),
            Err(err) => {
                warn!("resource content at rva {:#x}: {err}", entry.offset_to_data);
                None
            }
        };
        Ok(ResourceData {
            data_rva: entry.offset_to_data,
            offset: content,
            size: entry.size,
            code_page: entry.code_page,
            reserved: entry.reserved,
            language,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use crate::pe::ctx::AddressingWidth;
    use crate::pe::options::ParseOptions;
    use crate::pe::section_table::SectionTable;
    use scroll::Pwrite;

    const DIR: u32 = IMAGE_RESOURCE_DATA_IS_DIRECTORY;

    fn parse(bytes: &[u8]) -> error::Result<ResourceTree> {
        let sections = [SectionTable {
            virtual_address: 0x1000,
            virtual_size: 0x1000,
            size_of_raw_data: 0x1000,
            pointer_to_raw_data: 0,
            ..Default::default()
        }];
        let ctx = ParseCtx::new(
            Cursor::new(bytes),
            &sections,
            AddressingWidth::Width32,
            0,
            ParseOptions::default(),
        );
        ResourceTree::parse(
            &ctx,
            DataDirectory {
                virtual_address: 0x1000,
                size: bytes.len() as u32,
            },
        )
    }

    fn table(bytes: &mut [u8], offset: usize, named: u16, entries: &[(u32, u32)]) {
        let header = ImageResourceDirectory {
            number_of_named_entries: named,
            number_of_id_entries: entries.len() as u16 - named,
            ..Default::default()
        };
        bytes.pwrite_with(header, offset, scroll::LE).unwrap();
        let mut at = offset + SIZEOF_RESOURCE_DIRECTORY;
        for &(name_or_id, offset_to_data_or_directory) in entries {
            let entry = ResourceDirectoryEntry {
                name_or_id,
                offset_to_data_or_directory,
            };
            bytes.gwrite_with(entry, &mut at, scroll::LE).unwrap();
        }
    }

    /// type RT_MANIFEST -> id 1 -> language 0x409 -> data, plus a named type "CFG"
    fn tree() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x200];
        table(
            &mut bytes,
            0,
            1,
            &[
                (IMAGE_RESOURCE_NAME_IS_STRING | 0x100, DIR | 0x60),
                (RT_MANIFEST as u32, DIR | 0x20),
            ],
        );
        table(&mut bytes, 0x20, 0, &[(1, DIR | 0x38)]);
        table(&mut bytes, 0x38, 0, &[(0x409, 0x50)]);
        let data = ResourceDataEntry {
            offset_to_data: 0x1180,
            size: 5,
            code_page: 1252,
            reserved: 0,
        };
        bytes.pwrite_with(data, 0x50, scroll::LE).unwrap();
        table(&mut bytes, 0x60, 0, &[]);
        bytes.pwrite_with(3u16, 0x100, scroll::LE).unwrap();
        for (i, unit) in "CFG".encode_utf16().enumerate() {
            bytes.pwrite_with(unit, 0x102 + 2 * i, scroll::LE).unwrap();
        }
        bytes[0x180..0x185].copy_from_slice(b"<xml>");
        bytes
    }

    #[test]
    fn walk_tree() {
        let bytes = tree();
        let tree = parse(&bytes).unwrap();
        assert!(tree.truncated.is_empty());
        assert_eq!(tree.root.entries.len(), 2);
        assert_eq!(tree.root.entries[0].id, ResourceId::Name("CFG".into()));
        let leaves = tree.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].language, Some(0x409));
        assert_eq!(leaves[0].offset, Some(0x180));
        assert_eq!(leaves[0].code_page, 1252);
        assert_eq!(tree.manifest(&bytes), Some("<xml>"));
    }

    #[test]
    fn self_referential_table() {
        let mut bytes = vec![0u8; 0x40];
        table(&mut bytes, 0, 0, &[(RT_RCDATA as u32, DIR)]);
        let tree = parse(&bytes).unwrap();
        assert!(tree.root.entries.is_empty());
        assert_eq!(
            tree.truncated,
            [TruncatedBranch {
                offset: 0,
                depth: 1,
                reason: TruncationReason::Cycle
            }]
        );
    }

    #[test]
    fn mutual_cycle() {
        let mut bytes = vec![0u8; 0x40];
        table(&mut bytes, 0, 0, &[(1, DIR | 0x18)]);
        table(&mut bytes, 0x18, 0, &[(2, DIR)]);
        let tree = parse(&bytes).unwrap();
        assert_eq!(tree.truncated.len(), 1);
        assert_eq!(tree.truncated[0].reason, TruncationReason::Cycle);
        assert_eq!(tree.root.entries.len(), 1);
    }

    #[test]
    fn depth_is_limited() {
        // a chain of tables, each pointing at the next
        let stride = SIZEOF_RESOURCE_DIRECTORY + SIZEOF_RESOURCE_DIRECTORY_ENTRY;
        let tables = MAX_RESOURCE_DEPTH + 4;
        let mut bytes = vec![0u8; stride * tables + stride];
        for i in 0..tables {
            let next = (stride * (i + 1)) as u32;
            table(&mut bytes, stride * i, 0, &[(1, DIR | next)]);
        }
        let tree = parse(&bytes).unwrap();
        assert_eq!(tree.truncated.len(), 1);
        assert_eq!(tree.truncated[0].reason, TruncationReason::DepthLimit);
        assert_eq!(tree.truncated[0].depth, MAX_RESOURCE_DEPTH + 1);
    }

    #[test]
    fn entry_budget_bounds_the_walk() {
        // the root points into a run of (1, DIR | 0) pairs: read from any pair, a table
        // declares 0x8000 entries, each of them a cycle back to the root
        let children = 4;
        let fill = 0x100;
        let len = fill + (0x8000 + children + 2) * SIZEOF_RESOURCE_DIRECTORY_ENTRY;
        let mut bytes = vec![0u8; len];
        let entries: Vec<(u32, u32)> = (0..children)
            .map(|i| (i as u32 + 1, DIR | (fill + i * 8) as u32))
            .collect();
        table(&mut bytes, 0, 0, &entries);
        for at in (fill..len).step_by(8) {
            bytes.pwrite_with(1u32, at, scroll::LE).unwrap();
            bytes.pwrite_with(DIR, at + 4, scroll::LE).unwrap();
        }
        let tree = parse(&bytes).unwrap();
        assert!(tree.truncated.len() <= MAX_RESOURCE_ENTRIES + 1);
        let budget: Vec<_> = tree
            .truncated
            .iter()
            .filter(|branch| branch.reason == TruncationReason::Budget)
            .collect();
        assert_eq!(budget.len(), 1);
        assert_eq!(tree.truncated.last().unwrap().reason, TruncationReason::Budget);
        assert!(tree.root.entries.len() < children);
    }

    #[test]
    fn child_out_of_bounds() {
        let mut bytes = vec![0u8; 0x20];
        table(&mut bytes, 0, 0, &[(1, DIR | 0x7000_0000)]);
        let tree = parse(&bytes).unwrap();
        assert_eq!(tree.truncated[0].reason, TruncationReason::OutOfBounds);
    }

    #[test]
    fn truncated_root_is_a_failure() {
        let bytes = [0u8; 8];
        assert!(parse(&bytes).unwrap_err().is_out_of_bounds());
    }

    #[test]
    fn entry_count_is_clamped() {
        let mut bytes = vec![0u8; 0x20];
        let header = ImageResourceDirectory {
            number_of_named_entries: 0xffff,
            number_of_id_entries: 0xffff,
            ..Default::default()
        };
        bytes.pwrite_with(header, 0, scroll::LE).unwrap();
        let tree = parse(&bytes).unwrap();
        // two zeroed entries fit: ids 0 pointing at data entry 0, which is the header
        assert!(tree.root.entries.len() <= 2);
    }
}
