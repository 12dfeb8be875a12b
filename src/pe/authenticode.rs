// Reference:
//   https://learn.microsoft.com/en-us/windows-hardware/drivers/install/authenticode
//   https://download.microsoft.com/download/9/c/5/9c5b2167-8017-4bae-9fde-d599bac8184a/Authenticode_PE.docx

// Authenticode works by omiting sections of the PE binary from the digest
// those sections are:
//   - checksum
//   - data directory entry for certtable
//   - certtable

use core::ops::Range;

use super::Binary;
use super::data_directories::{DirectoryKind, SIZEOF_DATA_DIRECTORY};
use super::header::Header;
use super::optional_header;
use crate::pe::ctx::AddressingWidth;

static PADDING: [u8; 7] = [0; 7];

impl Binary {
    /// [`authenticode_ranges`](Binary::authenticode_ranges) returns the slices of `bytes`
    /// that are covered by an Authenticode signature, in order.
    ///
    /// `bytes` must be the buffer this binary was parsed from. When the excluded regions
    /// could not be located the whole buffer is yielded.
    pub fn authenticode_ranges<'s>(&'s self, bytes: &'s [u8]) -> ExcludedSectionsIter<'s> {
        ExcludedSectionsIter {
            sections: self.authenticode_excluded_sections.as_ref(),
            bytes,
            state: IterState::default(),
        }
    }

    /// SHA-256 over [`authenticode_ranges`](Binary::authenticode_ranges), the digest an
    /// Authenticode signature carries.
    #[cfg(feature = "codesign")]
    pub fn authentihash_sha256(&self, bytes: &[u8]) -> [u8; 32] {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        for chunk in self.authenticode_ranges(bytes) {
            hasher.update(chunk);
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        digest
    }
}

/// [`ExcludedSections`] holds the various ranges of the binary that are expected to be
/// excluded from the authenticode computation.
#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct ExcludedSections {
    checksum: Range<usize>,
    datadir_entry_certtable: Range<usize>,
    certtable: Option<Range<usize>>,
}

impl ExcludedSections {
    /// Locates the checksum, the certificate table slot and the table itself.
    ///
    /// `None` when the ranges do not fit in a buffer of `len` bytes in that order.
    pub(super) fn new(header: &Header, width: AddressingWidth, len: usize) -> Option<Self> {
        let optional_header_offset = header.dos_header.pe_pointer as usize
            + super::header::SIZEOF_PE_MAGIC
            + super::header::SIZEOF_COFF_HEADER;
        let (checksum_offset, data_directories_offset) = match width {
            AddressingWidth::Width32 => (
                optional_header::SIZEOF_STANDARD_FIELDS_32
                    + optional_header::OFFSET_WINDOWS_FIELDS_32_CHECKSUM,
                optional_header::SIZEOF_STANDARD_FIELDS_32
                    + optional_header::SIZEOF_WINDOWS_FIELDS_32,
            ),
            AddressingWidth::Width64 => (
                optional_header::SIZEOF_STANDARD_FIELDS_64
                    + optional_header::OFFSET_WINDOWS_FIELDS_64_CHECKSUM,
                optional_header::SIZEOF_STANDARD_FIELDS_64
                    + optional_header::SIZEOF_WINDOWS_FIELDS_64,
            ),
        };
        let checksum_start = optional_header_offset + checksum_offset;
        let checksum = checksum_start..checksum_start + 4;
        let entry_start = optional_header_offset
            + data_directories_offset
            + DirectoryKind::CertificateTable.index() * SIZEOF_DATA_DIRECTORY;
        let datadir_entry_certtable = entry_start..entry_start + SIZEOF_DATA_DIRECTORY;

        // the certificate table address is a file offset
        let certtable = header
            .optional_header
            .data_directories
            .get_certificate_table()
            .and_then(|dd| {
                let start = dd.virtual_address as usize;
                let end = start.checked_add(dd.size as usize)?;
                (start >= datadir_entry_certtable.end && end <= len).then_some(start..end)
            });

        if checksum.end > datadir_entry_certtable.start || datadir_entry_certtable.end > len {
            return None;
        }
        Some(ExcludedSections {
            checksum,
            datadir_entry_certtable,
            certtable,
        })
    }
}

pub struct ExcludedSectionsIter<'s> {
    sections: Option<&'s ExcludedSections>,
    bytes: &'s [u8],
    state: IterState,
}

#[derive(Debug, PartialEq, Default)]
enum IterState {
    #[default]
    Initial,
    DatadirEntry(usize),
    CertTable(usize),
    Final(usize),
    Padding(usize),
    Done,
}

impl<'s> Iterator for ExcludedSectionsIter<'s> {
    type Item = &'s [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.bytes;

        if let Some(sections) = self.sections {
            loop {
                match self.state {
                    IterState::Initial => {
                        self.state = IterState::DatadirEntry(sections.checksum.end);
                        return bytes.get(..sections.checksum.start);
                    }
                    IterState::DatadirEntry(start) => {
                        self.state = IterState::CertTable(sections.datadir_entry_certtable.end);
                        return bytes.get(start..sections.datadir_entry_certtable.start);
                    }
                    IterState::CertTable(start) => {
                        if let Some(certtable) = sections.certtable.as_ref() {
                            self.state = IterState::Final(certtable.end);
                            return bytes.get(start..certtable.start);
                        } else {
                            self.state = IterState::Final(start)
                        }
                    }
                    IterState::Final(start) => {
                        let buf = bytes.get(start..)?;
                        self.state = IterState::Padding(buf.len());
                        return Some(buf);
                    }
                    IterState::Padding(hash_size) => {
                        self.state = IterState::Done;

                        if hash_size % 8 != 0 {
                            let pad_size = 8 - hash_size % 8;
                            return Some(&PADDING[..pad_size]);
                        }
                    }
                    IterState::Done => return None,
                }
            }
        } else {
            loop {
                match self.state {
                    IterState::Initial => {
                        self.state = IterState::Done;
                        return Some(bytes);
                    }
                    IterState::Done => return None,
                    _ => {
                        self.state = IterState::Done;
                    }
                }
            }
        }
    }
}
