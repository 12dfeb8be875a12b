//! The attribute certificate table, where Authenticode signatures live.
//!
//! Unlike every other data directory, its address is a file offset: the table is never
//! mapped by the loader. Only the `WIN_CERTIFICATE` headers are decoded; the PKCS#7
//! payloads are kept verbatim in [`Signature::data`].

use alloc::vec::Vec;

use log::{debug, warn};
use scroll::{Pread, Pwrite, SizeWith};

use crate::cursor::Cursor;
use crate::error;
use crate::pe::data_directories::DataDirectory;
use crate::pe::utils;

pub const WIN_CERT_REVISION_1_0: u16 = 0x0100;
pub const WIN_CERT_REVISION_2_0: u16 = 0x0200;

pub const WIN_CERT_TYPE_X509: u16 = 0x0001;
pub const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;
pub const WIN_CERT_TYPE_RESERVED_1: u16 = 0x0003;
pub const WIN_CERT_TYPE_TS_STACK_SIGNED: u16 = 0x0004;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("WIN_CERTIFICATE"))]
pub struct AttributeCertificateHeader {
    /// Length of the entry, header included
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
}

pub const SIZEOF_ATTRIBUTE_CERTIFICATE_HEADER: usize = 8;

/// One entry of the certificate table
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct AttributeCertificate {
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
    /// Offset of the payload inside [`Signature::data`]
    pub offset: usize,
    /// Size of the payload
    pub size: usize,
}

impl AttributeCertificate {
    pub fn is_pkcs_signed_data(&self) -> bool {
        self.certificate_type == WIN_CERT_TYPE_PKCS_SIGNED_DATA
    }
}

/// The certificate table of an image
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Signature {
    /// File offset of the table
    pub offset: usize,
    /// The table, copied verbatim
    pub data: Vec<u8>,
    pub certificates: Vec<AttributeCertificate>,
}

impl Signature {
    pub(crate) fn parse(cursor: &Cursor, dd: DataDirectory) -> error::Result<Self> {
        let offset = dd.virtual_address as usize;
        let data = cursor.read_fixed(offset, dd.size as usize)?.to_vec();
        let certificates = certificates(&data);
        debug!(
            "certificate table at {offset:#x}: {:#x} bytes, {} certificates",
            data.len(),
            certificates.len()
        );
        Ok(Signature {
            offset,
            data,
            certificates,
        })
    }

    /// The payload of `certificate`, a PKCS#7 `SignedData` blob for Authenticode.
    pub fn content(&self, certificate: &AttributeCertificate) -> Option<&[u8]> {
        let end = certificate.offset.checked_add(certificate.size)?;
        self.data.get(certificate.offset..end)
    }
}

/// Walks the `WIN_CERTIFICATE` headers; every entry starts on an 8 byte boundary.
fn certificates(data: &[u8]) -> Vec<AttributeCertificate> {
    let mut certificates = Vec::new();
    let mut offset = 0;
    while data.len().saturating_sub(offset) >= SIZEOF_ATTRIBUTE_CERTIFICATE_HEADER {
        let Ok(header) = data.pread_with::<AttributeCertificateHeader>(offset, scroll::LE) else {
            break;
        };
        let length = header.length as usize;
        if length < SIZEOF_ATTRIBUTE_CERTIFICATE_HEADER || length > data.len() - offset {
            warn!(
                "attribute certificate at {offset:#x} claims {length:#x} bytes, {:#x} left",
                data.len() - offset
            );
            break;
        }
        certificates.push(AttributeCertificate {
            length: header.length,
            revision: header.revision,
            certificate_type: header.certificate_type,
            offset: offset + SIZEOF_ATTRIBUTE_CERTIFICATE_HEADER,
            size: length - SIZEOF_ATTRIBUTE_CERTIFICATE_HEADER,
        });
        match utils::align_up(offset + length, 8) {
            Some(next) => offset = next,
            None => break,
        }
    }
    certificates
}
