//! Just enough of the PE/COFF format to predict what firmware and shim
//! measure when they load an EFI image.

use super::pcr::Digest;
use sha2::{Digest as _, Sha256};
use std::ops::Range;
use thiserror::Error;

const PE_SIGNATURE: &[u8] = b"PE\0\0";
const COFF_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;
const SYMBOL_SIZE: usize = 18;
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const CERTIFICATE_TABLE_INDEX: usize = 4;
/// WIN_CERT_TYPE_PKCS_SIGNED_DATA
const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;
const WIN_CERTIFICATE_HEADER_SIZE: usize = 8;

/// Section shim embeds its vendor certificate in.
pub const VENDOR_CERT_SECTION: &str = ".vendor_cert";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PeError {
    #[error("not a PE image")]
    NotPe,
    #[error("unsupported optional header magic {0:#06x}")]
    UnsupportedMagic(u16),
    #[error("image is truncated: {0}")]
    Truncated(&'static str),
    #[error("invalid certificate table")]
    InvalidCertificateTable,
}

pub type Result<T, E = PeError> = core::result::Result<T, E>;

fn u16_at(data: &[u8], offset: usize, what: &'static str) -> Result<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(PeError::Truncated(what))
}

fn u32_at(data: &[u8], offset: usize, what: &'static str) -> Result<usize> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or(PeError::Truncated(what))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub raw_data: Range<usize>,
}

/// A parsed EFI image borrowing the file contents.
#[derive(Debug)]
pub struct PeImage<'a> {
    data: &'a [u8],
    checksum_offset: usize,
    certificate_entry_offset: Option<usize>,
    size_of_headers: usize,
    certificate_table: Range<usize>,
    sections: Vec<Section>,
}

impl<'a> PeImage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if !data.starts_with(b"MZ") {
            return Err(PeError::NotPe);
        }
        let pe_offset = u32_at(data, 0x3c, "DOS header")?;
        if data.get(pe_offset..pe_offset + 4) != Some(PE_SIGNATURE) {
            return Err(PeError::NotPe);
        }
        let coff = pe_offset + 4;
        let section_count = u16_at(data, coff + 2, "COFF header")? as usize;
        let symbol_table = u32_at(data, coff + 8, "COFF header")?;
        let symbol_count = u32_at(data, coff + 12, "COFF header")?;
        let optional_size = u16_at(data, coff + 16, "COFF header")? as usize;

        let optional = coff + COFF_HEADER_SIZE;
        let directories = match u16_at(data, optional, "optional header")? {
            PE32_MAGIC => optional + 96,
            PE32_PLUS_MAGIC => optional + 112,
            magic => return Err(PeError::UnsupportedMagic(magic)),
        };
        let size_of_headers = u32_at(data, optional + 60, "optional header")?;
        let checksum_offset = optional + 64;
        let directory_count = u32_at(data, directories - 4, "optional header")?;

        let (certificate_entry_offset, certificate_table) = if directory_count > CERTIFICATE_TABLE_INDEX {
            let entry = directories + CERTIFICATE_TABLE_INDEX * 8;
            let start = u32_at(data, entry, "data directories")?;
            let size = u32_at(data, entry + 4, "data directories")?;
            if size > 0 && start.checked_add(size).map_or(true, |end| end > data.len()) {
                return Err(PeError::InvalidCertificateTable);
            }
            (Some(entry), start..start + size)
        } else {
            (None, 0..0)
        };
        let headers_end = certificate_entry_offset.map_or(checksum_offset + 4, |entry| entry + 8);
        if size_of_headers > data.len() || headers_end > size_of_headers {
            return Err(PeError::Truncated("headers"));
        }

        let strings = symbol_table + symbol_count * SYMBOL_SIZE;
        let table = optional + optional_size;
        let sections = (0..section_count)
            .map(|i| {
                let header = table + i * SECTION_HEADER_SIZE;
                let raw = data
                    .get(header..header + 8)
                    .ok_or(PeError::Truncated("section table"))?;
                let name = section_name(data, raw, symbol_table, strings)?;
                let size = u32_at(data, header + 16, "section table")?;
                let start = u32_at(data, header + 20, "section table")?;
                if start + size > data.len() {
                    return Err(PeError::Truncated("section data"));
                }
                Ok(Section {
                    name,
                    raw_data: start..start + size,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            data,
            checksum_offset,
            certificate_entry_offset,
            size_of_headers,
            certificate_table,
            sections,
        })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&'a [u8]> {
        let data: &'a [u8] = self.data;
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| &data[s.raw_data.clone()])
    }

    /// The Authenticode image digest, which is what firmware logs for the
    /// images it loads.
    pub fn authenticode_digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        let data = self.data;
        hasher.update(&data[..self.checksum_offset]);
        match self.certificate_entry_offset {
            Some(entry) => {
                hasher.update(&data[self.checksum_offset + 4..entry]);
                hasher.update(&data[entry + 8..self.size_of_headers]);
            }
            None => hasher.update(&data[self.checksum_offset + 4..self.size_of_headers]),
        }

        let mut sections: Vec<&Range<usize>> = self
            .sections
            .iter()
            .map(|s| &s.raw_data)
            .filter(|r| !r.is_empty())
            .collect();
        sections.sort_by_key(|r| r.start);
        let mut hashed = self.size_of_headers;
        for range in sections {
            hasher.update(&data[range.clone()]);
            hashed += range.len();
        }

        let end = data.len().saturating_sub(self.certificate_table.len());
        if end > hashed {
            hasher.update(&data[hashed..end]);
        }
        Digest(hasher.finalize().into())
    }

    /// PKCS#7 SignedData blobs in the certificate table.
    pub fn signatures(&self) -> Result<Vec<&'a [u8]>> {
        let data: &'a [u8] = self.data;
        let mut table = &data[self.certificate_table.clone()];
        let mut signatures = Vec::new();
        while table.len() >= WIN_CERTIFICATE_HEADER_SIZE {
            let length = u32_at(table, 0, "certificate table")?;
            let cert_type = u16_at(table, 6, "certificate table")?;
            if length < WIN_CERTIFICATE_HEADER_SIZE || length > table.len() {
                return Err(PeError::InvalidCertificateTable);
            }
            if cert_type == WIN_CERT_TYPE_PKCS_SIGNED_DATA {
                signatures.push(&table[WIN_CERTIFICATE_HEADER_SIZE..length]);
            }
            // entries are 8 byte aligned
            let next = (length + 7) & !7;
            table = table.get(next..).unwrap_or_default();
        }
        Ok(signatures)
    }

    /// Whether a signature of the image names `subject`, the encoded subject
    /// of the signing certificate or of its issuer.
    pub fn signed_by(&self, subject: &[u8]) -> Result<bool> {
        Ok(!subject.is_empty()
            && self
                .signatures()?
                .iter()
                .any(|sig| sig.windows(subject.len()).any(|w| w == subject)))
    }

    /// The certificate shim trusts for the images it loads.
    pub fn vendor_cert(&self) -> Result<Option<&'a [u8]>> {
        let section = match self.section(VENDOR_CERT_SECTION) {
            Some(section) => section,
            None => return Ok(None),
        };
        let size = u32_at(section, 0, "vendor certificate table")?;
        let offset = u32_at(section, 8, "vendor certificate table")?;
        if size == 0 {
            return Ok(None);
        }
        section
            .get(offset..offset + size)
            .map(Some)
            .ok_or(PeError::Truncated("vendor certificate"))
    }
}

/// Section names longer than 8 bytes are `/<offset>` into the COFF string
/// table.
fn section_name(data: &[u8], raw: &[u8], symbol_table: usize, strings: usize) -> Result<String> {
    let short = raw.split(|b| *b == 0).next().unwrap_or_default();
    let offset = match short.strip_prefix(b"/") {
        Some(digits) if symbol_table != 0 => std::str::from_utf8(digits)
            .ok()
            .and_then(|d| d.parse::<usize>().ok())
            .ok_or(PeError::Truncated("section name"))?,
        _ => return Ok(String::from_utf8_lossy(short).into_owned()),
    };
    let name = data
        .get(strings + offset..)
        .and_then(|s| s.split(|b| *b == 0).next())
        .ok_or(PeError::Truncated("string table"))?;
    Ok(String::from_utf8_lossy(name).into_owned())
}
