//! Access to UEFI variables.

use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use uuid::{uuid, Uuid};

pub const EFIVARFS: &str = "/sys/firmware/efi/efivars";

/// Vendor GUID of the EFI global variables (`SecureBoot`, `PK`, `KEK`).
pub const GLOBAL_VARIABLE_GUID: Uuid = uuid!("8be4df61-93ca-11d2-aa0d-00e098032b8c");
/// Vendor GUID of the signature databases (`db`, `dbx`).
pub const IMAGE_SECURITY_DATABASE_GUID: Uuid = uuid!("d719b2cb-3d3a-4596-a3bc-dad00e67656f");
/// Vendor GUID of variables owned by shim.
pub const SHIM_LOCK_GUID: Uuid = uuid!("605dab50-e046-4300-abb6-3dd810dd8b23");
/// EFI_CERT_X509_GUID, signature lists of DER encoded certificates.
pub const CERT_X509_GUID: Uuid = uuid!("a5c059a1-94e4-4aa7-87b5-ab155c2bf072");

/// SignatureType, SignatureListSize, SignatureHeaderSize, SignatureSize.
const SIGNATURE_LIST_HEADER_SIZE: usize = 28;
const GUID_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum EfiError {
    #[error("not a supported EFI system")]
    NoEfiSystem,
    #[error("variable not found")]
    VarNotFound,
    #[error("variable {0} is truncated")]
    Truncated(String),
    #[error("invalid signature list: {0}")]
    InvalidSignatureList(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = EfiError> = core::result::Result<T, E>;

pub trait EfiVars {
    /// Reads the payload of a variable, without its attribute bits.
    fn read_var(&self, name: &str, guid: &Uuid) -> Result<Vec<u8>>;
}

/// [`EfiVars`] reading efivarfs, where every file starts with a 4 byte
/// attribute field.
#[derive(Debug, Clone)]
pub struct SysfsEfiVars {
    root: PathBuf,
}

impl Default for SysfsEfiVars {
    fn default() -> Self {
        Self {
            root: PathBuf::from(EFIVARFS),
        }
    }
}

impl SysfsEfiVars {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl EfiVars for SysfsEfiVars {
    fn read_var(&self, name: &str, guid: &Uuid) -> Result<Vec<u8>> {
        if !self.root.is_dir() {
            return Err(EfiError::NoEfiSystem);
        }
        let file_name = format!("{}-{}", name, guid.hyphenated());
        let mut data = match fs::read(self.root.join(&file_name)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(EfiError::VarNotFound),
            Err(e) => return Err(e.into()),
        };
        if data.len() < 4 {
            return Err(EfiError::Truncated(file_name));
        }
        Ok(data.split_off(4))
    }
}

/// One EFI_SIGNATURE_DATA entry of a signature database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureData {
    pub signature_type: Uuid,
    pub owner: Uuid,
    pub data: Vec<u8>,
}

impl SignatureData {
    /// The entry as laid out in the database, owner GUID first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(GUID_SIZE + self.data.len());
        bytes.extend_from_slice(&self.owner.to_bytes_le());
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<usize> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
}

fn read_guid(data: &[u8], offset: usize) -> Option<Uuid> {
    let bytes: [u8; GUID_SIZE] = data.get(offset..offset + GUID_SIZE)?.try_into().ok()?;
    Some(Uuid::from_bytes_le(bytes))
}

/// Parses the EFI_SIGNATURE_LISTs of a signature database such as `db`.
pub fn parse_signature_database(data: &[u8]) -> Result<Vec<SignatureData>> {
    let invalid = |what: &str, offset: usize| EfiError::InvalidSignatureList(format!("{} at offset {}", what, offset));
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let signature_type = read_guid(data, offset).ok_or_else(|| invalid("truncated header", offset))?;
        let (list_size, header_size, signature_size) = match (
            read_u32(data, offset + 16),
            read_u32(data, offset + 20),
            read_u32(data, offset + 24),
        ) {
            (Some(l), Some(h), Some(s)) => (l, h, s),
            _ => return Err(invalid("truncated header", offset)),
        };
        let list = data
            .get(offset..offset.saturating_add(list_size))
            .ok_or_else(|| invalid("truncated list", offset))?;
        let first = SIGNATURE_LIST_HEADER_SIZE + header_size;
        if signature_size <= GUID_SIZE || first > list.len() || (list.len() - first) % signature_size != 0 {
            return Err(invalid("inconsistent sizes", offset));
        }
        for signature in list[first..].chunks(signature_size) {
            entries.push(SignatureData {
                signature_type,
                owner: read_guid(signature, 0).ok_or_else(|| invalid("truncated signature", offset))?,
                data: signature[GUID_SIZE..].to_vec(),
            });
        }
        offset += list_size;
    }
    Ok(entries)
}

/// Splits one DER TLV off `data`, returning the whole element and the rest.
fn der_element(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let tag = *data.first()?;
    let first = *data.get(1)?;
    let (header, length) = if first & 0x80 == 0 {
        (2, first as usize)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 {
            return None;
        }
        let length = data
            .get(2..2 + count)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (2 + count, length)
    };
    let end = header.checked_add(length)?;
    let element = data.get(..end)?;
    Some((tag, element, &data[end..]))
}

fn der_contents(element: &[u8]) -> Option<&[u8]> {
    let (_, whole, _) = der_element(element)?;
    let header = if whole[1] & 0x80 == 0 { 2 } else { 2 + (whole[1] & 0x7f) as usize };
    whole.get(header..)
}

/// The encoded subject Name of a DER X.509 certificate.
pub fn x509_subject(cert: &[u8]) -> Option<&[u8]> {
    let tbs = der_contents(der_contents(cert)?)?;
    let (tag, _, mut rest) = der_element(tbs)?;
    // version is optional, the serial number follows it
    if tag != 0xa0 {
        rest = tbs;
    }
    // serialNumber, signature, issuer, validity
    for _ in 0..4 {
        rest = der_element(rest)?.2;
    }
    let (tag, subject, _) = der_element(rest)?;
    (tag == 0x30).then_some(subject)
}

#[derive(Error, Debug)]
pub enum SecureBootError {
    #[error("not a supported EFI system")]
    NoEfiSystem,
    #[error("cannot read secure boot variable: {0}")]
    Read(EfiError),
    #[error("secure boot variable does not exist")]
    Missing,
    #[error("secure boot is disabled")]
    Disabled,
}

pub fn check_secure_boot_enabled<E: EfiVars + ?Sized>(vars: &E) -> Result<(), SecureBootError> {
    let data = match vars.read_var("SecureBoot", &GLOBAL_VARIABLE_GUID) {
        Ok(data) => data,
        Err(EfiError::NoEfiSystem) => return Err(SecureBootError::NoEfiSystem),
        Err(e) => return Err(SecureBootError::Read(e)),
    };
    match data.first() {
        None => Err(SecureBootError::Missing),
        Some(1) => Ok(()),
        Some(_) => Err(SecureBootError::Disabled),
    }
}
