//! Predicted boot measurements, added to a profile one concern at a time.

use super::params::DeviceModel;
use super::pcr::{Digest, BOOT_MANAGER_CODE_PCR, KERNEL_PCR, SECURE_BOOT_POLICY_PCR};
use super::pe::{PeError, PeImage};
use super::profile::PcrProtectionProfile;
use crate::boot::{BootError, ContainerReader, EfiImage, LoadEvent};
use crate::efi::{
    parse_signature_database, x509_subject, EfiError, EfiVars, SignatureData, CERT_X509_GUID,
    GLOBAL_VARIABLE_GUID, IMAGE_SECURITY_DATABASE_GUID, SHIM_LOCK_GUID,
};
use once_cell::sync::Lazy;
use thiserror::Error;
use uuid::Uuid;

/// EV_SEPARATOR event data.
static SEPARATOR: Lazy<Digest> = Lazy::new(|| Digest::hash(&[0u8; 4]));
/// EV_EFI_ACTION logged before the boot manager starts the first image.
static CALLING_EFI_APPLICATION: Lazy<Digest> =
    Lazy::new(|| Digest::hash(b"Calling EFI Application from Boot Option"));
/// Epoch of the measured system, always 0 so far.
static SYSTEM_EPOCH: Lazy<Digest> = Lazy::new(|| Digest::hash(&0u32.to_le_bytes()));

const SECURE_BOOT_VARIABLES: [(&str, Uuid); 5] = [
    ("SecureBoot", GLOBAL_VARIABLE_GUID),
    ("PK", GLOBAL_VARIABLE_GUID),
    ("KEK", GLOBAL_VARIABLE_GUID),
    ("db", IMAGE_SECURITY_DATABASE_GUID),
    ("dbx", IMAGE_SECURITY_DATABASE_GUID),
];

#[derive(Error, Debug)]
pub enum MeasureError {
    #[error("no load sequences")]
    NoLoadSequences,
    #[error("cannot read EFI variable {name}: {source}")]
    EfiVar { name: String, source: EfiError },
    #[error("cannot read image: {0}")]
    Image(#[from] BootError),
    #[error("cannot parse image {image}: {source}")]
    Pe { image: String, source: PeError },
    #[error("cannot determine the authority that verifies image {0}")]
    NoAuthority(String),
}

pub type Result<T, E = MeasureError> = core::result::Result<T, E>;

pub trait ProfileMeasurements {
    /// Secure boot configuration and the authorities that verify each image
    /// of the load sequences, PCR 7.
    fn add_secure_boot_policy_profile(
        &self,
        profile: &mut PcrProtectionProfile,
        load_sequences: &[LoadEvent],
    ) -> Result<()>;

    /// Images started by the boot manager, PCR 4.
    fn add_boot_manager_profile(
        &self,
        profile: &mut PcrProtectionProfile,
        load_sequences: &[LoadEvent],
    ) -> Result<()>;

    /// Kernel command lines measured by the EFI stub, PCR 12.
    fn add_kernel_cmdline_profile(
        &self,
        profile: &mut PcrProtectionProfile,
        cmdlines: &[String],
    ) -> Result<()>;

    /// Device model measured by the initramfs, PCR 12.
    fn add_model_profile(&self, profile: &mut PcrProtectionProfile, model: &DeviceModel) -> Result<()>;
}

/// UEFI_VARIABLE_DATA as logged for EV_EFI_VARIABLE_DRIVER_CONFIG events.
pub fn variable_data_digest(name: &str, guid: &Uuid, data: &[u8]) -> Digest {
    let unicode_name: Vec<u16> = name.encode_utf16().collect();
    let mut event = Vec::with_capacity(32 + unicode_name.len() * 2 + data.len());
    event.extend_from_slice(&guid.to_bytes_le());
    event.extend_from_slice(&(unicode_name.len() as u64).to_le_bytes());
    event.extend_from_slice(&(data.len() as u64).to_le_bytes());
    for unit in unicode_name {
        event.extend_from_slice(&unit.to_le_bytes());
    }
    event.extend_from_slice(data);
    Digest::hash(&event)
}

/// Digest of a command line as measured by the systemd EFI stub.
pub fn kernel_cmdline_digest(cmdline: &str) -> Digest {
    let mut data: Vec<u8> = cmdline.encode_utf16().flat_map(u16::to_le_bytes).collect();
    data.extend_from_slice(&[0, 0]);
    Digest::hash(&data)
}

/// Predictions based on the running firmware and the boot assets on disk.
pub struct MeasuredBoot<E: EfiVars, C: ContainerReader> {
    efivars: E,
    containers: C,
}

impl<E: EfiVars, C: ContainerReader> MeasuredBoot<E, C> {
    pub fn new(efivars: E, containers: C) -> Self {
        Self { efivars, containers }
    }

    pub fn efivars(&self) -> &E {
        &self.efivars
    }

    fn read_variable(&self, name: &str, guid: &Uuid) -> Result<Vec<u8>> {
        match self.efivars.read_var(name, guid) {
            Ok(data) => Ok(data),
            // Absent variables are measured with empty data
            Err(EfiError::VarNotFound) => Ok(Vec::new()),
            Err(source) => Err(MeasureError::EfiVar {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn boot_path_profile(&self, images: &[&EfiImage]) -> Result<PcrProtectionProfile> {
        let mut profile = PcrProtectionProfile::new();
        profile
            .add_pcr_value(BOOT_MANAGER_CODE_PCR, Digest::zero())
            .extend_pcr(BOOT_MANAGER_CODE_PCR, *CALLING_EFI_APPLICATION)
            .extend_pcr(BOOT_MANAGER_CODE_PCR, *SEPARATOR);
        for image in images {
            let data = image.read(&self.containers)?;
            profile.extend_pcr(BOOT_MANAGER_CODE_PCR, parse_image(image, &data)?.authenticode_digest());
        }
        Ok(profile)
    }

    /// Verification events along one path. The first image is verified by
    /// the firmware against `db`, the rest by shim, which also trusts its
    /// vendor certificate. Every authority is logged once.
    fn authority_profile(&self, db: &[SignatureData], images: &[&EfiImage]) -> Result<PcrProtectionProfile> {
        let mut profile = PcrProtectionProfile::new();
        let mut logged: Vec<Digest> = Vec::new();
        let mut vendor_cert: Option<Vec<u8>> = None;
        for image in images {
            let data = image.read(&self.containers)?;
            let pe = parse_image(image, &data)?;
            let event = authority_event(db, vendor_cert.as_deref(), &pe)
                .map_err(|source| MeasureError::Pe {
                    image: image.to_string(),
                    source,
                })?
                .ok_or_else(|| MeasureError::NoAuthority(image.to_string()))?;
            if vendor_cert.is_none() {
                vendor_cert = pe
                    .vendor_cert()
                    .map_err(|source| MeasureError::Pe {
                        image: image.to_string(),
                        source,
                    })?
                    .map(<[u8]>::to_vec);
            }
            if !logged.contains(&event) {
                profile.extend_pcr(SECURE_BOOT_POLICY_PCR, event);
                logged.push(event);
            }
        }
        Ok(profile)
    }
}

fn parse_image<'d>(image: &EfiImage, data: &'d [u8]) -> Result<PeImage<'d>> {
    PeImage::parse(data).map_err(|source| MeasureError::Pe {
        image: image.to_string(),
        source,
    })
}

/// EV_EFI_VARIABLE_AUTHORITY digest for the certificate that verifies `pe`:
/// a `db` entry, or else the shim vendor certificate.
fn authority_event(db: &[SignatureData], vendor_cert: Option<&[u8]>, pe: &PeImage<'_>) -> Result<Option<Digest>, PeError> {
    for entry in db {
        if let Some(subject) = x509_subject(&entry.data) {
            if pe.signed_by(subject)? {
                return Ok(Some(variable_data_digest("db", &IMAGE_SECURITY_DATABASE_GUID, &entry.to_bytes())));
            }
        }
    }
    if let Some(cert) = vendor_cert {
        if let Some(subject) = x509_subject(cert) {
            if pe.signed_by(subject)? {
                return Ok(Some(variable_data_digest("Shim", &SHIM_LOCK_GUID, cert)));
            }
        }
    }
    Ok(None)
}

/// Appends `alternatives` to `profile`, OR-ed when there is more than one.
fn append_alternatives(profile: &mut PcrProtectionProfile, mut alternatives: Vec<PcrProtectionProfile>) {
    match alternatives.len() {
        0 => {}
        1 => {
            if let Some(single) = alternatives.pop() {
                profile.append(single);
            }
        }
        _ => {
            profile.add_profile_or(alternatives);
        }
    }
}

impl<E: EfiVars, C: ContainerReader> ProfileMeasurements for MeasuredBoot<E, C> {
    fn add_secure_boot_policy_profile(
        &self,
        profile: &mut PcrProtectionProfile,
        load_sequences: &[LoadEvent],
    ) -> Result<()> {
        if load_sequences.is_empty() {
            return Err(MeasureError::NoLoadSequences);
        }
        profile.add_pcr_value(SECURE_BOOT_POLICY_PCR, Digest::zero());
        let mut db = Vec::new();
        for (name, guid) in SECURE_BOOT_VARIABLES.iter() {
            let data = self.read_variable(name, guid)?;
            profile.extend_pcr(SECURE_BOOT_POLICY_PCR, variable_data_digest(name, guid, &data));
            if *name == "db" {
                db = data;
            }
        }
        profile.extend_pcr(SECURE_BOOT_POLICY_PCR, *SEPARATOR);

        let db: Vec<SignatureData> = parse_signature_database(&db)
            .map_err(|source| MeasureError::EfiVar {
                name: "db".to_string(),
                source,
            })?
            .into_iter()
            .filter(|entry| entry.signature_type == CERT_X509_GUID)
            .collect();
        let alternatives = load_sequences
            .iter()
            .flat_map(|sequence| sequence.paths())
            .map(|path| self.authority_profile(&db, &path))
            .collect::<Result<Vec<_>>>()?;
        append_alternatives(profile, alternatives);
        Ok(())
    }

    fn add_boot_manager_profile(
        &self,
        profile: &mut PcrProtectionProfile,
        load_sequences: &[LoadEvent],
    ) -> Result<()> {
        if load_sequences.is_empty() {
            return Err(MeasureError::NoLoadSequences);
        }
        let alternatives = load_sequences
            .iter()
            .flat_map(|sequence| sequence.paths())
            .map(|path| self.boot_path_profile(&path))
            .collect::<Result<Vec<_>>>()?;
        append_alternatives(profile, alternatives);
        Ok(())
    }

    fn add_kernel_cmdline_profile(
        &self,
        profile: &mut PcrProtectionProfile,
        cmdlines: &[String],
    ) -> Result<()> {
        let alternatives = cmdlines
            .iter()
            .map(|cmdline| {
                let mut branch = PcrProtectionProfile::new();
                branch.extend_pcr(KERNEL_PCR, kernel_cmdline_digest(cmdline));
                branch
            })
            .collect();
        append_alternatives(profile, alternatives);
        Ok(())
    }

    fn add_model_profile(&self, profile: &mut PcrProtectionProfile, model: &DeviceModel) -> Result<()> {
        profile
            .extend_pcr(KERNEL_PCR, *SYSTEM_EPOCH)
            .extend_pcr(KERNEL_PCR, model.digest());
        Ok(())
    }
}
