//! Inputs for sealing and resealing, and their YAML form.

use super::pcr::Digest;
use crate::boot::LoadChain;
use crate::keys::EncryptionKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// NV index holding the approved PCR policy of run-mode keys.
pub const DEFAULT_PCR_POLICY_COUNTER_HANDLE: u32 = 0x0188_0001;

/// Identity of the device model measured into the kernel PCR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModel {
    pub authority_id: String,
    pub brand_id: String,
    pub model: String,
    pub series: String,
    pub grade: String,
    pub sign_key_id: String,
}

impl DeviceModel {
    /// Chained SHA-256 over the identifying fields.
    pub fn digest(&self) -> Digest {
        [
            &self.brand_id,
            &self.model,
            &self.series,
            &self.grade,
            &self.sign_key_id,
        ]
        .iter()
        .fold(Digest::hash(self.authority_id.as_bytes()), |acc, field| {
            acc.extend(&Digest::hash(field.as_bytes()))
        })
    }
}

/// What one device model is allowed to boot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelSealParameters {
    #[serde(default)]
    pub load_chains: Vec<LoadChain>,
    #[serde(default)]
    pub kernel_cmdlines: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<DeviceModel>,
}

pub struct SealKeyRequest {
    pub key: EncryptionKey,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SealKeysParams {
    pub model_params: Vec<ModelSealParameters>,
    pub pcr_policy_counter_handle: u32,
    /// Written with the generated policy authorization key when set.
    pub policy_auth_key_file: Option<PathBuf>,
    pub tpm_provision: bool,
    pub lockout_auth_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResealKeysParams {
    pub model_params: Vec<ModelSealParameters>,
    /// The first file holds the primary key object.
    pub key_files: Vec<PathBuf>,
    pub policy_auth_key_file: PathBuf,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

fn default_handle() -> u32 {
    DEFAULT_PCR_POLICY_COUNTER_HANDLE
}

/// Sealing configuration file.
///
/// ```yaml
/// pcr_policy_counter_handle: 0x01880001
/// policy_auth_key_file: /run/mnt/ubuntu-save/device/fde/tpm-policy-auth-key
/// lockout_auth_file: /run/mnt/ubuntu-save/device/fde/tpm-lockout-auth
/// key_files:
///   - /run/mnt/ubuntu-boot/device/fde/ubuntu-data.sealed-key
/// models:
///   - kernel_cmdlines: ["snapd_recovery_mode=run console=ttyS0"]
///     load_chains:
///       - boot_file: { path: /boot/efi/EFI/boot/bootx64.efi }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealConfig {
    pub models: Vec<ModelSealParameters>,
    #[serde(default = "default_handle")]
    pub pcr_policy_counter_handle: u32,
    pub policy_auth_key_file: PathBuf,
    pub lockout_auth_file: PathBuf,
    pub key_files: Vec<PathBuf>,
}

impl SealConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn seal_params(&self, tpm_provision: bool) -> SealKeysParams {
        SealKeysParams {
            model_params: self.models.clone(),
            pcr_policy_counter_handle: self.pcr_policy_counter_handle,
            policy_auth_key_file: Some(self.policy_auth_key_file.clone()),
            tpm_provision,
            lockout_auth_file: self.lockout_auth_file.clone(),
        }
    }

    pub fn reseal_params(&self) -> ResealKeysParams {
        ResealKeysParams {
            model_params: self.models.clone(),
            key_files: self.key_files.clone(),
            policy_auth_key_file: self.policy_auth_key_file.clone(),
        }
    }
}
