//! Unlocking an encrypted volume at boot.

use super::pcr::{PcrSelection, KERNEL_PCR};
use super::sealed_key::{SealedKeyStore, StoreError};
use super::{TpmConnection, TpmConnector, TpmError, TpmGuard};
use crate::keyring::{Keyring, KEYRING_PREFIX, UNLOCK_PURPOSE};
use crate::luks::{ActivateError, VolumeActivator};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Attempts at typing the recovery key before giving up.
pub const RECOVERY_KEY_TRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum UnlockError {
    #[error("cannot unlock encrypted device {name:?}: {source}")]
    Connect { name: String, source: TpmError },
    #[error("cannot unlock encrypted device {device:?}: no usable TPM device is available and the recovery key is not allowed")]
    NoUnlockMethod { device: String },
    #[error("cannot read sealed key file {}: {source}", .path.display())]
    ReadSealedKey { path: PathBuf, source: StoreError },
    #[error("cannot unseal key: {0}")]
    Unseal(TpmError),
    #[error(transparent)]
    Activate(#[from] ActivateError),
    #[error("cannot activate encrypted device {device:?}: {source}")]
    Activation {
        device: String,
        source: Box<UnlockError>,
    },
    #[error("cannot unlock encrypted device {device:?}: {source}")]
    Recovery {
        device: String,
        source: ActivateError,
    },
    #[error("cannot lock TPM: {0}")]
    Lock(TpmError),
}

pub type Result<T, E = UnlockError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnlockOptions {
    pub allow_recovery_key: bool,
    /// Block access to sealed keys once this call is done.
    pub lock_keys_on_finish: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockMethod {
    UnlockedWithSealedKey,
    UnlockedWithRecoveryKey,
    UnlockedWithKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockResult {
    pub mapper_name: String,
    /// Decrypted block device.
    pub fs_device: PathBuf,
    pub method: UnlockMethod,
}

impl UnlockResult {
    fn new(mapper_name: String, method: UnlockMethod) -> Self {
        let fs_device = Path::new("/dev/mapper").join(&mapper_name);
        Self {
            mapper_name,
            fs_device,
            method,
        }
    }
}

fn mapper_name(name: &str) -> String {
    format!("{}-{}", name, Uuid::new_v4())
}

pub struct Unlocker<T: TpmConnector, A: VolumeActivator, K: Keyring, S: SealedKeyStore> {
    tpm: T,
    activator: A,
    keyring: K,
    store: S,
    keyring_prefix: String,
    lock_pcrs: PcrSelection,
}

impl<T, A, K, S> Unlocker<T, A, K, S>
where
    T: TpmConnector,
    A: VolumeActivator,
    K: Keyring,
    S: SealedKeyStore,
{
    pub fn new(tpm: T, activator: A, keyring: K, store: S) -> Self {
        Self {
            tpm,
            activator,
            keyring,
            store,
            keyring_prefix: KEYRING_PREFIX.to_string(),
            lock_pcrs: PcrSelection::new([KERNEL_PCR]),
        }
    }

    /// PCRs extended when access to sealed keys is locked.
    pub fn with_lock_pcrs(mut self, pcrs: PcrSelection) -> Self {
        self.lock_pcrs = pcrs;
        self
    }

    fn lock(&self, tpm: &mut TpmGuard<T::Connection>) -> Result<()> {
        let pcrs: Vec<_> = self.lock_pcrs.iter().collect();
        tpm.block_pcr_protection_policies(&pcrs)
            .map_err(UnlockError::Lock)
    }

    pub fn with_keyring_prefix<P: Into<String>>(mut self, prefix: P) -> Self {
        self.keyring_prefix = prefix.into();
        self
    }

    /// Opens a connection to the TPM. A missing device is `Ok(None)`.
    fn connect(&self, name: &str) -> Result<Option<TpmGuard<T::Connection>>> {
        match self.tpm.connect_guarded() {
            Ok(tpm) => Ok(Some(tpm)),
            Err(TpmError::NoDevice) => {
                log::info!("cannot open TPM connection: {}", TpmError::NoDevice);
                Ok(None)
            }
            Err(source) => Err(UnlockError::Connect {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Whether sealed keys can be unsealed on `tpm`.
    fn usable(tpm: &mut TpmGuard<T::Connection>) -> bool {
        match tpm.is_enabled() {
            Ok(enabled) => {
                if !enabled {
                    log::info!("TPM device is not enabled");
                }
                enabled
            }
            Err(e) => {
                log::warn!("cannot check if TPM is enabled: {}", e);
                false
            }
        }
    }

    /// Unlocks `device` as `<name>-<uuid>` with the key sealed in
    /// `sealed_key_file`, falling back to the recovery key when allowed.
    pub fn unlock_volume(
        &self,
        name: &str,
        device: &str,
        sealed_key_file: &Path,
        options: &UnlockOptions,
    ) -> Result<UnlockResult> {
        let mapper_name = mapper_name(name);
        let mut tpm = self.connect(name)?;

        let usable = tpm.as_mut().map_or(false, Self::usable);
        let result = match tpm.as_mut() {
            Some(tpm) if usable => self.unlock_with_tpm(tpm, &mapper_name, device, sealed_key_file, options),
            _ if options.allow_recovery_key => self.unlock_with_recovery_key(&mapper_name, device),
            _ => Err(UnlockError::NoUnlockMethod {
                device: device.to_string(),
            }),
        };

        // A detected TPM is locked even when it could not be used
        if let (true, Some(tpm)) = (options.lock_keys_on_finish, tpm.as_mut()) {
            if let Err(e) = self.lock(tpm) {
                if result.is_ok() {
                    return Err(e);
                }
                log::warn!("cannot lock access to sealed keys: {}", e);
            }
        }
        result.map(|method| UnlockResult::new(mapper_name, method))
    }

    fn unlock_with_tpm(
        &self,
        tpm: &mut TpmGuard<T::Connection>,
        mapper_name: &str,
        device: &str,
        sealed_key_file: &Path,
        options: &UnlockOptions,
    ) -> Result<UnlockMethod> {
        match self.activate_with_sealed_key(tpm, mapper_name, device, sealed_key_file) {
            Ok(()) => {
                log::info!("successfully activated encrypted device {:?} with TPM", device);
                Ok(UnlockMethod::UnlockedWithSealedKey)
            }
            Err(e) if options.allow_recovery_key => {
                log::warn!("cannot activate {:?} with sealed key: {}", device, e);
                let method = self
                    .unlock_with_recovery_key(mapper_name, device)
                    .map_err(|e| UnlockError::Activation {
                        device: device.to_string(),
                        source: Box::new(e),
                    })?;
                log::info!(
                    "successfully activated encrypted device {:?} using a fallback activation method",
                    device
                );
                Ok(method)
            }
            Err(e) => Err(UnlockError::Activation {
                device: device.to_string(),
                source: Box::new(e),
            }),
        }
    }

    fn activate_with_sealed_key(
        &self,
        tpm: &mut TpmGuard<T::Connection>,
        mapper_name: &str,
        device: &str,
        sealed_key_file: &Path,
    ) -> Result<()> {
        let object = self
            .store
            .read_object(sealed_key_file)
            .map_err(|source| UnlockError::ReadSealedKey {
                path: sealed_key_file.to_path_buf(),
                source,
            })?;
        let key = tpm.unseal_key(&object).map_err(UnlockError::Unseal)?;
        self.activator.activate_with_key(mapper_name, device, &key)?;
        if let Err(e) = self
            .keyring
            .store_key(&key, device, UNLOCK_PURPOSE, &self.keyring_prefix)
        {
            log::warn!("cannot add key to user keyring: {}", e);
        }
        Ok(())
    }

    fn unlock_with_recovery_key(&self, mapper_name: &str, device: &str) -> Result<UnlockMethod> {
        self.activator
            .activate_with_recovery_key(mapper_name, device, RECOVERY_KEY_TRIES)
            .map_err(|source| UnlockError::Recovery {
                device: device.to_string(),
                source,
            })?;
        Ok(UnlockMethod::UnlockedWithRecoveryKey)
    }

    /// Unlocks `device` with a key the caller already holds.
    pub fn unlock_volume_with_key(&self, name: &str, device: &str, key: &[u8]) -> Result<UnlockResult> {
        let mapper_name = mapper_name(name);
        self.activator.activate_with_key(&mapper_name, device, key)?;
        log::info!("successfully activated encrypted device {:?} using a key", device);
        Ok(UnlockResult::new(mapper_name, UnlockMethod::UnlockedWithKey))
    }

    /// Blocks access to sealed keys until the next boot.
    pub fn lock_sealed_keys(&self) -> Result<()> {
        let mut tpm = match self.tpm.connect_guarded() {
            Ok(tpm) => tpm,
            Err(TpmError::NoDevice) => {
                log::info!("cannot open TPM connection: {}", TpmError::NoDevice);
                return Ok(());
            }
            Err(e) => return Err(UnlockError::Lock(e)),
        };
        self.lock(&mut tpm)
    }
}
