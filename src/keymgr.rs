//! LUKS2 key lifecycle: recovery key management and crash-safe rotation of the
//! primary volume key.
//!
//! No protocol state is persisted. Each step re-derives where it stands from
//! keyslot occupancy, so an interrupted rotation is completed by running the
//! same step again:
//!
//! 1. [`KeyManager::stage_key_change`] puts the new key into the temporary slot.
//! 2. [`KeyManager::transition_key_change`] moves it into the primary slot.
//!
//! From the moment staging completes the new key unlocks the volume after every
//! individual keyslot operation.

use crate::kdf::{self, KdfError, KdfOptions};
use crate::keyring::{Keyring, KeyringError, KEYRING_PREFIX, UNLOCK_PURPOSE};
use crate::keys::{EncryptionKey, KeyError, RecoveryKey, UnlockKey};
use crate::luks::{KeySlot, KeyslotError, KeyslotOps, SlotPriority};
use std::path::PathBuf;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum KeyMgrError {
    #[error("cannot obtain current unlock key for {device}: {source}")]
    UnlockKey {
        device: String,
        source: KeyringError,
    },
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
    #[error(transparent)]
    Kdf(#[from] KdfError),
    #[error("cannot add key: {0}")]
    AddKey(KeyslotError),
    #[error("cannot add temporary key: {0}")]
    AddTemporaryKey(KeyslotError),
    #[error("cannot remove key from slot {slot}: {source}")]
    KillSlot { slot: KeySlot, source: KeyslotError },
    #[error("cannot set priority of slot {slot}: {source}")]
    SetPriority { slot: KeySlot, source: KeyslotError },
    #[error("cannot verify new key against the temporary slot: {0}")]
    VerifyTemporary(KeyslotError),
    #[error("cannot add key to user keyring: {0}")]
    StoreKey(KeyringError),
}

impl KeyMgrError {
    /// Whether adding a key failed because the target slot is in use.
    pub fn is_keyslot_already_used(&self) -> bool {
        matches!(self, KeyMgrError::AddKey(e) if e.is_slot_occupied())
    }
}

pub type Result<T, E = KeyMgrError> = core::result::Result<T, E>;

pub struct KeyManager<S: KeyslotOps, K: Keyring> {
    slots: S,
    keyring: K,
    meminfo: PathBuf,
    keyring_prefix: String,
}

impl<S: KeyslotOps, K: Keyring> KeyManager<S, K> {
    pub fn new(slots: S, keyring: K) -> Self {
        Self {
            slots,
            keyring,
            meminfo: PathBuf::from(kdf::PROC_MEMINFO),
            keyring_prefix: KEYRING_PREFIX.to_string(),
        }
    }

    pub fn with_meminfo<P: Into<PathBuf>>(mut self, meminfo: P) -> Self {
        self.meminfo = meminfo.into();
        self
    }

    pub fn with_keyring_prefix<P: Into<String>>(mut self, prefix: P) -> Self {
        self.keyring_prefix = prefix.into();
        self
    }

    pub fn slots(&self) -> &S {
        &self.slots
    }

    pub fn keyring(&self) -> &K {
        &self.keyring
    }

    fn current_unlock_key(&self, device: &str) -> Result<UnlockKey> {
        self.keyring
            .get_unlock_key(&self.keyring_prefix, device, false)
            .map_err(|source| KeyMgrError::UnlockKey {
                device: device.to_string(),
                source,
            })
    }

    fn supplied_or_current_key(&self, unlock_key: Option<&[u8]>, device: &str) -> Result<UnlockKey> {
        match unlock_key {
            Some(key) => Ok(Zeroizing::new(key.to_vec())),
            None => self.current_unlock_key(device),
        }
    }

    /// Kills `slot`, treating an already empty slot as done.
    fn kill_slot(&self, device: &str, slot: KeySlot, auth_key: &[u8]) -> Result<()> {
        match self.slots.kill_slot(device, slot, auth_key) {
            Ok(()) => Ok(()),
            Err(e) if e.is_slot_not_active() => {
                log::debug!("slot {} of {} already empty", slot, device);
                Ok(())
            }
            Err(source) => Err(KeyMgrError::KillSlot { slot, source }),
        }
    }

    fn prefer_primary(&self, device: &str) -> Result<()> {
        self.slots
            .set_slot_priority(device, KeySlot::PRIMARY, SlotPriority::Prefer)
            .map_err(|source| KeyMgrError::SetPriority {
                slot: KeySlot::PRIMARY,
                source,
            })
    }

    /// Puts `recovery_key` into the recovery slot, authorized by `unlock_key`
    /// or the key found in the kernel keyring.
    pub fn add_recovery_key(
        &self,
        recovery_key: &RecoveryKey,
        unlock_key: Option<&[u8]>,
        device: &str,
    ) -> Result<()> {
        let auth = self.supplied_or_current_key(unlock_key, device)?;
        let kdf = kdf::recovery_kdf(&self.meminfo)?;
        self.slots
            .add_key(device, &auth, recovery_key.as_bytes(), KeySlot::RECOVERY, &kdf)
            .map_err(KeyMgrError::AddKey)?;
        self.prefer_primary(device)?;
        log::info!("added recovery key to {}", device);
        Ok(())
    }

    pub fn remove_recovery_key(&self, unlock_key: Option<&[u8]>, device: &str) -> Result<()> {
        let auth = self.supplied_or_current_key(unlock_key, device)?;
        self.kill_slot(device, KeySlot::RECOVERY, &auth)?;
        log::info!("removed recovery key from {}", device);
        Ok(())
    }

    /// Stages `new_key` in the temporary slot, replacing whatever an earlier
    /// attempt left there.
    pub fn stage_key_change(&self, new_key: &[u8], device: &str) -> Result<()> {
        let new_key = EncryptionKey::try_from(new_key)?;
        let auth = self.current_unlock_key(device)?;
        self.stage(&auth, &new_key, device)?;
        log::info!("staged new volume key for {}", device);
        Ok(())
    }

    fn stage(&self, auth: &[u8], new_key: &EncryptionKey, device: &str) -> Result<()> {
        self.kill_slot(device, KeySlot::TEMPORARY, auth)?;
        self.slots
            .add_key(
                device,
                auth,
                new_key.as_bytes(),
                KeySlot::TEMPORARY,
                &KdfOptions::temporary_key(),
            )
            .map_err(KeyMgrError::AddTemporaryKey)
    }

    fn swap(&self, new_key: &EncryptionKey, device: &str) -> Result<()> {
        let key = new_key.as_bytes();
        self.kill_slot(device, KeySlot::PRIMARY, key)?;
        self.slots
            .add_key(
                device,
                key,
                key,
                KeySlot::PRIMARY,
                &KdfOptions::temporary_key(),
            )
            .map_err(KeyMgrError::AddKey)?;
        self.kill_slot(device, KeySlot::TEMPORARY, key)?;
        self.prefer_primary(device)
    }

    /// Moves a staged `new_key` into the primary slot.
    ///
    /// Adding the new key to the temporary slot, authorized by itself, tells
    /// the states apart: it only succeeds when the temporary slot is already
    /// empty and the key unlocks the primary slot, i.e. an earlier run got as
    /// far as removing the temporary key.
    pub fn transition_key_change(&self, new_key: &[u8], device: &str) -> Result<()> {
        let new_key = EncryptionKey::try_from(new_key)?;
        let key = new_key.as_bytes();
        match self.slots.add_key(
            device,
            key,
            key,
            KeySlot::TEMPORARY,
            &KdfOptions::temporary_key(),
        ) {
            Ok(()) => {
                log::info!("volume key of {} already transitioned", device);
                self.kill_slot(device, KeySlot::TEMPORARY, key)
            }
            Err(e) if e.is_slot_occupied() => {
                self.swap(&new_key, device)?;
                log::info!("transitioned {} to new volume key", device);
                Ok(())
            }
            Err(e) => Err(KeyMgrError::VerifyTemporary(e)),
        }
    }

    /// Replaces the volume key in one go and records the new key in the
    /// kernel keyring.
    pub fn change_volume_key_atomic(&self, new_key: &[u8], device: &str) -> Result<()> {
        let new_key = EncryptionKey::try_from(new_key)?;
        let auth = self.current_unlock_key(device)?;
        self.stage(&auth, &new_key, device)?;
        self.swap(&new_key, device)?;
        self.keyring
            .store_key(new_key.as_bytes(), device, UNLOCK_PURPOSE, &self.keyring_prefix)
            .map_err(KeyMgrError::StoreKey)?;
        log::info!("changed volume key of {}", device);
        Ok(())
    }
}
