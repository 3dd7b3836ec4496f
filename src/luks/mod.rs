//! LUKS2 keyslot and activation primitives.
//!
//! The protocol logic in [`crate::keymgr`] only sees the [`KeyslotOps`] trait and
//! the closed [`KeyslotError`] set, so it never inspects tool output itself.

use crate::kdf::KdfOptions;
use std::fmt;
use std::io;
use std::str::FromStr;
use thiserror::Error;

pub mod cryptsetup;

pub use cryptsetup::Cryptsetup;

/// Index of a LUKS2 keyslot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeySlot(pub u32);

impl KeySlot {
    /// Holds the current volume key.
    pub const PRIMARY: KeySlot = KeySlot(0);
    /// Holds the human readable recovery key.
    pub const RECOVERY: KeySlot = KeySlot(1);
    /// Scratch slot used while the volume key is being rotated.
    pub const TEMPORARY: KeySlot = KeySlot(2);
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPriority {
    Ignore,
    Normal,
    Prefer,
}

impl SlotPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotPriority::Ignore => "ignore",
            SlotPriority::Normal => "normal",
            SlotPriority::Prefer => "prefer",
        }
    }
}

impl fmt::Display for SlotPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(SlotPriority::Ignore),
            "normal" => Ok(SlotPriority::Normal),
            "prefer" => Ok(SlotPriority::Prefer),
            _ => Err(format!("invalid slot priority `{}`", s)),
        }
    }
}

#[derive(Error, Debug)]
pub enum KeyslotError {
    #[error("cryptsetup failed with: {message}")]
    Occupied { slot: KeySlot, message: String },
    #[error("cryptsetup failed with: {message}")]
    NotActive { slot: KeySlot, message: String },
    #[error("cryptsetup failed with: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl KeyslotError {
    pub fn is_slot_occupied(&self) -> bool {
        matches!(self, KeyslotError::Occupied { .. })
    }

    pub fn is_slot_not_active(&self) -> bool {
        matches!(self, KeyslotError::NotActive { .. })
    }
}

pub type Result<T, E = KeyslotError> = core::result::Result<T, E>;

/// Keyslot manipulation on a LUKS2 device.
pub trait KeyslotOps {
    /// Adds `new_key` to `slot`, authorized by `auth_key` which must already
    /// unlock some slot of `device`.
    fn add_key(
        &self,
        device: &str,
        auth_key: &[u8],
        new_key: &[u8],
        slot: KeySlot,
        kdf: &KdfOptions,
    ) -> Result<()>;

    fn kill_slot(&self, device: &str, slot: KeySlot, auth_key: &[u8]) -> Result<()>;

    fn set_slot_priority(&self, device: &str, slot: KeySlot, priority: SlotPriority) -> Result<()>;
}

#[derive(Error, Debug)]
pub enum ActivateError {
    #[error("cannot activate {device}: {message}")]
    Failed { device: String, message: String },
    #[error("cannot activate {device} with recovery key after {attempts} attempts")]
    RecoveryKeyExhausted { device: String, attempts: u32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Creates device mapper volumes for LUKS2 devices.
pub trait VolumeActivator {
    fn activate_with_key(&self, name: &str, device: &str, key: &[u8]) -> Result<(), ActivateError>;

    /// Prompts for the recovery key and activates the volume with it.
    fn activate_with_recovery_key(
        &self,
        name: &str,
        device: &str,
        tries: u32,
    ) -> Result<(), ActivateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_priority_parse() {
        assert_eq!("prefer".parse::<SlotPriority>(), Ok(SlotPriority::Prefer));
        assert_eq!(SlotPriority::Ignore.to_string(), "ignore");
        assert!("always".parse::<SlotPriority>().is_err());
    }

    #[test]
    fn keyslot_error_predicates() {
        let occupied = KeyslotError::Occupied {
            slot: KeySlot::RECOVERY,
            message: "Key slot 1 is full, please select another one.".to_string(),
        };
        assert!(occupied.is_slot_occupied());
        assert!(!occupied.is_slot_not_active());
        assert_eq!(
            occupied.to_string(),
            "cryptsetup failed with: Key slot 1 is full, please select another one."
        );
        let failed = KeyslotError::Failed("boom".to_string());
        assert!(!failed.is_slot_occupied());
        assert!(!failed.is_slot_not_active());
    }
}
