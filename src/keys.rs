//! Key material shared by the LUKS and TPM halves of the crate.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of the primary volume key held in keyslot 0.
pub const ENCRYPTION_KEY_SIZE: usize = 32;
/// Size of the recovery key held in keyslot 1.
pub const RECOVERY_KEY_SIZE: usize = 16;
/// Size of the authorization key for PCR policy updates.
pub const POLICY_AUTH_KEY_SIZE: usize = 32;
/// Size of the TPM lockout hierarchy authorization value.
pub const LOCKOUT_AUTH_SIZE: usize = 16;

const RECOVERY_KEY_GROUPS: usize = RECOVERY_KEY_SIZE / 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("cannot use a key of size different than {expected}")]
    InvalidKeySize { expected: usize, actual: usize },
    #[error("incorrectly formatted recovery key `{0}`")]
    InvalidRecoveryKey(String),
}

pub type Result<T, E = KeyError> = core::result::Result<T, E>;

/// Bytes that unlock a volume, as found in the kernel keyring.
pub type UnlockKey = Zeroizing<Vec<u8>>;

/// Random authorization secret, e.g. for PCR policy updates or the lockout hierarchy.
pub type AuthKey = Zeroizing<Vec<u8>>;

pub fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Primary volume key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; ENCRYPTION_KEY_SIZE]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; ENCRYPTION_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for EncryptionKey {
    type Error = KeyError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let key = <[u8; ENCRYPTION_KEY_SIZE]>::try_from(bytes).map_err(|_| {
            KeyError::InvalidKeySize {
                expected: ENCRYPTION_KEY_SIZE,
                actual: bytes.len(),
            }
        })?;
        Ok(Self(key))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Fallback unlock credential a human can type in.
///
/// The textual form is eight dash separated groups of five decimal digits,
/// each group being a little endian `u16` taken from two key bytes.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey([u8; RECOVERY_KEY_SIZE]);

impl RecoveryKey {
    pub fn new(bytes: [u8; RECOVERY_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; RECOVERY_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            write!(f, "{:05}", u16::from_le_bytes([pair[0], pair[1]]))?;
        }
        Ok(())
    }
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryKey([REDACTED])")
    }
}

impl FromStr for RecoveryKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || KeyError::InvalidRecoveryKey(s.to_string());
        let groups: Vec<&str> = s.trim().split('-').collect();
        if groups.len() != RECOVERY_KEY_GROUPS {
            return Err(invalid());
        }
        let mut bytes = [0u8; RECOVERY_KEY_SIZE];
        for (i, group) in groups.iter().enumerate() {
            if group.len() != 5 || !group.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let value: u16 = group.parse().map_err(|_| invalid())?;
            bytes[i * 2..i * 2 + 2].copy_from_slice(&value.to_le_bytes());
        }
        Ok(Self(bytes))
    }
}
