//! TPM sealing of volume keys.
//!
//! The device is reached through [`TpmConnector`]. Every connection a caller
//! opens is wrapped in a [`TpmGuard`] so it is closed on every exit path. The
//! hardware backend lives in [`esapi`] behind the `tpm2` feature; without it
//! [`Unavailable`] reports that no device exists.

use crate::keys::UnlockKey;
use ambassador::{delegatable_trait, Delegate};
use thiserror::Error;

pub mod measure;
pub mod params;
pub mod pcr;
pub mod pe;
pub mod profile;
pub mod sealed_key;
pub mod sealing;
pub mod unlock;

#[cfg(feature = "tpm2")]
pub mod esapi;

pub use params::{DeviceModel, ModelSealParameters, ResealKeysParams, SealKeyRequest, SealKeysParams};
pub use sealed_key::{FileKeyStore, KeyCreationParams, SealedKeyObject, SealedKeyStore};

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("no TPM2 device is available")]
    NoDevice,
    #[error("NV index {0:#010x} is already defined")]
    HandleInUse(u32),
    #[error("NV index {0:#010x} is not defined")]
    HandleNotDefined(u32),
    #[error("the PCR policy of the sealed key is not satisfied")]
    PolicyMismatch,
    #[error("authorization failed")]
    AuthFail,
    #[error("invalid key data: {0}")]
    InvalidKeyData(String),
    #[error("connection closed")]
    Closed,
    #[cfg(feature = "tpm2")]
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

/// Resource-managed kernel TPM device.
pub const DEFAULT_TCTI: &str = "device:/dev/tpmrm0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionMode {
    /// Take ownership and set a fresh lockout authorization value.
    Full,
    /// Reprovision a TPM whose lockout authorization is already known.
    Partial,
}

#[delegatable_trait]
pub trait TpmConnection {
    /// Whether the storage and endorsement hierarchies are enabled.
    fn is_enabled(&mut self) -> Result<bool>;

    fn lockout_auth_set(&mut self) -> Result<bool>;

    fn provision(&mut self, mode: ProvisionMode, lockout_auth: &[u8]) -> Result<()>;

    /// Seals every key under the policy in `params`, defining the policy NV
    /// index. Fails with [`TpmError::HandleInUse`] if the index exists.
    fn seal_keys(&mut self, keys: &[&[u8]], params: &KeyCreationParams) -> Result<Vec<SealedKeyObject>>;

    /// Policy digest the NV index at `handle` currently approves.
    fn approved_policy_digest(&mut self, handle: u32) -> Result<pcr::Digest>;

    /// Makes the current policy of `primary` the only one the TPM accepts.
    fn revoke_old_policies(&mut self, primary: &SealedKeyObject, auth_key: &[u8]) -> Result<()>;

    fn unseal_key(&mut self, object: &SealedKeyObject) -> Result<UnlockKey>;

    /// Extends `pcrs` with random values so no sealed key can be released
    /// until the next boot.
    fn block_pcr_protection_policies(&mut self, pcrs: &[pcr::PcrIndex]) -> Result<()>;

    fn nv_undefine(&mut self, handle: u32) -> Result<()>;

    /// Releases the connection. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

pub trait TpmConnector {
    type Connection: TpmConnection;

    fn connect(&self) -> Result<Self::Connection>;

    fn connect_guarded(&self) -> Result<TpmGuard<Self::Connection>> {
        self.connect().map(TpmGuard::new)
    }
}

/// Connection closed when dropped.
#[derive(Delegate)]
#[delegate(TpmConnection, target = "tpm", where = "C: TpmConnection")]
pub struct TpmGuard<C: TpmConnection> {
    tpm: C,
}

impl<C: TpmConnection> TpmGuard<C> {
    pub fn new(tpm: C) -> Self {
        Self { tpm }
    }
}

impl<C: TpmConnection> Drop for TpmGuard<C> {
    fn drop(&mut self) {
        if let Err(e) = self.tpm.close() {
            log::warn!("cannot close TPM connection: {}", e);
        }
    }
}

/// Connector for builds without a TPM backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unavailable;

/// Connection that can never be established.
pub enum NoConnection {}

impl TpmConnection for NoConnection {
    fn is_enabled(&mut self) -> Result<bool> {
        match *self {}
    }

    fn lockout_auth_set(&mut self) -> Result<bool> {
        match *self {}
    }

    fn provision(&mut self, _mode: ProvisionMode, _lockout_auth: &[u8]) -> Result<()> {
        match *self {}
    }

    fn seal_keys(&mut self, _keys: &[&[u8]], _params: &KeyCreationParams) -> Result<Vec<SealedKeyObject>> {
        match *self {}
    }

    fn approved_policy_digest(&mut self, _handle: u32) -> Result<pcr::Digest> {
        match *self {}
    }

    fn revoke_old_policies(&mut self, _primary: &SealedKeyObject, _auth_key: &[u8]) -> Result<()> {
        match *self {}
    }

    fn unseal_key(&mut self, _object: &SealedKeyObject) -> Result<UnlockKey> {
        match *self {}
    }

    fn block_pcr_protection_policies(&mut self, _pcrs: &[pcr::PcrIndex]) -> Result<()> {
        match *self {}
    }

    fn nv_undefine(&mut self, _handle: u32) -> Result<()> {
        match *self {}
    }

    fn close(&mut self) -> Result<()> {
        match *self {}
    }
}

impl TpmConnector for Unavailable {
    type Connection = NoConnection;

    fn connect(&self) -> Result<NoConnection> {
        Err(TpmError::NoDevice)
    }
}
