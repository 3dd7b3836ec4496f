//! Sealed key objects and the files they live in.

use super::pcr::Digest;
use super::profile::PcrPolicy;
use crate::keys::AuthKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

pub const SEALED_KEY_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid sealed key data: {0}")]
    Format(#[from] serde_yaml::Error),
    #[error("unsupported sealed key version {0}")]
    Version(u32),
}

pub type Result<T, E = StoreError> = core::result::Result<T, E>;

mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(de::Error::custom)
    }
}

/// Key sealed by the TPM together with the PCR policies that may release it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKeyObject {
    pub version: u32,
    pub pcr_policy_counter_handle: u32,
    /// Bumped on every policy update.
    pub policy_sequence: u64,
    #[serde(with = "hex_bytes")]
    pub public: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub private: Vec<u8>,
    pub pcr_policy: PcrPolicy,
    /// The policy the TPM approved when `pcr_policy` was written. Unsealing
    /// keeps working with it until the TPM has been told to revoke it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_pcr_policy: Option<PcrPolicy>,
}

impl SealedKeyObject {
    /// Replaces the current policy. Of the policies held so far, the one
    /// matching `approved`, the digest the TPM currently accepts, is kept as
    /// the previous policy.
    pub fn update_pcr_policy(&mut self, policy: PcrPolicy, approved: &Digest) {
        let previous = self
            .policies()
            .find(|p| p.approved_digest() == *approved)
            .cloned();
        if previous.is_none() {
            log::warn!("no PCR policy of the sealed key matches the approved policy digest");
        }
        self.previous_pcr_policy = previous;
        self.pcr_policy = policy;
        self.policy_sequence += 1;
    }

    /// Current policy first, then the one it replaced.
    pub fn policies(&self) -> impl Iterator<Item = &PcrPolicy> {
        std::iter::once(&self.pcr_policy).chain(self.previous_pcr_policy.as_ref())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let object: Self = serde_yaml::from_str(data)?;
        if object.version != SEALED_KEY_VERSION {
            return Err(StoreError::Version(object.version));
        }
        Ok(object)
    }
}

/// Parameters for sealing a set of keys under one PCR policy.
pub struct KeyCreationParams {
    pub pcr_policy: PcrPolicy,
    pub pcr_policy_counter_handle: u32,
    /// Authorizes later policy updates.
    pub auth_key: AuthKey,
}

/// Persistence for sealed key objects and the secrets next to them.
pub trait SealedKeyStore {
    fn read_object(&self, path: &Path) -> Result<SealedKeyObject>;
    fn write_object(&self, path: &Path, object: &SealedKeyObject) -> Result<()>;
    fn read_secret(&self, path: &Path) -> Result<AuthKey>;
    fn write_secret(&self, path: &Path, secret: &[u8]) -> Result<()>;
}

/// Writes `data` to a temporary file next to `path` and renames it into place.
pub fn write_file_atomic(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(&dir)?;
    file.write_all(data)?;
    file.as_file().set_permissions(fs::Permissions::from_mode(mode))?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// [`SealedKeyStore`] on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FileKeyStore;

impl SealedKeyStore for FileKeyStore {
    fn read_object(&self, path: &Path) -> Result<SealedKeyObject> {
        SealedKeyObject::from_yaml(&fs::read_to_string(path)?)
    }

    fn write_object(&self, path: &Path, object: &SealedKeyObject) -> Result<()> {
        write_file_atomic(path, object.to_yaml()?.as_bytes(), 0o600)?;
        Ok(())
    }

    fn read_secret(&self, path: &Path) -> Result<AuthKey> {
        Ok(Zeroizing::new(fs::read(path)?))
    }

    fn write_secret(&self, path: &Path, secret: &[u8]) -> Result<()> {
        write_file_atomic(path, secret, 0o600)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::pcr::{Digest, PcrSelection};
    use eyre::Result;

    fn policy(tag: &str) -> PcrPolicy {
        PcrPolicy {
            selection: PcrSelection::new([7, 12]),
            branches: vec![Digest::hash(tag.as_bytes())],
        }
    }

    fn object() -> SealedKeyObject {
        SealedKeyObject {
            version: SEALED_KEY_VERSION,
            pcr_policy_counter_handle: 0x01880001,
            policy_sequence: 0,
            public: vec![0, 1, 2],
            private: vec![0xde, 0xad],
            pcr_policy: policy("first"),
            previous_pcr_policy: None,
        }
    }

    #[test]
    fn update_keeps_approved_policy() {
        let mut object = object();
        let first = policy("first").approved_digest();
        object.update_pcr_policy(policy("second"), &first);
        assert_eq!(object.policy_sequence, 1);
        assert_eq!(object.pcr_policy, policy("second"));
        assert_eq!(object.previous_pcr_policy, Some(policy("first")));
        assert_eq!(object.policies().count(), 2);

        // "second" was never approved, "first" must survive
        object.update_pcr_policy(policy("third"), &first);
        assert_eq!(object.pcr_policy, policy("third"));
        assert_eq!(object.previous_pcr_policy, Some(policy("first")));

        // "third" got approved
        object.update_pcr_policy(policy("fourth"), &policy("third").approved_digest());
        assert_eq!(object.previous_pcr_policy, Some(policy("third")));
        assert_eq!(object.policy_sequence, 3);

        object.update_pcr_policy(policy("fifth"), &Digest::zero());
        assert_eq!(object.previous_pcr_policy, None);
    }

    #[test]
    fn file_store_is_private_and_atomic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ubuntu-data.sealed-key");
        let store = FileKeyStore;
        store.write_object(&path, &object())?;
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        assert_eq!(store.read_object(&path)?, object());
        let yaml = fs::read_to_string(&path)?;
        assert!(yaml.contains("private: dead"));
        assert!(!yaml.contains("previous_pcr_policy"));

        let mut updated = object();
        updated.update_pcr_policy(policy("second"), &policy("first").approved_digest());
        store.write_object(&path, &updated)?;
        assert_eq!(store.read_object(&path)?, updated);
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn secrets_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tpm-policy-auth-key");
        FileKeyStore.write_secret(&path, &[7u8; 32])?;
        assert_eq!(FileKeyStore.read_secret(&path)?.as_slice(), &[7u8; 32]);
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        Ok(())
    }

    #[test]
    fn rejects_unknown_version() -> Result<()> {
        let mut object = object();
        object.version = 9;
        let yaml = object.to_yaml()?;
        assert!(matches!(
            SealedKeyObject::from_yaml(&yaml),
            Err(StoreError::Version(9))
        ));
        Ok(())
    }
}
