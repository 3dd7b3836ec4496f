//! In-memory doubles for the adapter traits, shared by the unit tests.

use crate::boot::{self, BootError, ContainerReader};
use crate::efi::{EfiError, EfiVars};
use crate::kdf::KdfOptions;
use crate::keyring::{key_description, Keyring, KeyringError, UNLOCK_PURPOSE};
use crate::keys::{AuthKey, UnlockKey};
use crate::luks::{ActivateError, KeySlot, KeyslotError, KeyslotOps, SlotPriority, VolumeActivator};
use crate::tpm::pcr::{Digest, PcrIndex, PcrValues};
use crate::tpm::profile::policy_or_digest;
use crate::tpm::sealed_key::{self, SealedKeyStore, SEALED_KEY_VERSION};
use crate::tpm::{
    KeyCreationParams, ProvisionMode, SealedKeyObject, TpmConnection, TpmConnector, TpmError,
};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use uuid::Uuid;
use tempfile::TempDir;
use zeroize::Zeroizing;

/// Shell script standing in for an external binary, logging its arguments.
pub struct MockCommand {
    dir: TempDir,
    name: String,
}

impl MockCommand {
    pub fn new(name: &str, body: &str) -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join(format!("{}.calls", name));
        let script = format!(
            "#!/bin/sh\nMOCK_DIR='{dir}'\nprintf '%s' '{name}' >> '{log}'\nfor arg in \"$@\"; do printf ' %s' \"$arg\" >> '{log}'; done\nprintf '\\n' >> '{log}'\n{body}",
            dir = dir.path().display(),
            name = name,
            log = log.display(),
            body = body,
        );
        let path = dir.path().join(name);
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(Self {
            dir,
            name: name.to_string(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join(&self.name)
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Every invocation so far, split on whitespace.
    pub fn calls(&self) -> io::Result<Vec<Vec<String>>> {
        let log = self.dir.path().join(format!("{}.calls", self.name));
        let content = match fs::read_to_string(log) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(content
            .lines()
            .map(|line| line.split_whitespace().map(str::to_string).collect())
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotCall {
    Add { slot: u32, kdf: KdfOptions },
    Kill { slot: u32 },
    Priority { slot: u32, priority: SlotPriority },
}

/// LUKS2 header model: keys per slot, unlocking requires a matching key.
#[derive(Default)]
pub struct FakeLuks {
    pub slots: RefCell<BTreeMap<u32, Vec<u8>>>,
    pub priorities: RefCell<BTreeMap<u32, SlotPriority>>,
    pub calls: RefCell<Vec<SlotCall>>,
    /// Operations beyond this count fail as if the machine went down.
    pub crash_after: Cell<Option<usize>>,
    pub fail_add: RefCell<Option<(u32, String)>>,
}

impl FakeLuks {
    pub fn with_keys(keys: &[(u32, &[u8])]) -> Self {
        let luks = Self::default();
        for (slot, key) in keys {
            luks.slots.borrow_mut().insert(*slot, key.to_vec());
        }
        luks
    }

    pub fn unlocks(&self, key: &[u8]) -> bool {
        self.slots.borrow().values().any(|k| k == key)
    }

    pub fn key(&self, slot: u32) -> Option<Vec<u8>> {
        self.slots.borrow().get(&slot).cloned()
    }

    fn enter(&self, call: SlotCall) -> Result<(), KeyslotError> {
        if let Some(limit) = self.crash_after.get() {
            if self.calls.borrow().len() >= limit {
                return Err(KeyslotError::Failed("simulated crash".to_string()));
            }
        }
        self.calls.borrow_mut().push(call);
        Ok(())
    }

    fn authorize(&self, key: &[u8]) -> Result<(), KeyslotError> {
        if self.unlocks(key) {
            Ok(())
        } else {
            Err(KeyslotError::Failed(
                "No key available with this passphrase.".to_string(),
            ))
        }
    }
}

impl KeyslotOps for FakeLuks {
    fn add_key(
        &self,
        _device: &str,
        auth_key: &[u8],
        new_key: &[u8],
        slot: KeySlot,
        kdf: &KdfOptions,
    ) -> Result<(), KeyslotError> {
        self.enter(SlotCall::Add { slot: slot.0, kdf: *kdf })?;
        if let Some((failing, message)) = self.fail_add.borrow().as_ref() {
            if *failing == slot.0 {
                return Err(KeyslotError::Failed(message.clone()));
            }
        }
        self.authorize(auth_key)?;
        if self.slots.borrow().contains_key(&slot.0) {
            return Err(KeyslotError::Occupied {
                slot,
                message: format!("Key slot {} is full, please select another one.", slot),
            });
        }
        self.slots.borrow_mut().insert(slot.0, new_key.to_vec());
        Ok(())
    }

    fn kill_slot(&self, _device: &str, slot: KeySlot, auth_key: &[u8]) -> Result<(), KeyslotError> {
        self.enter(SlotCall::Kill { slot: slot.0 })?;
        if !self.slots.borrow().contains_key(&slot.0) {
            return Err(KeyslotError::NotActive {
                slot,
                message: format!("Keyslot {} is not active.", slot),
            });
        }
        self.authorize(auth_key)?;
        self.slots.borrow_mut().remove(&slot.0);
        Ok(())
    }

    fn set_slot_priority(
        &self,
        _device: &str,
        slot: KeySlot,
        priority: SlotPriority,
    ) -> Result<(), KeyslotError> {
        self.enter(SlotCall::Priority {
            slot: slot.0,
            priority,
        })?;
        self.priorities.borrow_mut().insert(slot.0, priority);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeKeyring {
    pub keys: RefCell<BTreeMap<String, Vec<u8>>>,
    pub gets: RefCell<Vec<(String, String, bool)>>,
    pub stores: Cell<usize>,
    pub fail_store: RefCell<Option<String>>,
}

impl FakeKeyring {
    pub fn with_unlock_key(prefix: &str, device: &str, key: &[u8]) -> Self {
        let keyring = Self::default();
        keyring.keys.borrow_mut().insert(
            key_description(prefix, device, UNLOCK_PURPOSE),
            key.to_vec(),
        );
        keyring
    }

    pub fn get(&self, prefix: &str, device: &str, purpose: &str) -> Option<Vec<u8>> {
        self.keys
            .borrow()
            .get(&key_description(prefix, device, purpose))
            .cloned()
    }
}

impl Keyring for FakeKeyring {
    fn get_unlock_key(&self, prefix: &str, device: &str, remove: bool) -> Result<UnlockKey, KeyringError> {
        self.gets
            .borrow_mut()
            .push((prefix.to_string(), device.to_string(), remove));
        let description = key_description(prefix, device, UNLOCK_PURPOSE);
        let key = if remove {
            self.keys.borrow_mut().remove(&description)
        } else {
            self.keys.borrow().get(&description).cloned()
        };
        key.map(Zeroizing::new)
            .ok_or(KeyringError::NotFound { description })
    }

    fn store_key(&self, key: &[u8], device: &str, purpose: &str, prefix: &str) -> Result<(), KeyringError> {
        self.stores.set(self.stores.get() + 1);
        if let Some(message) = self.fail_store.borrow().as_ref() {
            return Err(KeyringError::Command {
                operation: "padd".to_string(),
                message: message.clone(),
            });
        }
        self.keys
            .borrow_mut()
            .insert(key_description(prefix, device, purpose), key.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivateCall {
    Key { name: String, device: String, key: Vec<u8> },
    Recovery { name: String, device: String, tries: u32 },
}

#[derive(Default)]
pub struct FakeActivator {
    pub calls: RefCell<Vec<ActivateCall>>,
    pub fail_key: Cell<bool>,
    pub fail_recovery: Cell<bool>,
}

impl VolumeActivator for FakeActivator {
    fn activate_with_key(&self, name: &str, device: &str, key: &[u8]) -> Result<(), ActivateError> {
        self.calls.borrow_mut().push(ActivateCall::Key {
            name: name.to_string(),
            device: device.to_string(),
            key: key.to_vec(),
        });
        if self.fail_key.get() {
            return Err(ActivateError::Failed {
                device: device.to_string(),
                message: "No key available with this passphrase.".to_string(),
            });
        }
        Ok(())
    }

    fn activate_with_recovery_key(&self, name: &str, device: &str, tries: u32) -> Result<(), ActivateError> {
        self.calls.borrow_mut().push(ActivateCall::Recovery {
            name: name.to_string(),
            device: device.to_string(),
            tries,
        });
        if self.fail_recovery.get() {
            return Err(ActivateError::RecoveryKeyExhausted {
                device: device.to_string(),
                attempts: tries,
            });
        }
        Ok(())
    }
}

/// EFI variables keyed by name alone.
#[derive(Default)]
pub struct FakeEfiVars {
    pub vars: RefCell<BTreeMap<String, Vec<u8>>>,
    pub no_efi: Cell<bool>,
}

impl FakeEfiVars {
    pub fn with_secure_boot(enabled: bool) -> Self {
        let vars = Self::default();
        vars.set("SecureBoot", &[enabled as u8]);
        vars
    }

    pub fn set(&self, name: &str, data: &[u8]) {
        self.vars.borrow_mut().insert(name.to_string(), data.to_vec());
    }
}

impl EfiVars for FakeEfiVars {
    fn read_var(&self, name: &str, _guid: &Uuid) -> Result<Vec<u8>, EfiError> {
        if self.no_efi.get() {
            return Err(EfiError::NoEfiSystem);
        }
        self.vars
            .borrow()
            .get(name)
            .cloned()
            .ok_or(EfiError::VarNotFound)
    }
}

#[derive(Default)]
pub struct FakeContainers {
    pub files: RefCell<BTreeMap<(PathBuf, PathBuf), Vec<u8>>>,
}

impl FakeContainers {
    pub fn insert<P: AsRef<Path>>(&self, container: P, file_name: &str, data: &[u8]) {
        self.files.borrow_mut().insert(
            (container.as_ref().to_path_buf(), PathBuf::from(file_name)),
            data.to_vec(),
        );
    }
}

impl ContainerReader for FakeContainers {
    fn read_file(&self, container: &Path, file_name: &Path) -> boot::Result<Vec<u8>> {
        self.files
            .borrow()
            .get(&(container.to_path_buf(), file_name.to_path_buf()))
            .cloned()
            .ok_or_else(|| BootError::ContainerRead {
                container: container.to_path_buf(),
                file_name: file_name.to_path_buf(),
                message: "no such file".to_string(),
            })
    }
}

/// Sealed key objects and secrets held in memory.
#[derive(Default)]
pub struct FakeKeyStore {
    pub objects: RefCell<BTreeMap<PathBuf, SealedKeyObject>>,
    pub secrets: RefCell<BTreeMap<PathBuf, Vec<u8>>>,
    pub fail_write: RefCell<BTreeSet<PathBuf>>,
    pub writes: RefCell<Vec<PathBuf>>,
}

impl FakeKeyStore {
    pub fn object<P: AsRef<Path>>(&self, path: P) -> Option<SealedKeyObject> {
        self.objects.borrow().get(path.as_ref()).cloned()
    }

    pub fn secret<P: AsRef<Path>>(&self, path: P) -> Option<Vec<u8>> {
        self.secrets.borrow().get(path.as_ref()).cloned()
    }

    pub fn writes(&self) -> Vec<PathBuf> {
        self.writes.borrow().clone()
    }

    pub fn fail_writes_to<P: AsRef<Path>>(&self, path: P) {
        self.fail_write.borrow_mut().insert(path.as_ref().to_path_buf());
    }

    fn record_write(&self, path: &Path) -> sealed_key::Result<()> {
        if self.fail_write.borrow().contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only file system").into());
        }
        self.writes.borrow_mut().push(path.to_path_buf());
        Ok(())
    }
}

fn not_found(path: &Path) -> sealed_key::StoreError {
    io::Error::new(io::ErrorKind::NotFound, format!("{}: no such file", path.display())).into()
}

impl SealedKeyStore for FakeKeyStore {
    fn read_object(&self, path: &Path) -> sealed_key::Result<SealedKeyObject> {
        self.object(path).ok_or_else(|| not_found(path))
    }

    fn write_object(&self, path: &Path, object: &SealedKeyObject) -> sealed_key::Result<()> {
        self.record_write(path)?;
        self.objects
            .borrow_mut()
            .insert(path.to_path_buf(), object.clone());
        Ok(())
    }

    fn read_secret(&self, path: &Path) -> sealed_key::Result<AuthKey> {
        self.secret(path)
            .map(Zeroizing::new)
            .ok_or_else(|| not_found(path))
    }

    fn write_secret(&self, path: &Path, secret: &[u8]) -> sealed_key::Result<()> {
        self.record_write(path)?;
        self.secrets
            .borrow_mut()
            .insert(path.to_path_buf(), secret.to_vec());
        Ok(())
    }
}

/// TPM model: NV indices hold the approved policy digest and its auth value,
/// sealed objects release their secret when the PCRs satisfy that policy.
#[derive(Debug)]
pub struct FakeTpmState {
    pub present: bool,
    pub enabled: bool,
    pub lockout_auth_set: bool,
    pub lockout_auth: Vec<u8>,
    pub provisions: Vec<ProvisionMode>,
    pub nv: BTreeMap<u32, (Digest, Vec<u8>)>,
    pub objects: BTreeMap<Vec<u8>, Vec<u8>>,
    pub pcrs: PcrValues,
    pub connects: usize,
    pub closes: usize,
    pub revocations: usize,
    pub blocked: Vec<PcrIndex>,
    pub undefined: Vec<u32>,
    pub fail_nv_undefine: BTreeSet<u32>,
    pub fail_provision: bool,
    pub fail_block: bool,
}

impl Default for FakeTpmState {
    fn default() -> Self {
        Self {
            present: true,
            enabled: true,
            lockout_auth_set: false,
            lockout_auth: Vec::new(),
            provisions: Vec::new(),
            nv: BTreeMap::new(),
            objects: BTreeMap::new(),
            pcrs: PcrValues::new(),
            connects: 0,
            closes: 0,
            revocations: 0,
            blocked: Vec::new(),
            undefined: Vec::new(),
            fail_nv_undefine: BTreeSet::new(),
            fail_provision: false,
            fail_block: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeTpm {
    state: Rc<RefCell<FakeTpmState>>,
}

impl FakeTpm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absent() -> Self {
        let tpm = Self::default();
        tpm.state_mut().present = false;
        tpm
    }

    pub fn state(&self) -> Ref<'_, FakeTpmState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, FakeTpmState> {
        self.state.borrow_mut()
    }
}

impl TpmConnector for FakeTpm {
    type Connection = FakeTpmConnection;

    fn connect(&self) -> Result<FakeTpmConnection, TpmError> {
        let mut state = self.state.borrow_mut();
        if !state.present {
            return Err(TpmError::NoDevice);
        }
        state.connects += 1;
        Ok(FakeTpmConnection {
            state: Rc::clone(&self.state),
            closed: false,
        })
    }
}

pub struct FakeTpmConnection {
    state: Rc<RefCell<FakeTpmState>>,
    closed: bool,
}

impl FakeTpmConnection {
    fn state(&self) -> Result<RefMut<'_, FakeTpmState>, TpmError> {
        if self.closed {
            return Err(TpmError::Closed);
        }
        Ok(self.state.borrow_mut())
    }
}

impl TpmConnection for FakeTpmConnection {
    fn is_enabled(&mut self) -> Result<bool, TpmError> {
        Ok(self.state()?.enabled)
    }

    fn lockout_auth_set(&mut self) -> Result<bool, TpmError> {
        Ok(self.state()?.lockout_auth_set)
    }

    fn provision(&mut self, mode: ProvisionMode, lockout_auth: &[u8]) -> Result<(), TpmError> {
        let mut state = self.state()?;
        if state.fail_provision {
            return Err(TpmError::AuthFail);
        }
        if mode == ProvisionMode::Partial && state.lockout_auth_set && state.lockout_auth != lockout_auth {
            return Err(TpmError::AuthFail);
        }
        state.lockout_auth = lockout_auth.to_vec();
        state.lockout_auth_set = true;
        state.provisions.push(mode);
        Ok(())
    }

    fn seal_keys(&mut self, keys: &[&[u8]], params: &KeyCreationParams) -> Result<Vec<SealedKeyObject>, TpmError> {
        let mut state = self.state()?;
        let handle = params.pcr_policy_counter_handle;
        if state.nv.contains_key(&handle) {
            return Err(TpmError::HandleInUse(handle));
        }
        state.nv.insert(
            handle,
            (params.pcr_policy.approved_digest(), params.auth_key.to_vec()),
        );
        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let public = format!("public-{}", state.objects.len()).into_bytes();
            state.objects.insert(public.clone(), key.to_vec());
            objects.push(SealedKeyObject {
                version: SEALED_KEY_VERSION,
                pcr_policy_counter_handle: handle,
                policy_sequence: 0,
                public,
                private: b"private".to_vec(),
                pcr_policy: params.pcr_policy.clone(),
                previous_pcr_policy: None,
            });
        }
        Ok(objects)
    }

    fn approved_policy_digest(&mut self, handle: u32) -> Result<Digest, TpmError> {
        let state = self.state()?;
        state
            .nv
            .get(&handle)
            .map(|(approved, _)| *approved)
            .ok_or(TpmError::HandleNotDefined(handle))
    }

    fn revoke_old_policies(&mut self, primary: &SealedKeyObject, auth_key: &[u8]) -> Result<(), TpmError> {
        let mut state = self.state()?;
        let handle = primary.pcr_policy_counter_handle;
        let entry = state
            .nv
            .get_mut(&handle)
            .ok_or(TpmError::HandleNotDefined(handle))?;
        if entry.1 != auth_key {
            return Err(TpmError::AuthFail);
        }
        entry.0 = primary.pcr_policy.approved_digest();
        state.revocations += 1;
        Ok(())
    }

    fn unseal_key(&mut self, object: &SealedKeyObject) -> Result<UnlockKey, TpmError> {
        let state = self.state()?;
        let handle = object.pcr_policy_counter_handle;
        let (approved, _) = state
            .nv
            .get(&handle)
            .ok_or(TpmError::HandleNotDefined(handle))?;
        // A session runs PolicyPCR then the PolicyOR path of the matching
        // branch, and must end on the digest the NV index approves.
        let satisfied = object.policies().any(|policy| {
            policy.branch_index(&state.pcrs).map_or(false, |branch| {
                let session = policy
                    .or_path(branch)
                    .iter()
                    .fold(policy.branches[branch], |_, operands| policy_or_digest(operands));
                session == *approved
            })
        });
        if !satisfied {
            return Err(TpmError::PolicyMismatch);
        }
        state
            .objects
            .get(&object.public)
            .map(|secret| Zeroizing::new(secret.clone()))
            .ok_or_else(|| TpmError::InvalidKeyData("unknown object".to_string()))
    }

    fn block_pcr_protection_policies(&mut self, pcrs: &[PcrIndex]) -> Result<(), TpmError> {
        let mut state = self.state()?;
        if state.fail_block {
            return Err(TpmError::AuthFail);
        }
        for pcr in pcrs {
            let value = state.pcrs.get(pcr).copied().unwrap_or_default();
            state.pcrs.insert(*pcr, value.extend(&Digest::hash(b"fence")));
            state.blocked.push(*pcr);
        }
        Ok(())
    }

    fn nv_undefine(&mut self, handle: u32) -> Result<(), TpmError> {
        let mut state = self.state()?;
        if state.fail_nv_undefine.contains(&handle) {
            return Err(TpmError::AuthFail);
        }
        if state.nv.remove(&handle).is_none() {
            return Err(TpmError::HandleNotDefined(handle));
        }
        state.undefined.push(handle);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TpmError> {
        if !self.closed {
            self.closed = true;
            self.state.borrow_mut().closes += 1;
        }
        Ok(())
    }
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    match content.len() {
        len if len < 0x80 => out.push(len as u8),
        len if len <= 0xff => out.extend_from_slice(&[0x81, len as u8]),
        len => out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]),
    }
    out.extend_from_slice(content);
    out
}

fn der_seq(elements: &[&[u8]]) -> Vec<u8> {
    der(0x30, &elements.concat())
}

/// X.501 Name holding a single common name.
pub fn test_name(common_name: &str) -> Vec<u8> {
    let attribute = der_seq(&[&der(0x06, &[0x55, 0x04, 0x03]), &der(0x0c, common_name.as_bytes())]);
    der_seq(&[&der(0x31, &attribute)])
}

/// Structurally valid X.509 certificate with a dummy key and signature.
pub fn test_cert(issuer: &str, subject: &str) -> Vec<u8> {
    let algorithm = der_seq(&[&der(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b])]);
    let validity = der_seq(&[&der(0x17, b"200101000000Z"), &der(0x17, b"400101000000Z")]);
    let tbs = der_seq(&[
        &der(0xa0, &der(0x02, &[2])),
        &der(0x02, &[0x01, 0x23]),
        &algorithm,
        &test_name(issuer),
        &validity,
        &test_name(subject),
        &der_seq(&[&algorithm, &der(0x03, &[0, 0x42])]),
    ]);
    der_seq(&[&tbs, &algorithm, &der(0x03, &[0, 0x5a])])
}

/// One EFI_SIGNATURE_LIST of X.509 certificates per entry in `certs`.
pub fn signature_list(owner: &Uuid, certs: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for cert in certs {
        let signature_size = 16 + cert.len();
        out.extend_from_slice(&crate::efi::CERT_X509_GUID.to_bytes_le());
        out.extend_from_slice(&((28 + signature_size) as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(signature_size as u32).to_le_bytes());
        out.extend_from_slice(&owner.to_bytes_le());
        out.extend_from_slice(cert);
    }
    out
}

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], offset: usize, value: usize) {
    data[offset..offset + 4].copy_from_slice(&(value as u32).to_le_bytes());
}

/// Minimal PE32+ EFI image: a `.text` section, optionally shim's vendor
/// certificate section and Authenticode signatures embedding their
/// authority's certificate.
pub struct PeBuilder {
    text: Vec<u8>,
    authorities: Vec<Vec<u8>>,
    vendor_cert: Option<Vec<u8>>,
}

impl PeBuilder {
    pub fn new(text: &[u8]) -> Self {
        Self {
            text: text.to_vec(),
            authorities: Vec::new(),
            vendor_cert: None,
        }
    }

    pub fn signed_by(mut self, authority: &[u8]) -> Self {
        self.authorities.push(authority.to_vec());
        self
    }

    pub fn vendor_cert(mut self, cert: &[u8]) -> Self {
        self.vendor_cert = Some(cert.to_vec());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        const HEADERS: usize = 0x200;
        const OPTIONAL: usize = 0x58;
        const SECTION_TABLE: usize = OPTIONAL + 240;

        let mut sections: Vec<(&[u8], Vec<u8>)> = vec![(&b".text"[..], self.text.clone())];
        if let Some(cert) = &self.vendor_cert {
            let mut section = Vec::new();
            for field in [cert.len(), 0, 16, 16 + cert.len()] {
                section.extend_from_slice(&(field as u32).to_le_bytes());
            }
            section.extend_from_slice(cert);
            sections.push((&b"/4"[..], section));
        }

        let mut data = vec![0u8; HEADERS];
        data[..2].copy_from_slice(b"MZ");
        put_u32(&mut data, 0x3c, 0x40);
        data[0x40..0x44].copy_from_slice(b"PE\0\0");
        put_u16(&mut data, 0x44, 0x8664);
        put_u16(&mut data, 0x46, sections.len() as u16);
        put_u16(&mut data, 0x54, 240);
        put_u16(&mut data, OPTIONAL, 0x20b);
        put_u32(&mut data, OPTIONAL + 60, HEADERS);
        put_u32(&mut data, OPTIONAL + 64, 0x1234);
        put_u32(&mut data, OPTIONAL + 108, 16);

        for (i, (name, content)) in sections.iter().enumerate() {
            let header = SECTION_TABLE + i * 40;
            data[header..header + name.len()].copy_from_slice(name);
            put_u32(&mut data, header + 16, content.len());
            let offset = data.len();
            put_u32(&mut data, header + 20, offset);
            data.extend_from_slice(content);
        }
        if self.vendor_cert.is_some() {
            let offset = data.len();
            put_u32(&mut data, 0x4c, offset);
            let names = b".vendor_cert\0";
            data.extend_from_slice(&((4 + names.len()) as u32).to_le_bytes());
            data.extend_from_slice(names);
        }

        if !self.authorities.is_empty() {
            let mut table = Vec::new();
            for authority in &self.authorities {
                let blob = der_seq(&[
                    &der(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02]),
                    &der(0xa0, authority),
                ]);
                table.extend_from_slice(&((8 + blob.len()) as u32).to_le_bytes());
                table.extend_from_slice(&0x0200u16.to_le_bytes());
                table.extend_from_slice(&0x0002u16.to_le_bytes());
                table.extend_from_slice(&blob);
                table.resize((table.len() + 7) & !7, 0);
            }
            let offset = data.len();
            put_u32(&mut data, OPTIONAL + 112 + 32, offset);
            put_u32(&mut data, OPTIONAL + 112 + 36, table.len());
            data.extend_from_slice(&table);
        }
        data
    }
}

/// Owner of the test signature database entries.
pub const TEST_OWNER: Uuid = uuid::uuid!("77fa9abd-0359-4d32-bd60-28f4e78f784b");

/// CA in the test `db`.
pub fn test_db_cert() -> Vec<u8> {
    test_cert("Test Root", "Test UEFI CA")
}

/// Certificate compiled into the test shim.
pub fn test_vendor_cert() -> Vec<u8> {
    test_cert("Vendor CA", "Vendor CA")
}

/// Secure boot enabled, with [`test_db_cert`] in `db`.
pub fn secure_boot_vars() -> FakeEfiVars {
    let vars = FakeEfiVars::with_secure_boot(true);
    vars.set("db", &signature_list(&TEST_OWNER, &[&test_db_cert()]));
    vars
}

/// A shim signed through `db` carrying [`test_vendor_cert`].
pub fn shim_image(text: &[u8]) -> Vec<u8> {
    PeBuilder::new(text)
        .signed_by(&test_db_cert())
        .vendor_cert(&test_vendor_cert())
        .build()
}

/// An image shim verifies with its vendor certificate.
pub fn vendor_signed_image(text: &[u8]) -> Vec<u8> {
    PeBuilder::new(text).signed_by(&test_vendor_cert()).build()
}
