//! Sealing volume keys to a predicted boot chain and keeping them sealed as
//! the boot chain changes.

use super::measure::{MeasureError, ProfileMeasurements};
use super::params::{ModelSealParameters, ResealKeysParams, SealKeyRequest, SealKeysParams};
use super::profile::{PcrPolicy, PcrProtectionProfile, ProfileError};
use super::sealed_key::{KeyCreationParams, SealedKeyStore, StoreError};
use super::{ProvisionMode, TpmConnection, TpmConnector, TpmError, TpmGuard};
use crate::boot::{self, BootError};
use crate::efi::{check_secure_boot_enabled, EfiVars, SecureBootError};
use crate::keys::{random_bytes, LOCKOUT_AUTH_SIZE, POLICY_AUTH_KEY_SIZE};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SealError {
    #[error(transparent)]
    SecureBootDisabled(#[from] SecureBootError),
    #[error("cannot connect to TPM device: {0}")]
    NoTpm(TpmError),
    #[error("TPM device is not enabled")]
    TpmDisabled,
    #[error("TPM lockout authorization is already set")]
    TpmLockedOut,
    #[error("cannot connect to TPM: {0}")]
    Connect(TpmError),
    #[error(transparent)]
    Tpm(TpmError),
    #[error("at least one set of model-specific parameters is required")]
    EmptyModelSet,
    #[error("at least one sealed key file is required")]
    NoKeyFiles,
    #[error("cannot build EFI image load sequences: {0}")]
    LoadSequences(BootError),
    #[error("cannot add EFI secure boot policy profile: {0}")]
    SecureBootPolicyProfile(MeasureError),
    #[error("cannot add EFI boot manager profile: {0}")]
    BootManagerProfile(MeasureError),
    #[error("cannot add systemd EFI stub profile: {0}")]
    KernelCmdlineProfile(MeasureError),
    #[error("cannot add snap model profile: {0}")]
    ModelProfile(MeasureError),
    #[error("cannot compute PCR policy: {0}")]
    Policy(#[from] ProfileError),
    #[error("cannot write the lockout authorization file: {0}")]
    WriteLockoutAuth(StoreError),
    #[error("cannot read the lockout authorization file: {0}")]
    ReadLockoutAuth(StoreError),
    #[error("cannot provision TPM: {0}")]
    Provision(TpmError),
    #[error("cannot seal keys: {0}")]
    Seal(TpmError),
    #[error("cannot write sealed key file {}: {source}", .path.display())]
    WriteKey { path: PathBuf, source: StoreError },
    #[error("cannot read sealed key file {}: {source}", .path.display())]
    ReadKey { path: PathBuf, source: StoreError },
    #[error("cannot write the policy auth key file: {0}")]
    WritePolicyAuthKey(StoreError),
    #[error("cannot read the policy auth key file: {0}")]
    ReadPolicyAuthKey(StoreError),
    #[error("cannot read approved PCR policy: {0}")]
    ApprovedPolicy(TpmError),
    #[error("cannot revoke old PCR policies: {0}")]
    Revoke(TpmError),
    #[error("cannot release TPM resources: {}", describe_failures(.0))]
    ResourceRelease(Vec<(u32, TpmError)>),
}

fn describe_failures(failures: &[(u32, TpmError)]) -> String {
    failures
        .iter()
        .map(|(handle, e)| format!("{:#010x}: {}", handle, e))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T, E = SealError> = core::result::Result<T, E>;

pub struct SealManager<T: TpmConnector, E: EfiVars, P: ProfileMeasurements, S: SealedKeyStore> {
    tpm: T,
    efivars: E,
    measurements: P,
    store: S,
}

impl<T, E, P, S> SealManager<T, E, P, S>
where
    T: TpmConnector,
    E: EfiVars,
    P: ProfileMeasurements,
    S: SealedKeyStore,
{
    pub fn new(tpm: T, efivars: E, measurements: P, store: S) -> Self {
        Self {
            tpm,
            efivars,
            measurements,
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Connects to an enabled TPM.
    fn connect(&self) -> Result<TpmGuard<T::Connection>> {
        let mut tpm = self.tpm.connect_guarded().map_err(SealError::Connect)?;
        if !tpm.is_enabled().map_err(SealError::Tpm)? {
            return Err(SealError::TpmDisabled);
        }
        Ok(tpm)
    }

    pub fn check_sealing_supported(&self, mode: ProvisionMode) -> Result<()> {
        log::info!("checking if secure boot is enabled...");
        if let Err(e) = check_secure_boot_enabled(&self.efivars) {
            log::info!("secure boot not enabled: {}", e);
            return Err(e.into());
        }
        log::info!("secure boot is enabled");

        log::info!("checking if TPM device is available...");
        let mut tpm = self.tpm.connect_guarded().map_err(|e| {
            log::info!("cannot connect to TPM device: {}", e);
            SealError::NoTpm(e)
        })?;
        if !tpm.is_enabled().map_err(SealError::Tpm)? {
            log::info!("TPM device detected but not enabled");
            return Err(SealError::TpmDisabled);
        }
        if mode == ProvisionMode::Full && tpm.lockout_auth_set().map_err(SealError::Tpm)? {
            log::info!("TPM lockout authorization is already set");
            return Err(SealError::TpmLockedOut);
        }
        log::info!("TPM device detected and enabled");
        Ok(())
    }

    pub fn provision(&self, mode: ProvisionMode, lockout_auth_file: &Path) -> Result<()> {
        let mut tpm = self.connect()?;
        self.provision_with(&mut tpm, mode, lockout_auth_file)
    }

    fn provision_with(
        &self,
        tpm: &mut TpmGuard<T::Connection>,
        mode: ProvisionMode,
        lockout_auth_file: &Path,
    ) -> Result<()> {
        let lockout_auth = match mode {
            ProvisionMode::Full => {
                let auth = random_bytes(LOCKOUT_AUTH_SIZE);
                self.store
                    .write_secret(lockout_auth_file, &auth)
                    .map_err(SealError::WriteLockoutAuth)?;
                auth
            }
            ProvisionMode::Partial => self
                .store
                .read_secret(lockout_auth_file)
                .map_err(SealError::ReadLockoutAuth)?,
        };
        tpm.provision(mode, &lockout_auth).map_err(|e| {
            log::warn!("TPM provisioning error: {}", e);
            SealError::Provision(e)
        })?;
        log::info!("provisioned TPM ({:?})", mode);
        Ok(())
    }

    pub fn build_pcr_protection_profile(
        &self,
        model_params: &[ModelSealParameters],
    ) -> Result<PcrProtectionProfile> {
        if model_params.is_empty() {
            return Err(SealError::EmptyModelSet);
        }
        let mut per_model = Vec::with_capacity(model_params.len());
        for params in model_params {
            let mut profile = PcrProtectionProfile::new();
            let load_sequences =
                boot::build_load_sequences(&params.load_chains).map_err(SealError::LoadSequences)?;
            self.measurements
                .add_secure_boot_policy_profile(&mut profile, &load_sequences)
                .map_err(SealError::SecureBootPolicyProfile)?;
            self.measurements
                .add_boot_manager_profile(&mut profile, &load_sequences)
                .map_err(SealError::BootManagerProfile)?;
            if !params.kernel_cmdlines.is_empty() {
                self.measurements
                    .add_kernel_cmdline_profile(&mut profile, &params.kernel_cmdlines)
                    .map_err(SealError::KernelCmdlineProfile)?;
            }
            if let Some(model) = &params.model {
                self.measurements
                    .add_model_profile(&mut profile, model)
                    .map_err(SealError::ModelProfile)?;
            }
            per_model.push(profile);
        }

        let profile = if per_model.len() > 1 {
            let mut profile = PcrProtectionProfile::new();
            profile.add_profile_or(per_model);
            profile
        } else {
            per_model.remove(0)
        };
        log::debug!("PCR protection profile:\n{}", profile);
        Ok(profile)
    }

    /// Seals `keys` to the boot chains in `params`. Fails if the PCR policy
    /// counter handle is already in use.
    pub fn seal_keys(&self, keys: &[SealKeyRequest], params: &SealKeysParams) -> Result<()> {
        if params.model_params.is_empty() {
            return Err(SealError::EmptyModelSet);
        }
        let mut tpm = self.connect()?;
        let profile = self.build_pcr_protection_profile(&params.model_params)?;
        let pcr_policy = PcrPolicy::from_profile(&profile)?;

        if params.tpm_provision {
            self.provision_with(&mut tpm, ProvisionMode::Full, &params.lockout_auth_file)?;
        }

        let creation = KeyCreationParams {
            pcr_policy,
            pcr_policy_counter_handle: params.pcr_policy_counter_handle,
            auth_key: random_bytes(POLICY_AUTH_KEY_SIZE),
        };
        let secrets: Vec<&[u8]> = keys.iter().map(|k| k.key.as_bytes()).collect();
        let objects = tpm.seal_keys(&secrets, &creation).map_err(SealError::Seal)?;
        for (request, object) in keys.iter().zip(&objects) {
            self.store
                .write_object(&request.key_file, object)
                .map_err(|source| SealError::WriteKey {
                    path: request.key_file.clone(),
                    source,
                })?;
            log::info!("sealed key written to {}", request.key_file.display());
        }
        if let Some(path) = &params.policy_auth_key_file {
            self.store
                .write_secret(path, &creation.auth_key)
                .map_err(SealError::WritePolicyAuthKey)?;
        }
        Ok(())
    }

    /// Updates the PCR policy of every sealed key, then revokes the policies
    /// they had before.
    pub fn reseal_keys(&self, params: &ResealKeysParams) -> Result<()> {
        if params.model_params.is_empty() {
            return Err(SealError::EmptyModelSet);
        }
        let mut tpm = self.connect()?;
        let profile = self.build_pcr_protection_profile(&params.model_params)?;
        let pcr_policy = PcrPolicy::from_profile(&profile)?;

        let auth_key = self
            .store
            .read_secret(&params.policy_auth_key_file)
            .map_err(SealError::ReadPolicyAuthKey)?;
        if params.key_files.is_empty() {
            return Err(SealError::NoKeyFiles);
        }
        let mut objects = params
            .key_files
            .iter()
            .map(|path| {
                self.store
                    .read_object(path)
                    .map_err(|source| SealError::ReadKey {
                        path: path.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        for object in objects.iter_mut() {
            let approved = tpm
                .approved_policy_digest(object.pcr_policy_counter_handle)
                .map_err(SealError::ApprovedPolicy)?;
            object.update_pcr_policy(pcr_policy.clone(), &approved);
        }
        for (path, object) in params.key_files.iter().zip(&objects) {
            self.store
                .write_object(path, object)
                .map_err(|source| SealError::WriteKey {
                    path: path.clone(),
                    source,
                })?;
        }

        tpm.revoke_old_policies(&objects[0], &auth_key)
            .map_err(SealError::Revoke)?;
        log::info!("resealed {} keys", objects.len());
        Ok(())
    }

    /// Undefines the given NV indices. Every handle is attempted; the
    /// failures are reported together.
    pub fn release_pcr_handles(&self, handles: &[u32]) -> Result<()> {
        let mut tpm = self.tpm.connect_guarded().map_err(SealError::Connect)?;
        let mut failures = Vec::new();
        for &handle in handles.iter().filter(|&&h| h != 0) {
            match tpm.nv_undefine(handle) {
                Ok(()) => log::debug!("released handle {:#010x}", handle),
                Err(e) => failures.push((handle, e)),
            }
        }
        if !failures.is_empty() {
            return Err(SealError::ResourceRelease(failures));
        }
        Ok(())
    }
}
