//! Hardware TPM backend on top of tss-esapi.
//!
//! Keys are sealed as keyed-hash objects under a transient storage primary
//! key. Their auth policy is `PolicyAuthorizeNV` on the PCR policy counter
//! index, which holds the approved PolicyPCR/PolicyOR digest. Updating that
//! digest with the policy authorization key revokes every older policy.

use super::pcr::{self, PcrIndex, PcrSelection, PcrValues};
use super::profile::PcrPolicy;
use super::sealed_key::SEALED_KEY_VERSION;
use super::{
    KeyCreationParams, ProvisionMode, Result, SealedKeyObject, TpmConnection, TpmConnector, TpmError,
    DEFAULT_TCTI,
};
use crate::keys::UnlockKey;
use std::path::Path;
use std::str::FromStr;
use tss_esapi::attributes::{NvIndexAttributes, ObjectAttributes, SessionAttributes};
use tss_esapi::constants::property_tag::PropertyTag;
use tss_esapi::constants::{CapabilityType, SessionType};
use tss_esapi::handles::{
    AuthHandle, KeyHandle, NvIndexHandle, NvIndexTpmHandle, ObjectHandle, PcrHandle, TpmHandle,
};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::resource_handles::{Hierarchy, NvAuth, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::structures::{
    Auth, CapabilityData, CreateKeyResult, CreatePrimaryKeyResult, Digest, DigestList,
    DigestValues, EccPoint, KeyedHashScheme, MaxNvBuffer, NvPublic, PcrSelectionList, PcrSlot,
    Private, Public, PublicEccParametersBuilder, PublicKeyedHashParameters, SensitiveData,
    SymmetricDefinition, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::Context;
use zeroize::Zeroizing;

const SH_ENABLE: u32 = 1 << 1;
const EH_ENABLE: u32 = 1 << 2;
const LOCKOUT_AUTH_SET: u32 = 1 << 2;

/// Connects to the TPM named by a TCTI string such as `device:/dev/tpmrm0`.
#[derive(Debug, Clone)]
pub struct EsapiConnector {
    tcti: String,
}

impl Default for EsapiConnector {
    fn default() -> Self {
        Self::new(DEFAULT_TCTI)
    }
}

impl EsapiConnector {
    pub fn new<S: Into<String>>(tcti: S) -> Self {
        Self { tcti: tcti.into() }
    }
}

impl TpmConnector for EsapiConnector {
    type Connection = EsapiConnection;

    fn connect(&self) -> Result<EsapiConnection> {
        if let Some(device) = self.tcti.strip_prefix("device:") {
            if !Path::new(device).exists() {
                return Err(TpmError::NoDevice);
            }
        }
        let tcti = TctiNameConf::from_str(&self.tcti)?;
        let ctx = Context::new(tcti)?;
        log::debug!("connected to TPM at {}", self.tcti);
        let mut conn = EsapiConnection { ctx: Some(ctx) };
        conn.flush_transient()?;
        Ok(conn)
    }
}

pub struct EsapiConnection {
    ctx: Option<Context>,
}

impl EsapiConnection {
    fn ctx(&mut self) -> Result<&mut Context> {
        self.ctx.as_mut().ok_or(TpmError::Closed)
    }

    fn flush_transient(&mut self) -> Result<()> {
        let ctx = self.ctx()?;
        let (capabilities, _) = ctx.get_capability(CapabilityType::Handles, 0x8000_0000, 80)?;
        if let CapabilityData::Handles(handles) = capabilities {
            for handle in handles
                .into_inner()
                .into_iter()
                .filter(|h| matches!(h, TpmHandle::Transient(_)))
            {
                let handle = ctx.execute_without_session(|ctx| ctx.tr_from_tpm_public(handle))?;
                ctx.flush_context(handle).ok();
            }
        }
        Ok(())
    }

    fn make_session(&mut self, t: SessionType) -> Result<AuthSession> {
        let ctx = self.ctx()?;
        let session = ctx
            .start_auth_session(
                None,
                None,
                None,
                t,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or_else(|| TpmError::InvalidKeyData("cannot create auth session".to_string()))?;
        let (session_attributes, session_attributes_mask) = SessionAttributes::builder()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        ctx.tr_sess_set_attributes(session, session_attributes, session_attributes_mask)?;
        Ok(session)
    }

    fn flush_session(&mut self, session: AuthSession) -> Result<()> {
        let handle = match session {
            AuthSession::HmacSession(session) => match session {
                HmacSession::HmacSession { session_handle, .. } => Some(session_handle.into()),
            },
            AuthSession::PolicySession(session) => match session {
                PolicySession::PolicySession { session_handle, .. } => Some(session_handle.into()),
            },
            _ => None,
        };
        if let Some(handle) = handle {
            self.ctx()?.flush_context(handle)?;
        }
        Ok(())
    }

    fn startup_clear(&mut self) -> Result<u32> {
        Ok(self
            .ctx()?
            .get_tpm_property(PropertyTag::StartupClear)?
            .unwrap_or(0))
    }

    /// Transient storage root key, flushed by the caller.
    fn create_primary(&mut self) -> Result<KeyHandle> {
        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_sign_encrypt(false)
            .with_restricted(true)
            .build()?;

        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::Ecc)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_ecc_parameters(
                PublicEccParametersBuilder::new_restricted_decryption_key(
                    SymmetricDefinitionObject::AES_128_CFB,
                    EccCurve::NistP256,
                )
                .build()?,
            )
            .with_ecc_unique_identifier(EccPoint::default())
            .build()?;

        let CreatePrimaryKeyResult { key_handle, .. } = self.ctx()?.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
        })?;
        Ok(key_handle)
    }

    fn nv_handle(&mut self, handle: u32) -> Result<Option<NvIndexHandle>> {
        let index = NvIndexTpmHandle::new(handle)?;
        let resolved = self
            .ctx()?
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::NvIndex(index)));
        Ok(resolved.ok().map(NvIndexHandle::from))
    }

    fn read_approved_digest(&mut self, nv: NvIndexHandle) -> Result<pcr::Digest> {
        let data = self.ctx()?.execute_with_nullauth_session(|ctx| {
            ctx.nv_read(NvAuth::Owner, nv, pcr::DIGEST_SIZE as u16, 0)
        })?;
        pcr::Digest::try_from(data.value()).map_err(|e| TpmError::InvalidKeyData(e.to_string()))
    }

    fn write_approved_digest(&mut self, nv: NvIndexHandle, digest: &pcr::Digest) -> Result<()> {
        let data = MaxNvBuffer::try_from(digest.as_bytes().to_vec())?;
        let session = self.make_session(SessionType::Hmac)?;
        let ctx = self.ctx()?;
        let written = ctx.execute_with_session(Some(session), |ctx| ctx.nv_write(NvAuth::NvIndex(nv), data, 0));
        self.flush_session(session).ok();
        Ok(written?)
    }

    /// Digest of PolicyAuthorizeNV on `nv`, the auth policy of every sealed
    /// object.
    fn authorize_nv_policy(&mut self, nv: NvIndexHandle) -> Result<Digest> {
        let session = self.make_session(SessionType::Trial)?;
        let ctx = self.ctx()?;
        let policy: PolicySession = session.try_into()?;
        let digest = ctx
            .execute_with_nullauth_session(|ctx| ctx.policy_authorize_nv(policy, AuthHandle::Owner, nv))
            .and_then(|()| ctx.policy_get_digest(policy));
        self.flush_session(session).ok();
        Ok(digest?)
    }

    fn read_pcrs(&mut self, selection: &PcrSelection) -> Result<PcrValues> {
        let list = selection_list(selection)?;
        let (_, _, digests) = self
            .ctx()?
            .execute_without_session(|ctx| ctx.pcr_read(list))?;
        selection
            .iter()
            .zip(digests.value())
            .map(|(index, digest)| {
                pcr::Digest::try_from(digest.value())
                    .map(|d| (index, d))
                    .map_err(|e| TpmError::InvalidKeyData(e.to_string()))
            })
            .collect()
    }

    fn satisfy_policy(&mut self, session: PolicySession, policy: &PcrPolicy, nv: NvIndexHandle) -> Result<()> {
        let values = self.read_pcrs(&policy.selection)?;
        let branch = policy.branch_index(&values).ok_or(TpmError::PolicyMismatch)?;
        let pcr_digest = pcr::pcr_digest(&values, &policy.selection)
            .map_err(|e| TpmError::InvalidKeyData(e.to_string()))?;
        let list = selection_list(&policy.selection)?;
        let ctx = self.ctx()?;
        ctx.policy_pcr(session, Digest::try_from(pcr_digest.as_bytes().to_vec())?, list)?;
        for operands in policy.or_path(branch) {
            let mut digests = DigestList::new();
            for operand in &operands {
                digests.add(Digest::try_from(operand.as_bytes().to_vec())?)?;
            }
            ctx.policy_or(session, digests)?;
        }
        ctx.execute_with_nullauth_session(|ctx| ctx.policy_authorize_nv(session, AuthHandle::Owner, nv))?;
        Ok(())
    }

    fn unseal_with_policy(&mut self, object: &SealedKeyObject, policy: &PcrPolicy, nv: NvIndexHandle) -> Result<UnlockKey> {
        let public = Public::unmarshall(&object.public)?;
        let private = Private::try_from(object.private.clone())?;
        let primary = self.create_primary()?;
        let loaded = self
            .ctx()?
            .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public));
        self.ctx()?.flush_context(primary.into()).ok();
        let loaded = loaded?;

        let session = self.make_session(SessionType::Policy)?;
        let unsealed = self.unseal_in_session(session, loaded, policy, nv);
        self.flush_session(session).ok();
        self.ctx()?.flush_context(loaded.into()).ok();
        Ok(Zeroizing::new(unsealed?.value().to_vec()))
    }

    fn unseal_in_session(
        &mut self,
        session: AuthSession,
        loaded: KeyHandle,
        policy: &PcrPolicy,
        nv: NvIndexHandle,
    ) -> Result<SensitiveData> {
        self.satisfy_policy(session.try_into()?, policy, nv)?;
        Ok(self
            .ctx()?
            .execute_with_session(Some(session), |ctx| ctx.unseal(loaded.into()))?)
    }
}

fn selection_list(selection: &PcrSelection) -> Result<PcrSelectionList> {
    let slots = selection
        .iter()
        .map(|index| PcrSlot::try_from(1u32 << index))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PcrSelectionList::builder()
        .with_selection(HashingAlgorithm::Sha256, &slots)
        .build()?)
}

fn pcr_handle(index: PcrIndex) -> Result<PcrHandle> {
    let slot = PcrSlot::try_from(1u32 << index)?;
    Ok(match slot {
        PcrSlot::Slot0 => PcrHandle::Pcr0,
        PcrSlot::Slot1 => PcrHandle::Pcr1,
        PcrSlot::Slot2 => PcrHandle::Pcr2,
        PcrSlot::Slot3 => PcrHandle::Pcr3,
        PcrSlot::Slot4 => PcrHandle::Pcr4,
        PcrSlot::Slot5 => PcrHandle::Pcr5,
        PcrSlot::Slot6 => PcrHandle::Pcr6,
        PcrSlot::Slot7 => PcrHandle::Pcr7,
        PcrSlot::Slot8 => PcrHandle::Pcr8,
        PcrSlot::Slot9 => PcrHandle::Pcr9,
        PcrSlot::Slot10 => PcrHandle::Pcr10,
        PcrSlot::Slot11 => PcrHandle::Pcr11,
        PcrSlot::Slot12 => PcrHandle::Pcr12,
        PcrSlot::Slot13 => PcrHandle::Pcr13,
        PcrSlot::Slot14 => PcrHandle::Pcr14,
        PcrSlot::Slot15 => PcrHandle::Pcr15,
        PcrSlot::Slot16 => PcrHandle::Pcr16,
        PcrSlot::Slot17 => PcrHandle::Pcr17,
        PcrSlot::Slot18 => PcrHandle::Pcr18,
        PcrSlot::Slot19 => PcrHandle::Pcr19,
        PcrSlot::Slot20 => PcrHandle::Pcr20,
        PcrSlot::Slot21 => PcrHandle::Pcr21,
        PcrSlot::Slot22 => PcrHandle::Pcr22,
        PcrSlot::Slot23 => PcrHandle::Pcr23,
        other => {
            return Err(TpmError::InvalidKeyData(format!("unsupported PCR {:?}", other)))
        }
    })
}

impl TpmConnection for EsapiConnection {
    fn is_enabled(&mut self) -> Result<bool> {
        let flags = self.startup_clear()?;
        Ok(flags & (SH_ENABLE | EH_ENABLE) == SH_ENABLE | EH_ENABLE)
    }

    fn lockout_auth_set(&mut self) -> Result<bool> {
        let flags = self
            .ctx()?
            .get_tpm_property(PropertyTag::Permanent)?
            .unwrap_or(0);
        Ok(flags & LOCKOUT_AUTH_SET != 0)
    }

    fn provision(&mut self, mode: ProvisionMode, lockout_auth: &[u8]) -> Result<()> {
        let auth = Auth::try_from(lockout_auth.to_vec())?;
        let ctx = self.ctx()?;
        if mode == ProvisionMode::Partial {
            // Changing the value to itself proves we hold it
            ctx.tr_set_auth(ObjectHandle::Lockout, auth.clone())?;
        }
        ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.hierarchy_change_auth(AuthHandle::Lockout, auth.clone())
        })?;
        ctx.tr_set_auth(ObjectHandle::Lockout, auth)?;
        Ok(())
    }

    fn seal_keys(&mut self, keys: &[&[u8]], params: &KeyCreationParams) -> Result<Vec<SealedKeyObject>> {
        let handle = params.pcr_policy_counter_handle;
        if self.nv_handle(handle)?.is_some() {
            return Err(TpmError::HandleInUse(handle));
        }

        let attributes = NvIndexAttributes::builder()
            .with_auth_write(true)
            .with_owner_read(true)
            .with_auth_read(true)
            .with_no_da(true)
            .build()?;
        let public = NvPublic::builder()
            .with_nv_index(NvIndexTpmHandle::new(handle)?)
            .with_index_name_algorithm(HashingAlgorithm::Sha256)
            .with_index_attributes(attributes)
            .with_data_area_size(pcr::DIGEST_SIZE)
            .build()?;
        let auth = Auth::try_from(params.auth_key.to_vec())?;
        let nv = self.ctx()?.execute_with_nullauth_session(|ctx| {
            ctx.nv_define_space(Provision::Owner, Some(auth.clone()), public)
        })?;
        self.ctx()?.tr_set_auth(nv.into(), auth)?;
        self.write_approved_digest(nv, &params.pcr_policy.approved_digest())?;
        log::info!("defined PCR policy counter {:#010x}", handle);

        let auth_policy = self.authorize_nv_policy(nv)?;
        let primary = self.create_primary()?;
        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let object_attributes = ObjectAttributes::builder()
                .with_fixed_tpm(true)
                .with_fixed_parent(true)
                .build()?;
            let public = Public::builder()
                .with_public_algorithm(PublicAlgorithm::KeyedHash)
                .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
                .with_object_attributes(object_attributes)
                .with_auth_policy(auth_policy.clone())
                .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
                .with_keyed_hash_unique_identifier(Digest::default())
                .build()?;
            let data = SensitiveData::try_from(key.to_vec())?;
            let created = self
                .ctx()?
                .execute_with_nullauth_session(|ctx| ctx.create(primary, public, None, Some(data), None, None));
            let CreateKeyResult {
                out_private,
                out_public,
                ..
            } = match created {
                Ok(created) => created,
                Err(e) => {
                    self.ctx()?.flush_context(primary.into()).ok();
                    return Err(e.into());
                }
            };
            objects.push(SealedKeyObject {
                version: SEALED_KEY_VERSION,
                pcr_policy_counter_handle: handle,
                policy_sequence: 0,
                public: out_public.marshall()?,
                private: out_private.value().to_vec(),
                pcr_policy: params.pcr_policy.clone(),
                previous_pcr_policy: None,
            });
        }
        self.ctx()?.flush_context(primary.into()).ok();
        Ok(objects)
    }

    fn approved_policy_digest(&mut self, handle: u32) -> Result<pcr::Digest> {
        let nv = self
            .nv_handle(handle)?
            .ok_or(TpmError::HandleNotDefined(handle))?;
        self.read_approved_digest(nv)
    }

    fn revoke_old_policies(&mut self, primary: &SealedKeyObject, auth_key: &[u8]) -> Result<()> {
        let handle = primary.pcr_policy_counter_handle;
        let nv = self
            .nv_handle(handle)?
            .ok_or(TpmError::HandleNotDefined(handle))?;
        self.ctx()?
            .tr_set_auth(nv.into(), Auth::try_from(auth_key.to_vec())?)?;
        self.write_approved_digest(nv, &primary.pcr_policy.approved_digest())
    }

    fn unseal_key(&mut self, object: &SealedKeyObject) -> Result<UnlockKey> {
        let handle = object.pcr_policy_counter_handle;
        let nv = self
            .nv_handle(handle)?
            .ok_or(TpmError::HandleNotDefined(handle))?;
        let approved = self.read_approved_digest(nv)?;
        let policy = object
            .policies()
            .find(|p| p.approved_digest() == approved)
            .ok_or(TpmError::PolicyMismatch)?
            .clone();
        self.unseal_with_policy(object, &policy, nv)
    }

    fn block_pcr_protection_policies(&mut self, pcrs: &[PcrIndex]) -> Result<()> {
        for &index in pcrs {
            let pcr_handle = pcr_handle(index)?;
            let ctx = self.ctx()?;
            let random_digest_sha1 = ctx.get_random(20)?;
            let random_digest_sha256 = ctx.get_random(32)?;
            let mut vals = DigestValues::new();
            vals.set(HashingAlgorithm::Sha1, random_digest_sha1);
            vals.set(HashingAlgorithm::Sha256, random_digest_sha256);
            let session = self.make_session(SessionType::Hmac)?;
            let extended = self
                .ctx()?
                .execute_with_session(Some(session), |ctx| ctx.pcr_extend(pcr_handle, vals));
            self.flush_session(session).ok();
            extended?;
            log::debug!("blocked PCR {}", index);
        }
        Ok(())
    }

    fn nv_undefine(&mut self, handle: u32) -> Result<()> {
        let nv = self
            .nv_handle(handle)?
            .ok_or(TpmError::HandleNotDefined(handle))?;
        self.ctx()?
            .execute_with_nullauth_session(|ctx| ctx.nv_undefine_space(Provision::Owner, nv))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(ctx) = self.ctx.take() {
            drop(ctx);
            log::debug!("closed TPM connection");
        }
        Ok(())
    }
}
