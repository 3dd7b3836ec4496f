use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type PcrIndex = u32;

/// Boot manager code and boot attempts.
pub const BOOT_MANAGER_CODE_PCR: PcrIndex = 4;
/// Secure boot configuration and the authorities used to verify images.
pub const SECURE_BOOT_POLICY_PCR: PcrIndex = 7;
/// Reserved for measurements made by the kernel stub and the initramfs.
pub const KERNEL_PCR: PcrIndex = 12;

const MAX_PCR: PcrIndex = 23;
pub const DIGEST_SIZE: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least one selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR selection list specification `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
    #[error("no value for PCR {0}")]
    MissingPcrValue(PcrIndex),
    #[error("invalid digest `{0}`")]
    InvalidDigest(String),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

/// SHA-256 digest, the only PCR bank used for sealing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    pub const fn zero() -> Self {
        Digest([0u8; DIGEST_SIZE])
    }

    pub fn hash(data: &[u8]) -> Self {
        Digest(Sha256::digest(data).into())
    }

    /// `H(self || digest)`, the TPM2_PCR_Extend operation.
    pub fn extend(&self, digest: &Digest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(digest.0);
        Digest(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; DIGEST_SIZE]> for Digest {
    fn from(bytes: [u8; DIGEST_SIZE]) -> Self {
        Digest(bytes)
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = PcrError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        <[u8; DIGEST_SIZE]>::try_from(bytes)
            .map(Digest)
            .map_err(|_| PcrError::InvalidDigest(hex::encode(bytes)))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl FromStr for Digest {
    type Err = PcrError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| PcrError::InvalidDigest(s.to_string()))?;
        Digest::try_from(bytes.as_slice()).map_err(|_| PcrError::InvalidDigest(s.to_string()))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Expected value per PCR.
pub type PcrValues = BTreeMap<PcrIndex, Digest>;

/// Set of SHA-256 PCRs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PcrSelection(BTreeSet<PcrIndex>);

impl PcrSelection {
    pub fn new<I: IntoIterator<Item = PcrIndex>>(pcrs: I) -> Self {
        Self(pcrs.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = PcrIndex> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, pcr: PcrIndex) -> bool {
        self.0.contains(&pcr)
    }

    /// `pcrSelect` bitmap of a TPMS_PCR_SELECTION.
    pub fn bitmap(&self) -> [u8; 3] {
        let mut select = [0u8; 3];
        for pcr in self.iter() {
            select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }
        select
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pcrs: Vec<String> = self.iter().map(|p| p.to_string()).collect();
        write!(f, "sha256:{}", pcrs.join(","))
    }
}

fn parse_pcr_bank(bank: &str) -> Result<()> {
    match bank {
        "sha256" => Ok(()),
        _ => Err(PcrError::InvalidPcrBank(bank.to_string())),
    }
}

fn parse_slot(slot: &str) -> Result<PcrIndex> {
    match slot.parse::<PcrIndex>() {
        Ok(pcr) if pcr <= MAX_PCR && !slot.starts_with('+') => Ok(pcr),
        _ => Err(PcrError::InvalidPcrSlot(slot.to_string())),
    }
}

/// Parses `sha256:7,12` style selections.
pub fn parse_pcr_selection(expression: &str) -> Result<PcrSelection> {
    let (bank, slots) = expression
        .split_once(':')
        .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
    parse_pcr_bank(bank)?;
    if slots.is_empty() {
        return Err(PcrError::EmptyPcrSelectionList);
    }
    let pcrs = slots.split(',').map(parse_slot).collect::<Result<Vec<_>>>()?;
    Ok(PcrSelection::new(pcrs))
}

/// Digest over the selected PCR values in index order, as used by TPM2_PolicyPCR.
pub fn pcr_digest(values: &PcrValues, selection: &PcrSelection) -> Result<Digest> {
    let mut hasher = Sha256::new();
    for pcr in selection.iter() {
        let value = values.get(&pcr).ok_or(PcrError::MissingPcrValue(pcr))?;
        hasher.update(value.0);
    }
    Ok(Digest(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn parse_no_bank_delimiter() {
        let parsed = parse_pcr_selection("7,12");
        assert_eq!(
            parsed,
            Err(PcrError::InvalidPcrSelectionString("7,12".to_string()))
        );
    }

    #[test]
    fn parse_no_bank() {
        let parsed = parse_pcr_selection(":1,2,3");
        assert_eq!(parsed, Err(PcrError::InvalidPcrBank("".to_string())));
    }

    #[test]
    fn parse_bad_bank() {
        let parsed = parse_pcr_selection("sha1:1,2,3");
        assert_eq!(parsed, Err(PcrError::InvalidPcrBank("sha1".to_string())));
    }

    #[test]
    fn parse_no_selections() {
        let parsed = parse_pcr_selection("sha256:");
        assert_eq!(parsed, Err(PcrError::EmptyPcrSelectionList));
    }

    #[test]
    fn parse_bad_slot() {
        let parsed = parse_pcr_selection("sha256:1,bad,2");
        assert_eq!(parsed, Err(PcrError::InvalidPcrSlot("bad".to_string())));
    }

    #[test]
    fn parse_out_of_range_slot() {
        let parsed = parse_pcr_selection("sha256:1,24");
        assert_eq!(parsed, Err(PcrError::InvalidPcrSlot("24".to_string())));
    }

    #[test]
    fn parse_happy_sha256() -> Result<()> {
        let parsed = parse_pcr_selection("sha256:12,7")?;
        assert_eq!(parsed, PcrSelection::new([7, 12]));
        assert_eq!(parsed.to_string(), "sha256:7,12");
        assert_eq!(parsed.bitmap(), [0x80, 0x10, 0x00]);
        assert_eq!(parse_pcr_selection("sha256:4")?.bitmap(), [0x10, 0, 0]);
        Ok(())
    }

    #[test]
    fn extend_from_zero() -> Result<()> {
        let measured = Digest::hash(b"abc");
        let mut expected = Sha256::new();
        expected.update([0u8; 32]);
        expected.update(measured.0);
        assert_eq!(Digest::zero().extend(&measured).0, <[u8; 32]>::from(expected.finalize()));
        assert_eq!(
            measured.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(measured.to_string().parse::<Digest>()?, measured);
        Ok(())
    }

    #[test]
    fn digest_over_selection() -> Result<()> {
        let values = PcrValues::from([(7, Digest::hash(b"7")), (12, Digest::hash(b"12"))]);
        let mut hasher = Sha256::new();
        hasher.update(Digest::hash(b"7").0);
        hasher.update(Digest::hash(b"12").0);
        assert_eq!(
            pcr_digest(&values, &PcrSelection::new([12, 7]))?,
            Digest(hasher.finalize().into())
        );
        assert_eq!(
            pcr_digest(&values, &PcrSelection::new([4])),
            Err(PcrError::MissingPcrValue(4))
        );
        Ok(())
    }
}
