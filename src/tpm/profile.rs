//! PCR protection profiles and the TPM2 policies derived from them.
//!
//! A [`PcrProtectionProfile`] is a small program over PCR values: instructions
//! run in sequence (logical AND) and [`PcrProtectionProfile::add_profile_or`]
//! forks execution into alternative branches (logical OR). Running it yields
//! every PCR value combination under which a sealed key may be released.

use super::pcr::{self, Digest, PcrIndex, PcrSelection, PcrValues};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use thiserror::Error;

/// TPM_CC_PolicyPCR
const TPM_CC_POLICY_PCR: u32 = 0x0000_017f;
/// TPM_CC_PolicyOR
const TPM_CC_POLICY_OR: u32 = 0x0000_0171;
/// TPM_ALG_SHA256
const TPM_ALG_SHA256: u16 = 0x000b;

/// Digests a single TPM2_PolicyOR accepts.
pub const MAX_OR_OPERANDS: usize = 8;
/// Levels of PolicyOR between a PCR branch and the approved digest.
pub const MAX_OR_DEPTH: u32 = 4;
/// PCR value combinations a policy can hold.
pub const MAX_POLICY_BRANCHES: usize = MAX_OR_OPERANDS.pow(MAX_OR_DEPTH);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProfileError {
    #[error("profile does not constrain any PCR")]
    EmptySelection,
    #[error("PCR {0} is not set in every branch")]
    InconsistentBranches(PcrIndex),
    #[error("too many PCR value combinations ({0}), at most {MAX_POLICY_BRANCHES} are supported")]
    TooManyBranches(usize),
    #[error(transparent)]
    Pcr(#[from] pcr::PcrError),
}

pub type Result<T, E = ProfileError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Instruction {
    AddPcrValue { pcr: PcrIndex, value: Digest },
    ExtendPcr { pcr: PcrIndex, digest: Digest },
    Or(Vec<PcrProtectionProfile>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcrProtectionProfile {
    instructions: Vec<Instruction>,
}

impl PcrProtectionProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Sets `pcr` to `value`, replacing whatever was measured into it so far.
    pub fn add_pcr_value(&mut self, pcr: PcrIndex, value: Digest) -> &mut Self {
        self.instructions.push(Instruction::AddPcrValue { pcr, value });
        self
    }

    /// Extends `pcr` with `digest`. A PCR without a value starts out zeroed.
    pub fn extend_pcr(&mut self, pcr: PcrIndex, digest: Digest) -> &mut Self {
        self.instructions.push(Instruction::ExtendPcr { pcr, digest });
        self
    }

    pub fn add_profile_or(&mut self, profiles: Vec<PcrProtectionProfile>) -> &mut Self {
        self.instructions.push(Instruction::Or(profiles));
        self
    }

    pub fn append(&mut self, other: PcrProtectionProfile) -> &mut Self {
        self.instructions.extend(other.instructions);
        self
    }

    fn run(&self, mut states: Vec<PcrValues>) -> Vec<PcrValues> {
        for instruction in &self.instructions {
            match instruction {
                Instruction::AddPcrValue { pcr, value } => {
                    for state in states.iter_mut() {
                        state.insert(*pcr, *value);
                    }
                }
                Instruction::ExtendPcr { pcr, digest } => {
                    for state in states.iter_mut() {
                        let current = state.get(pcr).copied().unwrap_or_default();
                        state.insert(*pcr, current.extend(digest));
                    }
                }
                Instruction::Or(branches) => {
                    states = states
                        .into_iter()
                        .flat_map(|state| {
                            branches
                                .iter()
                                .flat_map(move |branch| branch.run(vec![state.clone()]))
                                .collect::<Vec<_>>()
                        })
                        .collect();
                }
            }
        }
        states
    }

    /// Every admissible PCR value combination, without duplicates.
    pub fn compute_pcr_values(&self) -> Vec<PcrValues> {
        let mut unique: Vec<PcrValues> = Vec::new();
        for values in self.run(vec![PcrValues::new()]) {
            if !unique.contains(&values) {
                unique.push(values);
            }
        }
        unique
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        for instruction in &self.instructions {
            match instruction {
                Instruction::AddPcrValue { pcr, value } => {
                    writeln!(f, "{}AddPCRValue(pcr={}, value={})", indent, pcr, value)?
                }
                Instruction::ExtendPcr { pcr, digest } => {
                    writeln!(f, "{}ExtendPCR(pcr={}, digest={})", indent, pcr, digest)?
                }
                Instruction::Or(branches) => {
                    writeln!(f, "{}BranchPoint(", indent)?;
                    for (i, branch) in branches.iter().enumerate() {
                        writeln!(f, "{}  Branch {} {{", indent, i)?;
                        branch.fmt_indented(f, depth + 2)?;
                        writeln!(f, "{}  }}", indent)?;
                    }
                    writeln!(f, "{})", indent)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for PcrProtectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// TPM2_PolicyPCR digests for every admissible PCR value combination.
///
/// With more than one branch the digests are the leaves of a PolicyOR tree:
/// each level ORs groups of up to [`MAX_OR_OPERANDS`] digests of the level
/// below until a single root remains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrPolicy {
    pub selection: PcrSelection,
    pub branches: Vec<Digest>,
}

/// Marshalled TPML_PCR_SELECTION holding a single SHA-256 selection.
fn pcr_selection_list(selection: &PcrSelection) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    bytes.extend_from_slice(&1u32.to_be_bytes());
    bytes.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
    bytes.push(3);
    bytes.extend_from_slice(&selection.bitmap());
    bytes
}

/// Session digest after TPM2_PolicyPCR on a fresh session.
pub fn policy_pcr_digest(selection: &PcrSelection, pcr_digest: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(Digest::zero().0);
    hasher.update(TPM_CC_POLICY_PCR.to_be_bytes());
    hasher.update(pcr_selection_list(selection));
    hasher.update(pcr_digest.0);
    Digest(hasher.finalize().into())
}

/// Session digest after TPM2_PolicyOR over `branches`.
pub fn policy_or_digest(branches: &[Digest]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(Digest::zero().0);
    hasher.update(TPM_CC_POLICY_OR.to_be_bytes());
    for branch in branches {
        hasher.update(branch.0);
    }
    Digest(hasher.finalize().into())
}

impl PcrPolicy {
    pub fn from_profile(profile: &PcrProtectionProfile) -> Result<Self> {
        let combinations = profile.compute_pcr_values();
        let selection = PcrSelection::new(combinations.iter().flat_map(|v| v.keys().copied()));
        if selection.is_empty() {
            return Err(ProfileError::EmptySelection);
        }
        let mut branches = Vec::new();
        for values in &combinations {
            if let Some(missing) = selection.iter().find(|pcr| !values.contains_key(pcr)) {
                return Err(ProfileError::InconsistentBranches(missing));
            }
            let branch = policy_pcr_digest(&selection, &pcr::pcr_digest(values, &selection)?);
            if !branches.contains(&branch) {
                branches.push(branch);
            }
        }
        if branches.len() > MAX_POLICY_BRANCHES {
            return Err(ProfileError::TooManyBranches(branches.len()));
        }
        Ok(Self {
            selection,
            branches,
        })
    }

    /// PolicyOR operand lists, one `Vec` per group, level by level from the
    /// branches up to the root. Empty for a single branch.
    pub fn or_tree(&self) -> Vec<Vec<Vec<Digest>>> {
        let mut levels = Vec::new();
        let mut nodes = self.branches.clone();
        while nodes.len() > 1 {
            let groups: Vec<Vec<Digest>> = nodes.chunks(MAX_OR_OPERANDS).map(or_operands).collect();
            nodes = groups.iter().map(|g| policy_or_digest(g)).collect();
            levels.push(groups);
        }
        levels
    }

    /// Policy digest a session must reach for the sealed object to be released.
    pub fn approved_digest(&self) -> Digest {
        match self.or_tree().last().and_then(|root| root.first()) {
            Some(root) => policy_or_digest(root),
            None => self.branches.first().copied().unwrap_or_default(),
        }
    }

    /// Index of the branch `values` satisfies.
    pub fn branch_index(&self, values: &PcrValues) -> Option<usize> {
        let digest = pcr::pcr_digest(values, &self.selection).ok()?;
        let branch = policy_pcr_digest(&self.selection, &digest);
        self.branches.iter().position(|b| *b == branch)
    }

    /// Whether `values` satisfies one of the branches.
    pub fn admits(&self, values: &PcrValues) -> bool {
        self.branch_index(values).is_some()
    }

    /// The TPM2_PolicyOR operand lists a session runs after TPM2_PolicyPCR
    /// for `branch`, in order.
    pub fn or_path(&self, branch: usize) -> Vec<Vec<Digest>> {
        let mut index = branch;
        self.or_tree()
            .into_iter()
            .filter_map(|mut groups| {
                let group = index / MAX_OR_OPERANDS;
                index = group;
                (group < groups.len()).then(|| groups.swap_remove(group))
            })
            .collect()
    }
}

/// A PolicyOR needs two operands; a lone digest is paired with itself.
fn or_operands(group: &[Digest]) -> Vec<Digest> {
    match group {
        [single] => vec![*single, *single],
        group => group.to_vec(),
    }
}
