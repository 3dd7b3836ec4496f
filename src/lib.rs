//! # fde-keymgr
//!
//! Key management for a LUKS2 encrypted root volume on a measured-boot device.
//!
//! - [`keymgr`] rotates the primary volume key and manages the recovery key.
//! - [`tpm`] seals volume keys to a predicted boot chain and unlocks the
//!   volume with them at boot.
//!
//! ## Building with a hardware TPM backend
//! ```bash
//! cargo build --features tpm2
//! ```
//! Set `FDE_KEYMGR_BUILD_STATIC=1` to link the tpm2-tss libraries statically.

pub mod boot;
pub mod cli;
pub mod efi;
pub mod kdf;
pub mod keymgr;
pub mod keyring;
pub mod keys;
pub mod luks;
pub mod tpm;

#[cfg(test)]
mod testutil;
