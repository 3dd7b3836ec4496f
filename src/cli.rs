use crate::boot::Unsquashfs;
use crate::efi::SysfsEfiVars;
use crate::kdf::{self, KdfOptions, PROC_MEMINFO};
use crate::keymgr::KeyManager;
use crate::keyring::{Keyctl, KEYRING_PREFIX};
use crate::keys::{RecoveryKey, UnlockKey};
use crate::luks::Cryptsetup;
use crate::tpm::measure::MeasuredBoot;
use crate::tpm::params::SealConfig;
use crate::tpm::pcr::{parse_pcr_selection, PcrSelection};
use crate::tpm::profile::PcrPolicy;
use crate::tpm::sealed_key::write_file_atomic;
use crate::tpm::sealing::SealManager;
use crate::tpm::unlock::{UnlockOptions, Unlocker};
use crate::tpm::{FileKeyStore, ProvisionMode, SealKeyRequest, DEFAULT_TCTI};
use clap::{Parser, Subcommand};
use eyre::{bail, Result};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const TPM_ENV_VAR: &str = "TCTI";
const KEYRING_PREFIX_ENV_VAR: &str = "FDE_KEYRING_PREFIX";
const DEFAULT_LOCK_PCRS: &str = "sha256:12";

#[cfg(feature = "tpm2")]
type Connector = crate::tpm::esapi::EsapiConnector;
#[cfg(not(feature = "tpm2"))]
type Connector = crate::tpm::Unavailable;

type Sealer = SealManager<Connector, SysfsEfiVars, MeasuredBoot<SysfsEfiVars, Unsquashfs>, FileKeyStore>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TPM device specified in TCTI format
    #[arg(short = 'T', long, default_value = DEFAULT_TCTI, env = TPM_ENV_VAR)]
    tcti: String,

    /// Description prefix of keys in the kernel keyring
    #[arg(long, default_value = KEYRING_PREFIX, env = KEYRING_PREFIX_ENV_VAR)]
    keyring_prefix: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the KDF cost used for the recovery key on this machine
    Kdf {
        #[arg(long, default_value = PROC_MEMINFO)]
        meminfo: PathBuf,
    },
    /// Generate a recovery key and add it to the recovery keyslot
    AddRecoveryKey {
        /// Encrypted block device, e.g. `/dev/sda4`
        device: String,
        /// Write the recovery key here instead of printing it
        #[arg(long)]
        output: Option<PathBuf>,
        /// Authorize with this key instead of the one in the kernel keyring
        #[arg(long)]
        unlock_key_file: Option<PathBuf>,
    },
    /// Remove the recovery key
    RemoveRecoveryKey {
        device: String,
        #[arg(long)]
        unlock_key_file: Option<PathBuf>,
    },
    /// Put a new volume key into the temporary keyslot
    StageKeyChange { device: String, key_file: PathBuf },
    /// Move a staged volume key into the primary keyslot
    TransitionKeyChange { device: String, key_file: PathBuf },
    /// Replace the volume key in one go
    ChangeKey { device: String, key_file: PathBuf },
    /// Check for secure boot and a usable TPM
    CheckSealing {
        /// Allow an already provisioned TPM
        #[arg(long)]
        partial: bool,
    },
    /// Take ownership of the TPM
    Provision {
        lockout_auth_file: PathBuf,
        /// Reprovision with an existing lockout authorization file
        #[arg(long)]
        partial: bool,
    },
    /// Seal volume keys to the boot chains in a sealing configuration
    Seal {
        config: PathBuf,
        /// Raw volume key, one per sealed key file in the configuration
        #[arg(long = "key", required = true)]
        keys: Vec<PathBuf>,
        /// Provision the TPM before sealing
        #[arg(long)]
        provision: bool,
    },
    /// Update sealed keys for changed boot chains
    Reseal { config: PathBuf },
    /// Unlock an encrypted volume with its sealed key
    Unlock {
        /// Volume name, e.g. `ubuntu-data`
        name: String,
        device: String,
        sealed_key_file: PathBuf,
        /// Prompt for the recovery key if the sealed key cannot be used
        #[arg(long)]
        allow_recovery_key: bool,
        /// Block access to sealed keys afterwards
        #[arg(long)]
        lock: bool,
        /// PCRs to extend when blocking access
        #[arg(long, value_name = "PCR List", default_value = DEFAULT_LOCK_PCRS, value_parser = parse_pcr_selection)]
        pcrs: PcrSelection,
    },
    /// Block access to sealed keys until the next boot
    Lock {
        #[arg(long, value_name = "PCR List", default_value = DEFAULT_LOCK_PCRS, value_parser = parse_pcr_selection)]
        pcrs: PcrSelection,
    },
    /// Undefine PCR policy counter NV indices
    ReleaseHandles {
        #[arg(required = true, value_parser = parse_handle)]
        handles: Vec<u32>,
    },
    /// Show the PCR protection profile for a sealing configuration
    Profile { config: PathBuf },
}

/// Parses a TPM handle given in hex (`0x01880001`) or decimal.
fn parse_handle(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid handle {:?}: {}", s, e))
}

fn provision_mode(partial: bool) -> ProvisionMode {
    if partial {
        ProvisionMode::Partial
    } else {
        ProvisionMode::Full
    }
}

fn read_key(path: &Path) -> Result<UnlockKey> {
    Ok(Zeroizing::new(fs::read(path)?))
}

fn read_optional_key(path: Option<&PathBuf>) -> Result<Option<UnlockKey>> {
    path.map(|p| read_key(p)).transpose()
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    fn connector(&self) -> Connector {
        #[cfg(feature = "tpm2")]
        {
            crate::tpm::esapi::EsapiConnector::new(&self.tcti)
        }
        #[cfg(not(feature = "tpm2"))]
        {
            log::debug!("built without TPM support, ignoring TCTI {}", self.tcti);
            crate::tpm::Unavailable
        }
    }

    fn key_manager(&self) -> KeyManager<Cryptsetup, Keyctl> {
        KeyManager::new(Cryptsetup::new(), Keyctl::new()).with_keyring_prefix(&self.keyring_prefix)
    }

    fn sealer(&self) -> Sealer {
        SealManager::new(
            self.connector(),
            SysfsEfiVars::default(),
            MeasuredBoot::new(SysfsEfiVars::default(), Unsquashfs::new()),
            FileKeyStore,
        )
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self.command);
        match &self.command {
            Commands::Kdf { meminfo } => show_kdf(meminfo)?,
            Commands::AddRecoveryKey {
                device,
                output,
                unlock_key_file,
            } => {
                let unlock_key = read_optional_key(unlock_key_file.as_ref())?;
                let recovery_key = RecoveryKey::generate();
                self.key_manager()
                    .add_recovery_key(&recovery_key, unlock_key.as_deref().map(Vec::as_slice), device)?;
                match output {
                    Some(path) => write_file_atomic(path, recovery_key.to_string().as_bytes(), 0o600)?,
                    None => println!("{}", recovery_key),
                }
            }
            Commands::RemoveRecoveryKey {
                device,
                unlock_key_file,
            } => {
                let unlock_key = read_optional_key(unlock_key_file.as_ref())?;
                self.key_manager()
                    .remove_recovery_key(unlock_key.as_deref().map(Vec::as_slice), device)?;
            }
            Commands::StageKeyChange { device, key_file } => {
                self.key_manager()
                    .stage_key_change(&read_key(key_file)?, device)?;
            }
            Commands::TransitionKeyChange { device, key_file } => {
                self.key_manager()
                    .transition_key_change(&read_key(key_file)?, device)?;
            }
            Commands::ChangeKey { device, key_file } => {
                self.key_manager()
                    .change_volume_key_atomic(&read_key(key_file)?, device)?;
            }
            Commands::CheckSealing { partial } => {
                self.sealer().check_sealing_supported(provision_mode(*partial))?;
                println!("sealing is supported");
            }
            Commands::Provision {
                lockout_auth_file,
                partial,
            } => self
                .sealer()
                .provision(provision_mode(*partial), lockout_auth_file)?,
            Commands::Seal {
                config,
                keys,
                provision,
            } => {
                let config = SealConfig::load(config)?;
                if keys.len() != config.key_files.len() {
                    bail!(
                        "got {} keys for {} sealed key files",
                        keys.len(),
                        config.key_files.len()
                    );
                }
                let requests = keys
                    .iter()
                    .zip(&config.key_files)
                    .map(|(key, key_file)| -> Result<SealKeyRequest> {
                        Ok(SealKeyRequest {
                            key: read_key(key)?.as_slice().try_into()?,
                            key_file: key_file.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.sealer()
                    .seal_keys(&requests, &config.seal_params(*provision))?;
            }
            Commands::Reseal { config } => {
                let config = SealConfig::load(config)?;
                self.sealer().reseal_keys(&config.reseal_params())?;
            }
            Commands::Unlock {
                name,
                device,
                sealed_key_file,
                allow_recovery_key,
                lock,
                pcrs,
            } => {
                let unlocker = Unlocker::new(self.connector(), Cryptsetup::new(), Keyctl::new(), FileKeyStore)
                    .with_keyring_prefix(&self.keyring_prefix)
                    .with_lock_pcrs(pcrs.clone());
                let options = UnlockOptions {
                    allow_recovery_key: *allow_recovery_key,
                    lock_keys_on_finish: *lock,
                };
                let result = unlocker.unlock_volume(name, device, sealed_key_file, &options)?;
                println!("{} ({:?})", result.fs_device.display(), result.method);
            }
            Commands::Lock { pcrs } => {
                Unlocker::new(self.connector(), Cryptsetup::new(), Keyctl::new(), FileKeyStore)
                    .with_lock_pcrs(pcrs.clone())
                    .lock_sealed_keys()?;
            }
            Commands::ReleaseHandles { handles } => self.sealer().release_pcr_handles(handles)?,
            Commands::Profile { config } => {
                let config = SealConfig::load(config)?;
                let profile = self.sealer().build_pcr_protection_profile(&config.models)?;
                let policy = PcrPolicy::from_profile(&profile)?;
                print!("{}", profile);
                println!("PCRs: {}", policy.selection);
                println!("Branches: {}", policy.branches.len());
                println!("Approved policy digest: {}", policy.approved_digest());
            }
        };
        Ok(self)
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}

fn show_kdf(meminfo: &Path) -> Result<()> {
    match kdf::recovery_kdf(meminfo)? {
        KdfOptions::MemoryCost {
            memory_kib,
            force_iterations,
        } => println!("argon2i memory: {} KiB, iterations: {}", memory_kib, force_iterations),
        KdfOptions::TargetDuration(duration) => println!("argon2i target time: {:?}", duration),
    }
    Ok(())
}
