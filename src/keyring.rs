//! Volume keys handed between boot stages through the kernel user keyring.

use crate::keys::UnlockKey;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use thiserror::Error;
use zeroize::Zeroizing;

pub const KEYRING_PREFIX: &str = "ubuntu-fde";
pub const UNLOCK_PURPOSE: &str = "unlock";

#[derive(Error, Debug)]
pub enum KeyringError {
    #[error("cannot find key in kernel keyring")]
    NotFound { description: String },
    #[error("keyctl {operation} failed: {message}")]
    Command { operation: String, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = KeyringError> = core::result::Result<T, E>;

/// `<prefix>:<device>:<purpose>`
pub fn key_description(prefix: &str, device: &str, purpose: &str) -> String {
    format!("{}:{}:{}", prefix, device, purpose)
}

pub trait Keyring {
    /// Fetches the key that unlocked `device`, optionally unlinking it.
    fn get_unlock_key(&self, prefix: &str, device: &str, remove: bool) -> Result<UnlockKey>;

    fn store_key(&self, key: &[u8], device: &str, purpose: &str, prefix: &str) -> Result<()>;
}

/// [`Keyring`] backed by the `keyctl` tool and the `@u` keyring.
#[derive(Debug, Clone)]
pub struct Keyctl {
    binary: PathBuf,
}

impl Default for Keyctl {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("keyctl"),
        }
    }
}

impl Keyctl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary<P: Into<PathBuf>>(mut self, binary: P) -> Self {
        self.binary = binary.into();
        self
    }

    fn keyctl(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)?;
        }
        Ok(child.wait_with_output()?)
    }

    fn checked(&self, operation: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Output> {
        let output = self.keyctl(args, stdin)?;
        if !output.status.success() {
            return Err(KeyringError::Command {
                operation: operation.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl Keyring for Keyctl {
    fn get_unlock_key(&self, prefix: &str, device: &str, remove: bool) -> Result<UnlockKey> {
        let description = key_description(prefix, device, UNLOCK_PURPOSE);
        let found = self.keyctl(&["search", "@u", "user", &description], None)?;
        if !found.status.success() {
            return Err(KeyringError::NotFound { description });
        }
        let id = String::from_utf8_lossy(&found.stdout).trim().to_string();
        let key = Zeroizing::new(self.checked("pipe", &["pipe", &id], None)?.stdout);
        if remove {
            self.checked("unlink", &["unlink", &id, "@u"], None)?;
            log::debug!("removed {} from user keyring", description);
        }
        Ok(key)
    }

    fn store_key(&self, key: &[u8], device: &str, purpose: &str, prefix: &str) -> Result<()> {
        let description = key_description(prefix, device, purpose);
        self.checked("padd", &["padd", "user", &description, "@u"], Some(key))?;
        log::debug!("stored {} in user keyring", description);
        Ok(())
    }
}
