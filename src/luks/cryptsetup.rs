use super::{ActivateError, KeySlot, KeyslotError, KeyslotOps, Result, SlotPriority, VolumeActivator};
use crate::kdf::KdfOptions;
use crate::keys::RecoveryKey;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

pub const DEFAULT_RUN_DIR: &str = "/run/fde-keymgr";

/// [`KeyslotOps`] and [`VolumeActivator`] on top of the `cryptsetup` binary.
#[derive(Debug, Clone)]
pub struct Cryptsetup {
    binary: PathBuf,
    ask_password: PathBuf,
    run_dir: PathBuf,
}

impl Default for Cryptsetup {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("cryptsetup"),
            ask_password: PathBuf::from("systemd-ask-password"),
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
        }
    }
}

fn run(mut command: Command, stdin: &[u8]) -> io::Result<Output> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    // stdin is written in full before the output is drained. Keys fit in
    // the pipe buffer, larger input could block against a chatty tool.
    if let Some(mut pipe) = child.stdin.take() {
        // The tool may exit before consuming its input
        match pipe.write_all(stdin) {
            Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e),
            _ => {}
        }
    }
    child.wait_with_output()
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}

/// Finds `<prefix><slot><suffix>` in `output`, e.g. `Key slot 1 is full`.
fn slot_message(output: &str, suffix: &str) -> Option<KeySlot> {
    ["Key slot ", "Keyslot "].iter().find_map(|prefix| {
        output.match_indices(prefix).find_map(|(i, _)| {
            let rest = &output[i + prefix.len()..];
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 || !rest[digits..].starts_with(suffix) {
                return None;
            }
            rest[..digits].parse().ok().map(KeySlot)
        })
    })
}

/// Maps the free-text output of a failed invocation onto [`KeyslotError`].
pub fn classify_failure(output: &str) -> KeyslotError {
    let message = output.trim().to_string();
    if let Some(slot) = slot_message(&message, " is full") {
        KeyslotError::Occupied { slot, message }
    } else if let Some(slot) = slot_message(&message, " is not active") {
        KeyslotError::NotActive { slot, message }
    } else {
        KeyslotError::Failed(message)
    }
}

impl Cryptsetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary<P: Into<PathBuf>>(mut self, binary: P) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_ask_password<P: Into<PathBuf>>(mut self, ask_password: P) -> Self {
        self.ask_password = ask_password.into();
        self
    }

    /// Directory holding the short lived unlock key files.
    pub fn with_run_dir<P: Into<PathBuf>>(mut self, run_dir: P) -> Self {
        self.run_dir = run_dir.into();
        self
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn check(&self, command: Command, stdin: &[u8]) -> Result<()> {
        let output = run(command, stdin)?;
        if output.status.success() {
            return Ok(());
        }
        Err(classify_failure(&combined_output(&output)))
    }

    fn ask_recovery_key(&self, device: &str) -> io::Result<String> {
        let output = Command::new(&self.ask_password)
            .arg("--icon")
            .arg("drive-harddisk")
            .arg("--id")
            .arg(format!("fde-keymgr:{}", device))
            .arg(format!("Please enter the recovery key for disk {}:", device))
            .stderr(Stdio::inherit())
            .output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {}", self.ask_password.display(), output.status),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl KeyslotOps for Cryptsetup {
    fn add_key(
        &self,
        device: &str,
        auth_key: &[u8],
        new_key: &[u8],
        slot: KeySlot,
        kdf: &KdfOptions,
    ) -> Result<()> {
        fs::create_dir_all(&self.run_dir)?;
        // Private to the owner, removed when dropped
        let mut key_file = tempfile::Builder::new()
            .prefix("unlock-")
            .suffix(".key")
            .tempfile_in(&self.run_dir)?;
        key_file.write_all(auth_key)?;
        key_file.flush()?;

        let mut command = self.command();
        command
            .args(["luksAddKey", "--type", "luks2", "--key-file"])
            .arg(key_file.path())
            .args(["--pbkdf", "argon2i"]);
        match kdf {
            KdfOptions::MemoryCost {
                memory_kib,
                force_iterations,
            } => {
                command
                    .arg("--pbkdf-force-iterations")
                    .arg(force_iterations.to_string())
                    .arg("--pbkdf-memory")
                    .arg(memory_kib.to_string());
            }
            KdfOptions::TargetDuration(duration) => {
                command
                    .arg("--iter-time")
                    .arg(duration.as_millis().to_string());
            }
        }
        command
            .arg("--key-slot")
            .arg(slot.to_string())
            .arg(device)
            .arg("-");
        log::debug!("adding key to slot {} of {}", slot, device);
        self.check(command, new_key)
    }

    fn kill_slot(&self, device: &str, slot: KeySlot, auth_key: &[u8]) -> Result<()> {
        let mut command = self.command();
        command
            .args(["luksKillSlot", "--type", "luks2", "--key-file", "-"])
            .arg(device)
            .arg(slot.to_string());
        log::debug!("killing slot {} of {}", slot, device);
        self.check(command, auth_key)
    }

    fn set_slot_priority(&self, device: &str, slot: KeySlot, priority: SlotPriority) -> Result<()> {
        let mut command = self.command();
        command
            .args(["config", "--priority", priority.as_str(), "--key-slot"])
            .arg(slot.to_string())
            .arg(device);
        self.check(command, &[])
    }
}

impl VolumeActivator for Cryptsetup {
    fn activate_with_key(&self, name: &str, device: &str, key: &[u8]) -> Result<(), ActivateError> {
        let mut command = self.command();
        command
            .args(["open", "--type", "luks2", "--key-file", "-"])
            .arg(device)
            .arg(name);
        let output = run(command, key)?;
        if output.status.success() {
            log::info!("activated {} as {}", device, name);
            return Ok(());
        }
        Err(ActivateError::Failed {
            device: device.to_string(),
            message: combined_output(&output),
        })
    }

    fn activate_with_recovery_key(
        &self,
        name: &str,
        device: &str,
        tries: u32,
    ) -> Result<(), ActivateError> {
        for attempt in 1..=tries {
            let input = self.ask_recovery_key(device)?;
            let key = match input.parse::<RecoveryKey>() {
                Ok(key) => key,
                Err(e) => {
                    log::warn!("attempt {}: {}", attempt, e);
                    continue;
                }
            };
            match self.activate_with_key(name, device, key.as_bytes()) {
                Ok(()) => return Ok(()),
                Err(ActivateError::Failed { message, .. }) => {
                    log::warn!("attempt {}: recovery key rejected: {}", attempt, message)
                }
                Err(e) => return Err(e),
            }
        }
        Err(ActivateError::RecoveryKeyExhausted {
            device: device.to_string(),
            attempts: tries,
        })
    }
}
