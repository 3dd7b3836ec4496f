//! Boot chains as trees of EFI image load events.
//!
//! A chain such as
//!
//! ```text
//! shim -> recovery grub -> recovery kernel
//!                      \-> run grub -> run kernel (good)
//!                                  \-> run kernel (try)
//! ```
//!
//! becomes one [`LoadEvent`] tree whose root is loaded by the firmware and
//! whose descendants are loaded through shim.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootError {
    #[error("file {} does not exist", .0.display())]
    MissingImage(PathBuf),
    #[error("cannot open {}: no such file", .0.display())]
    MissingContainer(PathBuf),
    #[error("cannot read {} from {}: {message}", .file_name.display(), .container.display())]
    ContainerRead {
        container: PathBuf,
        file_name: PathBuf,
        message: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = BootError> = core::result::Result<T, E>;

/// A boot asset, either a plain file or a file inside a snap container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap: Option<PathBuf>,
    pub path: PathBuf,
}

impl BootFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            snap: None,
            path: path.into(),
        }
    }

    pub fn in_snap<S: Into<PathBuf>, P: Into<PathBuf>>(snap: S, path: P) -> Self {
        Self {
            snap: Some(snap.into()),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadChain {
    pub boot_file: BootFile,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<LoadChain>,
}

impl LoadChain {
    pub fn new(boot_file: BootFile, next: Vec<LoadChain>) -> Self {
        Self { boot_file, next }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadEventSource {
    Firmware,
    Shim,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EfiImage {
    File(PathBuf),
    Contained { container: PathBuf, file_name: PathBuf },
}

impl EfiImage {
    pub fn read<R: ContainerReader + ?Sized>(&self, reader: &R) -> Result<Vec<u8>> {
        match self {
            EfiImage::File(path) => Ok(fs::read(path)?),
            EfiImage::Contained {
                container,
                file_name,
            } => reader.read_file(container, file_name),
        }
    }
}

impl fmt::Display for EfiImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EfiImage::File(path) => write!(f, "{}", path.display()),
            EfiImage::Contained {
                container,
                file_name,
            } => write!(f, "{}:{}", container.display(), file_name.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadEvent {
    pub source: LoadEventSource,
    pub image: EfiImage,
    pub next: Vec<LoadEvent>,
}

impl LoadEvent {
    /// Every root to leaf sequence of images.
    pub fn paths(&self) -> Vec<Vec<&EfiImage>> {
        if self.next.is_empty() {
            return vec![vec![&self.image]];
        }
        self.next
            .iter()
            .flat_map(|child| child.paths())
            .map(|tail| {
                let mut path = Vec::with_capacity(tail.len() + 1);
                path.push(&self.image);
                path.extend(tail);
                path
            })
            .collect()
    }
}

fn efi_image(boot_file: &BootFile) -> Result<EfiImage> {
    match &boot_file.snap {
        None => {
            if !boot_file.path.exists() {
                return Err(BootError::MissingImage(boot_file.path.clone()));
            }
            Ok(EfiImage::File(boot_file.path.clone()))
        }
        Some(snap) => {
            if !snap.exists() {
                return Err(BootError::MissingContainer(snap.clone()));
            }
            Ok(EfiImage::Contained {
                container: snap.clone(),
                file_name: boot_file.path.clone(),
            })
        }
    }
}

fn load_event(chain: &LoadChain, source: LoadEventSource) -> Result<LoadEvent> {
    let next = chain
        .next
        .iter()
        .map(|child| load_event(child, LoadEventSource::Shim))
        .collect::<Result<Vec<_>>>()?;
    Ok(LoadEvent {
        source,
        image: efi_image(&chain.boot_file)?,
        next,
    })
}

pub fn build_load_sequences(chains: &[LoadChain]) -> Result<Vec<LoadEvent>> {
    chains
        .iter()
        .map(|chain| load_event(chain, LoadEventSource::Firmware))
        .collect()
}

pub trait ContainerReader {
    fn read_file(&self, container: &Path, file_name: &Path) -> Result<Vec<u8>>;
}

/// Reads files out of squashfs snaps with `unsquashfs -cat`.
#[derive(Debug, Clone)]
pub struct Unsquashfs {
    binary: PathBuf,
}

impl Default for Unsquashfs {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("unsquashfs"),
        }
    }
}

impl Unsquashfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary<P: Into<PathBuf>>(mut self, binary: P) -> Self {
        self.binary = binary.into();
        self
    }
}

impl ContainerReader for Unsquashfs {
    fn read_file(&self, container: &Path, file_name: &Path) -> Result<Vec<u8>> {
        let output = Command::new(&self.binary)
            .args(["-n", "-cat"])
            .arg(container)
            .arg(file_name)
            .output()?;
        if !output.status.success() {
            return Err(BootError::ContainerRead {
                container: container.to_path_buf(),
                file_name: file_name.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}
