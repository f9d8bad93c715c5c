//! # Encrypted root device preparation
//!
//! Formats a block device as a LUKS volume and opens it, so that the mapped
//! device can serve as the source of the base root mount.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::Task;

/// The encryption management tool.
pub const CRYPTSETUP: &str = "cryptsetup";
/// Directory holding opened mapped devices.
pub const MAPPER_DIR: &str = "/dev/mapper";

/// A secret unlock passphrase; never shown by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Passphrase(String);

impl Passphrase {
    /// Wrap a secret.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The secret, as written to the tool's standard input.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// One credential of the encrypted volume.
///
/// With neither a passphrase nor a key file, the tool prompts on the
/// terminal. Both may be given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KeySlot {
    /// LUKS key slot index
    pub slot: u32,
    /// Passphrase, piped to the tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<Passphrase>,
    /// Key file passed via `--key-file`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<Utf8PathBuf>,
}

impl KeySlot {
    fn unlock_args(&self) -> impl Iterator<Item = String> + '_ {
        self.key_file
            .iter()
            .flat_map(|k| ["--key-file".to_string(), k.to_string()])
    }
}

/// The capability to run an external program.
pub trait CommandRunner: std::fmt::Debug {
    /// Run `exe` with `args`, failing unless it exits successfully.
    ///
    /// When `stdin` is `None` the program shares the caller's standard input,
    /// so it can prompt interactively.
    fn run(
        &self,
        description: &str,
        exe: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> anyhow::Result<()>;
}

/// Runs programs on the host.
#[derive(Debug, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(
        &self,
        description: &str,
        exe: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        let t = Task::new(description, exe).args(args);
        match stdin {
            Some(buf) => t.run_with_stdin_buf(Some(buf)),
            None => t.interactive().run(),
        }
    }
}

fn validate_mapped_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::config(format!("Invalid mapped device name {name:?}")));
    }
    Ok(())
}

/// Format `device` as an encrypted volume with the first of `slots`, then
/// open it as `mapped_name`, returning the mapped device path.
///
/// Only the first slot is enrolled; any further slots are ignored.
pub fn prepare_device(
    runner: &dyn CommandRunner,
    device: &Utf8Path,
    mapped_name: &str,
    slots: &[KeySlot],
) -> Result<Utf8PathBuf> {
    let Some((slot, rest)) = slots.split_first() else {
        return Err(Error::config(format!(
            "At least one key slot is required to encrypt {device}"
        )));
    };
    if device.as_str().is_empty() {
        return Err(Error::config("Empty device path"));
    }
    validate_mapped_name(mapped_name)?;
    if !rest.is_empty() {
        tracing::warn!("Ignoring {} additional key slot(s) for {device}", rest.len());
    }
    let stdin = slot.passphrase.as_ref().map(|p| p.as_bytes());

    let description = format!("Encrypting {device}");
    let mut args = vec![
        "luksFormat".to_string(),
        "--key-slot".to_string(),
        slot.slot.to_string(),
        device.to_string(),
        "-".to_string(),
    ];
    args.extend(slot.unlock_args());
    tracing::debug!("Formatting {device} with key slot {}", slot.slot);
    runner
        .run(&description, CRYPTSETUP, &args, stdin)
        .map_err(|e| Error::Subprocess {
            description,
            source: e.into(),
        })?;

    let description = format!("Opening {device} as {mapped_name}");
    let mut args = vec!["open".to_string(), device.to_string(), mapped_name.to_string()];
    args.extend(slot.unlock_args());
    runner
        .run(&description, CRYPTSETUP, &args, stdin)
        .map_err(|e| Error::Subprocess {
            description,
            source: e.into(),
        })?;

    let mapped = Utf8Path::new(MAPPER_DIR).join(mapped_name);
    tracing::info!("Opened {device} as {mapped}");
    Ok(mapped)
}

/// The serialized `[encryption]` section: the root device to set up before assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EncryptionSpec {
    /// The block device to format
    pub device: Utf8PathBuf,
    /// Name of the opened device below `/dev/mapper`
    pub mapped_name: String,
    /// Credentials; the first one is enrolled
    #[serde(default)]
    pub key_slots: Vec<KeySlot>,
}

impl EncryptionSpec {
    /// Run [`prepare_device`] for this specification.
    pub fn prepare(&self, runner: &dyn CommandRunner) -> Result<Utf8PathBuf> {
        prepare_device(runner, &self.device, &self.mapped_name, &self.key_slots)
    }
}
