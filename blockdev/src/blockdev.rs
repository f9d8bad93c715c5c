//! Block device helpers: inspection via `lsblk` and stable device paths.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

/// The udev-maintained directory of filesystem label symlinks.
pub const BY_LABEL_DIR: &str = "/dev/disk/by-label";

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk`.
#[derive(Debug, Deserialize)]
pub struct Device {
    /// Kernel name, e.g. `vda4`
    pub name: String,
    /// Filesystem label, if any
    pub label: Option<String>,
    /// Detected filesystem or signature type, e.g. `xfs` or `crypto_LUKS`
    pub fstype: Option<String>,
    /// Partitions and holders
    pub children: Option<Vec<Device>>,
}

impl Device {
    /// Path to the device node.
    pub fn path(&self) -> String {
        // RHEL8's lsblk doesn't have PATH, so we do it
        format!("/dev/{}", &self.name)
    }

    /// Whether the device has partitions or holders.
    pub fn has_children(&self) -> bool {
        self.children.as_ref().map_or(false, |v| !v.is_empty())
    }

    /// A device is blank if it carries neither a signature nor children.
    pub fn is_blank(&self) -> bool {
        self.fstype.is_none() && !self.has_children()
    }
}

fn parse_lsblk(buf: &[u8]) -> Result<Vec<Device>> {
    let devs: DevicesOutput = serde_json::from_slice(buf).context("Parsing lsblk output")?;
    Ok(devs.blockdevices)
}

/// Inspect a single device with `lsblk`.
#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    tracing::debug!("Inspecting {dev}");
    let o = Command::new("lsblk")
        .args(["-J", "-o", "NAME,LABEL,FSTYPE"])
        .arg(dev.as_str())
        .output()?;
    if !o.status.success() {
        anyhow::bail!("lsblk {dev} failed: {:?}", o.status);
    }
    parse_lsblk(&o.stdout)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

/// Return the `/dev/disk/by-label` path udev creates for a filesystem label.
///
/// udev replaces bytes which are unsafe in a device node name with a `\xNN`
/// escape; multi-byte UTF-8 sequences are kept as-is.
pub fn by_label_path(label: &str) -> Utf8PathBuf {
    let mut encoded = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() || "#+-.:=@_".contains(c) || !c.is_ascii() {
            encoded.push(c);
        } else {
            encoded.push_str(&format!("\\x{:02x}", c as u32));
        }
    }
    Utf8Path::new(BY_LABEL_DIR).join(encoded)
}
