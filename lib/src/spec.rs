//! The declarative description of the root filesystem layout.

use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::anyhow;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::naming::{check_collisions, StorageKind};

/// Default base image, relative to the state partition.
pub const DEFAULT_IMAGE: &str = "/cOS/active.img";
/// Default directory the root tree is assembled under.
pub const DEFAULT_MOUNTPOINT: &str = "/sysroot";
/// Default source of the root line in the generated fstab.
pub const DEFAULT_ROOT_DEVICE: &str = "/dev/loop0";
/// Default overlay backing store.
pub const DEFAULT_OVERLAY: &str = "tmpfs:25%";
/// Default directory (inside the assembled tree) holding persistent state.
pub const DEFAULT_PERSISTENT_STATE_TARGET: &str = "/usr/local/.state";
const DEFAULT_VOLUMES: &[&str] = &["LABEL=COS_OEM:/oem", "LABEL=COS_PERSISTENT:/usr/local"];
const DEFAULT_RW_PATHS: &[&str] = &["/var", "/etc"];
const DEFAULT_PERSISTENT_STATE_PATHS: &[&str] =
    &["/etc", "/root", "/home", "/opt", "/usr/local", "/var"];

/// Whether the base root is mounted read-only or read-write.
#[derive(
    clap::ValueEnum, Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum RootPermission {
    /// Read-only
    #[default]
    Ro,
    /// Read-write
    Rw,
}

impl Display for RootPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RootPermission::Ro => "ro",
            RootPermission::Rw => "rw",
        })
    }
}

/// Filesystem backing the transient overlay store.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum OverlayFsType {
    /// Memory-backed filesystem
    #[default]
    Tmpfs,
}

impl OverlayFsType {
    /// The filesystem type as passed to mount.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayFsType::Tmpfs => "tmpfs",
        }
    }
}

/// Transient overlay backing store, written as `<fstype>:<size>` (e.g. `tmpfs:25%`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OverlaySpec {
    /// Filesystem type of the store
    pub fstype: OverlayFsType,
    /// Size policy, an absolute size or a percentage of RAM
    pub size: String,
}

impl OverlaySpec {
    /// Mount options for the backing store.
    pub fn mount_options(&self) -> Vec<String> {
        vec!["defaults".to_string(), format!("size={}", self.size)]
    }
}

impl Default for OverlaySpec {
    fn default() -> Self {
        // SAFETY: The default is a valid specification
        Self::from_str(DEFAULT_OVERLAY).unwrap()
    }
}

impl FromStr for OverlaySpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (fstype, size) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid overlay {s}; expected <fstype>:<size>"))?;
        let fstype = match fstype {
            "tmpfs" => OverlayFsType::Tmpfs,
            o => anyhow::bail!("Unsupported overlay filesystem type: {o}"),
        };
        if size.is_empty() || size.contains(',') {
            anyhow::bail!("Invalid overlay size in {s}");
        }
        Ok(Self {
            fstype,
            size: size.to_string(),
        })
    }
}

impl TryFrom<String> for OverlaySpec {
    type Error = anyhow::Error;

    fn try_from(value: String) -> anyhow::Result<Self> {
        value.parse()
    }
}

impl From<OverlaySpec> for String {
    fn from(value: OverlaySpec) -> Self {
        value.to_string()
    }
}

impl Display for OverlaySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.fstype.as_str(), self.size)
    }
}

/// An auxiliary block device, written as `LABEL=<label>:<mountpoint>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeSpec {
    /// Filesystem label of the device
    pub label: String,
    /// Mount point relative to the assembled tree
    pub mountpoint: Utf8PathBuf,
}

impl FromStr for VolumeSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let rest = s
            .strip_prefix("LABEL=")
            .ok_or_else(|| anyhow!("Invalid volume {s}; expected LABEL=<label>:<mountpoint>"))?;
        let (label, mountpoint) = rest
            .split_once(':')
            .ok_or_else(|| anyhow!("Missing mountpoint in volume {s}"))?;
        if label.is_empty() || label.contains('/') {
            anyhow::bail!("Invalid label in volume {s}");
        }
        Ok(Self {
            label: label.to_string(),
            mountpoint: mountpoint.into(),
        })
    }
}

impl TryFrom<String> for VolumeSpec {
    type Error = anyhow::Error;

    fn try_from(value: String) -> anyhow::Result<Self> {
        value.parse()
    }
}

impl From<VolumeSpec> for String {
    fn from(value: VolumeSpec) -> Self {
        value.to_string()
    }
}

impl Display for VolumeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LABEL={}:{}", self.label, self.mountpoint)
    }
}

/// The full description of an assembly run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Base read-only root image
    pub image: Utf8PathBuf,
    /// Where the root tree is assembled
    pub mountpoint: Utf8PathBuf,
    /// Permission of the base root mount
    pub root_perm: RootPermission,
    /// Source of the root line in the generated fstab
    pub root_device: String,
    /// Whether the caller pivots into the tree afterwards
    pub switch_root: bool,
    /// Transient overlay backing store
    pub overlay: OverlaySpec,
    /// Paths made writable through an overlay
    pub rw_paths: Vec<Utf8PathBuf>,
    /// Auxiliary devices mounted into the tree
    pub volumes: Vec<VolumeSpec>,
    /// Paths relocated onto persistent storage
    pub persistent_state_paths: Vec<Utf8PathBuf>,
    /// Realize persistent paths via bind mounts
    pub persistent_state_bind: bool,
    /// Directory in the tree holding persistent state
    pub persistent_state_target: Utf8PathBuf,
}

impl Default for MountSpec {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.into(),
            mountpoint: DEFAULT_MOUNTPOINT.into(),
            root_perm: RootPermission::default(),
            root_device: DEFAULT_ROOT_DEVICE.to_string(),
            switch_root: true,
            overlay: OverlaySpec::default(),
            rw_paths: DEFAULT_RW_PATHS.iter().map(|p| Utf8PathBuf::from(*p)).collect(),
            volumes: DEFAULT_VOLUMES
                .iter()
                .map(|v| VolumeSpec::from_str(v))
                .collect::<anyhow::Result<_>>()
                // SAFETY: The defaults are valid specifications
                .unwrap(),
            persistent_state_paths: DEFAULT_PERSISTENT_STATE_PATHS
                .iter()
                .map(|p| Utf8PathBuf::from(*p))
                .collect(),
            persistent_state_bind: true,
            persistent_state_target: DEFAULT_PERSISTENT_STATE_TARGET.into(),
        }
    }
}

/// Normalize a configured path to an absolute path without trailing or
/// repeated separators. `.` and `..` components and the bare root are rejected,
/// as is `,`, which separates mount options.
pub fn normalize_path(p: &Utf8Path) -> Result<Utf8PathBuf> {
    if p.as_str().contains(',') {
        return Err(Error::config(format!("Path {p:?} must not contain ','")));
    }
    let mut r = Utf8PathBuf::from("/");
    for component in p.components() {
        match component {
            Utf8Component::RootDir => {}
            Utf8Component::Normal(c) => r.push(c),
            Utf8Component::CurDir | Utf8Component::ParentDir | Utf8Component::Prefix(_) => {
                return Err(Error::config(format!("Invalid path component in {p}")))
            }
        }
    }
    if r == "/" {
        return Err(Error::config(format!("Path {p:?} must not be the root")));
    }
    Ok(r)
}

/// Paths that end up in overlay `lowerdir=` options must not contain `:`,
/// which separates lower layers.
fn check_overlay_path(p: &Utf8Path) -> Result<()> {
    if p.as_str().contains(':') {
        return Err(Error::config(format!(
            "Overlaid path {p:?} must not contain ':'"
        )));
    }
    Ok(())
}

fn normalize_unique(what: &str, paths: &mut [Utf8PathBuf]) -> Result<()> {
    let mut seen = HashSet::new();
    for p in paths.iter_mut() {
        *p = normalize_path(p)?;
        if !seen.insert(p.clone()) {
            return Err(Error::config(format!("Duplicate {what} entry {p}")));
        }
    }
    Ok(())
}

impl MountSpec {
    /// Normalize all paths and verify the specification can be assembled.
    ///
    /// This runs before anything is mounted, so that a bad configuration
    /// never leaves a partially assembled tree behind.
    pub fn validate(mut self) -> Result<Self> {
        self.mountpoint = normalize_path(&self.mountpoint)?;
        self.persistent_state_target = normalize_path(&self.persistent_state_target)?;
        if self.root_device.is_empty() {
            return Err(Error::config("Empty root device"));
        }
        normalize_unique("rw-paths", &mut self.rw_paths)?;
        if !self.rw_paths.is_empty() {
            check_overlay_path(&self.mountpoint)?;
        }
        for p in self.rw_paths.iter() {
            check_overlay_path(p)?;
        }
        normalize_unique("persistent-state-paths", &mut self.persistent_state_paths)?;
        let mut volume_targets = HashSet::new();
        for volume in self.volumes.iter_mut() {
            if volume.label.is_empty() || volume.label.contains('/') {
                return Err(Error::config(format!("Invalid volume label {:?}", volume.label)));
            }
            volume.mountpoint = normalize_path(&volume.mountpoint)?;
            if !volume_targets.insert(volume.mountpoint.clone()) {
                return Err(Error::config(format!(
                    "Duplicate volume mountpoint {}",
                    volume.mountpoint
                )));
            }
        }
        check_collisions(
            self.rw_paths.iter().map(|p| p.as_path()),
            StorageKind::Overlay,
        )?;
        check_collisions(
            self.persistent_state_paths.iter().map(|p| p.as_path()),
            StorageKind::Bind,
        )?;
        if !self.persistent_state_bind && !self.persistent_state_paths.is_empty() {
            return Err(Error::config(
                "Persistent state is only supported via bind mounts",
            ));
        }
        Ok(self)
    }
}
