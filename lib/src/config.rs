//! # Configuration for `strata mount-rootfs`
//!
//! This module handles the TOML drop-in fragments stored in
//! `strata/rootfs.d` (e.g. `/etc/strata/rootfs.d/10-custom.toml`).

use std::path::Path;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::encrypt::EncryptionSpec;
use crate::spec::{MountSpec, OverlaySpec, RootPermission, VolumeSpec};

/// Directories scanned for configuration fragments, lowest priority first.
const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];
/// Location of the fragments below each base directory.
const CONFIG_SUBDIR: &str = "strata/rootfs.d";

/// The toplevel structure of a configuration fragment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct ConfigurationToplevel {
    pub(crate) mount: Option<MountConfiguration>,
    pub(crate) encryption: Option<EncryptionSpec>,
}

/// The serialized `[mount]` section; unset fields keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename = "mount", rename_all = "kebab-case")]
pub struct MountConfiguration {
    /// Base root image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Utf8PathBuf>,
    /// Where the tree is assembled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<Utf8PathBuf>,
    /// Permission of the base root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_perm: Option<RootPermission>,
    /// Source of the root fstab line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_device: Option<String>,
    /// Whether to switch root afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switch_root: Option<bool>,
    /// Overlay backing store, e.g. `tmpfs:25%`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlaySpec>,
    /// Paths overlaid writable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rw_paths: Option<Vec<Utf8PathBuf>>,
    /// Volumes, e.g. `LABEL=COS_OEM:/oem`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeSpec>>,
    /// Paths kept on persistent storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_state_paths: Option<Vec<Utf8PathBuf>>,
    /// Use bind mounts for persistent state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_state_bind: Option<bool>,
    /// Directory holding persistent state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_state_target: Option<Utf8PathBuf>,
}

fn mergeopt<T>(s: &mut Option<T>, o: Option<T>) {
    if let Some(o) = o {
        *s = Some(o);
    }
}

impl MountConfiguration {
    /// Apply any values in other, overriding any existing values in `self`.
    /// Lists are replaced, not extended.
    pub fn merge(&mut self, other: Self) {
        mergeopt(&mut self.image, other.image);
        mergeopt(&mut self.mountpoint, other.mountpoint);
        mergeopt(&mut self.root_perm, other.root_perm);
        mergeopt(&mut self.root_device, other.root_device);
        mergeopt(&mut self.switch_root, other.switch_root);
        mergeopt(&mut self.overlay, other.overlay);
        mergeopt(&mut self.rw_paths, other.rw_paths);
        mergeopt(&mut self.volumes, other.volumes);
        mergeopt(&mut self.persistent_state_paths, other.persistent_state_paths);
        mergeopt(&mut self.persistent_state_bind, other.persistent_state_bind);
        mergeopt(
            &mut self.persistent_state_target,
            other.persistent_state_target,
        );
    }

    /// Overwrite the fields of `spec` that are set here.
    pub fn apply(self, spec: &mut MountSpec) {
        fn set<T>(s: &mut T, o: Option<T>) {
            if let Some(o) = o {
                *s = o;
            }
        }
        set(&mut spec.image, self.image);
        set(&mut spec.mountpoint, self.mountpoint);
        set(&mut spec.root_perm, self.root_perm);
        set(&mut spec.root_device, self.root_device);
        set(&mut spec.switch_root, self.switch_root);
        set(&mut spec.overlay, self.overlay);
        set(&mut spec.rw_paths, self.rw_paths);
        set(&mut spec.volumes, self.volumes);
        set(&mut spec.persistent_state_paths, self.persistent_state_paths);
        set(&mut spec.persistent_state_bind, self.persistent_state_bind);
        set(&mut spec.persistent_state_target, self.persistent_state_target);
    }
}

/// The merged result of all configuration fragments.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    /// Mount layout overrides
    pub mount: MountConfiguration,
    /// Encrypted root device to prepare first, if any
    pub encryption: Option<EncryptionSpec>,
}

impl Configuration {
    fn merge(&mut self, other: ConfigurationToplevel) {
        if let Some(mount) = other.mount {
            tracing::debug!("Merging mount config: {mount:?}");
            self.mount.merge(mount);
        }
        // The encryption table is replaced as a whole
        mergeopt(&mut self.encryption, other.encryption);
    }
}

/// Parse one fragment, warning about unknown keys.
fn parse_fragment(buf: &str, path: &Path) -> Result<ConfigurationToplevel> {
    let mut unused = std::collections::BTreeSet::new();
    let de = toml::Deserializer::new(buf);
    let c: ConfigurationToplevel = serde_ignored::deserialize(de, |p| {
        unused.insert(p.to_string());
    })
    .with_context(|| format!("Parsing {path:?}"))?;
    for key in unused {
        tracing::warn!("{path:?}: Unknown key {key}");
    }
    Ok(c)
}

#[context("Loading configuration")]
/// Load the configuration, merging all found fragments in order.
/// Having no fragments at all is fine; the built-in defaults apply.
pub(crate) fn load_config() -> Result<Configuration> {
    let fragments = liboverdrop::scan(
        SYSTEMD_CONVENTIONAL_BASES,
        CONFIG_SUBDIR,
        &["toml"],
        true,
    );
    let mut config = Configuration::default();
    for (_name, path) in fragments {
        let buf = std::fs::read_to_string(&path).with_context(|| format!("Reading {path:?}"))?;
        config.merge(parse_fragment(&buf, &path)?);
    }
    Ok(config)
}
