//! # Root filesystem assembly
//!
//! Builds the writable root tree from the read-only base in a fixed order:
//!
//! 1. A transient store (tmpfs) is mounted at [`OVERLAY_DIR`].
//! 2. Each configured rw path gets an overlay whose upper and work
//!    directories live in that store.
//! 3. Auxiliary volumes are mounted by label.
//! 4. Each persistent path is copied (once) into the persistent-state
//!    directory and bind mounted back into place.
//! 5. An fstab describing all of the above is written into the tree.
//!
//! There is no rollback: when a step fails, earlier mounts stay in place for
//! inspection from a recovery shell.

use std::fmt::Display;
use std::os::unix::fs::PermissionsExt as _;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::{Dir, Permissions};
use cap_std_ext::dirext::CapStdExtDirExt;
use strata_utils::fstab_line;

use crate::entry::{
    relative_to_root, BindEntry, Environment, MountEntry, OverlayEntry, VolumeEntry,
    OVERLAY_FSTYPE,
};
use crate::error::{Error, Result};
use crate::mount::{join_under, Mounter};
use crate::spec::MountSpec;

/// Mount point of the transient overlay store.
pub const OVERLAY_DIR: &str = "/run/overlay";
/// Location of the generated fstab, relative to the assembled tree.
pub const FSTAB_PATH: &str = "etc/fstab";
const FSTAB_MODE: u32 = 0o644;

/// Progress of an assembly run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStage {
    /// Nothing has been done yet
    Init,
    /// The overlay store is mounted
    BackingStoreMounted,
    /// All rw paths are overlaid
    OverlaysApplied,
    /// All volumes are mounted
    VolumesApplied,
    /// All persistent paths are bind mounted
    StateApplied,
    /// The fstab was written; assembly succeeded
    FstabWritten,
    /// A step failed; mounts made before the failure are left in place
    Failed,
}

impl Display for AssemblyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssemblyStage::Init => "init",
            AssemblyStage::BackingStoreMounted => "backing-store-mounted",
            AssemblyStage::OverlaysApplied => "overlays-applied",
            AssemblyStage::VolumesApplied => "volumes-applied",
            AssemblyStage::StateApplied => "state-applied",
            AssemblyStage::FstabWritten => "fstab-written",
            AssemblyStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The mount entries of a specification, grouped in mount order.
#[derive(Debug, Default)]
pub struct Plan {
    /// One overlay per rw path
    pub overlays: Vec<MountEntry>,
    /// One mount per volume
    pub volumes: Vec<MountEntry>,
    /// One bind mount per persistent path
    pub state: Vec<MountEntry>,
}

impl Plan {
    /// Build the plan for a validated specification.
    pub fn new(spec: &MountSpec, overlay_root: &Utf8Path) -> Self {
        let base = &spec.mountpoint;
        let overlays = spec
            .rw_paths
            .iter()
            .map(|path| {
                MountEntry::Overlay(OverlayEntry {
                    path: path.clone(),
                    base: base.clone(),
                    store_root: overlay_root.to_owned(),
                    fstype: OVERLAY_FSTYPE.to_string(),
                })
            })
            .collect();
        let volumes = spec
            .volumes
            .iter()
            .map(|v| {
                MountEntry::Volume(VolumeEntry {
                    label: v.label.clone(),
                    mountpoint: v.mountpoint.clone(),
                    base: base.clone(),
                })
            })
            .collect();
        let state = spec
            .persistent_state_paths
            .iter()
            .map(|path| {
                MountEntry::Bind(BindEntry {
                    path: path.clone(),
                    base: base.clone(),
                    store_root: spec.persistent_state_target.clone(),
                })
            })
            .collect();
        Self {
            overlays,
            volumes,
            state,
        }
    }
}

/// Drives one assembly run against injected capabilities.
#[derive(Debug)]
pub struct Assembler<'a> {
    spec: MountSpec,
    env: Environment<'a>,
    overlay_root: Utf8PathBuf,
    stage: AssemblyStage,
    fstab: Vec<String>,
}

impl<'a> Assembler<'a> {
    /// Create an assembler; `root` is the directory absolute paths resolve in
    /// (normally `/`) and `mounter` performs the mounts.
    pub fn new(spec: MountSpec, root: &'a Dir, mounter: &'a dyn Mounter) -> Self {
        Self {
            spec,
            env: Environment::new(root, mounter),
            overlay_root: OVERLAY_DIR.into(),
            stage: AssemblyStage::Init,
            fstab: Vec::new(),
        }
    }

    /// Current progress.
    pub fn stage(&self) -> AssemblyStage {
        self.stage
    }

    /// Run the whole assembly and return the fstab lines that were written.
    ///
    /// This may only be called once per assembler.
    pub fn assemble(&mut self) -> Result<Vec<String>> {
        if self.stage != AssemblyStage::Init {
            return Err(Error::config(format!(
                "Assembly already ran (stage: {})",
                self.stage
            )));
        }
        match self.run() {
            Ok(()) => Ok(self.fstab.clone()),
            Err(e) => {
                tracing::error!("Assembly failed after stage {}: {e}", self.stage);
                self.stage = AssemblyStage::Failed;
                Err(e)
            }
        }
    }

    fn advance(&mut self, next: AssemblyStage) {
        tracing::info!("Assembly stage: {} -> {next}", self.stage);
        self.stage = next;
    }

    fn apply(&mut self, entries: &[MountEntry]) -> Result<()> {
        for entry in entries {
            tracing::debug!("Applying {}", entry.target());
            entry.mount(&self.env)?;
            self.fstab.push(entry.fstab_line());
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        // Validation, including storage name collisions, happens before anything is mounted.
        self.spec = self.spec.clone().validate()?;
        let plan = Plan::new(&self.spec, &self.overlay_root);

        self.mount_backing_store()?;
        self.advance(AssemblyStage::BackingStoreMounted);

        self.apply(&plan.overlays)?;
        self.advance(AssemblyStage::OverlaysApplied);

        self.apply(&plan.volumes)?;
        self.advance(AssemblyStage::VolumesApplied);

        if !plan.state.is_empty() {
            let state_root = join_under(&self.spec.mountpoint, &self.spec.persistent_state_target);
            self.env.create_dir(&state_root)?;
        }
        self.apply(&plan.state)?;
        self.advance(AssemblyStage::StateApplied);

        self.write_fstab()?;
        self.advance(AssemblyStage::FstabWritten);
        Ok(())
    }

    fn mount_backing_store(&mut self) -> Result<()> {
        let overlay = &self.spec.overlay;
        let fstype = overlay.fstype.as_str();
        let options = overlay.mount_options();
        self.env.create_dir(&self.overlay_root)?;
        self.env
            .mount(fstype, &self.overlay_root, fstype, &options)?;

        let root_perm = self.spec.root_perm.to_string();
        self.fstab.push(fstab_line([
            self.spec.root_device.as_str(),
            "/",
            "auto",
            root_perm.as_str(),
            "0",
            "0",
        ]));
        let options = options.join(",");
        self.fstab.push(fstab_line([
            fstype,
            self.overlay_root.as_str(),
            fstype,
            options.as_str(),
            "0",
            "0",
        ]));
        Ok(())
    }

    fn write_fstab(&self) -> Result<()> {
        let path = self.spec.mountpoint.join(FSTAB_PATH);
        tracing::debug!("Writing {path}");
        let contents = self.fstab.join("\n");
        let perms = Permissions::from_std(std::fs::Permissions::from_mode(FSTAB_MODE));
        self.env
            .root()
            .atomic_write_with_perms(relative_to_root(&path), contents, perms)
            .map_err(|source| Error::Persist { path, source })
    }
}
