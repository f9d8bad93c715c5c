//! The units of work of an assembly run.
//!
//! Each [`MountEntry`] knows how to mount itself against an [`Environment`]
//! and how to describe the same mount as an fstab line, so that the layout
//! can be recreated unattended after switch-root.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::{Dir, DirBuilder, DirBuilderExt as _};
use strata_utils::fstab_line;

use crate::error::{Error, Result};
use crate::mount::{join_under, Mounter};
use crate::naming::{derive_storage_name, StorageKind};

/// Permission mode of every directory created during assembly.
pub const DIR_PERM: u32 = 0o755;

/// Filesystem type of the per-path overlays.
pub const OVERLAY_FSTYPE: &str = "overlay";

/// Convert an absolute path into one relative to a root directory handle.
pub(crate) fn relative_to_root(path: &Utf8Path) -> &str {
    match path.as_str().trim_start_matches('/') {
        "" => ".",
        p => p,
    }
}

/// The capabilities a mount entry operates with: a handle on the host root
/// directory, and the ability to mount.
#[derive(Debug)]
pub struct Environment<'a> {
    root: &'a Dir,
    mounter: &'a dyn Mounter,
}

impl<'a> Environment<'a> {
    /// Create an environment; all absolute paths are resolved below `root`.
    pub fn new(root: &'a Dir, mounter: &'a dyn Mounter) -> Self {
        Self { root, mounter }
    }

    pub(crate) fn root(&self) -> &Dir {
        self.root
    }

    /// Create `path` and any missing parents; an existing directory is not an error.
    pub fn create_dir(&self, path: &Utf8Path) -> Result<()> {
        tracing::debug!("Creating {path}");
        let mut db = DirBuilder::new();
        db.recursive(true);
        db.mode(DIR_PERM);
        self.root
            .create_dir_with(relative_to_root(path), &db)
            .map_err(|source| Error::DirectoryCreation {
                path: path.to_owned(),
                source,
            })
    }

    /// Mount through the injected [`Mounter`].
    pub fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fstype: &str,
        options: &[String],
    ) -> Result<()> {
        tracing::debug!("Mounting {source} on {target} ({fstype}, {})", options.join(","));
        self.mounter
            .mount(source, target, fstype, options)
            .map_err(|e| Error::Mount {
                target: target.to_owned(),
                source: e.into(),
            })
    }
}

/// A writable overlay over one path of the base root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    /// Path inside the assembled tree, e.g. `/etc`
    pub path: Utf8PathBuf,
    /// Where the tree is assembled, e.g. `/sysroot`
    pub base: Utf8PathBuf,
    /// Root of the transient overlay store
    pub store_root: Utf8PathBuf,
    /// Filesystem type to mount
    pub fstype: String,
}

impl OverlayEntry {
    fn storage_dir(&self) -> Utf8PathBuf {
        self.store_root
            .join(derive_storage_name(self.path.as_str(), StorageKind::Overlay))
    }

    /// The writable layer.
    pub fn upper(&self) -> Utf8PathBuf {
        self.storage_dir().join("upper")
    }

    /// The overlayfs scratch directory.
    pub fn work(&self) -> Utf8PathBuf {
        self.storage_dir().join("work")
    }

    /// The original content, which is also the mount target.
    pub fn lower(&self) -> Utf8PathBuf {
        join_under(&self.base, &self.path)
    }

    fn options(&self) -> Vec<String> {
        vec![
            "defaults".to_string(),
            format!("lowerdir={}", self.lower()),
            format!("upperdir={}", self.upper()),
            format!("workdir={}", self.work()),
        ]
    }

    fn mount(&self, env: &Environment) -> Result<()> {
        let merged = self.lower();
        env.create_dir(&self.upper())?;
        env.create_dir(&self.work())?;
        env.create_dir(&merged)?;
        // The overlay is stacked in place on top of the existing content
        env.mount(&self.fstype, &merged, &self.fstype, &self.options())
    }

    fn fstab_line(&self) -> String {
        let lower = self.lower();
        let options = self.options().join(",");
        fstab_line([
            lower.as_str(),
            self.path.as_str(),
            self.fstype.as_str(),
            options.as_str(),
        ])
    }
}

/// A path whose content lives on persistent storage and is bind mounted back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindEntry {
    /// Path inside the assembled tree, e.g. `/home`
    pub path: Utf8PathBuf,
    /// Where the tree is assembled
    pub base: Utf8PathBuf,
    /// Root of the persistent-state store, inside the tree
    pub store_root: Utf8PathBuf,
}

impl BindEntry {
    /// The persistent directory, as seen from inside the tree.
    pub fn state_dir(&self) -> Utf8PathBuf {
        self.store_root
            .join(derive_storage_name(self.path.as_str(), StorageKind::Bind))
    }

    fn mount(&self, env: &Environment) -> Result<()> {
        let target = join_under(&self.base, &self.path);
        let state_dir = join_under(&self.base, &self.state_dir());
        env.create_dir(&target)?;
        env.create_dir(&state_dir)?;
        self.migrate(env, &target, &state_dir)?;
        env.mount(
            state_dir.as_str(),
            &target,
            "none",
            &["defaults".to_string(), "bind".to_string()],
        )
    }

    /// Seed an empty state directory with the current content of the path.
    /// A populated state directory is left alone, so earlier history wins.
    fn migrate(&self, env: &Environment, target: &Utf8Path, state_dir: &Utf8Path) -> Result<()> {
        let err = |source| Error::StateMigration {
            path: state_dir.to_owned(),
            source,
        };
        let (Some(store), Some(name)) = (state_dir.parent(), state_dir.file_name()) else {
            return Err(Error::config(format!("Invalid state directory {state_dir}")));
        };
        let store = env.root().open_dir(relative_to_root(store)).map_err(err)?;
        let src = env.root().open_dir(relative_to_root(target)).map_err(err)?;
        let exclude = join_under(&self.base, &self.store_root);
        tracing::debug!("Seeding {state_dir} from {target}");
        let copied = crate::migrate::seed_state_dir(
            &store,
            name,
            &src,
            target.as_std_path(),
            exclude.as_std_path(),
        )
        .map_err(err)?;
        if !copied {
            tracing::debug!("{state_dir} already populated");
        }
        Ok(())
    }

    fn fstab_line(&self) -> String {
        let state_dir = self.state_dir();
        fstab_line([
            state_dir.as_str(),
            self.path.as_str(),
            "none",
            "defaults,bind",
        ])
    }
}

/// A block device mounted by filesystem label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    /// Filesystem label
    pub label: String,
    /// Mount point inside the tree
    pub mountpoint: Utf8PathBuf,
    /// Where the tree is assembled
    pub base: Utf8PathBuf,
}

impl VolumeEntry {
    /// The device node udev maintains for the label.
    pub fn device(&self) -> Utf8PathBuf {
        strata_blockdev::by_label_path(&self.label)
    }

    fn mount(&self, env: &Environment) -> Result<()> {
        let target = join_under(&self.base, &self.mountpoint);
        env.create_dir(&target)?;
        env.mount(
            self.device().as_str(),
            &target,
            "auto",
            &["defaults".to_string()],
        )
    }

    fn fstab_line(&self) -> String {
        let device = self.device();
        fstab_line([device.as_str(), self.mountpoint.as_str(), "auto", "defaults"])
    }
}

/// One mount of the assembled tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEntry {
    /// A transient writable overlay
    Overlay(OverlayEntry),
    /// Persistent state bind mounted into place
    Bind(BindEntry),
    /// An auxiliary device
    Volume(VolumeEntry),
}

impl MountEntry {
    /// The path inside the tree this entry mounts on.
    pub fn target(&self) -> &Utf8Path {
        match self {
            MountEntry::Overlay(o) => &o.path,
            MountEntry::Bind(b) => &b.path,
            MountEntry::Volume(v) => &v.mountpoint,
        }
    }

    /// Perform the mount, creating any directories it needs first.
    pub fn mount(&self, env: &Environment) -> Result<()> {
        match self {
            MountEntry::Overlay(o) => o.mount(env),
            MountEntry::Bind(b) => b.mount(env),
            MountEntry::Volume(v) => v.mount(env),
        }
    }

    /// Render the equivalent fstab line (source, target, type, options).
    pub fn fstab_line(&self) -> String {
        match self {
            MountEntry::Overlay(o) => o.fstab_line(),
            MountEntry::Bind(b) => b.fstab_line(),
            MountEntry::Volume(v) => v.fstab_line(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use cap_std_ext::{cap_std, cap_tempfile};

    /// One recorded call to [`RecordingMounter`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct MountCall {
        pub(crate) source: String,
        pub(crate) target: Utf8PathBuf,
        pub(crate) fstype: String,
        pub(crate) options: Vec<String>,
    }

    /// Records mounts; optionally fails the mount with the given index.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingMounter {
        pub(crate) calls: Mutex<Vec<MountCall>>,
        pub(crate) fail_at: Option<usize>,
    }

    impl RecordingMounter {
        pub(crate) fn failing_at(n: usize) -> Self {
            Self {
                fail_at: Some(n),
                ..Default::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<MountCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Mounter for RecordingMounter {
        fn mount(
            &self,
            source: &str,
            target: &Utf8Path,
            fstype: &str,
            options: &[String],
        ) -> anyhow::Result<()> {
            let mut calls = self.calls.lock().unwrap();
            let idx = calls.len();
            calls.push(MountCall {
                source: source.to_string(),
                target: target.to_owned(),
                fstype: fstype.to_string(),
                options: options.to_vec(),
            });
            if self.fail_at == Some(idx) {
                anyhow::bail!("mount {target}: permission denied");
            }
            Ok(())
        }
    }

    fn overlay(path: &str) -> OverlayEntry {
        OverlayEntry {
            path: path.into(),
            base: "/sysroot".into(),
            store_root: "/run/overlay".into(),
            fstype: OVERLAY_FSTYPE.to_string(),
        }
    }

    #[test]
    fn test_overlay_fstab_line() {
        let e = MountEntry::Overlay(overlay("/etc"));
        similar_asserts::assert_eq!(
            e.fstab_line(),
            "/sysroot/etc\t/etc\toverlay\tdefaults,lowerdir=/sysroot/etc,upperdir=/run/overlay/etc.overlay/upper,workdir=/run/overlay/etc.overlay/work"
        );
        let e = overlay("/var/lib/rancher");
        assert_eq!(e.upper(), "/run/overlay/var-lib-rancher.overlay/upper");
    }

    #[test]
    fn test_bind_fstab_line() {
        let e = MountEntry::Bind(BindEntry {
            path: "/home".into(),
            base: "/sysroot".into(),
            store_root: "/usr/local/.state".into(),
        });
        assert_eq!(
            e.fstab_line(),
            "/usr/local/.state/home.bind\t/home\tnone\tdefaults,bind"
        );
    }

    #[test]
    fn test_volume_fstab_line() {
        let e = MountEntry::Volume(VolumeEntry {
            label: "COS_OEM".into(),
            mountpoint: "/oem".into(),
            base: "/sysroot".into(),
        });
        assert_eq!(e.target(), "/oem");
        assert_eq!(
            e.fstab_line(),
            "/dev/disk/by-label/COS_OEM\t/oem\tauto\tdefaults"
        );
    }

    #[test]
    fn test_create_dir_idempotent() -> anyhow::Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let mounter = RecordingMounter::default();
        let env = Environment::new(&td, &mounter);
        let p = Utf8Path::new("/run/overlay/etc.overlay/upper");
        env.create_dir(p)?;
        env.create_dir(p)?;
        assert!(td.is_dir("run/overlay/etc.overlay/upper"));
        Ok(())
    }

    #[test]
    fn test_overlay_mount() -> anyhow::Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let mounter = RecordingMounter::default();
        let env = Environment::new(&td, &mounter);
        MountEntry::Overlay(overlay("/etc")).mount(&env)?;
        assert!(td.is_dir("run/overlay/etc.overlay/upper"));
        assert!(td.is_dir("run/overlay/etc.overlay/work"));
        assert!(td.is_dir("sysroot/etc"));
        let calls = mounter.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].source, "overlay");
        assert_eq!(calls[0].target, "/sysroot/etc");
        assert_eq!(calls[0].fstype, "overlay");
        assert_eq!(
            calls[0].options,
            [
                "defaults",
                "lowerdir=/sysroot/etc",
                "upperdir=/run/overlay/etc.overlay/upper",
                "workdir=/run/overlay/etc.overlay/work"
            ]
        );
        Ok(())
    }

    #[test]
    fn test_bind_mount_migrates_once() -> anyhow::Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.create_dir_all("sysroot/home/user")?;
        td.write("sysroot/home/user/.profile", "v1")?;
        let mounter = RecordingMounter::default();
        let env = Environment::new(&td, &mounter);
        let e = MountEntry::Bind(BindEntry {
            path: "/home".into(),
            base: "/sysroot".into(),
            store_root: "/usr/local/.state".into(),
        });
        e.mount(&env)?;
        assert_eq!(
            td.read_to_string("sysroot/usr/local/.state/home.bind/user/.profile")?,
            "v1"
        );
        let calls = mounter.calls();
        assert_eq!(calls[0].source, "/sysroot/usr/local/.state/home.bind");
        assert_eq!(calls[0].target, "/sysroot/home");
        assert_eq!(calls[0].fstype, "none");
        assert_eq!(calls[0].options, ["defaults", "bind"]);

        // A second assembly keeps the persisted content
        td.write("sysroot/home/user/.profile", "v2")?;
        e.mount(&env)?;
        assert_eq!(
            td.read_to_string("sysroot/usr/local/.state/home.bind/user/.profile")?,
            "v1"
        );
        Ok(())
    }

    #[test]
    fn test_bind_excludes_state_store() -> anyhow::Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.create_dir_all("sysroot/usr/local/bin")?;
        td.write("sysroot/usr/local/bin/tool", "#!/bin/sh")?;
        let mounter = RecordingMounter::default();
        let env = Environment::new(&td, &mounter);
        MountEntry::Bind(BindEntry {
            path: "/usr/local".into(),
            base: "/sysroot".into(),
            store_root: "/usr/local/.state".into(),
        })
        .mount(&env)?;
        let state = "sysroot/usr/local/.state/usr-local.bind";
        assert!(td.is_file(format!("{state}/bin/tool")));
        assert!(!td.exists(format!("{state}/.state")));
        Ok(())
    }

    #[test]
    fn test_bind_redoes_interrupted_copy() -> anyhow::Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.create_dir_all("sysroot/opt/app/lib")?;
        td.write("sysroot/opt/app/lib/a.so", "a")?;
        td.write("sysroot/opt/app/lib/b.so", "b")?;
        // A previous run stopped partway through
        td.create_dir_all("sysroot/usr/local/.state/opt.bind")?;
        td.create_dir_all("sysroot/usr/local/.state/opt.bind.tmp/app/lib")?;
        td.write("sysroot/usr/local/.state/opt.bind.tmp/app/lib/a.so", "a")?;
        let mounter = RecordingMounter::default();
        let env = Environment::new(&td, &mounter);
        MountEntry::Bind(BindEntry {
            path: "/opt".into(),
            base: "/sysroot".into(),
            store_root: "/usr/local/.state".into(),
        })
        .mount(&env)?;
        let state = "sysroot/usr/local/.state/opt.bind";
        assert_eq!(td.read_to_string(format!("{state}/app/lib/a.so"))?, "a");
        assert_eq!(td.read_to_string(format!("{state}/app/lib/b.so"))?, "b");
        assert!(!td.exists(format!("{state}.tmp")));
        assert_eq!(mounter.calls().len(), 1);
        Ok(())
    }

    #[test]
    fn test_mount_failure_is_mount_error() -> anyhow::Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let mounter = RecordingMounter::failing_at(0);
        let env = Environment::new(&td, &mounter);
        let e = MountEntry::Volume(VolumeEntry {
            label: "COS_OEM".into(),
            mountpoint: "/oem".into(),
            base: "/sysroot".into(),
        });
        let err = e.mount(&env).unwrap_err();
        match err {
            Error::Mount { target, .. } => assert_eq!(target, "/sysroot/oem"),
            o => panic!("unexpected error {o:?}"),
        }
        Ok(())
    }
}
