//! # Root filesystem assembly CLI
//!
//! Command line tool run from the initramfs to build the writable root tree.

use std::ffi::OsString;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use clap::Parser;
use fn_error_context::context;

use crate::assemble::Assembler;
use crate::config::MountConfiguration;
use crate::encrypt::{prepare_device, HostRunner, KeySlot};
use crate::mount::HostMounter;
use crate::spec::{MountSpec, OverlaySpec, RootPermission, VolumeSpec};
use crate::task::Task;

/// Printed once the tree is assembled.
const READY_MESSAGE: &str = "RootFS mounted, ready for switching root.";

/// Assemble the root tree
#[derive(Debug, Default, Parser)]
pub(crate) struct MountRootfsOpts {
    /// Base read-only root image
    #[clap(long)]
    pub(crate) image: Option<Utf8PathBuf>,

    /// Directory the root tree is assembled under
    #[clap(long)]
    pub(crate) mountpoint: Option<Utf8PathBuf>,

    /// Mount the base root read-only or read-write
    #[clap(long, value_enum)]
    pub(crate) root_perm: Option<RootPermission>,

    /// Device named as the root source in the generated fstab
    #[clap(long)]
    pub(crate) root_device: Option<String>,

    /// Whether the root will be switched into afterwards
    #[clap(long)]
    pub(crate) switch_root: Option<bool>,

    /// Volumes to mount, as `LABEL=<label>:<mountpoint>`
    #[clap(long, value_delimiter = ',')]
    pub(crate) volumes: Vec<VolumeSpec>,

    /// Overlay backing store, as `<fstype>:<size>`
    #[clap(long)]
    pub(crate) overlay: Option<OverlaySpec>,

    /// Paths made writable through an overlay
    #[clap(long, value_delimiter = ',')]
    pub(crate) rw_paths: Vec<Utf8PathBuf>,

    /// Paths kept across boots on persistent storage
    #[clap(long, value_delimiter = ',')]
    pub(crate) persistent_state_paths: Vec<Utf8PathBuf>,

    /// Realize persistent paths with bind mounts
    #[clap(long)]
    pub(crate) persistent_state_bind: Option<bool>,

    /// Directory (inside the tree) holding persistent state
    #[clap(long)]
    pub(crate) persistent_state_target: Option<Utf8PathBuf>,
}

impl From<MountRootfsOpts> for MountConfiguration {
    fn from(o: MountRootfsOpts) -> Self {
        fn nonempty<T>(v: Vec<T>) -> Option<Vec<T>> {
            (!v.is_empty()).then_some(v)
        }
        Self {
            image: o.image,
            mountpoint: o.mountpoint,
            root_perm: o.root_perm,
            root_device: o.root_device,
            switch_root: o.switch_root,
            overlay: o.overlay,
            rw_paths: nonempty(o.rw_paths),
            volumes: nonempty(o.volumes),
            persistent_state_paths: nonempty(o.persistent_state_paths),
            persistent_state_bind: o.persistent_state_bind,
            persistent_state_target: o.persistent_state_target,
        }
    }
}

/// Set up an encrypted device
#[derive(Debug, Parser)]
pub(crate) struct EncryptDeviceOpts {
    /// The block device to format
    pub(crate) device: Utf8PathBuf,

    /// Name of the opened device below `/dev/mapper`
    pub(crate) mapped_name: String,

    /// Key slot to enroll
    #[clap(long, default_value_t = 0)]
    pub(crate) key_slot: u32,

    /// Unlock with this key file instead of prompting
    #[clap(long)]
    pub(crate) key_file: Option<Utf8PathBuf>,

    /// Erase existing signatures on the device first
    #[clap(long)]
    pub(crate) wipe: bool,
}

/// Assemble an immutable root filesystem at boot.
///
/// A read-only base root is made usable by overlaying transient writable
/// layers on selected paths, mounting auxiliary volumes, and bind mounting
/// persistent state back into place. The resulting layout is recorded in
/// the tree's `/etc/fstab`.
#[derive(Debug, Parser)]
#[clap(name = "strata")]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Assemble the root tree under the mount point.
    ///
    /// Values from the `strata/rootfs.d` configuration fragments are used
    /// unless overridden by flags.
    MountRootfs(MountRootfsOpts),
    /// Format a block device as an encrypted volume and open it.
    EncryptDevice(EncryptDeviceOpts),
}

#[context("Querying root privilege")]
pub(crate) fn require_root() -> Result<()> {
    let uid = rustix::process::getuid();
    if !uid.is_root() {
        anyhow::bail!("This command requires root privileges");
    }
    if !rustix::thread::capability_is_in_bounding_set(rustix::thread::Capability::SystemAdmin)? {
        anyhow::bail!("This command requires full root privileges (CAP_SYS_ADMIN)");
    }
    Ok(())
}

/// Implementation of `strata mount-rootfs`.
#[context("Mounting root filesystem")]
async fn mount_rootfs(opts: MountRootfsOpts) -> Result<()> {
    require_root()?;
    let config = crate::config::load_config()?;
    let mut mountconfig = config.mount;
    mountconfig.merge(opts.into());
    let mut spec = MountSpec::default();
    mountconfig.apply(&mut spec);
    let spec = spec.validate()?;

    let encryption = config.encryption;
    let fstab = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let mut spec = spec;
        if let Some(encryption) = encryption {
            let mapped = encryption.prepare(&HostRunner)?;
            spec.root_device = mapped.into_string();
        }
        let root = Dir::open_ambient_dir("/", cap_std::ambient_authority())
            .context("Opening /")?;
        let mounter = HostMounter;
        let mut assembler = Assembler::new(spec, &root, &mounter);
        Ok(assembler.assemble()?)
    })
    .await??;
    tracing::debug!("Wrote {} fstab entries", fstab.len());
    println!("{READY_MESSAGE}");
    Ok(())
}

/// Implementation of `strata encrypt-device`.
#[context("Encrypting device")]
async fn encrypt_device(opts: EncryptDeviceOpts) -> Result<()> {
    require_root()?;
    let mapped = tokio::task::spawn_blocking(move || -> Result<Utf8PathBuf> {
        let dev = strata_blockdev::list_dev(&opts.device)?;
        if !dev.is_blank() {
            if !opts.wipe {
                anyhow::bail!(
                    "Device {} is in use (has a filesystem or partitions); use --wipe to erase it",
                    opts.device
                );
            }
            Task::new(format!("Wiping {}", opts.device), "wipefs")
                .args(["-a", opts.device.as_str()])
                .run()?;
        }
        let slot = KeySlot {
            slot: opts.key_slot,
            passphrase: None,
            key_file: opts.key_file,
        };
        Ok(prepare_device(
            &HostRunner,
            &opts.device,
            &opts.mapped_name,
            &[slot],
        )?)
    })
    .await??;
    println!("Opened {mapped}");
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::MountRootfs(opts) => mount_rootfs(opts).await,
        Opt::EncryptDevice(opts) => encrypt_device(opts).await,
    }
}

#[test]
fn test_parse_mount_rootfs_args() {
    let o = Opt::try_parse_from([
        "strata",
        "mount-rootfs",
        "--root-perm",
        "rw",
        "--rw-paths",
        "/var,/etc",
        "--rw-paths",
        "/srv",
        "--volumes",
        "LABEL=COS_OEM:/oem",
        "--switch-root",
        "false",
        "--overlay",
        "tmpfs:1G",
    ])
    .unwrap();
    let o = match o {
        Opt::MountRootfs(o) => o,
        o => panic!("Expected mount-rootfs opts, not {o:?}"),
    };
    let c = MountConfiguration::from(o);
    assert_eq!(c.root_perm, Some(RootPermission::Rw));
    assert_eq!(c.rw_paths.as_deref().unwrap(), ["/var", "/etc", "/srv"]);
    assert_eq!(c.volumes.as_deref().unwrap()[0].label, "COS_OEM");
    assert_eq!(c.switch_root, Some(false));
    assert_eq!(c.overlay.unwrap().size, "1G");
    // Unset flags do not override configuration
    assert_eq!(c.persistent_state_paths, None);
    assert_eq!(c.mountpoint, None);

    assert!(Opt::try_parse_from(["strata", "mount-rootfs", "--overlay", "ext4:1G"]).is_err());
}

#[test]
fn test_cli_overrides_config() {
    let mut config = MountConfiguration {
        rw_paths: Some(vec!["/var".into()]),
        root_device: Some("/dev/vda2".into()),
        ..Default::default()
    };
    config.merge(
        MountRootfsOpts {
            root_device: Some("/dev/mapper/root".into()),
            ..Default::default()
        }
        .into(),
    );
    assert_eq!(config.rw_paths.as_deref().unwrap(), ["/var"]);
    assert_eq!(config.root_device.as_deref(), Some("/dev/mapper/root"));
}

#[test]
fn test_parse_encrypt_device_args() {
    let o = Opt::try_parse_from([
        "strata",
        "encrypt-device",
        "/dev/vda3",
        "root",
        "--key-slot",
        "1",
        "--wipe",
    ])
    .unwrap();
    let o = match o {
        Opt::EncryptDevice(o) => o,
        o => panic!("Expected encrypt-device opts, not {o:?}"),
    };
    assert_eq!(o.device, "/dev/vda3");
    assert_eq!(o.mapped_name, "root");
    assert_eq!(o.key_slot, 1);
    assert!(o.key_file.is_none());
    assert!(o.wipe);
}
