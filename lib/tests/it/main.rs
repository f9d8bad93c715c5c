//! End-to-end assembly against a temporary root directory.

use std::sync::Mutex;

use anyhow::Result;
use camino::Utf8Path;
use cap_std_ext::{cap_std, cap_tempfile};
use indoc::indoc;
use strata_lib::assemble::{AssemblyStage, Assembler};
use strata_lib::mount::Mounter;
use strata_lib::spec::MountSpec;

/// Records mount targets without touching the mount table.
#[derive(Debug, Default)]
struct FakeMounter {
    targets: Mutex<Vec<String>>,
}

impl Mounter for FakeMounter {
    fn mount(
        &self,
        _source: &str,
        target: &Utf8Path,
        _fstype: &str,
        _options: &[String],
    ) -> Result<()> {
        self.targets.lock().unwrap().push(target.to_string());
        Ok(())
    }
}

#[test]
fn test_default_layout() -> Result<()> {
    let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
    td.create_dir_all("sysroot/etc/ssh")?;
    td.write("sysroot/etc/hostname", "localhost\n")?;
    td.create_dir_all("sysroot/root")?;

    let mounter = FakeMounter::default();
    let mut assembler = Assembler::new(MountSpec::default(), &td, &mounter);
    let lines = assembler.assemble()?;
    assert_eq!(assembler.stage(), AssemblyStage::FstabWritten);

    let expected = indoc! {"
        /dev/loop0\t/\tauto\tro\t0\t0
        tmpfs\t/run/overlay\ttmpfs\tdefaults,size=25%\t0\t0
        /sysroot/var\t/var\toverlay\tdefaults,lowerdir=/sysroot/var,upperdir=/run/overlay/var.overlay/upper,workdir=/run/overlay/var.overlay/work
        /sysroot/etc\t/etc\toverlay\tdefaults,lowerdir=/sysroot/etc,upperdir=/run/overlay/etc.overlay/upper,workdir=/run/overlay/etc.overlay/work
        /dev/disk/by-label/COS_OEM\t/oem\tauto\tdefaults
        /dev/disk/by-label/COS_PERSISTENT\t/usr/local\tauto\tdefaults
        /usr/local/.state/etc.bind\t/etc\tnone\tdefaults,bind
        /usr/local/.state/root.bind\t/root\tnone\tdefaults,bind
        /usr/local/.state/home.bind\t/home\tnone\tdefaults,bind
        /usr/local/.state/opt.bind\t/opt\tnone\tdefaults,bind
        /usr/local/.state/usr-local.bind\t/usr/local\tnone\tdefaults,bind
        /usr/local/.state/var.bind\t/var\tnone\tdefaults,bind"};
    similar_asserts::assert_eq!(td.read_to_string("sysroot/etc/fstab")?, expected);
    assert_eq!(lines.join("\n"), expected);

    // Existing content was seeded into the state store
    assert_eq!(
        td.read_to_string("sysroot/usr/local/.state/etc.bind/hostname")?,
        "localhost\n"
    );
    assert!(td.is_dir("sysroot/usr/local/.state/etc.bind/ssh"));
    // The state store does not contain a copy of itself
    assert!(!td.exists("sysroot/usr/local/.state/usr-local.bind/.state"));

    let targets = mounter.targets.lock().unwrap();
    assert_eq!(targets.len(), 11);
    assert_eq!(targets[0], "/run/overlay");
    assert_eq!(targets[10], "/sysroot/var");
    Ok(())
}

#[test]
fn test_invalid_spec_mounts_nothing() -> Result<()> {
    let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
    let mounter = FakeMounter::default();
    let spec = MountSpec {
        rw_paths: vec!["/var/lib".into(), "/var-lib".into()],
        ..Default::default()
    };
    let mut assembler = Assembler::new(spec, &td, &mounter);
    let e = assembler.assemble().unwrap_err();
    assert!(e.to_string().contains("var-lib.overlay"), "{e}");
    assert_eq!(assembler.stage(), AssemblyStage::Failed);
    assert!(mounter.targets.lock().unwrap().is_empty());
    Ok(())
}
