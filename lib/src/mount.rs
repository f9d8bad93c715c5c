//! Helpers for interacting with mountpoints

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::task::Task;

/// The capability to attach a filesystem to the mount table.
///
/// Options are individual `key[=value]` tokens; implementations join them
/// with commas.
pub trait Mounter: std::fmt::Debug {
    /// Mount `source` of type `fstype` on `target`.
    fn mount(&self, source: &str, target: &Utf8Path, fstype: &str, options: &[String])
        -> Result<()>;
}

/// Mounts via the host's `mount` binary.
#[derive(Debug, Default)]
pub struct HostMounter;

impl Mounter for HostMounter {
    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fstype: &str,
        options: &[String],
    ) -> Result<()> {
        let mut t = Task::new(format!("Mounting {target}"), "mount")
            .quiet()
            .args(["-t", fstype]);
        if !options.is_empty() {
            t = t.args(["-o", options.join(",").as_str()]);
        }
        t.args([source, target.as_str()]).run()
    }
}

/// Resolve `path` below `base`; a leading `/` on `path` does not reset to the root.
pub(crate) fn join_under(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    base.join(path.as_str().trim_start_matches('/'))
}

#[test]
fn test_join_under() {
    let base = Utf8Path::new("/sysroot");
    assert_eq!(join_under(base, Utf8Path::new("/etc")), "/sysroot/etc");
    assert_eq!(join_under(base, Utf8Path::new("var/lib")), "/sysroot/var/lib");
    assert_eq!(
        join_under(Utf8Path::new("/"), Utf8Path::new("/run/overlay")),
        "/run/overlay"
    );
}
