//! Copy existing content into a fresh persistent-state directory.

use std::io;
use std::path::{Path, PathBuf};

use cap_std_ext::cap_std::fs::{Dir, Metadata, MetadataExt as _};
use cap_std_ext::dirext::CapStdExtDirExt;
use rustix::fs::{AtFlags, Gid, Uid};

/// Set the owner of `name` (not following symlinks) to the one in `meta`.
///
/// Directory handles from [`Dir::open_dir`] cannot be passed to `fchown`, so
/// this always goes through the parent.
#[allow(unsafe_code)]
fn chown_like(dir: &Dir, name: &Path, meta: &Metadata) -> io::Result<()> {
    // SAFETY: The ids come from an existing inode
    let (uid, gid) = unsafe { (Uid::from_raw(meta.uid()), Gid::from_raw(meta.gid())) };
    rustix::fs::chownat(dir, name, Some(uid), Some(gid), AtFlags::SYMLINK_NOFOLLOW)?;
    Ok(())
}

/// Recursively copy the contents of `src` into `dst`, preserving permission
/// bits and ownership. The subtree at `exclude` (an absolute path in the same
/// namespace as `src`) is skipped. Symlinks are copied as links. Device nodes,
/// fifos and sockets are skipped.
pub(crate) fn copy_tree(src: &Dir, src_path: &Path, dst: &Dir, exclude: &Path) -> io::Result<()> {
    for entry in src.entries()? {
        let entry = entry?;
        let name = PathBuf::from(entry.file_name());
        let ft = entry.file_type()?;
        let child = src_path.join(&name);
        if ft.is_dir() {
            if child == exclude {
                tracing::debug!("Skipping {child:?}");
                continue;
            }
            let meta = entry.metadata()?;
            dst.create_dir(&name)?;
            copy_tree(&src.open_dir(&name)?, &child, &dst.open_dir(&name)?, exclude)?;
            chown_like(dst, &name, &meta)?;
            dst.set_permissions(&name, meta.permissions())?;
        } else if ft.is_symlink() {
            let meta = entry.metadata()?;
            let target = src.read_link_contents(&name)?;
            dst.symlink_contents(target, &name)?;
            chown_like(dst, &name, &meta)?;
        } else if ft.is_file() {
            let meta = entry.metadata()?;
            src.copy(&name, dst, &name)?;
            chown_like(dst, &name, &meta)?;
            dst.set_permissions(&name, meta.permissions())?;
        } else {
            tracing::debug!("Skipping special file {child:?}");
        }
    }
    Ok(())
}

/// Populate the state directory `name` in `store` from `src` unless it
/// already has content; returns whether a copy was made.
///
/// The copy goes to a sibling staging directory which is renamed over the
/// (empty) state directory once complete, so an interrupted copy is redone
/// from scratch on the next run instead of being taken as finished.
pub(crate) fn seed_state_dir(
    store: &Dir,
    name: &str,
    src: &Dir,
    src_path: &Path,
    exclude: &Path,
) -> io::Result<bool> {
    if store.open_dir(name)?.entries()?.next().is_some() {
        return Ok(false);
    }
    let staging = format!("{name}.tmp");
    if store.remove_all_optional(&staging)? {
        tracing::debug!("Removed incomplete copy {staging}");
    }
    store.create_dir(&staging)?;
    copy_tree(src, src_path, &store.open_dir(&staging)?, exclude)?;
    // The root of the state directory stands in for the original path
    let meta = src.dir_metadata()?;
    chown_like(store, Path::new(&staging), &meta)?;
    store.set_permissions(&staging, meta.permissions())?;
    store.rename(&staging, store, name)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_std::fs::MetadataExt as _;
    use cap_std_ext::{cap_std, cap_tempfile};
    use std::os::unix::fs::PermissionsExt as _;

    fn mode(td: &Dir, p: &str) -> io::Result<u32> {
        Ok(td.symlink_metadata(p)?.mode() & 0o7777)
    }

    #[test]
    fn test_copy_tree() -> anyhow::Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.create_dir_all("src/sub/deeper")?;
        td.create_dir_all("src/.state/old")?;
        td.write("src/a", "a")?;
        td.write("src/sub/deeper/b", "b")?;
        td.symlink_contents("sub/deeper/b", "src/link")?;
        td.set_permissions(
            "src/a",
            cap_std::fs::Permissions::from_std(std::fs::Permissions::from_mode(0o600)),
        )?;
        td.set_permissions(
            "src/sub",
            cap_std::fs::Permissions::from_std(std::fs::Permissions::from_mode(0o750)),
        )?;
        td.create_dir("dst")?;

        let src = td.open_dir("src")?;
        let dst = td.open_dir("dst")?;
        copy_tree(&src, Path::new("/src"), &dst, Path::new("/src/.state"))?;

        assert_eq!(td.read_to_string("dst/a")?, "a");
        assert_eq!(td.read_to_string("dst/sub/deeper/b")?, "b");
        assert_eq!(td.read_link_contents("dst/link")?, Path::new("sub/deeper/b"));
        assert_eq!(mode(&td, "dst/a")?, 0o600);
        assert_eq!(mode(&td, "dst/sub")?, 0o750);
        for p in ["sub", "sub/deeper", "a", "link"] {
            let s = td.symlink_metadata(format!("src/{p}"))?;
            let d = td.symlink_metadata(format!("dst/{p}"))?;
            assert_eq!((s.uid(), s.gid()), (d.uid(), d.gid()), "{p}");
        }
        assert!(!td.exists("dst/.state"));
        Ok(())
    }

    #[test]
    fn test_seed_state_dir() -> anyhow::Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        td.create_dir_all("home/user")?;
        td.write("home/user/.profile", "v1")?;
        td.set_permissions(
            "home",
            cap_std::fs::Permissions::from_std(std::fs::Permissions::from_mode(0o711)),
        )?;
        td.create_dir_all("store/home.bind")?;
        // Leftovers of an interrupted copy
        td.create_dir_all("store/home.bind.tmp/stale")?;

        let store = td.open_dir("store")?;
        let src = td.open_dir("home")?;
        let exclude = Path::new("/store");
        assert!(seed_state_dir(&store, "home.bind", &src, Path::new("/home"), exclude)?);
        assert_eq!(td.read_to_string("store/home.bind/user/.profile")?, "v1");
        assert!(!td.exists("store/home.bind/stale"));
        assert!(!td.exists("store/home.bind.tmp"));
        assert_eq!(mode(&td, "store/home.bind")?, 0o711);

        // Populated state is kept
        td.write("home/user/.profile", "v2")?;
        assert!(!seed_state_dir(&store, "home.bind", &src, Path::new("/home"), exclude)?);
        assert_eq!(td.read_to_string("store/home.bind/user/.profile")?, "v1");
        Ok(())
    }
}
