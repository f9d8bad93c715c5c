//! Storage directory naming for overlay and persistent-state directories.
//!
//! Each writable path gets a flat directory name in the backing store, e.g.
//! `/var/lib` becomes `var-lib.overlay` in the overlay store and
//! `var-lib.bind` in the persistent-state store.

use std::collections::HashMap;

use camino::Utf8Path;

use crate::error::{Error, Result};

/// Which backing store a derived directory lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Upper/work directories of a transient overlay
    Overlay,
    /// Persistent state relocated and bind mounted back
    Bind,
}

impl StorageKind {
    /// The suffix appended to derived names.
    pub fn suffix(&self) -> &'static str {
        match self {
            StorageKind::Overlay => "overlay",
            StorageKind::Bind => "bind",
        }
    }
}

/// Derive the storage directory name for `path`.
///
/// A single leading `/` is stripped and the remaining separators become `-`.
/// Distinct paths may flatten to the same name (`/a/b` and `/a-b`); use
/// [`check_collisions`] on the configured set before mounting anything.
pub fn derive_storage_name(path: &str, kind: StorageKind) -> String {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    format!("{}.{}", trimmed.replace('/', "-"), kind.suffix())
}

/// Verify that no two configured paths share a derived storage name.
pub fn check_collisions<'a>(
    paths: impl IntoIterator<Item = &'a Utf8Path>,
    kind: StorageKind,
) -> Result<()> {
    let mut seen: HashMap<String, &Utf8Path> = HashMap::new();
    for path in paths {
        let name = derive_storage_name(path.as_str(), kind);
        if let Some(prev) = seen.insert(name.clone(), path) {
            return Err(Error::config(format!(
                "{prev} and {path} both map to {kind:?} storage {name}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive() {
        let cases = [
            ("/etc", StorageKind::Overlay, "etc.overlay"),
            ("/var/lib/rancher", StorageKind::Overlay, "var-lib-rancher.overlay"),
            ("/home", StorageKind::Bind, "home.bind"),
            ("/usr/local", StorageKind::Bind, "usr-local.bind"),
        ];
        for (path, kind, expected) in cases {
            assert_eq!(derive_storage_name(path, kind), expected);
            // Deterministic across calls
            assert_eq!(derive_storage_name(path, kind), derive_storage_name(path, kind));
        }
    }

    #[test]
    fn test_leading_slash_irrelevant() {
        for kind in [StorageKind::Overlay, StorageKind::Bind] {
            assert_eq!(
                derive_storage_name("/var", kind),
                derive_storage_name("var", kind)
            );
        }
        // Only one leading slash is stripped
        assert_eq!(derive_storage_name("//var", StorageKind::Bind), "-var.bind");
    }

    #[test]
    fn test_trailing_slash_distinct() {
        assert_ne!(
            derive_storage_name("/var", StorageKind::Overlay),
            derive_storage_name("/var/", StorageKind::Overlay)
        );
    }

    #[test]
    fn test_collisions() {
        let ok = ["/var", "/data/var", "/etc"].map(Utf8Path::new);
        check_collisions(ok, StorageKind::Overlay).unwrap();

        let bad = ["/a/b", "/a-b"].map(Utf8Path::new);
        let e = check_collisions(bad, StorageKind::Overlay).unwrap_err();
        assert!(matches!(e, Error::Configuration(_)));
        assert!(e.to_string().contains("a-b.overlay"), "{e}");
    }
}
