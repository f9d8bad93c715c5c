//! Error kinds for root filesystem assembly and device preparation.

use camino::Utf8PathBuf;
use thiserror::Error;

/// A boxed error from a capability (mount helper, subprocess runner).
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error during assembly. Every variant is fatal for the current run.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Creating directory {path}: {source}")]
    DirectoryCreation {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Mounting {target}: {source}")]
    Mount {
        target: Utf8PathBuf,
        #[source]
        source: BoxedError,
    },
    #[error("Migrating state into {path}: {source}")]
    StateMigration {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{description}: {source}")]
    Subprocess {
        description: String,
        #[source]
        source: BoxedError,
    },
    #[error("Writing {path}: {source}")]
    Persist {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// The type of Result.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    // Errors are returned from blocking tasks and wrapped by anyhow
    static_assertions::assert_impl_all!(Error: Send, Sync);

    #[test]
    fn test_display_includes_path() {
        let e = Error::DirectoryCreation {
            path: "/sysroot/oem".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(e.to_string().starts_with("Creating directory /sysroot/oem: "));
    }
}
