//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod fstab;
pub use fstab::*;
mod tracing_util;
pub use tracing_util::*;
