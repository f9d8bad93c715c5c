//! # Immutable root filesystem assembly
//!
//! This crate builds the root tree an immutable OS boots into: a read-only
//! base root with transient writable overlays on selected paths, auxiliary
//! volumes mounted by label, and persistent state bind mounted back into
//! place. The resulting layout is recorded as an fstab inside the tree.
//!
//! The entry point for library users is [`assemble::Assembler`], which takes
//! a validated [`spec::MountSpec`] along with a root directory handle and a
//! [`mount::Mounter`].

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod assemble;
pub mod cli;
pub(crate) mod config;
pub mod encrypt;
pub mod entry;
pub mod error;
mod migrate;
pub mod mount;
pub mod naming;
pub mod spec;
mod task;
