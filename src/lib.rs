//! In-process inode engine for a userspace virtual filesystem daemon.
//!
//! This crate owns the parts of such a daemon that define inode identity and
//! lifecycle, durable materialized state, the observable change stream, the
//! privileged mount agent protocol, and per-checkout persisted state. Kernel
//! channel codecs, the content-addressed object store, the outward RPC
//! surface, CLIs and telemetry sinks are collaborators with a trait-shaped
//! contract defined in [`collaborators`], not implementations owned here.

pub mod checkout_config;
pub mod collaborators;
pub mod error;
pub mod inode;
pub mod journal;
pub mod object_id;
pub mod overlay;
pub mod privhelper;
pub mod relpath;
pub mod startup_status;
pub mod time_util;
pub mod utf8;

pub use error::{CoreError, Result};
