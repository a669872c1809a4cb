//! Meridian Install - from compiled intents to programmed devices
//!
//! This crate is the glue between the intent compiler and the device
//! drivers:
//!
//! - [`MastershipGatedInstaller`]: sends objectives only to devices the
//!   local node masters, with per-attempt timeouts and bounded retries
//! - [`InstallProgress`]: replicated per-device install records and the
//!   derived [`IntentInstallState`]
//! - [`IntentManager`]: intent registry, recompilation on topology and
//!   mastership changes, and the worker loop driving both
//!
//! Installation across devices is not atomic. Each master programs its own
//! devices; an intent is partially installed until every master is done.

#![forbid(unsafe_code)]

/// Install errors
pub mod errors;

/// Mastership-gated installer
pub mod installer;

/// Intent lifecycle
pub mod manager;

/// Install progress tracking
pub mod progress;

pub use errors::{InstallError, Result};
pub use installer::{DeviceOutcome, InstallReport, MastershipGatedInstaller};
pub use manager::{IntentManager, IntentManagerBuilder, TopologyChange, DEFAULT_RECONCILE_INTERVAL};
pub use progress::{
    DeviceInstallRecord, DeviceInstallState, InstallProgress, IntentInstallState, ProgressKey,
    PROGRESS_MAP,
};
