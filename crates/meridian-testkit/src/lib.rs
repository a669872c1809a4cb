//! Meridian Testing Infrastructure
//!
//! Deterministic stand-ins for the collaborators the platform consumes but
//! does not own, plus topology and intent fixtures shared by the integration
//! tests of the other crates.
//!
//! - [`FakeMastership`]: settable per-device masters with a change bus
//! - [`RecordingInstaller`]: objective driver that records calls and can be
//!   scripted to fail, reject or hang per device
//! - [`fixtures`]: linear switch topologies and link-collection intents
//! - [`init_tracing`]: opt-in log output for test runs

#![forbid(unsafe_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

/// Topology and intent fixtures
pub mod fixtures;

/// Fake mastership oracle
pub mod mastership;

/// Recording objective installer
pub mod southbound;

pub use fixtures::{cp, device, linear_intent, linear_path, linear_topology, test_app, ts};
pub use mastership::FakeMastership;
pub use southbound::{FailurePlan, RecordingInstaller};

use std::sync::Once;

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness.
///
/// Filtering follows `RUST_LOG`; without it only warnings are shown. Safe to
/// call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
