//! Mastership-gated objective installation
//!
//! A node programs only the devices it currently masters. Installables for
//! other devices are reported as skipped; their masters install them when
//! they process the same intent.
//!
//! Each device is driven independently and concurrently. Within a device the
//! objectives are sent in order, each attempt bounded by the install timeout
//! and retried with jittered exponential backoff while the failure is
//! retryable. Mastership is re-checked before every attempt: a node that
//! loses a device mid-install abandons it and leaves the rest to the new
//! master.

use backon::{ExponentialBuilder, Retryable};
use futures::future::join_all;
use meridian_core::{
    DeviceId, ForwardingObjective, InstallConfig, MastershipOracle, ObjectiveError,
    ObjectiveInstaller,
};
use meridian_intent::Installable;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// How installation on one device ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    /// Every objective was acknowledged
    Installed {
        /// Objectives applied
        objectives: usize,
    },
    /// An objective failed after the retry budget or was rejected
    Failed(ObjectiveError),
    /// Mastership moved away before the device finished
    Abandoned {
        /// Objectives applied before giving up
        applied: usize,
    },
}

/// Result of one [`MastershipGatedInstaller::install`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Outcome per locally mastered device
    pub outcomes: BTreeMap<DeviceId, DeviceOutcome>,
    /// Devices left to their masters
    pub skipped: BTreeSet<DeviceId>,
}

impl InstallReport {
    /// True when every locally mastered device finished
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .values()
            .all(|outcome| matches!(outcome, DeviceOutcome::Installed { .. }))
    }

    /// Devices that failed, with the error
    pub fn failures(&self) -> impl Iterator<Item = (&DeviceId, &ObjectiveError)> {
        self.outcomes.iter().filter_map(|(device, outcome)| match outcome {
            DeviceOutcome::Failed(error) => Some((device, error)),
            _ => None,
        })
    }
}

/// Sends installables to the devices this node masters
#[derive(Clone)]
pub struct MastershipGatedInstaller {
    oracle: Arc<dyn MastershipOracle>,
    driver: Arc<dyn ObjectiveInstaller>,
    config: InstallConfig,
}

impl MastershipGatedInstaller {
    /// Installer issuing writes through `driver` when `oracle` allows
    pub fn new(
        oracle: Arc<dyn MastershipOracle>,
        driver: Arc<dyn ObjectiveInstaller>,
        config: &InstallConfig,
    ) -> Self {
        Self {
            oracle,
            driver,
            config: config.clone(),
        }
    }

    /// Mastership oracle consulted before every write
    pub fn oracle(&self) -> &Arc<dyn MastershipOracle> {
        &self.oracle
    }

    /// Backoff between attempts of one objective
    pub fn retry_policy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.config.min_backoff_ms))
            .with_max_delay(Duration::from_millis(self.config.max_backoff_ms))
            .with_max_times(self.config.max_retries)
            .with_jitter()
    }

    /// Install `installables`, one concurrent task per mastered device
    pub async fn install(&self, installables: &[Installable]) -> InstallReport {
        let mut report = InstallReport::default();
        let mut by_device: BTreeMap<&DeviceId, Vec<&ForwardingObjective>> = BTreeMap::new();
        for installable in installables {
            if self.oracle.is_local_master(&installable.device_id) {
                by_device
                    .entry(&installable.device_id)
                    .or_default()
                    .push(&installable.objective);
            } else {
                report.skipped.insert(installable.device_id.clone());
            }
        }
        if !report.skipped.is_empty() {
            tracing::debug!(skipped = report.skipped.len(), "devices left to their masters");
        }

        let outcomes = join_all(by_device.into_iter().map(|(device, objectives)| async move {
            let outcome = self.install_device(device, &objectives).await;
            (device.clone(), outcome)
        }))
        .await;
        report.outcomes.extend(outcomes);
        report
    }

    async fn install_device(
        &self,
        device: &DeviceId,
        objectives: &[&ForwardingObjective],
    ) -> DeviceOutcome {
        for (applied, objective) in objectives.iter().enumerate() {
            if !self.oracle.is_local_master(device) {
                tracing::warn!(device = %device, applied, "mastership lost, abandoning install");
                return DeviceOutcome::Abandoned { applied };
            }
            if let Err(error) = self.forward_with_retry(device, objective).await {
                if !self.oracle.is_local_master(device) {
                    tracing::warn!(device = %device, applied, "mastership lost, abandoning install");
                    return DeviceOutcome::Abandoned { applied };
                }
                tracing::warn!(device = %device, error = %error, "objective failed");
                return DeviceOutcome::Failed(error);
            }
        }
        tracing::debug!(device = %device, objectives = objectives.len(), "device programmed");
        DeviceOutcome::Installed {
            objectives: objectives.len(),
        }
    }

    async fn forward_with_retry(
        &self,
        device: &DeviceId,
        objective: &ForwardingObjective,
    ) -> Result<(), ObjectiveError> {
        (move || self.forward_once(device, objective))
            .retry(self.retry_policy())
            .when(|error: &ObjectiveError| {
                error.is_retryable() && self.oracle.is_local_master(device)
            })
            .notify(|error: &ObjectiveError, delay: Duration| {
                tracing::debug!(
                    device = %device,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "retrying objective"
                );
            })
            .await
    }

    async fn forward_once(
        &self,
        device: &DeviceId,
        objective: &ForwardingObjective,
    ) -> Result<(), ObjectiveError> {
        let timeout_ms = self.config.install_timeout_ms;
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.driver.forward(device, objective),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ObjectiveError::Timeout {
                device: device.clone(),
                timeout_ms,
            })
        })
    }
}
