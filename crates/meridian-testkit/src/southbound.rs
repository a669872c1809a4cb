//! Scriptable objective driver

use async_trait::async_trait;
use meridian_core::{DeviceId, ForwardingObjective, ObjectiveError, ObjectiveInstaller, ObjectiveOp};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

/// How a device answers `forward`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePlan {
    /// The first `times` attempts fail as unreachable, later ones succeed
    Unreachable {
        /// Failing attempts before recovery
        times: usize,
    },
    /// Every attempt is rejected
    Reject,
    /// Attempts never complete
    Hang,
}

enum Answer {
    Ack,
    Fail(ObjectiveError),
    Hang,
}

/// [`ObjectiveInstaller`] that keeps every acknowledged objective.
#[derive(Debug, Default)]
pub struct RecordingInstaller {
    accepted: Mutex<Vec<(DeviceId, ForwardingObjective)>>,
    attempts: Mutex<BTreeMap<DeviceId, usize>>,
    plans: Mutex<BTreeMap<DeviceId, FailurePlan>>,
    delay: Option<Duration>,
}

impl RecordingInstaller {
    /// Driver that acknowledges everything immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver that waits `delay` before answering
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Script the answers of `device`
    pub fn plan(&self, device: DeviceId, plan: FailurePlan) {
        self.plans.lock().insert(device, plan);
    }

    /// Let `device` acknowledge again
    pub fn clear_plan(&self, device: &DeviceId) {
        self.plans.lock().remove(device);
    }

    /// Number of `forward` calls made for `device`
    pub fn attempts(&self, device: &DeviceId) -> usize {
        self.attempts.lock().get(device).copied().unwrap_or(0)
    }

    /// Acknowledged objectives for `device` in arrival order
    pub fn accepted(&self, device: &DeviceId) -> Vec<ForwardingObjective> {
        self.accepted
            .lock()
            .iter()
            .filter(|(d, _)| d == device)
            .map(|(_, objective)| objective.clone())
            .collect()
    }

    /// Total acknowledged objectives
    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().len()
    }

    /// Rules left on `device` after replaying adds and removes
    pub fn active_rules(&self, device: &DeviceId) -> Vec<ForwardingObjective> {
        let mut rules = BTreeMap::new();
        for objective in self.accepted(device) {
            match objective.op {
                ObjectiveOp::Add => {
                    rules.insert(objective.rule_key(), objective);
                }
                ObjectiveOp::Remove => {
                    rules.remove(&objective.rule_key());
                }
            }
        }
        rules.into_values().collect()
    }

    fn answer(&self, device: &DeviceId) -> Answer {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(device.clone()).or_insert(0);
            *count += 1;
            *count
        };
        match self.plans.lock().get(device) {
            None => Answer::Ack,
            Some(FailurePlan::Unreachable { times }) if attempt > *times => Answer::Ack,
            Some(FailurePlan::Unreachable { .. }) => Answer::Fail(ObjectiveError::Unreachable {
                device: device.clone(),
                reason: format!("attempt {attempt} refused"),
            }),
            Some(FailurePlan::Reject) => Answer::Fail(ObjectiveError::Rejected {
                device: device.clone(),
                reason: "unsupported match".into(),
            }),
            Some(FailurePlan::Hang) => Answer::Hang,
        }
    }
}

#[async_trait]
impl ObjectiveInstaller for RecordingInstaller {
    async fn forward(
        &self,
        device: &DeviceId,
        objective: &ForwardingObjective,
    ) -> Result<(), ObjectiveError> {
        let answer = self.answer(device);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match answer {
            Answer::Ack => {
                self.accepted
                    .lock()
                    .push((device.clone(), objective.clone()));
                Ok(())
            }
            Answer::Fail(error) => Err(error),
            Answer::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{AppId, ObjectiveFlag, PortNumber, TrafficSelector, TrafficTreatment};

    fn objective(op: ObjectiveOp) -> ForwardingObjective {
        ForwardingObjective {
            selector: TrafficSelector::builder()
                .match_in_port(PortNumber::new(1))
                .build(),
            treatment: TrafficTreatment::builder()
                .set_output(PortNumber::new(2))
                .build(),
            priority: 10,
            flag: ObjectiveFlag::Specific,
            permanent: true,
            timeout_secs: 0,
            app_id: AppId::new(1, "test"),
            op,
        }
    }

    #[tokio::test]
    async fn test_unreachable_plan_recovers() {
        let driver = RecordingInstaller::new();
        let device = DeviceId::new("of:1");
        driver.plan(device.clone(), FailurePlan::Unreachable { times: 1 });

        assert!(driver.forward(&device, &objective(ObjectiveOp::Add)).await.is_err());
        assert!(driver.forward(&device, &objective(ObjectiveOp::Add)).await.is_ok());
        assert_eq!(driver.attempts(&device), 2);
        assert_eq!(driver.accepted(&device).len(), 1);
    }

    #[tokio::test]
    async fn test_remove_clears_active_rule() {
        let driver = RecordingInstaller::new();
        let device = DeviceId::new("of:1");
        driver.forward(&device, &objective(ObjectiveOp::Add)).await.unwrap();
        assert_eq!(driver.active_rules(&device).len(), 1);
        driver.forward(&device, &objective(ObjectiveOp::Remove)).await.unwrap();
        assert!(driver.active_rules(&device).is_empty());
    }
}
