//! Intent lifecycle
//!
//! The [`IntentManager`] keeps every registered intent installed against the
//! current topology:
//!
//! - **submit** commits the intent to the cluster-wide registry, compiles it
//!   and installs the objectives of the devices this node masters
//! - **topology events** recompile the intents that reference the affected
//!   devices or links and install only the difference
//! - **mastership events** make a node that gained a device re-drive every
//!   intent touching it, so a handover mid-install converges
//! - **withdraw** removes the intent and its objectives
//!
//! Every node runs a manager. The registry is a [`ConsistentMap`], so all
//! nodes agree on the intent set; install progress is replicated through
//! [`InstallProgress`], so all nodes can report the combined state.

use crate::errors::{InstallError, Result};
use crate::installer::{DeviceOutcome, InstallReport, MastershipGatedInstaller};
use crate::progress::{DeviceInstallRecord, DeviceInstallState, InstallProgress, IntentInstallState};
use meridian_core::{DeviceId, LinkKey, MastershipEvent, NodeId};
use meridian_intent::{
    CompilationError, FlowObjectiveIntent, Installable, Intent, IntentCompiler, IntentKey,
    LinkCollectionCompiler,
};
use meridian_maps::ConsistentMap;
use meridian_topology::{DeviceEvent, LinkEvent, TopologyStore};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Default period between full reconciliations of the worker loop
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Topology change that may invalidate compiled intents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    /// Device or port change
    Device(DeviceEvent),
    /// Link change
    Link(LinkEvent),
}

impl TopologyChange {
    /// Devices the change concerns
    pub fn devices(&self) -> BTreeSet<DeviceId> {
        match self {
            Self::Device(event) => BTreeSet::from([event.device_id().clone()]),
            Self::Link(event) => {
                let key = event.key();
                BTreeSet::from([key.src.device_id, key.dst.device_id])
            }
        }
    }

    /// Link the change concerns
    pub fn link(&self) -> Option<LinkKey> {
        match self {
            Self::Device(_) => None,
            Self::Link(event) => Some(event.key()),
        }
    }

    fn affects(&self, intent: &Intent) -> bool {
        if let Some(link) = self.link() {
            if intent.links().contains(&link) {
                return true;
            }
        }
        !intent.devices().is_disjoint(&self.devices())
    }
}

impl From<DeviceEvent> for TopologyChange {
    fn from(event: DeviceEvent) -> Self {
        Self::Device(event)
    }
}

impl From<LinkEvent> for TopologyChange {
    fn from(event: LinkEvent) -> Self {
        Self::Link(event)
    }
}

#[derive(Debug, Clone)]
enum Tracked {
    Compiled(FlowObjectiveIntent),
    CompileFailed(CompilationError),
    Withdrawn,
}

struct Inner {
    intents: Arc<dyn ConsistentMap<IntentKey, Intent>>,
    compiler: Arc<dyn IntentCompiler>,
    topology: Arc<TopologyStore>,
    installer: MastershipGatedInstaller,
    progress: InstallProgress,
    tracked: RwLock<BTreeMap<IntentKey, Tracked>>,
    // Serializes compile-and-install passes on this node
    drive: async_lock::Mutex<()>,
    reconcile_interval: Duration,
}

/// Builder for [`IntentManager`]
pub struct IntentManagerBuilder {
    intents: Arc<dyn ConsistentMap<IntentKey, Intent>>,
    topology: Arc<TopologyStore>,
    installer: MastershipGatedInstaller,
    progress: InstallProgress,
    compiler: Arc<dyn IntentCompiler>,
    reconcile_interval: Duration,
}

impl IntentManagerBuilder {
    /// Compile with `compiler` instead of [`LinkCollectionCompiler`]
    pub fn with_compiler(mut self, compiler: Arc<dyn IntentCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    /// Period between full reconciliations in [`IntentManager::run`]
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Build the manager
    pub fn build(self) -> IntentManager {
        IntentManager {
            inner: Arc::new(Inner {
                intents: self.intents,
                compiler: self.compiler,
                topology: self.topology,
                installer: self.installer,
                progress: self.progress,
                tracked: RwLock::new(BTreeMap::new()),
                drive: async_lock::Mutex::new(()),
                reconcile_interval: self.reconcile_interval,
            }),
        }
    }
}

/// Compiles, installs and re-evaluates intents on one node
#[derive(Clone)]
pub struct IntentManager {
    inner: Arc<Inner>,
}

impl IntentManager {
    /// Start building a manager over the shared registry and this node's
    /// topology, installer and progress map
    pub fn builder(
        intents: Arc<dyn ConsistentMap<IntentKey, Intent>>,
        topology: Arc<TopologyStore>,
        installer: MastershipGatedInstaller,
        progress: InstallProgress,
    ) -> IntentManagerBuilder {
        IntentManagerBuilder {
            intents,
            topology,
            installer,
            progress,
            compiler: Arc::new(LinkCollectionCompiler::default()),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    /// Node running this manager
    pub fn local_node(&self) -> NodeId {
        self.inner.installer.oracle().local_node()
    }

    /// Install progress shared with the cluster
    pub fn progress(&self) -> &InstallProgress {
        &self.inner.progress
    }

    /// Register `intent` and install it on the devices this node masters.
    ///
    /// Resubmitting under an existing key replaces the intent. When the
    /// intent does not compile it stays registered in the failed state and
    /// is retried on the next topology change that touches it.
    pub async fn submit(&self, intent: Intent) -> Result<IntentInstallState> {
        let key = intent.key().clone();
        self.inner.intents.put(key.clone(), intent.clone()).await?;
        tracing::info!(intent = %key, "intent submitted");
        self.inner.drive(&intent, &BTreeSet::new()).await
    }

    /// Unregister `key` and remove its objectives from mastered devices
    pub async fn withdraw(&self, key: &IntentKey) -> Result<IntentInstallState> {
        let removed = self.inner.intents.remove(key).await?;
        let known = matches!(
            self.inner.tracked.read().get(key),
            Some(Tracked::Compiled(_) | Tracked::CompileFailed(_))
        );
        if removed.is_none() && !known {
            return Err(InstallError::NotFound(key.clone()));
        }
        self.inner.withdraw_local(key).await?;
        tracing::info!(intent = %key, "intent withdrawn");
        Ok(IntentInstallState::Withdrawn)
    }

    /// State of `key` as seen from this node
    pub fn intent_state(&self, key: &IntentKey) -> Option<IntentInstallState> {
        match self.inner.tracked.read().get(key)? {
            Tracked::Compiled(compiled) => Some(
                self.inner
                    .progress
                    .state(key, &compiled.devices()),
            ),
            Tracked::CompileFailed(_) => Some(IntentInstallState::Failed),
            Tracked::Withdrawn => Some(IntentInstallState::Withdrawn),
        }
    }

    /// Last successful compilation of `key`
    pub fn compiled(&self, key: &IntentKey) -> Option<FlowObjectiveIntent> {
        match self.inner.tracked.read().get(key)? {
            Tracked::Compiled(compiled) => Some(compiled.clone()),
            Tracked::CompileFailed(_) | Tracked::Withdrawn => None,
        }
    }

    /// Why `key` last failed to compile
    pub fn compile_error(&self, key: &IntentKey) -> Option<CompilationError> {
        match self.inner.tracked.read().get(key)? {
            Tracked::CompileFailed(error) => Some(error.clone()),
            Tracked::Compiled(_) | Tracked::Withdrawn => None,
        }
    }

    /// Every registered intent
    pub async fn intents(&self) -> Result<Vec<Intent>> {
        self.inner.registered().await
    }

    /// Re-evaluate the intents `change` affects; returns how many were
    /// re-driven
    pub async fn handle_topology_event(&self, change: &TopologyChange) -> Result<usize> {
        let affected: Vec<Intent> = self
            .inner
            .registered()
            .await?
            .into_iter()
            .filter(|intent| change.affects(intent))
            .collect();
        tracing::debug!(
            devices = ?change.devices(),
            intents = affected.len(),
            "topology change"
        );
        self.inner.drive_all(&affected, &BTreeSet::new()).await
    }

    /// React to a mastership change.
    ///
    /// Gaining a device re-drives every intent touching it. Losing one needs
    /// no action here: installs in flight notice and abandon the device.
    pub async fn handle_mastership_event(&self, event: &MastershipEvent) -> Result<usize> {
        let local = self.local_node();
        if !event.is_master(&local) {
            tracing::info!(
                device = %event.device_id,
                master = ?event.master,
                "device mastered elsewhere"
            );
            return Ok(0);
        }
        tracing::info!(device = %event.device_id, "gained mastership");
        let affected: Vec<Intent> = self
            .inner
            .registered()
            .await?
            .into_iter()
            .filter(|intent| intent.devices().contains(&event.device_id))
            .collect();
        let force = BTreeSet::from([event.device_id.clone()]);
        self.inner.drive_all(&affected, &force).await
    }

    /// Bring this node in line with the registry: drive every registered
    /// intent and withdraw local state of intents no longer registered
    pub async fn reconcile(&self) -> Result<usize> {
        let registered = self.inner.registered().await?;
        let keys: BTreeSet<&IntentKey> = registered.iter().map(Intent::key).collect();
        let stale: Vec<IntentKey> = self
            .inner
            .tracked
            .read()
            .iter()
            .filter(|(key, tracked)| !keys.contains(key) && !matches!(tracked, Tracked::Withdrawn))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.inner.withdraw_local(key).await?;
        }
        self.inner.drive_all(&registered, &BTreeSet::new()).await
    }

    /// Worker loop: follow the topology buses, `mastership`, and a periodic
    /// reconciliation until the topology store or the mastership bus closes
    pub async fn run(&self, mut mastership: broadcast::Receiver<MastershipEvent>) {
        let mut devices = self.inner.topology.subscribe_devices();
        let mut links = self.inner.topology.subscribe_links();
        let mut ticker = tokio::time::interval(self.inner.reconcile_interval);

        loop {
            let outcome = tokio::select! {
                event = devices.recv() => match event {
                    Ok(event) => self.handle_topology_event(&event.into()).await,
                    Err(RecvError::Lagged(missed)) => self.catch_up("device", missed).await,
                    Err(RecvError::Closed) => break,
                },
                event = links.recv() => match event {
                    Ok(event) => self.handle_topology_event(&event.into()).await,
                    Err(RecvError::Lagged(missed)) => self.catch_up("link", missed).await,
                    Err(RecvError::Closed) => break,
                },
                event = mastership.recv() => match event {
                    Ok(event) => self.handle_mastership_event(&event).await,
                    Err(RecvError::Lagged(missed)) => self.catch_up("mastership", missed).await,
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => self.reconcile().await,
            };
            if let Err(error) = outcome {
                tracing::warn!(error = %error, "intent re-evaluation failed");
            }
        }
        tracing::info!(node = %self.local_node(), "intent worker stopped");
    }

    /// Run [`IntentManager::run`] on a spawned task
    pub fn spawn(&self, mastership: broadcast::Receiver<MastershipEvent>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run(mastership).await })
    }

    async fn catch_up(&self, bus: &str, missed: u64) -> Result<usize> {
        tracing::warn!(bus, missed, "event bus lagged, reconciling");
        self.reconcile().await
    }
}

impl Inner {
    async fn registered(&self) -> Result<Vec<Intent>> {
        Ok(self
            .intents
            .entry_set()
            .await?
            .into_iter()
            .map(|(_, intent)| intent.into_value())
            .collect())
    }

    async fn drive_all(&self, intents: &[Intent], force: &BTreeSet<DeviceId>) -> Result<usize> {
        for intent in intents {
            match self.drive(intent, force).await {
                Ok(_) | Err(InstallError::Compilation(_)) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(intents.len())
    }

    /// Compile `intent` and install what this node owes the devices it
    /// masters.
    ///
    /// Besides the diff against the previous compilation, a device is
    /// (re)programmed in full when it is in `force` or when this node has no
    /// installed record of its own for it.
    async fn drive(&self, intent: &Intent, force: &BTreeSet<DeviceId>) -> Result<IntentInstallState> {
        let _guard = self.drive.lock().await;
        let key = intent.key().clone();
        let previous = match self.tracked.read().get(&key) {
            Some(Tracked::Compiled(compiled)) => Some(compiled.clone()),
            _ => None,
        };

        let compiled = match self
            .compiler
            .compile(intent, previous.as_ref(), self.topology.as_ref())
        {
            Ok(compiled) => compiled,
            Err(error) => {
                tracing::warn!(intent = %key, error = %error, "intent failed to compile");
                self.tracked
                    .write()
                    .insert(key.clone(), Tracked::CompileFailed(error.clone()));
                if let Some(previous) = previous {
                    self.remove_installed(&previous, false).await?;
                }
                return Err(error.into());
            }
        };

        let changes = self.pending_changes(&compiled, previous.as_ref(), force);
        if !changes.is_empty() {
            self.mark_installing(&compiled, &changes)?;
            let report = self.installer.install(&changes).await;
            self.record_outcomes(&compiled, &report)?;
        }
        self.tracked
            .write()
            .insert(key.clone(), Tracked::Compiled(compiled.clone()));

        let state = self.progress.state(&key, &compiled.devices());
        tracing::debug!(intent = %key, changes = changes.len(), state = %state, "intent driven");
        Ok(state)
    }

    fn pending_changes(
        &self,
        compiled: &FlowObjectiveIntent,
        previous: Option<&FlowObjectiveIntent>,
        force: &BTreeSet<DeviceId>,
    ) -> Vec<Installable> {
        let local = self.installer.oracle().local_node();
        let mut changes = compiled.diff(previous);
        let mut seen: BTreeSet<Installable> = changes.iter().cloned().collect();
        for device in compiled.devices() {
            let settled = self.progress.get(&compiled.key, &device).is_some_and(|record| {
                record.state == DeviceInstallState::Installed && record.node == local
            });
            if settled && !force.contains(&device) {
                continue;
            }
            for installable in compiled.installables.iter().filter(|i| i.device_id == device) {
                if seen.insert(installable.clone()) {
                    changes.push(installable.clone());
                }
            }
        }
        changes
    }

    fn mark_installing(&self, compiled: &FlowObjectiveIntent, changes: &[Installable]) -> Result<()> {
        let oracle = self.installer.oracle();
        let devices: BTreeSet<&DeviceId> = changes
            .iter()
            .map(|i| &i.device_id)
            .filter(|device| compiled.touches(device) && oracle.is_local_master(device))
            .collect();
        for device in devices {
            self.progress.record(
                &compiled.key,
                device,
                DeviceInstallRecord {
                    state: DeviceInstallState::Installing,
                    node: oracle.local_node(),
                    objectives: compiled.objectives_for(device).len(),
                },
            )?;
        }
        Ok(())
    }

    fn record_outcomes(&self, compiled: &FlowObjectiveIntent, report: &InstallReport) -> Result<()> {
        let local = self.installer.oracle().local_node();
        for (device, outcome) in &report.outcomes {
            if !compiled.touches(device) {
                // Only withdrawals went to a device that left the intent
                self.progress.clear(&compiled.key, device)?;
                continue;
            }
            let state = match outcome {
                DeviceOutcome::Installed { .. } => DeviceInstallState::Installed,
                DeviceOutcome::Failed(error) => {
                    tracing::warn!(
                        intent = %compiled.key,
                        device = %device,
                        error = %error,
                        "device install failed"
                    );
                    DeviceInstallState::Failed {
                        reason: error.to_string(),
                    }
                }
                // The new master owns the record now
                DeviceOutcome::Abandoned { .. } => continue,
            };
            self.progress.record(
                &compiled.key,
                device,
                DeviceInstallRecord {
                    state,
                    node: local.clone(),
                    objectives: compiled.objectives_for(device).len(),
                },
            )?;
        }
        if report.is_complete() && !report.outcomes.is_empty() {
            tracing::info!(intent = %compiled.key, devices = report.outcomes.len(), "objectives installed");
        }
        Ok(())
    }

    /// Remove what `compiled` put on mastered devices.
    ///
    /// With `forget` set, devices that dropped their objectives lose their
    /// progress record; otherwise they are recorded as withdrawn.
    async fn remove_installed(&self, compiled: &FlowObjectiveIntent, forget: bool) -> Result<()> {
        let report = self.installer.install(&compiled.withdrawal()).await;
        let local = self.installer.oracle().local_node();
        for (device, outcome) in &report.outcomes {
            let state = match outcome {
                DeviceOutcome::Installed { .. } if forget => {
                    self.progress.clear(&compiled.key, device)?;
                    continue;
                }
                DeviceOutcome::Installed { .. } => DeviceInstallState::Withdrawn,
                DeviceOutcome::Failed(error) => {
                    tracing::warn!(
                        intent = %compiled.key,
                        device = %device,
                        error = %error,
                        "objective removal failed"
                    );
                    DeviceInstallState::Failed {
                        reason: error.to_string(),
                    }
                }
                DeviceOutcome::Abandoned { .. } => continue,
            };
            self.progress.record(
                &compiled.key,
                device,
                DeviceInstallRecord {
                    state,
                    node: local.clone(),
                    objectives: 0,
                },
            )?;
        }
        Ok(())
    }

    async fn withdraw_local(&self, key: &IntentKey) -> Result<()> {
        let _guard = self.drive.lock().await;
        let previous = self.tracked.write().insert(key.clone(), Tracked::Withdrawn);
        if let Some(Tracked::Compiled(compiled)) = previous {
            self.remove_installed(&compiled, true).await?;
        }
        Ok(())
    }
}
