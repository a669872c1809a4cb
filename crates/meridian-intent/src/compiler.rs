//! Compilation of intents into device-scoped forwarding objectives

use crate::errors::{CompilationError, Result};
use crate::intent::{Intent, IntentKey, LinkCollectionIntent};
use meridian_core::{
    AppId, DeviceId, ForwardingObjective, ObjectiveFlag, ObjectiveOp, PortNumber, TrafficSelector,
    TrafficTreatment,
};
use meridian_topology::TopologyView;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Application that owns objectives produced by the built-in compilers
pub const INTENT_FRAMEWORK_APP: &str = "org.meridian.net.intent";

/// One forwarding objective bound to the device it programs
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Installable {
    /// Target device
    pub device_id: DeviceId,
    /// What to program
    pub objective: ForwardingObjective,
}

/// Result of compiling one intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowObjectiveIntent {
    /// Intent this was compiled from
    pub key: IntentKey,
    /// Application owning the objectives
    pub app_id: AppId,
    /// Objectives in device order
    pub installables: Vec<Installable>,
    /// Resource references carried over from the intent
    pub resources: BTreeSet<String>,
}

impl FlowObjectiveIntent {
    /// Devices that receive at least one objective
    pub fn devices(&self) -> BTreeSet<DeviceId> {
        self.installables
            .iter()
            .map(|i| i.device_id.clone())
            .collect()
    }

    /// Objectives for one device
    pub fn objectives_for(&self, device_id: &DeviceId) -> Vec<&ForwardingObjective> {
        self.installables
            .iter()
            .filter(|i| &i.device_id == device_id)
            .map(|i| &i.objective)
            .collect()
    }

    /// True when any objective targets `device_id`
    pub fn touches(&self, device_id: &DeviceId) -> bool {
        self.installables.iter().any(|i| &i.device_id == device_id)
    }

    /// Objectives that move a device from `previous` to `self`.
    ///
    /// Rules of `previous` whose match no longer appears are withdrawn;
    /// installables that are new or changed are added.
    pub fn diff(&self, previous: Option<&FlowObjectiveIntent>) -> Vec<Installable> {
        let Some(previous) = previous else {
            return self.installables.clone();
        };
        let current: BTreeSet<&Installable> = self.installables.iter().collect();
        let current_rules: BTreeSet<_> = self
            .installables
            .iter()
            .map(|i| (&i.device_id, i.objective.rule_key()))
            .collect();

        let removals = previous
            .installables
            .iter()
            .filter(|i| !current_rules.contains(&(&i.device_id, i.objective.rule_key())))
            .map(|i| Installable {
                device_id: i.device_id.clone(),
                objective: i.objective.with_op(ObjectiveOp::Remove),
            });
        let previous: BTreeSet<&Installable> = previous.installables.iter().collect();
        let additions = current
            .into_iter()
            .filter(|i| !previous.contains(i))
            .cloned();
        removals.chain(additions).collect()
    }

    /// Objectives that withdraw everything this result installed
    pub fn withdrawal(&self) -> Vec<Installable> {
        self.installables
            .iter()
            .map(|i| Installable {
                device_id: i.device_id.clone(),
                objective: i.objective.with_op(ObjectiveOp::Remove),
            })
            .collect()
    }
}

/// Turns an intent into installables against the current topology
pub trait IntentCompiler: Send + Sync {
    /// Compile `intent`. `previous` is the last successful result for the
    /// same intent, if any.
    fn compile(
        &self,
        intent: &Intent,
        previous: Option<&FlowObjectiveIntent>,
        topology: &dyn TopologyView,
    ) -> Result<FlowObjectiveIntent>;
}

/// Compiler for [`LinkCollectionIntent`]
#[derive(Debug, Clone)]
pub struct LinkCollectionCompiler {
    app_id: AppId,
}

impl Default for LinkCollectionCompiler {
    fn default() -> Self {
        Self::new(AppId::new(1, INTENT_FRAMEWORK_APP))
    }
}

impl LinkCollectionCompiler {
    /// Compiler whose objectives are owned by `app_id`
    pub fn new(app_id: AppId) -> Self {
        Self { app_id }
    }

    /// Check every connect point and link against the topology
    fn validate(intent: &LinkCollectionIntent, topology: &dyn TopologyView) -> Result<()> {
        let key = intent.key();
        for device in intent.devices() {
            if !topology.contains_device(&device) {
                return Err(CompilationError::MissingDevice {
                    key: key.clone(),
                    device,
                });
            }
        }
        for point in intent.ingress_points().iter().chain(intent.egress_points()) {
            // Devices that report no ports cannot be checked
            let ports = topology.port_numbers(&point.device_id);
            if !ports.is_empty() && !ports.contains(&point.port) {
                return Err(CompilationError::MissingPort {
                    key: key.clone(),
                    point: point.clone(),
                });
            }
        }
        if let Some(link) = intent.links().iter().find(|l| !topology.contains_link(l)) {
            return Err(CompilationError::MissingLink {
                key: key.clone(),
                link: link.clone(),
            });
        }
        Ok(())
    }

    fn device_objectives(
        &self,
        intent: &LinkCollectionIntent,
        device_id: &DeviceId,
        in_ports: &BTreeSet<PortNumber>,
        out_ports: &BTreeSet<PortNumber>,
    ) -> Vec<ForwardingObjective> {
        let ingress_ports: BTreeSet<PortNumber> = intent
            .ingress_points()
            .iter()
            .filter(|point| &point.device_id == device_id)
            .map(|point| point.port)
            .collect();

        let default_treatment = with_outputs(TrafficTreatment::builder().build(), out_ports);
        let ingress_treatment = with_outputs(intent.treatment().clone(), out_ports);

        in_ports
            .iter()
            .map(|in_port| {
                let treatment = if ingress_ports.contains(in_port) {
                    &ingress_treatment
                } else {
                    &default_treatment
                };
                ForwardingObjective {
                    selector: in_port_selector(intent.selector(), *in_port),
                    treatment: treatment.clone(),
                    priority: intent.priority(),
                    flag: ObjectiveFlag::Specific,
                    permanent: true,
                    timeout_secs: 0,
                    app_id: self.app_id.clone(),
                    op: ObjectiveOp::Add,
                }
            })
            .collect()
    }

    fn compile_link_collection(
        &self,
        intent: &LinkCollectionIntent,
        topology: &dyn TopologyView,
    ) -> Result<FlowObjectiveIntent> {
        Self::validate(intent, topology)?;

        let mut input_ports: BTreeMap<DeviceId, BTreeSet<PortNumber>> = BTreeMap::new();
        let mut output_ports: BTreeMap<DeviceId, BTreeSet<PortNumber>> = BTreeMap::new();
        for link in intent.links() {
            input_ports
                .entry(link.dst.device_id.clone())
                .or_default()
                .insert(link.dst.port);
            output_ports
                .entry(link.src.device_id.clone())
                .or_default()
                .insert(link.src.port);
        }
        for point in intent.ingress_points() {
            input_ports
                .entry(point.device_id.clone())
                .or_default()
                .insert(point.port);
        }
        for point in intent.egress_points() {
            output_ports
                .entry(point.device_id.clone())
                .or_default()
                .insert(point.port);
        }

        let empty = BTreeSet::new();
        let installables = output_ports
            .iter()
            .flat_map(|(device_id, out_ports)| {
                let in_ports = input_ports.get(device_id).unwrap_or(&empty);
                self.device_objectives(intent, device_id, in_ports, out_ports)
                    .into_iter()
                    .map(move |objective| Installable {
                        device_id: device_id.clone(),
                        objective,
                    })
            })
            .collect();

        Ok(FlowObjectiveIntent {
            key: intent.key().clone(),
            app_id: self.app_id.clone(),
            installables,
            resources: intent.resources().clone(),
        })
    }
}

impl IntentCompiler for LinkCollectionCompiler {
    fn compile(
        &self,
        intent: &Intent,
        previous: Option<&FlowObjectiveIntent>,
        topology: &dyn TopologyView,
    ) -> Result<FlowObjectiveIntent> {
        let compiled = match intent {
            Intent::LinkCollection(intent) => self.compile_link_collection(intent, topology)?,
        };
        match previous {
            Some(previous) => tracing::debug!(
                intent = %compiled.key,
                installables = compiled.installables.len(),
                changes = compiled.diff(Some(previous)).len(),
                "recompiled intent"
            ),
            None => tracing::debug!(
                intent = %compiled.key,
                installables = compiled.installables.len(),
                "compiled intent"
            ),
        }
        Ok(compiled)
    }
}

fn with_outputs(treatment: TrafficTreatment, out_ports: &BTreeSet<PortNumber>) -> TrafficTreatment {
    out_ports
        .iter()
        .fold(treatment.to_builder(), |builder, port| builder.set_output(*port))
        .build()
}

fn in_port_selector(selector: &TrafficSelector, in_port: PortNumber) -> TrafficSelector {
    selector.to_builder().match_in_port(in_port).build()
}
