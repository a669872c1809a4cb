//! Declarative connectivity requests
//!
//! An intent states what connectivity an application wants, not how each
//! device must be programmed. Intents are immutable once built; resubmitting
//! under the same key replaces the earlier intent.

use crate::errors::{CompilationError, Result};
use meridian_core::{AppId, ConnectPoint, DeviceId, LinkKey, TrafficSelector, TrafficTreatment};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Default priority of intents that do not set one
pub const DEFAULT_INTENT_PRIORITY: u16 = 100;

/// Application-scoped intent identity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IntentKey {
    /// Owning application
    pub app_id: AppId,
    /// Id unique within the application
    pub id: u64,
}

impl IntentKey {
    /// Create a key
    pub fn new(app_id: AppId, id: u64) -> Self {
        Self { app_id, id }
    }
}

impl fmt::Display for IntentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:#x}", self.app_id.name, self.id)
    }
}

/// Connectivity over an explicit set of links.
///
/// Traffic matching `selector` that enters at an ingress point receives
/// `treatment` there and is forwarded along `links` to every egress point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCollectionIntent {
    key: IntentKey,
    selector: TrafficSelector,
    treatment: TrafficTreatment,
    priority: u16,
    ingress_points: BTreeSet<ConnectPoint>,
    egress_points: BTreeSet<ConnectPoint>,
    links: BTreeSet<LinkKey>,
    resources: BTreeSet<String>,
}

impl LinkCollectionIntent {
    /// Start building an intent
    pub fn builder(app_id: AppId, id: u64) -> LinkCollectionIntentBuilder {
        LinkCollectionIntentBuilder {
            key: IntentKey::new(app_id, id),
            selector: TrafficSelector::new(),
            treatment: TrafficTreatment::new(),
            priority: DEFAULT_INTENT_PRIORITY,
            ingress_points: BTreeSet::new(),
            egress_points: BTreeSet::new(),
            links: BTreeSet::new(),
            resources: BTreeSet::new(),
        }
    }

    /// Identity
    pub fn key(&self) -> &IntentKey {
        &self.key
    }

    /// Traffic the intent applies to
    pub fn selector(&self) -> &TrafficSelector {
        &self.selector
    }

    /// Instructions applied where traffic enters
    pub fn treatment(&self) -> &TrafficTreatment {
        &self.treatment
    }

    /// Rule priority
    pub fn priority(&self) -> u16 {
        self.priority
    }

    /// Where traffic enters
    pub fn ingress_points(&self) -> &BTreeSet<ConnectPoint> {
        &self.ingress_points
    }

    /// Where traffic leaves
    pub fn egress_points(&self) -> &BTreeSet<ConnectPoint> {
        &self.egress_points
    }

    /// Links traffic traverses
    pub fn links(&self) -> &BTreeSet<LinkKey> {
        &self.links
    }

    /// Opaque resource references carried to the compiled result
    pub fn resources(&self) -> &BTreeSet<String> {
        &self.resources
    }

    /// Every device the intent names
    pub fn devices(&self) -> BTreeSet<DeviceId> {
        self.ingress_points
            .iter()
            .chain(&self.egress_points)
            .map(|point| point.device_id.clone())
            .chain(self.links.iter().flat_map(|link| {
                [link.src.device_id.clone(), link.dst.device_id.clone()]
            }))
            .collect()
    }
}

/// Builder for [`LinkCollectionIntent`]
#[derive(Debug, Clone)]
pub struct LinkCollectionIntentBuilder {
    key: IntentKey,
    selector: TrafficSelector,
    treatment: TrafficTreatment,
    priority: u16,
    ingress_points: BTreeSet<ConnectPoint>,
    egress_points: BTreeSet<ConnectPoint>,
    links: BTreeSet<LinkKey>,
    resources: BTreeSet<String>,
}

impl LinkCollectionIntentBuilder {
    /// Traffic selector
    pub fn selector(mut self, selector: TrafficSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Treatment applied at ingress
    pub fn treatment(mut self, treatment: TrafficTreatment) -> Self {
        self.treatment = treatment;
        self
    }

    /// Rule priority
    pub fn priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    /// Add an ingress point
    pub fn ingress(mut self, point: ConnectPoint) -> Self {
        self.ingress_points.insert(point);
        self
    }

    /// Add an egress point
    pub fn egress(mut self, point: ConnectPoint) -> Self {
        self.egress_points.insert(point);
        self
    }

    /// Add a link to traverse
    pub fn link(mut self, link: LinkKey) -> Self {
        self.links.insert(link);
        self
    }

    /// Add several links
    pub fn links(mut self, links: impl IntoIterator<Item = LinkKey>) -> Self {
        self.links.extend(links);
        self
    }

    /// Add a resource reference
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.insert(resource.into());
        self
    }

    /// Validate and finish.
    ///
    /// Fails when ingress or egress is empty, or when any named device lies
    /// off every walk from an ingress device to an egress device along the
    /// declared links.
    pub fn build(self) -> Result<LinkCollectionIntent> {
        if self.ingress_points.is_empty() {
            return Err(CompilationError::EmptyIntent {
                key: self.key,
                reason: "no ingress points".into(),
            });
        }
        if self.egress_points.is_empty() {
            return Err(CompilationError::EmptyIntent {
                key: self.key,
                reason: "no egress points".into(),
            });
        }

        let intent = LinkCollectionIntent {
            key: self.key,
            selector: self.selector,
            treatment: self.treatment,
            priority: self.priority,
            ingress_points: self.ingress_points,
            egress_points: self.egress_points,
            links: self.links,
            resources: self.resources,
        };
        check_reachability(&intent)?;
        Ok(intent)
    }
}

/// Devices reachable from `starts` following `edges`
fn reachable(
    starts: impl IntoIterator<Item = DeviceId>,
    edges: &BTreeMap<DeviceId, BTreeSet<DeviceId>>,
) -> BTreeSet<DeviceId> {
    let mut seen: BTreeSet<DeviceId> = BTreeSet::new();
    let mut queue: VecDeque<DeviceId> = starts.into_iter().collect();
    while let Some(device) = queue.pop_front() {
        if !seen.insert(device.clone()) {
            continue;
        }
        if let Some(next) = edges.get(&device) {
            queue.extend(next.iter().filter(|d| !seen.contains(*d)).cloned());
        }
    }
    seen
}

fn check_reachability(intent: &LinkCollectionIntent) -> Result<()> {
    let mut forward: BTreeMap<DeviceId, BTreeSet<DeviceId>> = BTreeMap::new();
    let mut backward: BTreeMap<DeviceId, BTreeSet<DeviceId>> = BTreeMap::new();
    for link in &intent.links {
        forward
            .entry(link.src.device_id.clone())
            .or_default()
            .insert(link.dst.device_id.clone());
        backward
            .entry(link.dst.device_id.clone())
            .or_default()
            .insert(link.src.device_id.clone());
    }

    let from_ingress = reachable(
        intent.ingress_points.iter().map(|p| p.device_id.clone()),
        &forward,
    );
    let to_egress = reachable(
        intent.egress_points.iter().map(|p| p.device_id.clone()),
        &backward,
    );
    match intent
        .devices()
        .into_iter()
        .find(|device| !from_ingress.contains(device) || !to_egress.contains(device))
    {
        Some(device) => Err(CompilationError::Unreachable {
            key: intent.key.clone(),
            device,
        }),
        None => Ok(()),
    }
}

/// Any intent the platform can compile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    /// Connectivity over an explicit link set
    LinkCollection(LinkCollectionIntent),
}

impl Intent {
    /// Identity
    pub fn key(&self) -> &IntentKey {
        match self {
            Self::LinkCollection(intent) => intent.key(),
        }
    }

    /// Every device the intent names
    pub fn devices(&self) -> BTreeSet<DeviceId> {
        match self {
            Self::LinkCollection(intent) => intent.devices(),
        }
    }

    /// Links the intent traverses
    pub fn links(&self) -> &BTreeSet<LinkKey> {
        match self {
            Self::LinkCollection(intent) => intent.links(),
        }
    }
}

impl From<LinkCollectionIntent> for Intent {
    fn from(intent: LinkCollectionIntent) -> Self {
        Self::LinkCollection(intent)
    }
}
