//! Intent lifecycle across an in-process cluster
//!
//! - Devices mastered by different nodes are installed by their own masters
//! - Replicated progress lets every node report the combined state
//! - Link loss fails the intent and removes its objectives; repair reinstalls
//! - A new master re-drives the devices it gained
//! - Withdrawal removes objectives on every master
//! - The worker loop follows topology events on its own

use meridian_core::{
    DeviceId, InstallConfig, LinkKey, LogicalClock, MapConfig, MastershipEvent, NodeId,
    ProviderId, Timestamped,
};
use meridian_install::{
    InstallError, InstallProgress, IntentInstallState, IntentManager, MastershipGatedInstaller,
};
use meridian_intent::{Intent, IntentKey};
use meridian_maps::{ConsistentMap, InMemoryNetwork, QuorumConsistentMap};
use meridian_testkit::{
    cp, device, init_tracing, linear_intent, linear_topology, ts, FailurePlan, FakeMastership,
    RecordingInstaller,
};
use meridian_topology::{
    GenericPortType, LinkDescription, LinkEvent, LinkType, PortDescription, TopologyStore,
};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Cluster fixture
// ============================================================================

struct Node {
    manager: IntentManager,
    driver: Arc<RecordingInstaller>,
    topology: Arc<TopologyStore>,
}

struct Cluster {
    _network: InMemoryNetwork,
    oracle: FakeMastership,
    nodes: Vec<Node>,
}

fn node_id(i: usize) -> NodeId {
    NodeId::new(format!("n{i}"))
}

fn map_config() -> MapConfig {
    MapConfig {
        consensus_timeout_ms: 500,
        ..MapConfig::default()
    }
}

fn install_config() -> InstallConfig {
    InstallConfig {
        install_timeout_ms: 100,
        max_retries: 2,
        min_backoff_ms: 1,
        max_backoff_ms: 5,
    }
}

/// `size` nodes over a line of `devices` switches; `masters[i]` is the index
/// of the node mastering `of:{i+1}`
fn cluster(size: usize, devices: u32, masters: &[usize]) -> Cluster {
    init_tracing();
    let network = InMemoryNetwork::new();
    let transports: Vec<_> = (1..=size).map(|i| network.join(node_id(i))).collect();
    let oracle = FakeMastership::new(node_id(1));
    for (index, master) in masters.iter().enumerate() {
        oracle.set_master(device(index as u32 + 1), Some(node_id(*master)));
    }

    let nodes = transports
        .into_iter()
        .enumerate()
        .map(|(index, transport)| {
            let node = node_id(index + 1);
            let intents: Arc<dyn ConsistentMap<IntentKey, Intent>> = Arc::new(
                QuorumConsistentMap::new("intents", node_id(1), transport.clone(), &map_config()),
            );
            let progress = InstallProgress::replicated(
                Arc::new(LogicalClock::new(node.clone())),
                transport,
                &map_config(),
            );
            let driver = Arc::new(RecordingInstaller::new());
            let installer = MastershipGatedInstaller::new(
                Arc::new(oracle.view(node)),
                driver.clone(),
                &install_config(),
            );
            let topology = Arc::new(linear_topology(devices));
            let manager = IntentManager::builder(intents, topology.clone(), installer, progress)
                .with_reconcile_interval(Duration::from_secs(60))
                .build();
            Node {
                manager,
                driver,
                topology,
            }
        })
        .collect();

    Cluster {
        _network: network,
        oracle,
        nodes,
    }
}

impl Cluster {
    async fn flush_progress(&self) {
        for node in &self.nodes {
            node.manager.progress().map().flush().await.unwrap();
        }
    }
}

fn restore_link(topology: &TopologyStore, link: &LinkKey, logical: u64) -> LinkEvent {
    topology
        .put_link_description(
            &ProviderId::new("of"),
            Timestamped::new(
                LinkDescription::new(link.src.clone(), link.dst.clone(), LinkType::Direct),
                ts(logical),
            ),
        )
        .unwrap()
        .unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

fn rules(node: &Node, n: u32) -> usize {
    node.driver.active_rules(&device(n)).len()
}

// ============================================================================
// Distributed installation
// ============================================================================

#[tokio::test]
async fn test_partial_install_converges_across_masters() {
    let cluster = cluster(2, 3, &[1, 2, 2]);
    let (n1, n2) = (&cluster.nodes[0], &cluster.nodes[1]);
    let intent = linear_intent(1, 3);
    let key = intent.key().clone();

    assert_eq!(
        n1.manager.submit(intent).await.unwrap(),
        IntentInstallState::PartiallyInstalled
    );
    assert_eq!(rules(n1, 1), 1);
    assert_eq!(n1.driver.attempts(&device(2)), 0);

    // n2 learns the intent from the registry and programs its own devices
    assert_eq!(n2.manager.reconcile().await.unwrap(), 1);
    assert_eq!(rules(n2, 2), 1);
    assert_eq!(rules(n2, 3), 1);
    assert_eq!(n2.driver.attempts(&device(1)), 0);

    cluster.flush_progress().await;
    assert_eq!(n1.manager.intent_state(&key), Some(IntentInstallState::Installed));
    assert_eq!(n2.manager.intent_state(&key), Some(IntentInstallState::Installed));
}

#[tokio::test]
async fn test_mastership_handover_redrives_device() {
    let cluster = cluster(2, 3, &[1, 1, 1]);
    let (n1, n2) = (&cluster.nodes[0], &cluster.nodes[1]);
    let intent = linear_intent(2, 3);
    let key = intent.key().clone();
    assert_eq!(
        n1.manager.submit(intent).await.unwrap(),
        IntentInstallState::Installed
    );
    n2.manager.reconcile().await.unwrap();
    assert_eq!(n2.driver.accepted_count(), 0);
    // n2 must have seen n1's records for its own to supersede them
    cluster.flush_progress().await;

    cluster.oracle.set_master(device(2), Some(node_id(2)));
    let event = MastershipEvent {
        device_id: device(2),
        master: Some(node_id(2)),
    };
    assert_eq!(n1.manager.handle_mastership_event(&event).await.unwrap(), 0);
    assert_eq!(n2.manager.handle_mastership_event(&event).await.unwrap(), 1);
    assert_eq!(rules(n2, 2), 1);
    assert_eq!(n2.driver.attempts(&device(1)), 0);

    cluster.flush_progress().await;
    let record = n1.manager.progress().get(&key, &device(2)).unwrap();
    assert_eq!(record.node, node_id(2));
    assert_eq!(n1.manager.intent_state(&key), Some(IntentInstallState::Installed));
}

#[tokio::test]
async fn test_withdraw_reaches_every_master() {
    let cluster = cluster(2, 2, &[1, 2]);
    let (n1, n2) = (&cluster.nodes[0], &cluster.nodes[1]);
    let intent = linear_intent(3, 2);
    let key = intent.key().clone();
    n1.manager.submit(intent).await.unwrap();
    n2.manager.reconcile().await.unwrap();
    assert_eq!(rules(n1, 1) + rules(n2, 2), 2);

    assert_eq!(
        n1.manager.withdraw(&key).await.unwrap(),
        IntentInstallState::Withdrawn
    );
    assert_eq!(rules(n1, 1), 0);
    assert!(n1.manager.compiled(&key).is_none());
    assert!(n2.manager.intents().await.unwrap().is_empty());

    // n2 drops its objectives once it notices the intent is gone
    n2.manager.reconcile().await.unwrap();
    assert_eq!(rules(n2, 2), 0);
    assert_eq!(n2.manager.intent_state(&key), Some(IntentInstallState::Withdrawn));

    // Withdrawn devices leave no progress behind once the cluster has caught up
    cluster.flush_progress().await;
    for node in &cluster.nodes {
        assert!(node.manager.progress().records(&key).is_empty());
    }
    for node in &cluster.nodes {
        node.manager.progress().map().anti_entropy_round().await.unwrap();
    }
    for node in &cluster.nodes {
        assert_eq!(node.manager.progress().map().tombstones(), 0);
    }

    assert!(matches!(
        n1.manager.withdraw(&key).await,
        Err(InstallError::NotFound(_))
    ));
}

// ============================================================================
// Re-evaluation
// ============================================================================

#[tokio::test]
async fn test_link_loss_fails_then_recovers() {
    let cluster = cluster(1, 3, &[1, 1, 1]);
    let node = &cluster.nodes[0];
    let intent = linear_intent(4, 3);
    let key = intent.key().clone();
    node.manager.submit(intent).await.unwrap();

    let link = LinkKey::new(cp(1, 3), cp(2, 4));
    let removed = node.topology.remove_link(&link).unwrap();
    assert_eq!(
        node.manager.handle_topology_event(&removed.into()).await.unwrap(),
        1
    );
    assert_eq!(node.manager.intent_state(&key), Some(IntentInstallState::Failed));
    for n in 1..=3 {
        assert_eq!(rules(node, n), 0, "of:{n} still holds objectives");
    }

    let restored = restore_link(&node.topology, &link, 20);
    node.manager
        .handle_topology_event(&restored.into())
        .await
        .unwrap();
    assert_eq!(node.manager.intent_state(&key), Some(IntentInstallState::Installed));
    for n in 1..=3 {
        assert_eq!(rules(node, n), 1);
    }
}

#[tokio::test]
async fn test_rejected_device_fails_intent_until_retried() {
    let cluster = cluster(1, 3, &[1, 1, 1]);
    let node = &cluster.nodes[0];
    node.driver.plan(device(2), FailurePlan::Reject);
    let intent = linear_intent(5, 3);
    let key = intent.key().clone();

    assert_eq!(
        node.manager.submit(intent).await.unwrap(),
        IntentInstallState::Failed
    );
    // Other devices keep what they installed
    assert_eq!(rules(node, 1), 1);
    assert_eq!(rules(node, 3), 1);

    node.driver.clear_plan(&device(2));
    node.manager.reconcile().await.unwrap();
    assert_eq!(node.manager.intent_state(&key), Some(IntentInstallState::Installed));
    assert_eq!(rules(node, 2), 1);
}

#[tokio::test]
async fn test_recompile_installs_only_the_difference() {
    let cluster = cluster(1, 3, &[1, 1, 1]);
    let node = &cluster.nodes[0];
    node.manager.submit(linear_intent(6, 3)).await.unwrap();
    let installed = node.driver.accepted_count();

    // A port update on a device of the intent recompiles to the same result
    let port_event = node
        .topology
        .put_port_description(
            &ProviderId::new("of"),
            &device(2),
            Timestamped::new(
                PortDescription::new(1u64, false, GenericPortType::Copper),
                ts(30),
            ),
        )
        .unwrap()
        .unwrap();
    node.manager
        .handle_topology_event(&port_event.into())
        .await
        .unwrap();
    assert_eq!(node.driver.accepted_count(), installed);
}

// ============================================================================
// Worker loop
// ============================================================================

#[tokio::test]
async fn test_worker_loop_follows_topology() {
    let cluster = cluster(1, 2, &[1, 1]);
    let node = &cluster.nodes[0];
    let worker = node.manager.spawn(cluster.oracle.subscribe());
    let intent = linear_intent(7, 2);
    let key = intent.key().clone();
    node.manager.submit(intent).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    node.topology
        .remove_link(&LinkKey::new(cp(1, 3), cp(2, 4)))
        .unwrap();
    let manager = node.manager.clone();
    assert!(eventually(|| manager.intent_state(&key) == Some(IntentInstallState::Failed)).await);
    assert_eq!(rules(node, 1), 0);

    worker.abort();
}

#[tokio::test]
async fn test_worker_loop_follows_mastership() {
    let cluster = cluster(2, 2, &[1, 1]);
    let (n1, n2) = (&cluster.nodes[0], &cluster.nodes[1]);
    let worker = n2.manager.spawn(cluster.oracle.subscribe());
    n1.manager.submit(linear_intent(8, 2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    cluster.oracle.set_master(device(2), Some(node_id(2)));
    let driver = n2.driver.clone();
    let target: DeviceId = device(2);
    assert!(eventually(|| driver.active_rules(&target).len() == 1).await);

    worker.abort();
}
