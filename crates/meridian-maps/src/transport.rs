//! Cluster messaging
//!
//! Maps talk to their peers through [`ClusterTransport`]: a request/response
//! channel addressed by node and subject. Each map registers a
//! [`MessageHandler`] per subject it serves.
//!
//! [`InMemoryNetwork`] connects any number of in-process nodes and can isolate
//! or stall individual nodes to exercise quorum loss and timeouts.

use crate::errors::TransportError;
use async_trait::async_trait;
use meridian_core::NodeId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Server side of a subject
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle `payload` from `from`, returning the reply payload
    async fn handle(&self, from: &NodeId, payload: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

/// Request/response messaging between cluster members
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Identity of this node
    fn local_node(&self) -> NodeId;

    /// All cluster members including this node, in id order
    fn members(&self) -> Vec<NodeId>;

    /// Serve `subject` on this node with `handler`, replacing any earlier one
    fn register_handler(&self, subject: &str, handler: Arc<dyn MessageHandler>);

    /// Send `payload` to `to` and wait for the reply
    async fn request(
        &self,
        to: &NodeId,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError>;

    /// Members other than this node
    fn peers(&self) -> Vec<NodeId> {
        let local = self.local_node();
        self.members().into_iter().filter(|n| *n != local).collect()
    }
}

#[derive(Default)]
struct NetworkState {
    members: BTreeSet<NodeId>,
    handlers: HashMap<(NodeId, String), Arc<dyn MessageHandler>>,
    isolated: BTreeSet<NodeId>,
    stalled: BTreeSet<NodeId>,
}

/// In-process network shared by a set of [`InMemoryTransport`]s
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `node` to the network and return its transport
    pub fn join(&self, node: NodeId) -> Arc<InMemoryTransport> {
        self.state.write().members.insert(node.clone());
        Arc::new(InMemoryTransport {
            node,
            network: self.clone(),
        })
    }

    /// Cut `node` off from every other member
    pub fn isolate(&self, node: &NodeId) {
        tracing::debug!(node = %node, "isolating node");
        self.state.write().isolated.insert(node.clone());
    }

    /// Undo [`InMemoryNetwork::isolate`]
    pub fn heal(&self, node: &NodeId) {
        self.state.write().isolated.remove(node);
    }

    /// Accept requests to `node` but never answer them
    pub fn stall(&self, node: &NodeId) {
        self.state.write().stalled.insert(node.clone());
    }

    /// Undo [`InMemoryNetwork::stall`]
    pub fn resume(&self, node: &NodeId) {
        self.state.write().stalled.remove(node);
    }
}

/// One node's view of an [`InMemoryNetwork`]
pub struct InMemoryTransport {
    node: NodeId,
    network: InMemoryNetwork,
}

#[async_trait]
impl ClusterTransport for InMemoryTransport {
    fn local_node(&self) -> NodeId {
        self.node.clone()
    }

    fn members(&self) -> Vec<NodeId> {
        self.network.state.read().members.iter().cloned().collect()
    }

    fn register_handler(&self, subject: &str, handler: Arc<dyn MessageHandler>) {
        self.network
            .state
            .write()
            .handlers
            .insert((self.node.clone(), subject.to_string()), handler);
    }

    async fn request(
        &self,
        to: &NodeId,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        let (handler, stalled) = {
            let state = self.network.state.read();
            let cut = *to != self.node
                && (state.isolated.contains(to) || state.isolated.contains(&self.node));
            if cut || !state.members.contains(to) {
                return Err(TransportError::Unreachable(to.clone()));
            }
            let handler = state
                .handlers
                .get(&(to.clone(), subject.to_string()))
                .cloned()
                .ok_or_else(|| TransportError::NoHandler {
                    peer: to.clone(),
                    subject: subject.to_string(),
                })?;
            (handler, state.stalled.contains(to))
        };

        if stalled {
            futures::future::pending::<()>().await;
        }
        handler.handle(&self.node, payload).await
    }
}
