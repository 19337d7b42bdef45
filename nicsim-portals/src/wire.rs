//! The wire between nodes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nicsim_fabric::Platform;
use tracing::warn;

use crate::message::Message;
use crate::node::Node;
use crate::types::Nid;

/// Point-to-point fabric connecting every node's per-VN receive mailboxes.
/// Transfers occupy the wire for the platform's bandwidth/latency figures
/// and then land in the target NIC's mailbox; pointer-passing semantics, no
/// serialization.
#[derive(Debug)]
pub struct Interconnect {
    platform: Platform,
    nodes: Mutex<HashMap<Nid, Arc<Node>>>,
}

impl Interconnect {
    pub fn new(platform: Platform) -> Arc<Self> {
        Arc::new(Self {
            platform,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, node: Arc<Node>) {
        self.nodes.lock().unwrap().insert(node.nid, node);
    }

    pub fn node(&self, nid: Nid) -> Option<Arc<Node>> {
        self.nodes.lock().unwrap().get(&nid).cloned()
    }

    /// Carry a message across the wire and deliver it to the target NIC.
    pub async fn send(&self, msg: Arc<Message>) {
        self.platform
            .net_link(msg.initiator, msg.target)
            .transfer(msg.simulated_size)
            .await;
        self.deliver(msg);
    }

    fn deliver(&self, msg: Arc<Message>) {
        let Some(node) = self.node(msg.target) else {
            warn!(target = msg.target, "message addressed to an unknown node");
            return;
        };
        let vn = msg.vn();
        let _ = node.rx_sender(vn).send(msg);
    }
}
