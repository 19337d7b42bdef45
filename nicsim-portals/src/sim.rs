//! The simulation registry: configuration, platform, nodes and their actors.
//!
//! Explicitly constructed and passed by handle; there is no process-wide
//! singleton. Building a `Simulation` spawns every node's NIC actors, so it
//! must happen inside the (paused-clock) runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nicsim_fabric::{Platform, SimClock};
use tracing::info;

use crate::api::Portals;
use crate::config::SimConfig;
use crate::node::Node;
use crate::types::{ALL_VNS, Nid};
use crate::wire::Interconnect;
use crate::{e2e, initiator, target};

pub struct Simulation {
    config: Arc<SimConfig>,
    platform: Platform,
    clock: SimClock,
    net: Arc<Interconnect>,
    nodes: Mutex<HashMap<Nid, Arc<Node>>>,
}

impl Simulation {
    /// Build the cluster: one node per platform entry, with four transmit
    /// initiators, four receive targets and (unless E2E is off) the retry
    /// engine each.
    pub fn new(platform: Platform, config: SimConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let clock = SimClock::start();
        let net = Interconnect::new(platform.clone());

        let sim = Arc::new(Self {
            config: Arc::clone(&config),
            platform: platform.clone(),
            clock,
            net,
            nodes: Mutex::new(HashMap::new()),
        });
        for nid in 0..platform.nodes {
            sim.add_node(nid);
        }
        info!(nodes = platform.nodes, "simulation built");
        sim
    }

    fn add_node(&self, nid: Nid) {
        let node = Node::new(nid, &self.platform, Arc::clone(&self.config), self.clock);
        self.net.register(Arc::clone(&node));

        for vn in ALL_VNS {
            initiator::spawn(Arc::clone(&node), Arc::clone(&self.net), vn);
            target::spawn(Arc::clone(&node), vn);
        }
        if !self.config.e2e_off {
            e2e::spawn(Arc::clone(&node));
        }

        self.nodes.lock().unwrap().insert(nid, node);
    }

    pub fn config(&self) -> &Arc<SimConfig> {
        &self.config
    }

    pub fn clock(&self) -> SimClock {
        self.clock
    }

    pub fn node(&self, nid: Nid) -> Arc<Node> {
        self.nodes
            .lock()
            .unwrap()
            .get(&nid)
            .cloned()
            .unwrap_or_else(|| panic!("no node {nid} in this simulation"))
    }

    /// A compute-class process endpoint on a node.
    pub fn process(&self, nid: Nid) -> Portals {
        Portals::new(self.node(nid), false)
    }

    /// A service-class process endpoint (management traffic rides the
    /// service VNs).
    pub fn service_process(&self, nid: Nid) -> Portals {
        Portals::new(self.node(nid), true)
    }
}
