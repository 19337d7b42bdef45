//! Shared setup for the point-to-point tests: a two-node cluster and one
//! Portals endpoint per node.

#![allow(dead_code)]

use std::sync::Arc;

use nicsim_fabric::Platform;
use nicsim_portals::api::{EqHandle, NiHandle, Portals};
use nicsim_portals::types::{PTL_IFACE_DEFAULT, PTL_NI_MATCHING, PTL_NI_PHYSICAL};
use nicsim_portals::{Event, EventKind, SimConfig, Simulation};

pub const TEST_PID: u32 = 123;

pub fn two_nodes() -> Arc<Simulation> {
    Simulation::new(Platform::uniform(2), SimConfig::default())
}

pub fn two_nodes_with(config: SimConfig) -> Arc<Simulation> {
    Simulation::new(Platform::uniform(2), config)
}

pub struct Endpoint {
    pub ptl: Portals,
    pub nih: NiHandle,
    pub eqh: EqHandle,
}

/// Open a matching physical NI with an event queue on one node.
pub async fn endpoint(sim: &Simulation, nid: u32) -> Endpoint {
    endpoint_with(sim, nid, PTL_NI_MATCHING | PTL_NI_PHYSICAL, TEST_PID).await
}

pub async fn endpoint_with(sim: &Simulation, nid: u32, options: u32, pid: u32) -> Endpoint {
    let ptl = sim.process(nid);
    ptl.init().unwrap();
    let (nih, _) = ptl
        .ni_init(PTL_IFACE_DEFAULT, options, pid, None)
        .await
        .unwrap();
    let eqh = ptl.eq_alloc(nih, 64).unwrap();
    Endpoint { ptl, nih, eqh }
}

/// Block for the next event and assert its kind.
pub async fn expect_event(ep: &Endpoint, kind: EventKind) -> Event {
    let event = ep.ptl.eq_wait(ep.eqh).await.unwrap().into_event();
    assert_eq!(event.kind, kind, "unexpected event: {event:?}");
    event
}
