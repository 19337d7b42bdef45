//! Network interfaces.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::pt::Pt;
use crate::request::Request;
use crate::types::{self, NiLimits, Nid, Pid, PtIndex, has_option};

/// Host-issued commands outstanding per NI.
pub const CQ_CAPACITY: usize = 16;

/// One opened network interface. The matching/non-matching and
/// physical/logical characters are fixed at creation.
#[derive(Debug)]
pub struct Ni {
    pub iface: u32,
    pub options: u32,
    pub pid: Pid,
    pub limits: NiLimits,
    /// Command-queue slots: taken by the command path, given back by the
    /// transmit initiator once it accepts the message.
    pub cq: Arc<Semaphore>,
    pts: Mutex<HashMap<PtIndex, Arc<Pt>>>,
    l2p: Mutex<Vec<(Nid, Pid)>>,
}

impl Ni {
    pub fn new(iface: u32, options: u32, pid: Pid, limits: NiLimits) -> Arc<Self> {
        Arc::new(Self {
            iface,
            options,
            pid,
            limits,
            cq: Arc::new(Semaphore::new(CQ_CAPACITY)),
            pts: Mutex::new(HashMap::new()),
            l2p: Mutex::new(Vec::new()),
        })
    }

    pub fn matching(&self) -> bool {
        has_option(self.options, types::PTL_NI_MATCHING)
    }

    pub fn physical(&self) -> bool {
        has_option(self.options, types::PTL_NI_PHYSICAL)
    }

    /// Whether an incoming request may be looked up on this NI at all.
    pub fn can_match_request(&self, req: &Request) -> bool {
        (self.pid == req.target_pid || req.target_pid == types::PTL_PID_ANY)
            && self.matching() == req.matching
    }

    // ----- portal table -----

    pub fn insert_pt(&self, index: PtIndex, pt: Arc<Pt>) -> bool {
        use std::collections::hash_map::Entry;
        match self.pts.lock().unwrap().entry(index) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(pt);
                true
            }
        }
    }

    /// First free index, for `PTL_PT_ANY` allocations.
    pub fn free_pt_index(&self) -> Option<PtIndex> {
        let pts = self.pts.lock().unwrap();
        (0..=self.limits.max_pt_index as PtIndex).find(|index| !pts.contains_key(index))
    }

    pub fn pt(&self, index: PtIndex) -> Option<Arc<Pt>> {
        self.pts.lock().unwrap().get(&index).cloned()
    }

    pub fn remove_pt(&self, index: PtIndex) -> Option<Arc<Pt>> {
        self.pts.lock().unwrap().remove(&index)
    }

    // ----- logical-to-physical map -----

    pub fn set_map(&self, map: Vec<(Nid, Pid)>) {
        *self.l2p.lock().unwrap() = map;
    }

    pub fn get_map(&self) -> Vec<(Nid, Pid)> {
        self.l2p.lock().unwrap().clone()
    }

    pub fn resolve_rank(&self, rank: u32) -> Option<(Nid, Pid)> {
        self.l2p.lock().unwrap().get(rank as usize).copied()
    }

    /// This process' own rank in the logical map.
    pub fn rank_of(&self, nid: Nid, pid: Pid) -> Option<u32> {
        self.l2p
            .lock()
            .unwrap()
            .iter()
            .position(|&entry| entry == (nid, pid))
            .map(|rank| rank as u32)
    }

    /// Resolve an addressed process to its physical identity.
    pub fn physical_proc(&self, target: types::ProcessId) -> Option<(Nid, Pid)> {
        match target {
            types::ProcessId::Phys { nid, pid } => Some((nid, pid)),
            types::ProcessId::Rank(rank) => self.resolve_rank(rank),
        }
    }
}
