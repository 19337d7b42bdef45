//! Per-node NIC state: network interfaces, transmit queues, flow control,
//! E2E bookkeeping and the PCI endpoints.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use nicsim_fabric::{PciLink, Platform, SimClock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::SimConfig;
use crate::event::{Event, EventQueue};
use crate::message::{Message, MsgType};
use crate::ni::Ni;
use crate::queue::TxQueue;
use crate::types::{EVENT_SIZE, Nid, Pid, VN_COUNT, Vn};

/// Shared pool of in-flight reliable messages per node.
pub const MAX_E2E_ENTRIES: usize = 8192;

/// A message enlisted with the reliability engine, stamped with its
/// send-init time.
pub type E2eItem = (Arc<Message>, f64);

type RxChannels = [Mutex<Option<UnboundedReceiver<Arc<Message>>>>; VN_COUNT];

#[derive(Default)]
struct FlowCtrl {
    node_counts: [HashMap<Nid, i64>; VN_COUNT],
    process_counts: [HashMap<(Pid, Pid, Nid), i64>; VN_COUNT],
    waiting: [Vec<Arc<Message>>; VN_COUNT],
}

/// One simulated network node.
pub struct Node {
    pub nid: Nid,
    pub config: Arc<SimConfig>,
    pub clock: SimClock,
    pub pci: PciLink,
    pub tx_queues: [Arc<TxQueue>; VN_COUNT],
    nis: Mutex<Vec<Arc<Ni>>>,
    e2e_entries: Arc<Semaphore>,
    e2e_tx: UnboundedSender<E2eItem>,
    e2e_rx: Mutex<Option<UnboundedReceiver<E2eItem>>>,
    rx_txs: [UnboundedSender<Arc<Message>>; VN_COUNT],
    rx_rxs: RxChannels,
    flowctrl: Mutex<FlowCtrl>,
    pub e2e_retried: AtomicU64,
    pub e2e_gave_up: AtomicU64,
}

impl Node {
    pub fn new(nid: Nid, platform: &Platform, config: Arc<SimConfig>, clock: SimClock) -> Arc<Self> {
        let pci = platform.pci_link(nid);
        let queue_pci = config.model_pci_commands().then_some(pci);
        let tx_queues = std::array::from_fn(|_| TxQueue::new(queue_pci));

        let (e2e_tx, e2e_rx) = mpsc::unbounded_channel();
        let mut rx_txs = Vec::with_capacity(VN_COUNT);
        let rx_rxs: RxChannels = std::array::from_fn(|_| {
            let (tx, rx) = mpsc::unbounded_channel();
            rx_txs.push(tx);
            Mutex::new(Some(rx))
        });
        let rx_txs: [UnboundedSender<Arc<Message>>; VN_COUNT] = match rx_txs.try_into() {
            Ok(txs) => txs,
            Err(_) => unreachable!("one rx sender per VN"),
        };

        Arc::new(Self {
            nid,
            config,
            clock,
            pci,
            tx_queues,
            nis: Mutex::new(Vec::new()),
            e2e_entries: Arc::new(Semaphore::new(MAX_E2E_ENTRIES)),
            e2e_tx,
            e2e_rx: Mutex::new(Some(e2e_rx)),
            rx_txs,
            rx_rxs,
            flowctrl: Mutex::new(FlowCtrl::default()),
            e2e_retried: AtomicU64::new(0),
            e2e_gave_up: AtomicU64::new(0),
        })
    }

    // ----- network interfaces -----

    pub fn register_ni(&self, ni: Arc<Ni>) -> bool {
        let mut nis = self.nis.lock().unwrap();
        if nis.iter().any(|existing| existing.pid == ni.pid) {
            return false;
        }
        nis.push(ni);
        true
    }

    pub fn unregister_ni(&self, ni: &Arc<Ni>) {
        self.nis
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, ni));
    }

    pub fn nis(&self) -> Vec<Arc<Ni>> {
        self.nis.lock().unwrap().clone()
    }

    // ----- inbound wire mailboxes -----

    pub(crate) fn rx_sender(&self, vn: Vn) -> UnboundedSender<Arc<Message>> {
        self.rx_txs[vn.index()].clone()
    }

    pub(crate) fn take_rx(&self, vn: Vn) -> UnboundedReceiver<Arc<Message>> {
        self.rx_rxs[vn.index()]
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| panic!("rx mailbox for {vn:?} taken twice on node {}", self.nid))
    }

    pub(crate) fn take_e2e_rx(&self) -> UnboundedReceiver<E2eItem> {
        self.e2e_rx
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| panic!("E2E queue taken twice on node {}", self.nid))
    }

    // ----- event delivery -----

    /// Deliver an event into an EQ, paying the small PCI event transfer when
    /// command modelling is on. A missing EQ swallows the event.
    pub async fn issue_event(&self, eq: &Option<Arc<EventQueue>>, event: Event) {
        let Some(eq) = eq else { return };
        if self.config.model_pci_commands() {
            self.pci.transfer(EVENT_SIZE).await;
        }
        eq.deliver(event);
    }

    // ----- E2E entries -----

    /// Reserve an in-flight entry. Retransmissions re-use their entry and
    /// never come back here.
    pub async fn acquire_e2e_entry(&self) {
        if self.config.e2e_off {
            return;
        }
        match self.e2e_entries.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => unreachable!("E2E entry semaphore is never closed"),
        }
    }

    /// Hand a sent message to the reliability engine.
    pub fn e2e_enlist(&self, msg: &Arc<Message>) {
        let _ = self.e2e_tx.send((Arc::clone(msg), self.clock.now_secs()));
    }

    /// Release the E2E entry and the flow-control credits consumed by a
    /// message, then reinject any messages parked on that VN.
    pub fn release_e2e_entry(&self, target_nid: Nid, vn: Vn, src_pid: Pid, dst_pid: Pid) {
        if self.config.e2e_off {
            return;
        }
        self.e2e_entries.add_permits(1);

        let max_to_target = self.config.max_inflight_to_target;
        let max_to_process = self.config.max_inflight_to_process;
        if max_to_target == 0 && max_to_process == 0 {
            return;
        }

        {
            let mut flowctrl = self.flowctrl.lock().unwrap();
            if max_to_target > 0 {
                let count = flowctrl.node_counts[vn.index()]
                    .get_mut(&target_nid)
                    .unwrap_or_else(|| {
                        panic!(
                            "releasing a missing node-level flow-control counter {} -> {target_nid}",
                            self.nid
                        )
                    });
                *count += 1;
                assert!(
                    *count <= max_to_target as i64,
                    "node-level flow-control counter {} -> {target_nid} above its cap",
                    self.nid
                );
            }
            if max_to_process > 0 {
                let key = (src_pid, dst_pid, target_nid);
                let count = flowctrl.process_counts[vn.index()]
                    .get_mut(&key)
                    .unwrap_or_else(|| {
                        panic!(
                            "releasing a missing process-level flow-control counter {}:{src_pid} -> {target_nid}:{dst_pid}",
                            self.nid
                        )
                    });
                *count += 1;
                assert!(
                    *count <= max_to_process as i64,
                    "process-level flow-control counter {}:{src_pid} -> {target_nid}:{dst_pid} above its cap",
                    self.nid
                );
            }
        }

        self.resume_parked(vn);
    }

    // ----- flow control -----

    /// Try to consume flow-control credits for an outgoing message. E2E ACKs
    /// and retransmissions are never gated.
    pub fn check_flowctrl(&self, msg: &Arc<Message>) -> bool {
        if self.config.e2e_off || msg.msg_type == MsgType::E2eAck || msg.retry_count > 0 {
            return true;
        }

        let max_to_target = self.config.max_inflight_to_target;
        let max_to_process = self.config.max_inflight_to_process;
        if max_to_target == 0 && max_to_process == 0 {
            return true;
        }

        let vn = msg.vn();
        let req = &msg.request;
        let (src_pid, dst_pid) = if vn.is_request() {
            (req.initiator_pid(), req.target_pid)
        } else {
            (req.target_pid, req.initiator_pid())
        };
        let process_key = (src_pid, dst_pid, msg.target);

        let mut flowctrl = self.flowctrl.lock().unwrap();

        if max_to_target > 0 {
            let count = flowctrl.node_counts[vn.index()]
                .entry(msg.target)
                .or_insert_with(|| {
                    debug!(
                        src = self.nid,
                        dst = msg.target,
                        cap = max_to_target,
                        "creating node-level flow-control counter"
                    );
                    max_to_target as i64
                });
            assert!(*count >= 0, "node-level flow control below zero");
            if *count == 0 {
                return false;
            }
        }
        if max_to_process > 0 {
            let count = flowctrl.process_counts[vn.index()]
                .entry(process_key)
                .or_insert_with(|| {
                    debug!(
                        src = self.nid,
                        src_pid,
                        dst = msg.target,
                        dst_pid,
                        cap = max_to_process,
                        "creating process-level flow-control counter"
                    );
                    max_to_process as i64
                });
            assert!(*count >= 0, "process-level flow control below zero");
            if *count == 0 {
                return false;
            }
        }

        if max_to_target > 0 {
            *flowctrl.node_counts[vn.index()]
                .get_mut(&msg.target)
                .unwrap_or_else(|| unreachable!("counter created above")) -= 1;
        }
        if max_to_process > 0 {
            *flowctrl.process_counts[vn.index()]
                .get_mut(&process_key)
                .unwrap_or_else(|| unreachable!("counter created above")) -= 1;
        }
        true
    }

    /// Park a message that ran out of credits. Whoever releases credits
    /// reinjects the parked messages.
    pub fn park_flowctrl(&self, msg: Arc<Message>) {
        let mut flowctrl = self.flowctrl.lock().unwrap();
        let waiting = &mut flowctrl.waiting[msg.vn().index()];
        if !waiting.iter().any(|parked| Arc::ptr_eq(parked, &msg)) {
            waiting.push(msg);
        }
    }

    /// Push every message parked on `vn` back onto its transmit queue.
    pub fn resume_parked(&self, vn: Vn) {
        let parked = {
            let mut flowctrl = self.flowctrl.lock().unwrap();
            std::mem::take(&mut flowctrl.waiting[vn.index()])
        };
        for msg in parked {
            self.tx_queues[vn.index()].push(msg);
        }
    }

    /// Flow-control credit currently available toward a node, for tests and
    /// introspection. `None` when the counter was never created.
    pub fn flowctrl_credit(&self, vn: Vn, target_nid: Nid) -> Option<i64> {
        self.flowctrl.lock().unwrap().node_counts[vn.index()]
            .get(&target_nid)
            .copied()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("nid", &self.nid).finish()
    }
}
