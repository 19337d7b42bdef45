//! Transmit queues between the command path and the NIC initiators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nicsim_fabric::PciLink;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::message::Message;
use crate::types::Size;

/// FIFO feeding one per-VN transmit initiator.
///
/// Two flavors, selected by configuration: when PCI commands are modelled the
/// queue charges the command's PCI transfer time on the timed push; otherwise
/// pushes only yield to the scheduler. Pops block; ordering is FIFO in both
/// flavors, and reinjected messages (retransmissions, unparked messages) go
/// to the tail.
#[derive(Debug)]
pub struct TxQueue {
    tx: UnboundedSender<Arc<Message>>,
    rx: Mutex<UnboundedReceiver<Arc<Message>>>,
    pci: Option<PciLink>,
    // `UnboundedSender` exposes no length/emptiness query, so the count is
    // tracked alongside the channel itself.
    count: AtomicUsize,
}

impl TxQueue {
    pub fn new(pci: Option<PciLink>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            pci,
            count: AtomicUsize::new(0),
        })
    }

    /// Push from the command path, charging the simulated transfer of
    /// `simulated_size` command bytes when PCI commands are modelled.
    pub async fn push_timed(&self, msg: Arc<Message>, simulated_size: Size) {
        if let Some(pci) = &self.pci {
            pci.transfer(simulated_size).await;
        } else {
            tokio::task::yield_now().await;
        }
        if self.tx.send(msg).is_ok() {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Plain tail push (NIC-internal reinjection; never charges time).
    pub fn push(&self, msg: Arc<Message>) {
        if self.tx.send(msg).is_ok() {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Blocking pop. A single initiator consumes each queue.
    pub async fn pop(&self) -> Arc<Message> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(msg) => {
                self.count.fetch_sub(1, Ordering::SeqCst);
                msg
            }
            // All senders gone: the node is being torn down and the popping
            // actor with it. Park forever instead of spinning.
            None => std::future::pending().await,
        }
    }

    /// Whether a pop would complete immediately.
    pub fn ready(&self) -> bool {
        !self.is_empty()
    }

    /// Empty the queue, returning whatever was pending (teardown path).
    pub async fn drain(&self) -> Vec<Arc<Message>> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            self.count.fetch_sub(1, Ordering::SeqCst);
            drained.push(msg);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.count.load(Ordering::SeqCst) == 0
    }
}
