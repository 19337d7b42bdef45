//! Transmit-side NIC actor, one per virtual network class.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use crate::message::{Message, MsgType};
use crate::node::Node;
use crate::types::{self, BUFFERED_PUT_MAX, EventKind, Vn, has_option};
use crate::wire::Interconnect;

/// NIC command-processing cost.
const COMMAND_PROCESS_COST: Duration = Duration::from_nanos(300);
/// Cost of issuing a DMA read request toward host memory.
const DMA_REQUEST_COST: Duration = Duration::from_nanos(300);
/// Cost of completing a buffered put inside the NIC.
const BUFFERED_SEND_COST: Duration = Duration::from_nanos(400);
/// Per-message setup before the wire leg starts.
const WIRE_SETUP_COST: Duration = Duration::from_nanos(2);
/// Size of one DMA read request on the PCI bus.
const DMA_REQUEST_SIZE: u64 = 64;

/// Spawn the transmit initiator for one VN.
pub fn spawn(node: Arc<Node>, net: Arc<Interconnect>, vn: Vn) -> JoinHandle<()> {
    nicsim_fabric::spawn_daemon(run(node, net, vn))
}

async fn run(node: Arc<Node>, net: Arc<Interconnect>, vn: Vn) {
    let queue = Arc::clone(&node.tx_queues[vn.index()]);
    loop {
        let msg = queue.pop().await;

        // Out of credits: park it and keep the pipeline moving. Whoever
        // releases credits reinjects the parked messages.
        if !node.check_flowctrl(&msg) {
            node.park_flowctrl(msg);
            continue;
        }

        trace!(nid = node.nid, ?vn, kind = ?msg.msg_type, "transmitting");
        match msg.msg_type {
            MsgType::PtlPut | MsgType::PtlAtomic | MsgType::PtlFetchAtomic => {
                handle_put(&node, &net, msg).await;
            }
            MsgType::PtlGet => {
                msg.request.origin.cq.add_permits(1);
                reliable_send(&node, &net, msg).await;
            }
            // PTL vs E2E difference is entirely in the enlistment below.
            MsgType::PtlAck | MsgType::E2eAck => {
                reliable_send(&node, &net, msg).await;
            }
            MsgType::PtlGetResponse => {
                handle_response(&node, &net, Arc::clone(&msg)).await;
                if node.config.e2e_off {
                    // No E2E ACK will ever come back to trigger it.
                    msg.request.maybe_issue_target_event(EventKind::Get).await;
                }
            }
            MsgType::PtlFetchAtomicResponse => {
                handle_response(&node, &net, Arc::clone(&msg)).await;
                if node.config.e2e_off {
                    msg.request
                        .maybe_issue_target_event(EventKind::FetchAtomic)
                        .await;
                }
            }
        }
    }
}

/// Enlist with the reliability engine (fresh messages take an E2E entry;
/// retransmissions re-use theirs) and start the wire leg.
async fn wire_start(node: &Arc<Node>, net: &Arc<Interconnect>, msg: Arc<Message>) -> JoinHandle<()> {
    tokio::time::sleep(WIRE_SETUP_COST).await;
    if !node.config.e2e_off && msg.msg_type != MsgType::E2eAck {
        if msg.retry_count == 0 {
            node.acquire_e2e_entry().await;
        }
        node.e2e_enlist(&msg);
    }
    let net = Arc::clone(net);
    tokio::spawn(async move { net.send(msg).await })
}

/// Reliable send with the initiator blocked for the whole wire leg.
async fn reliable_send(node: &Arc<Node>, net: &Arc<Interconnect>, msg: Arc<Message>) {
    let wire = wire_start(node, net, msg).await;
    let _ = wire.await;
}

/// Put-family command: decide inline vs PIO vs DMA for the PCI leg, overlap
/// it with the wire leg, and complete buffered puts immediately.
async fn handle_put(node: &Arc<Node>, net: &Arc<Interconnect>, msg: Arc<Message>) {
    let req = Arc::clone(&msg.request);
    req.origin.cq.add_permits(1);

    tokio::time::sleep(COMMAND_PROCESS_COST).await;

    let inline_size = types::inline_size(req.matching);
    let pio = is_pio(
        node,
        req.matching,
        req.payload_size,
        req.md.options,
        msg.retry_count,
    );

    let needs_dma = !pio
        && node.config.model_pci
        && ((msg.retry_count > 0 && msg.simulated_size > BUFFERED_PUT_MAX)
            || (msg.retry_count == 0 && msg.simulated_size > inline_size));

    let buffered = msg.simulated_size <= BUFFERED_PUT_MAX;
    let mut dma = None;

    if needs_dma {
        // Ask the host for the payload, then stream it while the wire leg
        // runs detached.
        tokio::time::sleep(DMA_REQUEST_COST).await;
        node.pci.transfer(DMA_REQUEST_SIZE).await;
        dma = Some(
            node.pci
                .transfer_detached(req.payload_size.saturating_sub(inline_size)),
        );
        tokio::time::sleep(node.pci.first_packet_wait(msg.simulated_size)).await;
    }

    let wire = wire_start(node, net, msg).await;

    if buffered {
        tokio::time::sleep(BUFFERED_SEND_COST).await;
        req.maybe_issue_send().await;
    }

    match dma {
        Some(dma) => {
            let _ = dma.await;
            // Wire leg completes detached.
            drop(wire);
        }
        None => {
            let _ = wire.await;
        }
    }
}

/// Get / fetch-atomic response: the payload is always DMA'd out of host
/// memory, overlapped with the wire leg.
async fn handle_response(node: &Arc<Node>, net: &Arc<Interconnect>, msg: Arc<Message>) {
    let mut dma = None;
    if node.config.model_pci && msg.simulated_size > 0 {
        node.pci.transfer(DMA_REQUEST_SIZE).await;
        dma = Some(node.pci.transfer_detached(msg.simulated_size));
        tokio::time::sleep(node.pci.first_packet_wait(msg.simulated_size)).await;
    }

    let wire = wire_start(node, net, msg).await;

    match dma {
        Some(dma) => {
            let _ = dma.await;
            drop(wire);
        }
        None => {
            let _ = wire.await;
        }
    }
}

/// PIO applies to first transmissions of volatile MDs within the PIO band;
/// everything larger (and every large retransmission) goes out as DMA.
pub fn is_pio(
    node: &Node,
    req_matching: bool,
    payload_size: u64,
    md_options: u32,
    retry: u32,
) -> bool {
    retry == 0
        && node.config.model_pci
        && payload_size > types::inline_size(req_matching)
        && payload_size <= types::pio_size(req_matching)
        && has_option(md_options, types::PTL_MD_VOLATILE)
}
