//! Receive-side NIC actor, one per virtual network class.
//!
//! Runs the matching engine over incoming requests, applies the operation to
//! memory, emits events and counter updates, and queues responses and
//! acknowledgements on the response-family transmit queue. Also the landing
//! point for responses and ACKs coming back to an initiator.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::atomics;
use crate::event::Event;
use crate::me::MatchEntry;
use crate::memory::capped_copy;
use crate::message::{Message, MsgType};
use crate::node::Node;
use crate::pt::Pt;
use crate::queue::TxQueue;
use crate::request::{MatchedEntry, ProcessState, Request, RequestOp};
use crate::types::{self, AckReq, EventKind, ListKind, NiFail, Vn};

/// Spawn the receive target for one VN.
pub fn spawn(node: Arc<Node>, vn: Vn) -> JoinHandle<()> {
    nicsim_fabric::spawn_daemon(run(node, vn))
}

async fn run(node: Arc<Node>, vn: Vn) {
    let mut rx = node.take_rx(vn);
    // Whatever we emit in reaction is response-class traffic of the same
    // service/compute family.
    let tx_queue = Arc::clone(&node.tx_queues[vn.response_family().index()]);

    while let Some(msg) = rx.recv().await {
        trace!(nid = node.nid, ?vn, kind = ?msg.msg_type, "received");
        match msg.msg_type {
            MsgType::PtlPut => handle_put(&node, &tx_queue, msg).await,
            MsgType::PtlAtomic => handle_atomic(&node, &tx_queue, msg).await,
            MsgType::PtlGet => handle_get(&node, &tx_queue, msg).await,
            MsgType::PtlFetchAtomic => handle_fetch_atomic(&node, &tx_queue, msg).await,
            MsgType::PtlGetResponse | MsgType::PtlFetchAtomicResponse => {
                handle_response(&node, &tx_queue, msg).await;
            }
            MsgType::PtlAck => handle_ptl_ack(&node, &tx_queue, msg).await,
            MsgType::E2eAck => handle_e2e_ack(&node, msg).await,
        }
    }
}

struct MatchHit {
    pt: Arc<Pt>,
    me: Arc<MatchEntry>,
}

/// The matching engine: find an NI compatible with the request, look up the
/// portal, then walk priority and overflow lists.
fn match_entry(node: &Node, msg: &Arc<Message>) -> (Option<MatchHit>, NiFail) {
    let req = &msg.request;
    for ni in node.nis() {
        if !ni.can_match_request(req) {
            continue;
        }

        let Some(pt) = ni.pt(req.pt_index) else {
            return (None, NiFail::TargetInvalid);
        };
        if !pt.enabled() {
            return (None, NiFail::PtDisabled);
        }
        if let Some(me) = pt.walk_through_lists(msg, &ni) {
            return (Some(MatchHit { pt, me }), NiFail::Ok);
        }
    }
    (None, NiFail::TargetInvalid)
}

/// Record the match on the request: phase, truncated length, delivery
/// offset, reported offset, and (when the response path needs it) a snapshot
/// of the matched entry. The locally-managed cursor advances here.
fn record_match(req: &Request, pt: &Arc<Pt>, me: &Arc<MatchEntry>, keep_snapshot: bool) -> (u64, u64) {
    let mlength = me.mlength(req.payload_size);
    let (start, reported) = me.offsetted_addr(req.remote_offset, req.payload_size, true);

    let mut state = req.state();
    state.phase = state.phase.max(ProcessState::Received);
    state.mlength = mlength;
    state.start = Some(start);
    state.target_remote_offset = reported;
    if keep_snapshot {
        state.matched = Some(MatchedEntry {
            pt_index: pt.index,
            user_ptr: me.user_ptr,
            options: me.desc.options,
            list: me.list,
            eq: pt.eq.clone(),
        });
    }
    (mlength, start)
}

/// Operation event for put-like requests. Overflow-list matches stay silent
/// here; their `*_OVERFLOW` event is produced by the unexpected-header walk.
/// Auto-unlink runs (and emits AUTO_UNLINK) before the operation event so an
/// application unlinking from the event callback cannot race it. Returns
/// whether the entry auto-unlinked.
async fn put_like_event(
    node: &Node,
    pt: &Arc<Pt>,
    me: &Arc<MatchEntry>,
    msg: &Arc<Message>,
    kind: EventKind,
) -> bool {
    let req = &msg.request;
    let emit = !me.has_option(types::PTL_ME_EVENT_COMM_DISABLE)
        && !me.has_option(types::PTL_ME_EVENT_SUCCESS_DISABLE)
        && me.list == ListKind::Priority;

    if !emit {
        return pt.maybe_auto_unlink(me, node).await;
    }

    let (mlength, start) = {
        let state = req.state();
        (state.mlength, state.start)
    };
    let mut event = Event::new(kind);
    event.initiator_nid = req.initiator_nid();
    event.initiator_pid = req.initiator_pid();
    event.pt_index = pt.index;
    event.user_ptr = me.user_ptr;
    event.rlength = req.payload_size;
    event.mlength = mlength;
    event.remote_offset = req.remote_offset;
    event.match_bits = req.match_bits;
    event.start = start;
    event.list = Some(me.list);
    if let Some(hdr) = req.op.hdr() {
        event.hdr_data = hdr;
    }
    if let Some((op, datatype)) = req.op.atomic_params() {
        event.atomic_op = Some(op);
        event.atomic_type = Some(datatype);
    }

    let auto_unlinked = pt.maybe_auto_unlink(me, node).await;
    node.issue_event(&pt.eq, event).await;
    auto_unlinked
}

/// Queue the acknowledgement for a put-like request, or fast-forward the
/// whole exchange in quick-ACK mode (no ACK message on the wire; SEND/ACK
/// fire at the initiator right now).
async fn send_ack(
    node: &Arc<Node>,
    tx_queue: &Arc<TxQueue>,
    msg: &Arc<Message>,
    ack_type: MsgType,
    fail: NiFail,
) {
    let req = &msg.request;
    if node.config.quick_acks {
        req.advance_phase(ProcessState::Finished);
        req.origin
            .node
            .release_e2e_entry(node.nid, msg.vn(), req.origin.pid, req.target_pid);
        req.maybe_issue_send().await;
        req.issue_ack(fail).await;
    } else {
        tx_queue.push(Message::ack_for(msg, ack_type, fail));
    }
}

async fn handle_put(node: &Arc<Node>, tx_queue: &Arc<TxQueue>, msg: Arc<Message>) {
    let req = Arc::clone(&msg.request);
    if req.phase() > ProcessState::Created {
        return; // Duplicate delivery (E2E retransmission).
    }

    let (matched, fail) = match_entry(node, &msg);
    let matched_entry = matched.is_some();
    let mut need_ack = false;
    let mut ack_type = MsgType::PtlAck;

    if let Some(hit) = matched {
        hit.me.set_in_use(true);
        // The response path only needs the entry snapshot for overflow
        // matches (the later unexpected-header walk).
        let keep_snapshot = hit.me.list == ListKind::Overflow;
        let (mlength, start) = record_match(&req, &hit.pt, &hit.me, keep_snapshot);

        if node.config.use_real_memory && !req.md.region.is_empty() {
            capped_copy(
                &hit.me.desc.region,
                start,
                &req.md.region,
                req.local_offset,
                mlength,
                node.config.max_memcpy,
            );
        }

        if hit.me.has_option(types::PTL_ME_EVENT_CT_COMM) {
            hit.me.increment_ct(mlength);
        }

        let need_portals_ack = !hit.me.has_option(types::PTL_ME_ACK_DISABLE)
            && req.op.ack_req() != AckReq::NoAck;
        need_ack = need_portals_ack || !node.config.e2e_off;
        ack_type = if need_portals_ack {
            MsgType::PtlAck
        } else {
            MsgType::E2eAck
        };

        hit.me.set_in_use(false);
        let auto_unlinked = put_like_event(node, &hit.pt, &hit.me, &msg, EventKind::Put).await;
        if !auto_unlinked && hit.me.needs_unlink() {
            hit.pt.unlink(&hit.me);
        }
    } else if req.op.ack_req() != AckReq::NoAck {
        // Nothing matched, but the initiator asked for an acknowledgement:
        // it gets one carrying the failure.
        need_ack = true;
        ack_type = MsgType::PtlAck;
    }

    if need_ack {
        send_ack(node, tx_queue, &msg, ack_type, fail).await;
    }

    // PCI leg writing the payload into host memory.
    if matched_entry && node.config.model_pci && msg.simulated_size > 0 {
        tokio::time::sleep(node.pci.first_packet_wait(msg.simulated_size)).await;
        node.pci.transfer(msg.simulated_size).await;
    }
}

async fn handle_atomic(node: &Arc<Node>, tx_queue: &Arc<TxQueue>, msg: Arc<Message>) {
    let req = Arc::clone(&msg.request);
    if req.phase() > ProcessState::Created {
        return;
    }

    let (matched, fail) = match_entry(node, &msg);
    let mut need_ack = false;
    let mut ack_type = MsgType::PtlAck;
    let mut dma = None;

    if let Some(hit) = matched {
        hit.me.set_in_use(true);
        let keep_snapshot = hit.me.list == ListKind::Overflow;
        let (mlength, start) = record_match(&req, &hit.pt, &hit.me, keep_snapshot);

        if node.config.use_real_memory && !req.md.region.is_empty() {
            apply_to_entry(node, &req, &hit.me, start, mlength, None);
        }

        if hit.me.has_option(types::PTL_ME_EVENT_CT_COMM) {
            hit.me.increment_ct(mlength);
        }

        let need_portals_ack = !hit.me.has_option(types::PTL_ME_ACK_DISABLE)
            && req.op.ack_req() != AckReq::NoAck;
        need_ack = need_portals_ack || !node.config.e2e_off;
        ack_type = if need_portals_ack {
            MsgType::PtlAck
        } else {
            MsgType::E2eAck
        };

        // Operand write-back overlaps the acknowledgement.
        if node.config.model_pci && msg.simulated_size > 0 {
            dma = Some(node.pci.transfer_detached(msg.simulated_size));
            tokio::time::sleep(node.pci.first_packet_wait(msg.simulated_size)).await;
        }

        if need_ack {
            send_ack(node, tx_queue, &msg, ack_type, fail).await;
            need_ack = false;
        }

        hit.me.set_in_use(false);
        let auto_unlinked = put_like_event(node, &hit.pt, &hit.me, &msg, EventKind::Atomic).await;
        if !auto_unlinked && hit.me.needs_unlink() {
            hit.pt.unlink(&hit.me);
        }
    } else if req.op.ack_req() != AckReq::NoAck {
        need_ack = true;
        ack_type = MsgType::PtlAck;
    }

    if need_ack {
        send_ack(node, tx_queue, &msg, ack_type, fail).await;
    }
    if let Some(dma) = dma {
        let _ = dma.await;
    }
}

async fn handle_get(node: &Arc<Node>, tx_queue: &Arc<TxQueue>, msg: Arc<Message>) {
    let req = Arc::clone(&msg.request);
    if req.phase() > ProcessState::Created {
        return;
    }

    let (matched, fail) = match_entry(node, &msg);
    let mut response_size = 0;

    if let Some(hit) = matched {
        hit.me.set_in_use(true);
        let (mlength, start) = record_match(&req, &hit.pt, &hit.me, true);

        if hit.me.has_option(types::PTL_ME_EVENT_CT_COMM) {
            hit.me.increment_ct(mlength);
        }
        response_size = mlength;

        if node.config.use_real_memory && !hit.me.desc.region.is_empty() {
            capped_copy(
                &req.md.region,
                req.local_offset,
                &hit.me.desc.region,
                start,
                mlength,
                node.config.max_memcpy,
            );
        }

        hit.me.set_in_use(false);
        // The GET event waits for the response to reach the wire; only
        // auto-unlink runs now.
        let auto_unlinked = hit.pt.maybe_auto_unlink(&hit.me, node).await;
        if !auto_unlinked && hit.me.needs_unlink() {
            hit.pt.unlink(&hit.me);
        }
    }

    tx_queue.push(Message::response_for(
        &msg,
        MsgType::PtlGetResponse,
        response_size,
        fail,
    ));
}

async fn handle_fetch_atomic(node: &Arc<Node>, tx_queue: &Arc<TxQueue>, msg: Arc<Message>) {
    let req = Arc::clone(&msg.request);
    if req.phase() > ProcessState::Created {
        return;
    }

    let (matched, fail) = match_entry(node, &msg);
    let mut response_size = 0;

    if let Some(hit) = matched {
        hit.me.set_in_use(true);
        let (mlength, start) = record_match(&req, &hit.pt, &hit.me, true);

        if node.config.use_real_memory && !req.md.region.is_empty() {
            let RequestOp::FetchAtomic {
                get_md,
                get_local_offset,
                constant,
                ..
            } = &req.op
            else {
                unreachable!("fetch-atomic message with a non-fetch-atomic request");
            };

            // Pre-op snapshot into the get-side MD: this is what the
            // initiator's fetch buffer receives.
            if !hit.me.desc.region.is_empty() {
                capped_copy(
                    &get_md.region,
                    *get_local_offset,
                    &hit.me.desc.region,
                    start,
                    mlength,
                    node.config.max_memcpy,
                );
            }
            apply_to_entry(node, &req, &hit.me, start, mlength, constant.as_deref());
        }

        if hit.me.has_option(types::PTL_ME_EVENT_CT_COMM) {
            hit.me.increment_ct(mlength);
        }
        response_size = mlength;

        hit.me.set_in_use(false);
        // FETCH_ATOMIC event comes from the initiator when the response is
        // out, as for GET.
        let auto_unlinked = hit.pt.maybe_auto_unlink(&hit.me, node).await;
        if !auto_unlinked && hit.me.needs_unlink() {
            hit.pt.unlink(&hit.me);
        }
    }

    tx_queue.push(Message::response_for(
        &msg,
        MsgType::PtlFetchAtomicResponse,
        response_size,
        fail,
    ));
}

/// Run the atomic engine against the matched entry's memory.
fn apply_to_entry(
    node: &Node,
    req: &Request,
    me: &Arc<MatchEntry>,
    start: u64,
    mlength: u64,
    constant: Option<&[u8]>,
) {
    let Some((op, datatype)) = req.op.atomic_params() else {
        unreachable!("atomic apply on a non-atomic request");
    };
    let mut target_bytes = me.desc.region.read(start, mlength);
    let operand = req.md.region.read(req.local_offset, mlength);
    let len = target_bytes.len().min(operand.len());
    match atomics::apply_atomic_op(
        op,
        datatype,
        &mut target_bytes,
        &operand,
        constant,
        len,
        None,
    ) {
        Ok(()) => {
            me.desc.region.write(start, &target_bytes);
        }
        Err(err) => warn!(
            nid = node.nid,
            ?op,
            ?datatype,
            %err,
            "atomic operation rejected"
        ),
    }
}

/// A GET / FETCH_ATOMIC response landing back at the initiator.
async fn handle_response(node: &Arc<Node>, tx_queue: &Arc<TxQueue>, msg: Arc<Message>) {
    let req = Arc::clone(&msg.request);
    let request_vn = if req.service_vn {
        Vn::ServiceRequest
    } else {
        Vn::ComputeRequest
    };
    node.release_e2e_entry(msg.initiator, request_vn, req.origin.pid, req.target_pid);

    if req.phase() > ProcessState::Received {
        return; // Duplicate response.
    }
    req.advance_phase(ProcessState::Answered);

    // PCI leg writing the reply payload into host memory.
    let mut dma = None;
    if node.config.model_pci && msg.simulated_size > 0 {
        dma = Some(node.pci.transfer_detached(msg.simulated_size));
        tokio::time::sleep(node.pci.first_packet_wait(msg.simulated_size)).await;
    }

    if !node.config.e2e_off {
        tx_queue.push(Message::ack_for(&msg, MsgType::E2eAck, NiFail::Ok));
    }

    let reply_md = req.reply_md();
    if reply_md.has_option(types::PTL_MD_EVENT_CT_REPLY) {
        reply_md.increment_ct(req.payload_size);
    }

    let (mlength, remote_offset) = {
        let state = req.state();
        (state.mlength, state.target_remote_offset)
    };
    let mut event = Event::new(EventKind::Reply);
    event.ni_fail = msg.ni_fail;
    event.user_ptr = req.user_ptr;
    event.mlength = mlength;
    event.remote_offset = remote_offset;
    node.issue_event(&reply_md.eq, event).await;

    if let Some(dma) = dma {
        let _ = dma.await;
    }
}

/// A Portals ACK landing back at the initiator.
async fn handle_ptl_ack(node: &Arc<Node>, tx_queue: &Arc<TxQueue>, msg: Arc<Message>) {
    let req = Arc::clone(&msg.request);
    let request_vn = if req.service_vn {
        Vn::ServiceRequest
    } else {
        Vn::ComputeRequest
    };
    node.release_e2e_entry(msg.initiator, request_vn, req.origin.pid, req.target_pid);

    if !node.config.e2e_off {
        tx_queue.push(Message::ack_for(&msg, MsgType::E2eAck, NiFail::Ok));
    }

    if req.phase() <= ProcessState::Received {
        req.advance_phase(ProcessState::Answered);
        req.maybe_issue_send().await;
        req.issue_ack(msg.ni_fail).await;
    }
}

/// The E2E acknowledgement closing the reliability loop: finish the request,
/// give back flow-control credits, and emit whichever initiator/target-side
/// event was waiting for confirmed delivery.
async fn handle_e2e_ack(node: &Arc<Node>, msg: Arc<Message>) {
    let req = Arc::clone(&msg.request);
    if req.phase() >= ProcessState::Finished {
        return;
    }
    req.advance_phase(ProcessState::Finished);

    let Some(answers) = &msg.answers else {
        panic!("E2E ACK without an acknowledged message");
    };
    let vn = answers.vn();
    let (src_pid, dst_pid) = if vn.is_request() {
        (req.origin.pid, req.target_pid)
    } else {
        (req.target_pid, req.origin.pid)
    };
    node.release_e2e_entry(answers.target, vn, src_pid, dst_pid);

    match &req.op {
        RequestOp::Put { .. } | RequestOp::Atomic { .. } => {
            // A put that never asked for a Portals ACK still owes its SEND.
            if req.op.ack_req() == AckReq::NoAck {
                req.maybe_issue_send().await;
            }
        }
        RequestOp::Get => req.maybe_issue_target_event(EventKind::Get).await,
        RequestOp::FetchAtomic { .. } => {
            req.maybe_issue_target_event(EventKind::FetchAtomic).await;
        }
    }
}
