//! End-to-end reliability engine.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::event::Event;
use crate::message::{Message, MsgType};
use crate::node::Node;
use crate::request::{ProcessState, RequestOp};
use crate::types::{EventKind, NiFail};

/// Spawn the per-node retry actor.
///
/// One actor suffices: `retry_timeout` is constant, so messages time out in
/// the order they were enlisted, and sleeping until the head's deadline never
/// delays a later message's deadline.
pub fn spawn(node: Arc<Node>) -> JoinHandle<()> {
    let mut queue = node.take_e2e_rx();
    nicsim_fabric::spawn_daemon(async move {
        info!(
            nid = node.nid,
            timeout = node.config.retry_timeout,
            retries = node.config.max_retries,
            "E2E engine running"
        );

        while let Some((msg, send_init_time)) = queue.recv().await {
            node.clock
                .sleep_until_secs(send_init_time + node.config.retry_timeout)
                .await;

            // ACKed in time: a PTL_ACK is done once its request finished,
            // everything else once the request was answered.
            let settled = if msg.msg_type == MsgType::PtlAck {
                ProcessState::Finished
            } else {
                ProcessState::Answered
            };
            if msg.request.phase() >= settled {
                continue;
            }

            if msg.retry_count >= node.config.max_retries {
                node.e2e_gave_up.fetch_add(1, Ordering::Relaxed);
                debug!(
                    nid = node.nid,
                    kind = ?msg.msg_type,
                    retries = msg.retry_count,
                    "giving up on unacknowledged message"
                );
                if msg.msg_type.is_request() {
                    deliver_failure(&msg).await;
                }
                continue;
            }

            // Hand it back to the transmit initiator, at the tail. The
            // retransmission re-uses this message's E2E entry.
            node.e2e_retried.fetch_add(1, Ordering::Relaxed);
            let retransmit = Message::retransmit(&msg);
            let vn = retransmit.vn();
            node.tx_queues[vn.index()].push(retransmit);
            node.resume_parked(vn);
        }

        info!(
            nid = node.nid,
            retried = node.e2e_retried.load(Ordering::Relaxed),
            gave_up = node.e2e_gave_up.load(Ordering::Relaxed),
            "E2E engine stopping"
        );
    })
}

/// A given-up request is still forced to completion so the application and
/// the resource ledgers unblock: the pending completion event is delivered
/// with the FAIL type. A SEND that already went out is never duplicated, and
/// one that never went out is not synthesised.
async fn deliver_failure(msg: &Arc<Message>) {
    let req = &msg.request;
    req.advance_phase(ProcessState::Finished);
    match &req.op {
        RequestOp::Put { .. } | RequestOp::Atomic { .. } => {
            req.issue_ack(NiFail::Fail).await;
        }
        RequestOp::Get | RequestOp::FetchAtomic { .. } => {
            let reply_md = req.reply_md();
            let mut event = Event::new(EventKind::Reply);
            event.ni_fail = NiFail::Fail;
            event.user_ptr = req.user_ptr;
            req.origin.node.issue_event(&reply_md.eq, event).await;
        }
    }
}
