//! Wire-level messages.

use std::sync::Arc;

use crate::request::Request;
use crate::types::{ACK_SIZE, NiFail, Nid, Size, Vn};

/// The eight message types that travel between NICs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    E2eAck,
    PtlAck,
    PtlPut,
    PtlGet,
    PtlAtomic,
    PtlFetchAtomic,
    PtlGetResponse,
    PtlFetchAtomicResponse,
}

impl MsgType {
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MsgType::PtlPut | MsgType::PtlGet | MsgType::PtlAtomic | MsgType::PtlFetchAtomic
        )
    }
}

/// One message on the wire. Immutable; retransmissions and responses are new
/// messages referencing the same parent request. `Arc` ownership keeps the
/// request alive until every retry path and event delivery has seen it.
#[derive(Debug)]
pub struct Message {
    pub msg_type: MsgType,
    pub initiator: Nid,
    pub target: Nid,
    pub simulated_size: Size,
    pub retry_count: u32,
    pub ni_fail: NiFail,
    pub request: Arc<Request>,
    /// For acknowledgements: the message being acknowledged.
    pub answers: Option<Arc<Message>>,
}

impl Message {
    pub fn request(
        msg_type: MsgType,
        initiator: Nid,
        target: Nid,
        simulated_size: Size,
        request: Arc<Request>,
    ) -> Arc<Self> {
        Arc::new(Self {
            msg_type,
            initiator,
            target,
            simulated_size,
            retry_count: 0,
            ni_fail: NiFail::Ok,
            request,
            answers: None,
        })
    }

    /// An acknowledgement (Portals or E2E) for `msg`, flowing backwards.
    pub fn ack_for(msg: &Arc<Message>, msg_type: MsgType, ni_fail: NiFail) -> Arc<Self> {
        Arc::new(Self {
            msg_type,
            initiator: msg.target,
            target: msg.initiator,
            simulated_size: ACK_SIZE,
            retry_count: 0,
            ni_fail,
            request: Arc::clone(&msg.request),
            answers: Some(Arc::clone(msg)),
        })
    }

    /// A data response (get / fetch-atomic) for `msg`, flowing backwards.
    pub fn response_for(
        msg: &Arc<Message>,
        msg_type: MsgType,
        simulated_size: Size,
        ni_fail: NiFail,
    ) -> Arc<Self> {
        Arc::new(Self {
            msg_type,
            initiator: msg.target,
            target: msg.initiator,
            simulated_size,
            retry_count: 0,
            ni_fail,
            request: Arc::clone(&msg.request),
            answers: None,
        })
    }

    /// A retransmission of `msg`.
    pub fn retransmit(msg: &Arc<Message>) -> Arc<Self> {
        Arc::new(Self {
            msg_type: msg.msg_type,
            initiator: msg.initiator,
            target: msg.target,
            simulated_size: msg.simulated_size,
            retry_count: msg.retry_count + 1,
            ni_fail: msg.ni_fail,
            request: Arc::clone(&msg.request),
            answers: msg.answers.as_ref().map(Arc::clone),
        })
    }

    /// Virtual network class: request types ride the request VN of the
    /// request's service/compute family, everything else the response VN.
    pub fn vn(&self) -> Vn {
        match (self.msg_type.is_request(), self.request.service_vn) {
            (true, true) => Vn::ServiceRequest,
            (true, false) => Vn::ComputeRequest,
            (false, true) => Vn::ServiceResponse,
            (false, false) => Vn::ComputeResponse,
        }
    }
}
