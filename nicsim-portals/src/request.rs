//! Portals operations in flight.
//!
//! One `Request` models one user-level operation (Put, Get, Atomic,
//! FetchAtomic, Swap); several wire messages usually reference it. The
//! target and the initiator share the request object, which is what lets
//! acknowledgement handlers observe truncation results without re-sending
//! them.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;

use crate::event::{Event, EventQueue};
use crate::md::Md;
use crate::node::Node;
use crate::types::{
    self, AckReq, AtomicDatatype, AtomicOp, EventKind, HdrData, ListKind, MatchBits, NiFail, Nid,
    Pid, PtIndex, Size, UserPtr,
};

/// Where a request came from: the issuing node, the issuing process and the
/// command queue whose slot the transmit initiator must hand back.
#[derive(Debug, Clone)]
pub struct Origin {
    pub node: Arc<Node>,
    pub pid: Pid,
    pub cq: Arc<Semaphore>,
}

/// Where a request is in its life. Strictly monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessState {
    Created,
    Received,
    Answered,
    Finished,
}

/// Per-kind payload of a request. Swap is a fetch-atomic whose operation is
/// from the swap family and carries the operation constant.
#[derive(Debug)]
pub enum RequestOp {
    Put {
        ack_req: AckReq,
        hdr: HdrData,
    },
    Get,
    Atomic {
        ack_req: AckReq,
        hdr: HdrData,
        op: AtomicOp,
        datatype: AtomicDatatype,
    },
    FetchAtomic {
        hdr: HdrData,
        op: AtomicOp,
        datatype: AtomicDatatype,
        get_md: Arc<Md>,
        get_local_offset: Size,
        /// Swap-family third operand, little-endian element bytes.
        constant: Option<Vec<u8>>,
    },
}

impl RequestOp {
    /// Capability bits an entry must expose to accept this operation:
    /// (needs OP_PUT, needs OP_GET).
    pub fn required_capabilities(&self) -> (bool, bool) {
        match self {
            RequestOp::Put { .. } | RequestOp::Atomic { .. } => (true, false),
            RequestOp::Get => (false, true),
            RequestOp::FetchAtomic { .. } => (true, true),
        }
    }

    pub fn ack_req(&self) -> AckReq {
        match self {
            RequestOp::Put { ack_req, .. } | RequestOp::Atomic { ack_req, .. } => *ack_req,
            // Gets and fetch-atomics are answered by a reply, never an ACK.
            RequestOp::Get | RequestOp::FetchAtomic { .. } => AckReq::NoAck,
        }
    }

    pub fn hdr(&self) -> Option<HdrData> {
        match self {
            RequestOp::Put { hdr, .. }
            | RequestOp::Atomic { hdr, .. }
            | RequestOp::FetchAtomic { hdr, .. } => Some(*hdr),
            RequestOp::Get => None,
        }
    }

    pub fn atomic_params(&self) -> Option<(AtomicOp, AtomicDatatype)> {
        match self {
            RequestOp::Atomic { op, datatype, .. }
            | RequestOp::FetchAtomic { op, datatype, .. } => Some((*op, *datatype)),
            _ => None,
        }
    }

    pub fn is_put_like(&self) -> bool {
        matches!(self, RequestOp::Put { .. } | RequestOp::Atomic { .. })
    }

    /// Event kind reported when a retained header for this request is
    /// consumed by a later append.
    pub fn overflow_event_kind(&self) -> EventKind {
        match self {
            RequestOp::Put { .. } => EventKind::PutOverflow,
            RequestOp::Get => EventKind::GetOverflow,
            RequestOp::Atomic { .. } => EventKind::AtomicOverflow,
            RequestOp::FetchAtomic { .. } => EventKind::FetchAtomicOverflow,
        }
    }
}

/// Snapshot of the entry a request matched, kept for the response path.
/// Plain values: the entry itself may be unlinked before the response lands.
#[derive(Debug, Clone)]
pub struct MatchedEntry {
    pub pt_index: PtIndex,
    pub user_ptr: UserPtr,
    pub options: u32,
    pub list: ListKind,
    pub eq: Option<Arc<EventQueue>>,
}

impl MatchedEntry {
    pub fn has_option(&self, flag: u32) -> bool {
        types::has_option(self.options, flag)
    }
}

#[derive(Debug)]
pub struct RequestState {
    pub phase: ProcessState,
    /// Bytes actually delivered at the target after truncation.
    pub mlength: Size,
    /// Offset the target reports back (locally-managed entries overwrite
    /// the requested one).
    pub target_remote_offset: Size,
    /// Delivery offset into the matched entry's region.
    pub start: Option<Size>,
    pub matched: Option<MatchedEntry>,
    send_event_issued: bool,
    reply_event_issued: bool,
}

/// A user operation shared by all of its messages.
#[derive(Debug)]
pub struct Request {
    pub op: RequestOp,
    pub payload_size: Size,
    /// Private MD copy taken at issue time.
    pub md: Arc<Md>,
    pub matching: bool,
    pub match_bits: MatchBits,
    pub target_pid: Pid,
    pub pt_index: PtIndex,
    pub user_ptr: UserPtr,
    pub service_vn: bool,
    pub local_offset: Size,
    pub remote_offset: Size,
    pub origin: Origin,
    state: Mutex<RequestState>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        op: RequestOp,
        md: Arc<Md>,
        payload_size: Size,
        matching: bool,
        match_bits: MatchBits,
        target_pid: Pid,
        pt_index: PtIndex,
        user_ptr: UserPtr,
        service_vn: bool,
        local_offset: Size,
        remote_offset: Size,
        origin: Origin,
    ) -> Arc<Self> {
        Arc::new(Self {
            op,
            payload_size,
            md,
            matching,
            match_bits,
            target_pid,
            pt_index,
            user_ptr,
            service_vn,
            local_offset,
            remote_offset,
            origin,
            state: Mutex::new(RequestState {
                phase: ProcessState::Created,
                mlength: 0,
                target_remote_offset: remote_offset,
                start: None,
                matched: None,
                send_event_issued: false,
                reply_event_issued: false,
            }),
        })
    }

    pub fn initiator_nid(&self) -> Nid {
        self.origin.node.nid
    }

    pub fn initiator_pid(&self) -> Pid {
        self.origin.pid
    }

    pub fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap()
    }

    pub fn phase(&self) -> ProcessState {
        self.state().phase
    }

    /// Advance the phase; the state machine never moves backwards.
    pub fn advance_phase(&self, phase: ProcessState) {
        let mut state = self.state();
        state.phase = state.phase.max(phase);
    }

    /// MD whose event queue the REPLY is delivered to: the get-side MD for
    /// fetch-atomics, the (only) MD otherwise.
    pub fn reply_md(&self) -> &Arc<Md> {
        match &self.op {
            RequestOp::FetchAtomic { get_md, .. } => get_md,
            _ => &self.md,
        }
    }

    /// SEND at the initiator, once. Buffered puts issue it from the command
    /// path; everything else from an acknowledgement, so a retransmission or
    /// a late ACK can never duplicate it.
    pub async fn maybe_issue_send(&self) {
        {
            let mut state = self.state();
            if state.send_event_issued {
                return;
            }
            state.send_event_issued = true;
        }

        if self.md.has_option(types::PTL_MD_EVENT_CT_SEND) {
            self.md.increment_ct(self.payload_size);
        }

        if !self.md.has_option(types::PTL_MD_EVENT_SEND_DISABLE)
            && !self.md.has_option(types::PTL_MD_EVENT_SUCCESS_DISABLE)
        {
            let mut event = Event::new(EventKind::Send);
            event.user_ptr = self.user_ptr;
            // SEND does not care about truncation.
            event.mlength = self.payload_size;
            self.origin.node.issue_event(&self.md.eq, event).await;
        }
    }

    /// ACK at the initiator (put-like requests that asked for one).
    pub async fn issue_ack(&self, fail: NiFail) {
        if self.md.has_option(types::PTL_MD_EVENT_CT_ACK) {
            self.md.increment_ct(self.payload_size);
        }

        if self.op.ack_req() == AckReq::Ack
            && !self.md.has_option(types::PTL_MD_EVENT_SUCCESS_DISABLE)
        {
            let (mlength, remote_offset) = {
                let state = self.state();
                (state.mlength, state.target_remote_offset)
            };
            let mut event = Event::new(EventKind::Ack);
            event.ni_fail = fail;
            event.user_ptr = self.user_ptr;
            event.mlength = mlength;
            event.remote_offset = remote_offset;
            self.origin.node.issue_event(&self.md.eq, event).await;
        }
    }

    /// GET / FETCH_ATOMIC at the target's matched entry, once per request.
    /// Emitted when the response is known delivered (or synthesised when E2E
    /// is off). Overflow-list matches stay silent here; their event comes
    /// from the unexpected-header walk.
    pub async fn maybe_issue_target_event(&self, kind: EventKind) {
        let matched = {
            let mut state = self.state();
            if state.reply_event_issued {
                return;
            }
            state.reply_event_issued = true;
            state.matched.clone()
        };

        let Some(matched) = matched else { return };
        if matched.has_option(types::PTL_ME_EVENT_COMM_DISABLE)
            || matched.has_option(types::PTL_ME_EVENT_SUCCESS_DISABLE)
            || matched.list != ListKind::Priority
        {
            return;
        }

        let (mlength, start) = {
            let state = self.state();
            (state.mlength, state.start)
        };
        let mut event = Event::new(kind);
        event.initiator_nid = self.initiator_nid();
        event.initiator_pid = self.origin.pid;
        event.pt_index = matched.pt_index;
        event.user_ptr = matched.user_ptr;
        event.rlength = self.payload_size;
        event.mlength = mlength;
        event.remote_offset = self.remote_offset;
        event.match_bits = self.match_bits;
        event.start = start;
        if let Some(hdr) = self.op.hdr() {
            event.hdr_data = hdr;
        }
        if let Some((op, datatype)) = self.op.atomic_params() {
            event.atomic_op = Some(op);
            event.atomic_type = Some(datatype);
        }
        self.origin.node.issue_event(&matched.eq, event).await;
    }
}
