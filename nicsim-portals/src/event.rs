//! Full events and event queues.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{PtlError, Result};
use crate::polling::{PollTimeout, wait_any};
use crate::types::{
    AtomicDatatype, AtomicOp, EventKind, HdrData, ListKind, MatchBits, NiFail, Nid, Pid, PtIndex,
    Size, UserPtr,
};

/// One full event, sec 3.13.4. Fields a given event kind does not define are
/// left at their defaults, as on the wire.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub ni_fail: NiFail,
    pub initiator_nid: Nid,
    pub initiator_pid: Pid,
    pub pt_index: PtIndex,
    pub user_ptr: UserPtr,
    pub hdr_data: HdrData,
    pub match_bits: MatchBits,
    pub rlength: Size,
    pub mlength: Size,
    pub remote_offset: Size,
    /// Byte offset into the matched entry's region where delivery started.
    pub start: Option<Size>,
    pub uid: u32,
    pub list: Option<ListKind>,
    pub atomic_op: Option<AtomicOp>,
    pub atomic_type: Option<AtomicDatatype>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            ni_fail: NiFail::Ok,
            initiator_nid: 0,
            initiator_pid: 0,
            pt_index: 0,
            user_ptr: 0,
            hdr_data: 0,
            match_bits: 0,
            rlength: 0,
            mlength: 0,
            remote_offset: 0,
            start: None,
            uid: 0,
            list: None,
            atomic_op: None,
            atomic_type: None,
        }
    }
}

/// A fetched event, tagged with whether the queue overflowed since the last
/// fetch (the `PTL_EQ_DROPPED` success-with-warning of the C API).
#[derive(Debug, Clone)]
pub enum EqRead {
    Ok(Event),
    Dropped(Event),
}

impl EqRead {
    pub fn event(&self) -> &Event {
        match self {
            EqRead::Ok(ev) | EqRead::Dropped(ev) => ev,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            EqRead::Ok(ev) | EqRead::Dropped(ev) => ev,
        }
    }
}

#[derive(Debug, Default)]
struct EqInner {
    queue: VecDeque<Event>,
    dropped: bool,
}

/// FIFO of events with a fixed capacity. Deliveries beyond the capacity are
/// discarded and surface as a dropped flag on the next fetch.
#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    inner: Mutex<EqInner>,
    notify: Notify,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(EqInner::default()),
            notify: Notify::new(),
        })
    }

    /// NIC-side delivery. Never blocks.
    pub fn deliver(&self, event: Event) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.queue.len() >= self.capacity {
                inner.dropped = true;
                return;
            }
            inner.queue.push_back(event);
        }
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<EqRead> {
        let mut inner = self.inner.lock().unwrap();
        let event = inner.queue.pop_front()?;
        if inner.dropped {
            inner.dropped = false;
            Some(EqRead::Dropped(event))
        } else {
            Some(EqRead::Ok(event))
        }
    }

    /// Non-blocking fetch.
    pub fn get(&self) -> Result<EqRead> {
        self.pop().ok_or(PtlError::EqEmpty)
    }

    /// Blocking fetch.
    pub async fn wait(&self) -> EqRead {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(read) = self.pop() {
                return read;
            }
            notified.await;
        }
    }

    pub fn ready(&self) -> bool {
        !self.inner.lock().unwrap().queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait on several queues at once; returns the index of the first queue
    /// that produced an event, or `EqEmpty` on timeout / empty probe.
    pub async fn poll(queues: &[Arc<EventQueue>], timeout_ms: i64) -> Result<(usize, EqRead)> {
        let timeout = PollTimeout::parse(timeout_ms)?;
        if queues.is_empty() {
            return Err(PtlError::ArgInvalid);
        }
        loop {
            // Register interest before checking, so a delivery racing with
            // the check is never lost.
            let mut futs = Vec::with_capacity(queues.len());
            for eq in queues {
                let mut fut = Box::pin(eq.notify.notified());
                fut.as_mut().enable();
                futs.push(fut);
            }

            for (i, eq) in queues.iter().enumerate() {
                if let Some(read) = eq.pop() {
                    return Ok((i, read));
                }
            }

            if !wait_any(futs, timeout).await {
                return Err(PtlError::EqEmpty);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn get_and_wait_are_fifo() {
        let eq = EventQueue::new(8);
        eq.deliver(Event::new(EventKind::Link));
        eq.deliver(Event::new(EventKind::Put));

        assert_eq!(eq.get().unwrap().event().kind, EventKind::Link);
        assert_eq!(eq.wait().await.event().kind, EventKind::Put);
        assert_eq!(eq.get().unwrap_err(), PtlError::EqEmpty);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_marks_the_next_fetch_dropped() {
        let eq = EventQueue::new(1);
        eq.deliver(Event::new(EventKind::Put));
        eq.deliver(Event::new(EventKind::Ack));

        match eq.get().unwrap() {
            EqRead::Dropped(ev) => assert_eq!(ev.kind, EventKind::Put),
            EqRead::Ok(_) => panic!("expected the dropped flag"),
        }
        // Flag is consumed.
        assert_eq!(eq.get().unwrap_err(), PtlError::EqEmpty);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_delivery() {
        let eq = EventQueue::new(8);
        let waiter = {
            let eq = eq.clone();
            tokio::spawn(async move { eq.wait().await.into_event().kind })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        eq.deliver(Event::new(EventKind::Send));
        assert_eq!(waiter.await.unwrap(), EventKind::Send);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_with_eq_empty() {
        let a = EventQueue::new(4);
        let b = EventQueue::new(4);
        let err = EventQueue::poll(&[a.clone(), b.clone()], 10).await.unwrap_err();
        assert_eq!(err, PtlError::EqEmpty);

        b.deliver(Event::new(EventKind::Reply));
        let (which, read) = EventQueue::poll(&[a, b], 10).await.unwrap();
        assert_eq!(which, 1);
        assert_eq!(read.event().kind, EventKind::Reply);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_rejects_bad_timeouts() {
        let eq = EventQueue::new(4);
        let err = EventQueue::poll(&[eq], -5).await.unwrap_err();
        assert_eq!(err, PtlError::ArgInvalid);
    }
}
