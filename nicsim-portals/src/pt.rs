//! Portal table entries: the pair of match lists plus retained unexpected
//! headers.

use std::sync::{Arc, Mutex};

use crate::event::{Event, EventQueue};
use crate::me::MatchEntry;
use crate::message::Message;
use crate::ni::Ni;
use crate::node::Node;
use crate::types::{self, EventKind, ListKind, PtIndex, has_option};

#[derive(Debug, Default)]
struct PtState {
    enabled: bool,
    priority: Vec<Arc<MatchEntry>>,
    overflow: Vec<Arc<MatchEntry>>,
    /// Messages that matched only on the overflow list, kept until a later
    /// priority append observes them.
    unexpected_headers: Vec<Arc<Message>>,
}

/// One slot of an NI's portal table.
#[derive(Debug)]
pub struct Pt {
    pub index: PtIndex,
    pub options: u32,
    pub eq: Option<Arc<EventQueue>>,
    state: Mutex<PtState>,
}

impl Pt {
    pub fn new(index: PtIndex, options: u32, eq: Option<Arc<EventQueue>>) -> Arc<Self> {
        Arc::new(Self {
            index,
            options,
            eq,
            state: Mutex::new(PtState {
                enabled: true,
                ..PtState::default()
            }),
        })
    }

    pub fn enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    pub fn enable(&self) {
        self.state.lock().unwrap().enabled = true;
    }

    pub fn disable(&self) {
        self.state.lock().unwrap().enabled = false;
    }

    /// Priority list first, then overflow, first match wins. An overflow
    /// match retains the message header for a later priority append. With
    /// the flow-control PT option, a message nothing matched disables the
    /// entry.
    pub fn walk_through_lists(
        self: &Arc<Self>,
        msg: &Arc<Message>,
        ni: &Ni,
    ) -> Option<Arc<MatchEntry>> {
        let mut state = self.state.lock().unwrap();
        if !state.enabled {
            return None;
        }

        let req = &msg.request;
        for me in &state.priority {
            if me.matches(req, ni) {
                me.mark_used();
                return Some(Arc::clone(me));
            }
        }
        if let Some(me) = state
            .overflow
            .iter()
            .find(|me| me.matches(req, ni))
            .cloned()
        {
            me.mark_used();
            state.unexpected_headers.push(Arc::clone(msg));
            return Some(me);
        }

        if has_option(self.options, types::PTL_PT_FLOWCTRL) {
            state.enabled = false;
        }
        None
    }

    /// Walk the retained headers in arrival order against a freshly appended
    /// priority entry. Each match consumes its header and emits the
    /// corresponding `*_OVERFLOW` event; a `USE_ONCE` entry stops after the
    /// first consumption.
    pub async fn walk_through_uhs(
        self: &Arc<Self>,
        me: &Arc<MatchEntry>,
        ni: &Ni,
        node: &Node,
    ) -> bool {
        let use_once = me.has_option(types::PTL_ME_USE_ONCE);
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let mut index = 0;
            while index < state.unexpected_headers.len() {
                let header = &state.unexpected_headers[index];
                let req = &header.request;
                if !me.matches(req, ni) {
                    index += 1;
                    continue;
                }
                me.mark_used();

                // The event reports the overflow entry the payload actually
                // landed in, not the entry being appended. The cursor of the
                // new entry is left untouched.
                let matched = req.state().matched.clone();
                let mut event = Event::new(req.op.overflow_event_kind());
                event.initiator_nid = req.initiator_nid();
                event.initiator_pid = req.initiator_pid();
                event.rlength = req.payload_size;
                event.match_bits = req.match_bits;
                if let Some(hdr) = req.op.hdr() {
                    event.hdr_data = hdr;
                }
                {
                    let req_state = req.state();
                    event.mlength = req_state.mlength;
                    event.start = req_state.start;
                }
                if let Some(matched) = matched {
                    event.pt_index = matched.pt_index;
                    event.user_ptr = matched.user_ptr;
                    event.list = Some(matched.list);
                }
                events.push(event);

                state.unexpected_headers.remove(index);
                if use_once {
                    break;
                }
            }
        }

        let matched_any = !events.is_empty();
        for event in events {
            node.issue_event(&self.eq, event).await;
        }
        matched_any
    }

    /// Append an entry, walking the retained headers first for priority
    /// appends. Returns false when a consumed `USE_ONCE` entry was not
    /// actually inserted (sec 3.12.2): such an append produces only the
    /// overflow event, no LINK and no AUTO_UNLINK.
    pub async fn append(
        self: &Arc<Self>,
        me: Arc<MatchEntry>,
        ni: &Ni,
        node: &Node,
    ) -> bool {
        let matched_uh = if me.list == ListKind::Priority {
            self.walk_through_uhs(&me, ni, node).await
        } else {
            false
        };

        if matched_uh && me.has_option(types::PTL_ME_USE_ONCE) {
            return false;
        }

        let user_ptr = me.user_ptr;
        let link_disabled = me.has_option(types::PTL_ME_EVENT_LINK_DISABLE);
        {
            let mut state = self.state.lock().unwrap();
            match me.list {
                ListKind::Priority => state.priority.push(me),
                ListKind::Overflow => state.overflow.push(me),
            }
        }

        if !link_disabled {
            let mut event = Event::new(EventKind::Link);
            event.pt_index = self.index;
            event.user_ptr = user_ptr;
            node.issue_event(&self.eq, event).await;
        }
        true
    }

    /// Remove an entry. If the matching engine currently holds it, the
    /// removal is deferred to the end of the handling step.
    pub fn unlink(&self, me: &Arc<MatchEntry>) {
        if me.in_use() {
            me.flag_needs_unlink();
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.priority.retain(|entry| !Arc::ptr_eq(entry, me));
        state.overflow.retain(|entry| !Arc::ptr_eq(entry, me));
    }

    /// Auto-unlink an entry whose condition fired, emitting AUTO_UNLINK.
    /// The event goes out before the operation event that triggered it, so
    /// an application unlinking from its event callback cannot race the
    /// entry's destruction.
    pub async fn maybe_auto_unlink(
        self: &Arc<Self>,
        me: &Arc<MatchEntry>,
        node: &Node,
    ) -> bool {
        if !me.should_auto_unlink() {
            return false;
        }

        let emit = !me.has_option(types::PTL_ME_EVENT_UNLINK_DISABLE)
            && !me.has_option(types::PTL_ME_EVENT_SUCCESS_DISABLE);
        self.unlink(me);

        if emit {
            let mut event = Event::new(EventKind::AutoUnlink);
            event.pt_index = self.index;
            event.user_ptr = me.user_ptr;
            node.issue_event(&self.eq, event).await;
        }
        true
    }

    pub fn contains(&self, me: &Arc<MatchEntry>) -> bool {
        let state = self.state.lock().unwrap();
        state.priority.iter().any(|entry| Arc::ptr_eq(entry, me))
            || state.overflow.iter().any(|entry| Arc::ptr_eq(entry, me))
    }

    pub fn list_lens(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.priority.len(),
            state.overflow.len(),
            state.unexpected_headers.len(),
        )
    }

    /// Drop every entry and retained header (PTFree).
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.priority.clear();
        state.overflow.clear();
        state.unexpected_headers.clear();
    }
}
