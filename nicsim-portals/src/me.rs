//! List entries and matching entries (target side).
//!
//! LEs and MEs share one representation; a non-matching NI simply never
//! looks at the match bits. Destruction while the matching engine holds an
//! entry is deferred through the in-use / needs-unlink flags.

use std::sync::{Arc, Mutex};

use crate::counter::CountingEvent;
use crate::memory::MemRegion;
use crate::ni::Ni;
use crate::request::Request;
use crate::types::{
    self, ListKind, MatchBits, ProcessId, Size, UserPtr, has_option, PTL_NID_ANY, PTL_PID_ANY,
    PTL_RANK_ANY,
};

/// User-supplied description of a list entry, sec 3.12.1.
#[derive(Debug, Clone)]
pub struct MeDesc {
    pub region: MemRegion,
    pub ct: Option<Arc<CountingEvent>>,
    pub uid: u32,
    pub options: u32,
    pub match_id: ProcessId,
    pub match_bits: MatchBits,
    pub ignore_bits: MatchBits,
    pub min_free: Size,
}

impl MeDesc {
    /// A plain entry accepting puts and gets from anyone.
    pub fn over(region: MemRegion) -> Self {
        Self {
            region,
            ct: None,
            uid: types::PTL_UID_ANY,
            options: types::PTL_ME_OP_PUT | types::PTL_ME_OP_GET,
            match_id: ProcessId::phys(PTL_NID_ANY, PTL_PID_ANY),
            match_bits: 0,
            ignore_bits: 0,
            min_free: 0,
        }
    }

    pub fn with_match(mut self, match_bits: MatchBits, ignore_bits: MatchBits) -> Self {
        self.match_bits = match_bits;
        self.ignore_bits = ignore_bits;
        self
    }

    pub fn with_options(mut self, options: u32) -> Self {
        self.options = options;
        self
    }

    pub fn with_ct(mut self, ct: Arc<CountingEvent>) -> Self {
        self.ct = Some(ct);
        self
    }

    pub fn with_min_free(mut self, min_free: Size) -> Self {
        self.min_free = min_free;
        self
    }
}

#[derive(Debug, Default)]
struct MeState {
    /// Consumed (matters with `USE_ONCE`).
    used: bool,
    /// The matching engine is operating on this entry.
    in_use: bool,
    /// An unlink arrived while in use; honoured at the end of the step.
    needs_unlink: bool,
    /// Locally-managed delivery cursor.
    manage_local_offset: Size,
}

/// A posted list entry.
#[derive(Debug)]
pub struct MatchEntry {
    pub desc: MeDesc,
    pub user_ptr: UserPtr,
    pub list: ListKind,
    state: Mutex<MeState>,
}

impl MatchEntry {
    pub fn new(desc: MeDesc, list: ListKind, user_ptr: UserPtr) -> Arc<Self> {
        Arc::new(Self {
            desc,
            user_ptr,
            list,
            state: Mutex::new(MeState::default()),
        })
    }

    pub fn has_option(&self, flag: u32) -> bool {
        has_option(self.desc.options, flag)
    }

    pub fn manage_local_offset(&self) -> Size {
        self.state.lock().unwrap().manage_local_offset
    }

    pub fn mark_used(&self) {
        self.state.lock().unwrap().used = true;
    }

    pub fn set_in_use(&self, in_use: bool) {
        self.state.lock().unwrap().in_use = in_use;
    }

    pub fn in_use(&self) -> bool {
        self.state.lock().unwrap().in_use
    }

    pub fn flag_needs_unlink(&self) {
        self.state.lock().unwrap().needs_unlink = true;
    }

    pub fn needs_unlink(&self) -> bool {
        self.state.lock().unwrap().needs_unlink
    }

    /// Matching rule of sec 3.12: not yet consumed, capability bits allow
    /// the operation, the source filter accepts the initiator, and (for
    /// matching NIs) the match bits agree outside the ignore mask.
    pub fn matches(&self, req: &Request, ni: &Ni) -> bool {
        {
            let state = self.state.lock().unwrap();
            if self.has_option(types::PTL_ME_USE_ONCE) && state.used {
                return false;
            }
        }

        let (needs_put, needs_get) = req.op.required_capabilities();
        if needs_put && !self.has_option(types::PTL_ME_OP_PUT) {
            return false;
        }
        if needs_get && !self.has_option(types::PTL_ME_OP_GET) {
            return false;
        }

        if !self.source_allowed(req, ni) {
            return false;
        }

        if !req.matching {
            return true;
        }
        (req.match_bits ^ self.desc.match_bits) & !self.desc.ignore_bits == 0
    }

    fn source_allowed(&self, req: &Request, ni: &Ni) -> bool {
        match self.desc.match_id {
            ProcessId::Phys { nid, pid } => {
                (nid == PTL_NID_ANY || nid == req.initiator_nid())
                    && (pid == PTL_PID_ANY || pid == req.initiator_pid())
            }
            ProcessId::Rank(rank) => {
                rank == PTL_RANK_ANY
                    || ni
                        .resolve_rank(rank)
                        .is_some_and(|(nid, pid)| {
                            nid == req.initiator_nid() && pid == req.initiator_pid()
                        })
            }
        }
    }

    /// Bytes actually deliverable: what is left past the local cursor,
    /// truncated by the request size.
    pub fn mlength(&self, payload_size: Size) -> Size {
        let remaining = self
            .desc
            .region
            .len()
            .saturating_sub(self.manage_local_offset());
        remaining.min(payload_size)
    }

    /// Delivery offset within the entry's region. For locally-managed
    /// entries the cursor is used (and optionally advanced by the request
    /// size, clamped to the region); otherwise the requested remote offset.
    /// Also returns the offset the target reports back in events.
    pub fn offsetted_addr(
        &self,
        remote_offset: Size,
        payload_size: Size,
        advance_cursor: bool,
    ) -> (Size, Size) {
        if !self.has_option(types::PTL_ME_MANAGE_LOCAL) {
            return (remote_offset, remote_offset);
        }

        let mut state = self.state.lock().unwrap();
        let addr = state.manage_local_offset;
        if advance_cursor {
            state.manage_local_offset =
                (state.manage_local_offset + payload_size).min(self.desc.region.len());
        }
        (addr, addr)
    }

    /// `USE_ONCE` after consumption, or a locally-managed cursor that can no
    /// longer honour `min_free`.
    pub fn should_auto_unlink(&self) -> bool {
        self.has_option(types::PTL_ME_USE_ONCE)
            || (self.has_option(types::PTL_ME_MANAGE_LOCAL)
                && self.manage_local_offset() + self.desc.min_free > self.desc.region.len())
    }

    /// Bump the entry counter by bytes or by one, depending on
    /// `PTL_ME_EVENT_CT_BYTES`.
    pub fn increment_ct(&self, byte_count: Size) {
        if let Some(ct) = &self.desc.ct {
            let amount = if self.has_option(types::PTL_ME_EVENT_CT_BYTES) {
                byte_count
            } else {
                1
            };
            ct.increment_success(amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manage_local_cursor_advances_and_clamps() {
        let me = MatchEntry::new(
            MeDesc::over(MemRegion::new(10)).with_options(
                types::PTL_ME_OP_PUT | types::PTL_ME_MANAGE_LOCAL,
            ),
            ListKind::Priority,
            0,
        );

        let (addr, reported) = me.offsetted_addr(99, 6, true);
        assert_eq!((addr, reported), (0, 0));
        assert_eq!(me.manage_local_offset(), 6);

        // Next delivery truncates to what is left, cursor clamps at length.
        assert_eq!(me.mlength(6), 4);
        let (addr, _) = me.offsetted_addr(0, 6, true);
        assert_eq!(addr, 6);
        assert_eq!(me.manage_local_offset(), 10);
    }

    #[test]
    fn plain_entries_use_the_remote_offset() {
        let me = MatchEntry::new(MeDesc::over(MemRegion::new(10)), ListKind::Priority, 0);
        assert_eq!(me.offsetted_addr(3, 4, true), (3, 3));
        assert_eq!(me.manage_local_offset(), 0);
    }

    #[test]
    fn auto_unlink_conditions() {
        let use_once = MatchEntry::new(
            MeDesc::over(MemRegion::new(4)).with_options(types::PTL_ME_USE_ONCE),
            ListKind::Priority,
            0,
        );
        assert!(use_once.should_auto_unlink());

        let managed = MatchEntry::new(
            MeDesc::over(MemRegion::new(10))
                .with_options(types::PTL_ME_MANAGE_LOCAL)
                .with_min_free(5),
            ListKind::Priority,
            0,
        );
        assert!(!managed.should_auto_unlink());
        managed.offsetted_addr(0, 6, true);
        // Cursor at 6, min_free 5 > 4 remaining.
        assert!(managed.should_auto_unlink());
    }
}
