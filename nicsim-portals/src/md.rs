//! Memory descriptors (initiator side).

use std::sync::Arc;

use crate::counter::CountingEvent;
use crate::event::EventQueue;
use crate::memory::MemRegion;
use crate::types::{self, Size, has_option};

/// A bound memory descriptor. Immutable once bound; requests hold their own
/// `Arc`, so releasing the handle is always safe while operations are
/// outstanding (the private-copy rule of the original API).
#[derive(Debug, Clone)]
pub struct Md {
    pub region: MemRegion,
    pub options: u32,
    pub eq: Option<Arc<EventQueue>>,
    pub ct: Option<Arc<CountingEvent>>,
}

impl Md {
    pub fn new(
        region: MemRegion,
        options: u32,
        eq: Option<Arc<EventQueue>>,
        ct: Option<Arc<CountingEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            region,
            options,
            eq,
            ct,
        })
    }

    pub fn has_option(&self, flag: u32) -> bool {
        has_option(self.options, flag)
    }

    /// Bump the MD counter by bytes or by one, depending on
    /// `PTL_MD_EVENT_CT_BYTES`.
    pub fn increment_ct(&self, byte_count: Size) {
        if let Some(ct) = &self.ct {
            let amount = if self.has_option(types::PTL_MD_EVENT_CT_BYTES) {
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
    fn ct_counts_bytes_or_operations() {
        let ct = CountingEvent::new();
        let md = Md::new(MemRegion::new(8), 0, None, Some(ct.clone()));
        md.increment_ct(8);
        assert_eq!(ct.get().success, 1);

        let md = Md::new(
            MemRegion::new(8),
            types::PTL_MD_EVENT_CT_BYTES,
            None,
            Some(ct.clone()),
        );
        md.increment_ct(8);
        assert_eq!(ct.get().success, 9);
    }
}
