//! User-facing Portals entry points.
//!
//! A `Portals` value is one simulated process' view of its node's NIC. The
//! entry points validate handles, take a command-queue slot, build the
//! request and its first wire message, push it onto the transmit queue of
//! the right virtual network, and return. Blocking completion calls suspend
//! the caller on the EQ/CT they name; `*_nb` forms return `TryAgain` instead
//! of blocking on backpressure.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::counter::{CountingEvent, CtValue};
use crate::error::{PtlError, Result};
use crate::event::{EqRead, EventQueue};
use crate::handles::{Handle, SlotTable};
use crate::md::Md;
use crate::me::{MatchEntry, MeDesc};
use crate::memory::MemRegion;
use crate::message::{Message, MsgType};
use crate::ni::{CQ_CAPACITY, Ni};
use crate::node::Node;
use crate::pt::Pt;
use crate::request::{Origin, Request, RequestOp};
use crate::types::{
    self, AckReq, AtomicDatatype, AtomicOp, COMMAND_SIZE, HdrData, ListKind, MatchBits, NiLimits,
    Nid, Pid, ProcessId, PtIndex, Size, UserPtr,
};

/// Binding behind an MD handle.
#[derive(Debug)]
pub struct MdBinding {
    ni: Arc<Ni>,
    md: Arc<Md>,
}

/// Binding behind an ME/LE handle.
#[derive(Debug)]
pub struct MeBinding {
    pt: Arc<Pt>,
    me: Arc<MatchEntry>,
}

pub type NiHandle = Handle<Arc<Ni>>;
pub type MdHandle = Handle<MdBinding>;
pub type EqHandle = Handle<Arc<EventQueue>>;
pub type CtHandle = Handle<Arc<CountingEvent>>;
pub type MeHandle = Handle<MeBinding>;
/// LEs are MEs without match bits; the handles are one namespace.
pub type LeHandle = MeHandle;

/// `PtlHandleIsEqual`.
pub fn handle_is_equal<T>(a: Handle<T>, b: Handle<T>) -> bool {
    a == b
}

#[derive(Default)]
struct HandleTables {
    nis: SlotTable<Arc<Ni>>,
    mds: SlotTable<MdBinding>,
    eqs: SlotTable<Arc<EventQueue>>,
    cts: SlotTable<Arc<CountingEvent>>,
    mes: SlotTable<MeBinding>,
}

/// Memory-descriptor parameters for `md_bind`.
#[derive(Debug, Clone)]
pub struct MdParams {
    pub region: MemRegion,
    pub options: u32,
    pub eq: Option<EqHandle>,
    pub ct: Option<CtHandle>,
}

impl MdParams {
    pub fn over(region: MemRegion) -> Self {
        Self {
            region,
            options: 0,
            eq: None,
            ct: None,
        }
    }

    pub fn with_options(mut self, options: u32) -> Self {
        self.options = options;
        self
    }

    pub fn with_eq(mut self, eq: EqHandle) -> Self {
        self.eq = Some(eq);
        self
    }

    pub fn with_ct(mut self, ct: CtHandle) -> Self {
        self.ct = Some(ct);
        self
    }
}

/// List-entry parameters for `me_append` / `le_append`.
#[derive(Debug, Clone)]
pub struct MeParams {
    pub region: MemRegion,
    pub options: u32,
    pub ct: Option<CtHandle>,
    pub uid: u32,
    pub match_id: ProcessId,
    pub match_bits: MatchBits,
    pub ignore_bits: MatchBits,
    pub min_free: Size,
}

impl MeParams {
    pub fn over(region: MemRegion) -> Self {
        Self {
            region,
            options: types::PTL_ME_OP_PUT | types::PTL_ME_OP_GET,
            ct: None,
            uid: types::PTL_UID_ANY,
            match_id: ProcessId::phys(types::PTL_NID_ANY, types::PTL_PID_ANY),
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

    pub fn with_ct(mut self, ct: CtHandle) -> Self {
        self.ct = Some(ct);
        self
    }

    pub fn with_min_free(mut self, min_free: Size) -> Self {
        self.min_free = min_free;
        self
    }
}

/// One simulated process' Portals endpoint.
pub struct Portals {
    node: Arc<Node>,
    service: bool,
    uid: u32,
    handles: Mutex<HandleTables>,
}

impl Portals {
    pub(crate) fn new(node: Arc<Node>, service: bool) -> Self {
        Self {
            node,
            service,
            uid: 0,
            handles: Mutex::new(HandleTables::default()),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// `PtlInit`. Per-process library setup is implicit here; kept for
    /// client-code parity.
    pub fn init(&self) -> Result<()> {
        Ok(())
    }

    /// `PtlFini`.
    pub fn fini(&self) {}

    // ----- handle resolution -----

    fn resolve_ni(&self, nih: NiHandle) -> Result<Arc<Ni>> {
        self.handles
            .lock()
            .unwrap()
            .nis
            .get(nih)
            .cloned()
            .ok_or(PtlError::ArgInvalid)
    }

    fn resolve_md(&self, mdh: MdHandle) -> Result<(Arc<Ni>, Arc<Md>)> {
        let tables = self.handles.lock().unwrap();
        let binding = tables.mds.get(mdh).ok_or(PtlError::ArgInvalid)?;
        Ok((Arc::clone(&binding.ni), Arc::clone(&binding.md)))
    }

    fn resolve_eq(&self, eqh: EqHandle) -> Result<Arc<EventQueue>> {
        self.handles
            .lock()
            .unwrap()
            .eqs
            .get(eqh)
            .cloned()
            .ok_or(PtlError::ArgInvalid)
    }

    fn resolve_ct(&self, cth: CtHandle) -> Result<Arc<CountingEvent>> {
        self.handles
            .lock()
            .unwrap()
            .cts
            .get(cth)
            .cloned()
            .ok_or(PtlError::ArgInvalid)
    }

    /// Small PCI command transfer for control operations that reach the NIC.
    async fn issue_command(&self) {
        if self.node.config.model_pci_commands() {
            self.node.pci.transfer(COMMAND_SIZE).await;
        }
    }

    // ----- network interfaces -----

    /// `PtlNIInit`. The matching/non-matching and physical/logical characters
    /// are fixed here; `PTL_PID_ANY` picks a free pid on the node.
    pub async fn ni_init(
        &self,
        iface: u32,
        options: u32,
        pid: Pid,
        desired: Option<&NiLimits>,
    ) -> Result<(NiHandle, NiLimits)> {
        let matching = types::has_option(options, types::PTL_NI_MATCHING);
        let no_matching = types::has_option(options, types::PTL_NI_NO_MATCHING);
        let physical = types::has_option(options, types::PTL_NI_PHYSICAL);
        let logical = types::has_option(options, types::PTL_NI_LOGICAL);
        if matching == no_matching || physical == logical {
            return Err(PtlError::ArgInvalid);
        }
        if pid != types::PTL_PID_ANY && pid > types::PTL_PID_MAX {
            return Err(PtlError::ArgInvalid);
        }

        let pid = if pid == types::PTL_PID_ANY {
            self.pick_free_pid()
        } else {
            pid
        };

        let limits = desired.map(NiLimits::clamp).unwrap_or_default();
        let ni = Ni::new(iface, options, pid, limits);
        if !self.node.register_ni(Arc::clone(&ni)) {
            return Err(PtlError::PidInUse);
        }
        debug!(nid = self.node.nid, pid, matching, physical, "NI opened");

        let nih = self.handles.lock().unwrap().nis.insert(ni);
        Ok((nih, limits))
    }

    fn pick_free_pid(&self) -> Pid {
        let used: Vec<Pid> = self.node.nis().iter().map(|ni| ni.pid).collect();
        (1..=types::PTL_PID_MAX)
            .find(|pid| !used.contains(pid))
            .unwrap_or(types::PTL_PID_MAX)
    }

    /// `PtlNIFini`. Waits for every outstanding command to be accepted by
    /// the NIC before tearing the interface down.
    pub async fn ni_fini(&self, nih: NiHandle) -> Result<()> {
        let ni = self.resolve_ni(nih)?;
        for _ in 0..CQ_CAPACITY {
            match ni.cq.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            }
        }
        self.node.unregister_ni(&ni);
        self.handles.lock().unwrap().nis.remove(nih);
        Ok(())
    }

    /// `PtlNIHandle`: not provided by the modelled adapter's library.
    pub fn ni_handle(&self) -> Result<NiHandle> {
        Err(PtlError::Unimplemented)
    }

    /// `PtlSetMap`.
    pub fn set_map(&self, nih: NiHandle, map: &[(Nid, Pid)]) -> Result<()> {
        let ni = self.resolve_ni(nih)?;
        ni.set_map(map.to_vec());
        Ok(())
    }

    /// `PtlGetMap`.
    pub fn get_map(&self, nih: NiHandle) -> Result<Vec<(Nid, Pid)>> {
        Ok(self.resolve_ni(nih)?.get_map())
    }

    // ----- identity -----

    /// `PtlGetUid`.
    pub fn get_uid(&self, nih: NiHandle) -> Result<u32> {
        self.resolve_ni(nih)?;
        Ok(self.uid)
    }

    /// `PtlGetId`: the logical rank on logical interfaces, the physical pair
    /// otherwise.
    pub fn get_id(&self, nih: NiHandle) -> Result<ProcessId> {
        let ni = self.resolve_ni(nih)?;
        if ni.physical() {
            Ok(ProcessId::phys(self.node.nid, ni.pid))
        } else {
            ni.rank_of(self.node.nid, ni.pid)
                .map(ProcessId::Rank)
                .ok_or(PtlError::ArgInvalid)
        }
    }

    /// `PtlGetPhysId`.
    pub fn get_phys_id(&self, nih: NiHandle) -> Result<ProcessId> {
        let ni = self.resolve_ni(nih)?;
        Ok(ProcessId::phys(self.node.nid, ni.pid))
    }

    // ----- portal table -----

    /// `PtlPTAlloc`.
    pub async fn pt_alloc(
        &self,
        nih: NiHandle,
        options: u32,
        eqh: Option<EqHandle>,
        desired: PtIndex,
    ) -> Result<PtIndex> {
        let ni = self.resolve_ni(nih)?;
        let eq = match eqh {
            Some(eqh) => Some(self.resolve_eq(eqh)?),
            None => None,
        };
        if types::has_option(options, types::PTL_PT_FLOWCTRL) && eq.is_none() {
            return Err(PtlError::PtEqNeeded);
        }

        let index = if desired == types::PTL_PT_ANY {
            ni.free_pt_index().ok_or(PtlError::PtFull)?
        } else {
            if desired > ni.limits.max_pt_index as PtIndex {
                return Err(PtlError::ArgInvalid);
            }
            desired
        };

        self.issue_command().await;
        let pt = Pt::new(index, options, eq);
        if !ni.insert_pt(index, pt) {
            return Err(PtlError::PtInUse);
        }
        Ok(index)
    }

    /// `PtlPTFree`.
    pub async fn pt_free(&self, nih: NiHandle, index: PtIndex) -> Result<()> {
        let ni = self.resolve_ni(nih)?;
        self.issue_command().await;
        let pt = ni.remove_pt(index).ok_or(PtlError::ArgInvalid)?;
        pt.clear();
        Ok(())
    }

    /// `PtlPTEnable`.
    pub async fn pt_enable(&self, nih: NiHandle, index: PtIndex) -> Result<()> {
        let ni = self.resolve_ni(nih)?;
        self.issue_command().await;
        ni.pt(index).ok_or(PtlError::ArgInvalid)?.enable();
        Ok(())
    }

    /// `PtlPTDisable`.
    pub async fn pt_disable(&self, nih: NiHandle, index: PtIndex) -> Result<()> {
        let ni = self.resolve_ni(nih)?;
        self.issue_command().await;
        ni.pt(index).ok_or(PtlError::ArgInvalid)?.disable();
        Ok(())
    }

    pub async fn pt_enable_nb(&self, nih: NiHandle, index: PtIndex) -> Result<()> {
        self.pt_enable(nih, index).await
    }

    pub async fn pt_disable_nb(&self, nih: NiHandle, index: PtIndex) -> Result<()> {
        self.pt_disable(nih, index).await
    }

    // ----- memory descriptors -----

    /// `PtlMDBind`.
    pub async fn md_bind(&self, nih: NiHandle, params: &MdParams) -> Result<MdHandle> {
        let ni = self.resolve_ni(nih)?;
        let eq = match params.eq {
            Some(eqh) => Some(self.resolve_eq(eqh)?),
            None => None,
        };
        let ct = match params.ct {
            Some(cth) => Some(self.resolve_ct(cth)?),
            None => None,
        };
        self.issue_command().await;
        let md = Md::new(params.region.clone(), params.options, eq, ct);
        Ok(self.handles.lock().unwrap().mds.insert(MdBinding { ni, md }))
    }

    /// `PtlMDRelease`. Outstanding operations hold their own copy, so this
    /// only invalidates the handle.
    pub async fn md_release(&self, mdh: MdHandle) -> Result<()> {
        self.issue_command().await;
        self.handles
            .lock()
            .unwrap()
            .mds
            .remove(mdh)
            .map(|_| ())
            .ok_or(PtlError::ArgInvalid)
    }

    // ----- list entries -----

    /// `PtlMEAppend`.
    pub async fn me_append(
        &self,
        nih: NiHandle,
        pt_index: PtIndex,
        params: &MeParams,
        list: ListKind,
        user_ptr: UserPtr,
    ) -> Result<MeHandle> {
        let ni = self.resolve_ni(nih)?;
        let pt = ni.pt(pt_index).ok_or(PtlError::ArgInvalid)?;
        let ct = match params.ct {
            Some(cth) => Some(self.resolve_ct(cth)?),
            None => None,
        };

        self.issue_command().await;
        let me = MatchEntry::new(
            MeDesc {
                region: params.region.clone(),
                ct,
                uid: params.uid,
                options: params.options,
                match_id: params.match_id,
                match_bits: params.match_bits,
                ignore_bits: params.ignore_bits,
                min_free: params.min_free,
            },
            list,
            user_ptr,
        );

        // A USE_ONCE entry consumed by retained headers is never inserted;
        // its handle stays valid but unlinking it is a no-op.
        pt.append(Arc::clone(&me), &ni, &self.node).await;

        Ok(self.handles.lock().unwrap().mes.insert(MeBinding { pt, me }))
    }

    /// `PtlMEUnlink`. Deferred while the matching engine holds the entry.
    pub async fn me_unlink(&self, meh: MeHandle) -> Result<()> {
        self.issue_command().await;
        let binding = self
            .handles
            .lock()
            .unwrap()
            .mes
            .remove(meh)
            .ok_or(PtlError::ArgInvalid)?;
        binding.pt.unlink(&binding.me);
        Ok(())
    }

    /// `PtlLEAppend` (LEs and MEs share the table namespace).
    pub async fn le_append(
        &self,
        nih: NiHandle,
        pt_index: PtIndex,
        params: &MeParams,
        list: ListKind,
        user_ptr: UserPtr,
    ) -> Result<LeHandle> {
        self.me_append(nih, pt_index, params, list, user_ptr).await
    }

    /// `PtlLEUnlink`.
    pub async fn le_unlink(&self, leh: LeHandle) -> Result<()> {
        self.me_unlink(leh).await
    }

    /// `PtlMESearch`: not provided by the modelled adapter's library.
    pub fn me_search(&self) -> Result<()> {
        Err(PtlError::Unimplemented)
    }

    /// `PtlLESearch`: not provided by the modelled adapter's library.
    pub fn le_search(&self) -> Result<()> {
        Err(PtlError::Unimplemented)
    }

    // ----- event queues -----

    /// `PtlEQAlloc`.
    pub fn eq_alloc(&self, nih: NiHandle, count: usize) -> Result<EqHandle> {
        self.resolve_ni(nih)?;
        if count == 0 {
            return Err(PtlError::ArgInvalid);
        }
        let eq = EventQueue::new(count);
        Ok(self.handles.lock().unwrap().eqs.insert(eq))
    }

    /// `PtlEQFree`.
    pub fn eq_free(&self, eqh: EqHandle) -> Result<()> {
        self.handles
            .lock()
            .unwrap()
            .eqs
            .remove(eqh)
            .map(|_| ())
            .ok_or(PtlError::ArgInvalid)
    }

    /// `PtlEQGet`.
    pub fn eq_get(&self, eqh: EqHandle) -> Result<EqRead> {
        self.resolve_eq(eqh)?.get()
    }

    /// `PtlEQWait`.
    pub async fn eq_wait(&self, eqh: EqHandle) -> Result<EqRead> {
        let eq = self.resolve_eq(eqh)?;
        Ok(eq.wait().await)
    }

    /// `PtlEQPoll`.
    pub async fn eq_poll(&self, eqhs: &[EqHandle], timeout_ms: i64) -> Result<(usize, EqRead)> {
        let queues = eqhs
            .iter()
            .map(|&eqh| self.resolve_eq(eqh))
            .collect::<Result<Vec<_>>>()?;
        EventQueue::poll(&queues, timeout_ms).await
    }

    // ----- counting events -----

    /// `PtlCTAlloc`.
    pub fn ct_alloc(&self, nih: NiHandle) -> Result<CtHandle> {
        self.resolve_ni(nih)?;
        let ct = CountingEvent::new();
        Ok(self.handles.lock().unwrap().cts.insert(ct))
    }

    /// `PtlCTFree`.
    pub fn ct_free(&self, cth: CtHandle) -> Result<()> {
        self.handles
            .lock()
            .unwrap()
            .cts
            .remove(cth)
            .map(|_| ())
            .ok_or(PtlError::ArgInvalid)
    }

    /// `PtlCTGet`.
    pub fn ct_get(&self, cth: CtHandle) -> Result<CtValue> {
        Ok(self.resolve_ct(cth)?.get())
    }

    /// `PtlCTWait`.
    pub async fn ct_wait(&self, cth: CtHandle, test: Size) -> Result<CtValue> {
        let ct = self.resolve_ct(cth)?;
        Ok(ct.wait(test).await)
    }

    /// `PtlCTPoll`.
    pub async fn ct_poll(
        &self,
        cths: &[CtHandle],
        tests: &[Size],
        timeout_ms: i64,
    ) -> Result<(usize, CtValue)> {
        let counters = cths
            .iter()
            .map(|&cth| self.resolve_ct(cth))
            .collect::<Result<Vec<_>>>()?;
        CountingEvent::poll(&counters, tests, timeout_ms).await
    }

    /// `PtlCTSet`.
    pub async fn ct_set(&self, cth: CtHandle, value: CtValue) -> Result<()> {
        let ct = self.resolve_ct(cth)?;
        self.issue_command().await;
        ct.set(value);
        Ok(())
    }

    /// `PtlCTInc`.
    pub async fn ct_inc(&self, cth: CtHandle, delta: CtValue) -> Result<()> {
        let ct = self.resolve_ct(cth)?;
        self.issue_command().await;
        ct.increment(delta);
        Ok(())
    }

    // ----- data transfer -----

    #[allow(clippy::too_many_arguments)]
    pub async fn put(
        &self,
        mdh: MdHandle,
        local_offset: Size,
        length: Size,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
    ) -> Result<()> {
        self.issue_put(
            mdh,
            local_offset,
            length,
            ack_req,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr,
            true,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn put_nb(
        &self,
        mdh: MdHandle,
        local_offset: Size,
        length: Size,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
    ) -> Result<()> {
        self.issue_put(
            mdh,
            local_offset,
            length,
            ack_req,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr,
            false,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn issue_put(
        &self,
        mdh: MdHandle,
        local_offset: Size,
        length: Size,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
        blocking: bool,
    ) -> Result<()> {
        let (ni, md) = self.resolve_md(mdh)?;
        let op = RequestOp::Put { ack_req, hdr };
        self.issue(
            &ni,
            md,
            op,
            MsgType::PtlPut,
            length,
            length,
            target,
            pt_index,
            match_bits,
            local_offset,
            remote_offset,
            user_ptr,
            blocking,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get(
        &self,
        mdh: MdHandle,
        local_offset: Size,
        length: Size,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
    ) -> Result<()> {
        let (ni, md) = self.resolve_md(mdh)?;
        self.issue(
            &ni,
            md,
            RequestOp::Get,
            MsgType::PtlGet,
            length,
            COMMAND_SIZE,
            target,
            pt_index,
            match_bits,
            local_offset,
            remote_offset,
            user_ptr,
            true,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get_nb(
        &self,
        mdh: MdHandle,
        local_offset: Size,
        length: Size,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
    ) -> Result<()> {
        let (ni, md) = self.resolve_md(mdh)?;
        self.issue(
            &ni,
            md,
            RequestOp::Get,
            MsgType::PtlGet,
            length,
            COMMAND_SIZE,
            target,
            pt_index,
            match_bits,
            local_offset,
            remote_offset,
            user_ptr,
            false,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn atomic(
        &self,
        mdh: MdHandle,
        local_offset: Size,
        length: Size,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
        op: AtomicOp,
        datatype: AtomicDatatype,
    ) -> Result<()> {
        self.issue_atomic(
            mdh,
            local_offset,
            length,
            ack_req,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr,
            op,
            datatype,
            true,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn atomic_nb(
        &self,
        mdh: MdHandle,
        local_offset: Size,
        length: Size,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
        op: AtomicOp,
        datatype: AtomicDatatype,
    ) -> Result<()> {
        self.issue_atomic(
            mdh,
            local_offset,
            length,
            ack_req,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr,
            op,
            datatype,
            false,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn issue_atomic(
        &self,
        mdh: MdHandle,
        local_offset: Size,
        length: Size,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
        op: AtomicOp,
        datatype: AtomicDatatype,
        blocking: bool,
    ) -> Result<()> {
        if op.is_swap() || length % datatype.size() as Size != 0 {
            return Err(PtlError::ArgInvalid);
        }
        let (ni, md) = self.resolve_md(mdh)?;
        self.issue(
            &ni,
            md,
            RequestOp::Atomic {
                ack_req,
                hdr,
                op,
                datatype,
            },
            MsgType::PtlAtomic,
            length,
            length,
            target,
            pt_index,
            match_bits,
            local_offset,
            remote_offset,
            user_ptr,
            blocking,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn fetch_atomic(
        &self,
        get_mdh: MdHandle,
        get_local_offset: Size,
        put_mdh: MdHandle,
        put_local_offset: Size,
        length: Size,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
        op: AtomicOp,
        datatype: AtomicDatatype,
    ) -> Result<()> {
        self.issue_fetch_atomic(
            get_mdh,
            get_local_offset,
            put_mdh,
            put_local_offset,
            length,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr,
            op,
            datatype,
            true,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn fetch_atomic_nb(
        &self,
        get_mdh: MdHandle,
        get_local_offset: Size,
        put_mdh: MdHandle,
        put_local_offset: Size,
        length: Size,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
        op: AtomicOp,
        datatype: AtomicDatatype,
    ) -> Result<()> {
        self.issue_fetch_atomic(
            get_mdh,
            get_local_offset,
            put_mdh,
            put_local_offset,
            length,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr,
            op,
            datatype,
            false,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn issue_fetch_atomic(
        &self,
        get_mdh: MdHandle,
        get_local_offset: Size,
        put_mdh: MdHandle,
        put_local_offset: Size,
        length: Size,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
        op: AtomicOp,
        datatype: AtomicDatatype,
        blocking: bool,
    ) -> Result<()> {
        if op.is_swap() || length % datatype.size() as Size != 0 {
            return Err(PtlError::ArgInvalid);
        }
        let (_, get_md) = self.resolve_md(get_mdh)?;
        let (ni, put_md) = self.resolve_md(put_mdh)?;
        self.issue(
            &ni,
            put_md,
            RequestOp::FetchAtomic {
                hdr,
                op,
                datatype,
                get_md,
                get_local_offset,
                constant: None,
            },
            MsgType::PtlFetchAtomic,
            length,
            length,
            target,
            pt_index,
            match_bits,
            put_local_offset,
            remote_offset,
            user_ptr,
            blocking,
        )
        .await
    }

    /// `PtlSwap`: the swap-family fetch-atomic. `constant` carries the third
    /// operand for the conditional and masked variants, as little-endian
    /// element bytes.
    #[allow(clippy::too_many_arguments)]
    pub async fn swap(
        &self,
        get_mdh: MdHandle,
        get_local_offset: Size,
        put_mdh: MdHandle,
        put_local_offset: Size,
        length: Size,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
        constant: &[u8],
        op: AtomicOp,
        datatype: AtomicDatatype,
    ) -> Result<()> {
        self.issue_swap(
            get_mdh,
            get_local_offset,
            put_mdh,
            put_local_offset,
            length,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr,
            constant,
            op,
            datatype,
            true,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn swap_nb(
        &self,
        get_mdh: MdHandle,
        get_local_offset: Size,
        put_mdh: MdHandle,
        put_local_offset: Size,
        length: Size,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
        constant: &[u8],
        op: AtomicOp,
        datatype: AtomicDatatype,
    ) -> Result<()> {
        self.issue_swap(
            get_mdh,
            get_local_offset,
            put_mdh,
            put_local_offset,
            length,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr,
            constant,
            op,
            datatype,
            false,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn issue_swap(
        &self,
        get_mdh: MdHandle,
        get_local_offset: Size,
        put_mdh: MdHandle,
        put_local_offset: Size,
        length: Size,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: Size,
        user_ptr: UserPtr,
        hdr: HdrData,
        constant: &[u8],
        op: AtomicOp,
        datatype: AtomicDatatype,
        blocking: bool,
    ) -> Result<()> {
        if !op.is_swap() {
            return Err(PtlError::ArgInvalid);
        }
        let elem = datatype.size() as Size;
        if length % elem != 0 {
            return Err(PtlError::ArgInvalid);
        }
        // Every swap-family operation except the masked one is one element.
        if op != AtomicOp::Mswap && length != elem {
            return Err(PtlError::ArgInvalid);
        }
        let needs_constant = op != AtomicOp::Swap;
        if needs_constant && constant.len() < datatype.size() {
            return Err(PtlError::ArgInvalid);
        }

        let (_, get_md) = self.resolve_md(get_mdh)?;
        let (ni, put_md) = self.resolve_md(put_mdh)?;
        self.issue(
            &ni,
            put_md,
            RequestOp::FetchAtomic {
                hdr,
                op,
                datatype,
                get_md,
                get_local_offset,
                constant: Some(constant.to_vec()),
            },
            MsgType::PtlFetchAtomic,
            length,
            length,
            target,
            pt_index,
            match_bits,
            put_local_offset,
            remote_offset,
            user_ptr,
            blocking,
        )
        .await
    }

    /// `PtlTriggeredPut` and the rest of the triggered family: not provided
    /// by the modelled adapter's library.
    pub fn triggered_put(&self) -> Result<()> {
        Err(PtlError::Unimplemented)
    }

    pub fn triggered_get(&self) -> Result<()> {
        Err(PtlError::Unimplemented)
    }

    /// Common issue path: validate, take a command-queue slot (released by
    /// the transmit initiator on acceptance), build the request and message,
    /// and push onto the VN's transmit queue paying the command cost.
    #[allow(clippy::too_many_arguments)]
    async fn issue(
        &self,
        ni: &Arc<Ni>,
        md: Arc<Md>,
        op: RequestOp,
        msg_type: MsgType,
        length: Size,
        simulated_size: Size,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        local_offset: Size,
        remote_offset: Size,
        user_ptr: UserPtr,
        blocking: bool,
    ) -> Result<()> {
        if length > types::PTL_SIZE_MAX {
            return Err(PtlError::ArgInvalid);
        }
        let (target_nid, target_pid) = ni.physical_proc(target).ok_or(PtlError::ArgInvalid)?;

        if blocking {
            match ni.cq.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(PtlError::ArgInvalid),
            }
        } else {
            match ni.cq.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(PtlError::TryAgain),
            }
        }

        let req = Request::new(
            op,
            md,
            length,
            ni.matching(),
            match_bits,
            target_pid,
            pt_index,
            user_ptr,
            self.service,
            local_offset,
            remote_offset,
            Origin {
                node: Arc::clone(&self.node),
                pid: ni.pid,
                cq: Arc::clone(&ni.cq),
            },
        );
        let msg = Message::request(msg_type, self.node.nid, target_nid, simulated_size, req);
        let vn = msg.vn();
        self.node.tx_queues[vn.index()]
            .push_timed(msg, COMMAND_SIZE)
            .await;
        Ok(())
    }
}
