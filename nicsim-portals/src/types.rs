//! Portals 4 constants and wire-level enums.
//!
//! Values are bit-exact with the governing header: client code compiled
//! against that header observes the same flag masks, enum discriminants and
//! sentinels here.

use serde::{Deserialize, Serialize};

pub type Nid = u32;
pub type Pid = u32;
pub type PtIndex = u32;
pub type MatchBits = u64;
pub type HdrData = u64;
pub type UserPtr = u64;
pub type Size = u64;

/// sec 3.3.1: max ptl_size_t.
pub const PTL_SIZE_MAX: Size = (1 << 48) - 1;
/// sec 3.6.2: max pid.
pub const PTL_PID_MAX: Pid = (1 << 12) - 1;
/// Infinite timeout for EQ/CT poll, in the header a `ptl_time_t` of -1.
pub const PTL_TIME_FOREVER: i64 = -1;

pub const PTL_IFACE_DEFAULT: u32 = 0;

/// Special identifiers.
pub const PTL_PT_ANY: PtIndex = !0;
pub const PTL_PID_ANY: Pid = 0x0;
pub const PTL_UID_ANY: u32 = 0xffff_ffff;
pub const PTL_NID_ANY: Nid = 0x0;
pub const PTL_RANK_ANY: u32 = 0x7f_ffff;

/// NI options.
pub const PTL_NI_PHYSICAL: u32 = 0x1;
pub const PTL_NI_MATCHING: u32 = 0x2;
pub const PTL_NI_LOGICAL: u32 = 0x4;
pub const PTL_NI_NO_MATCHING: u32 = 0x8;

/// PT options.
pub const PTL_PT_ONLY_USE_ONCE: u32 = 1;
pub const PTL_PT_ONLY_TRUNCATE: u32 = 2;
pub const PTL_PT_FLOWCTRL: u32 = 4;

/// ME/LE options (the LE constants are aliases in the header).
pub const PTL_ME_EVENT_COMM_DISABLE: u32 = 0x1;
pub const PTL_ME_EVENT_SUCCESS_DISABLE: u32 = 0x2;
pub const PTL_ME_EVENT_OVER_DISABLE: u32 = 0x4;
pub const PTL_ME_EVENT_LINK_DISABLE: u32 = 0x8;
pub const PTL_ME_EVENT_CT_BYTES: u32 = 0x10;
pub const PTL_ME_EVENT_CT_OVERFLOW: u32 = 0x20;
pub const PTL_ME_EVENT_CT_COMM: u32 = 0x40;
pub const PTL_ME_OP_PUT: u32 = 0x100;
pub const PTL_ME_OP_GET: u32 = 0x200;
pub const PTL_ME_USE_ONCE: u32 = 0x400;
pub const PTL_ME_ACK_DISABLE: u32 = 0x800;
pub const PTL_ME_MAY_ALIGN: u32 = 0x1000;
pub const PTL_ME_EVENT_UNLINK_DISABLE: u32 = 0x2000;
pub const PTL_ME_MANAGE_LOCAL: u32 = 0x4000;
pub const PTL_ME_NO_TRUNCATE: u32 = 0x8000;
pub const PTL_ME_UNEXPECTED_HDR_DISABLE: u32 = 0x10000;
pub const PTL_ME_EVENT_FLOWCTRL_DISABLE: u32 = 0x20000;
pub const PTL_ME_IS_ACCESSIBLE: u32 = 0x40000;

/// MD options.
pub const PTL_MD_EVENT_SUCCESS_DISABLE: u32 = 0x1;
pub const PTL_MD_EVENT_CT_SEND: u32 = 0x2;
pub const PTL_MD_EVENT_CT_REPLY: u32 = 0x4;
pub const PTL_MD_EVENT_CT_ACK: u32 = 0x8;
pub const PTL_MD_EVENT_CT_BYTES: u32 = 0x10;
pub const PTL_MD_UNORDERED: u32 = 0x20;
pub const PTL_MD_EVENT_SEND_DISABLE: u32 = 0x40;
pub const PTL_MD_VOLATILE: u32 = 0x100;

pub fn has_option(options: u32, flag: u32) -> bool {
    options & flag != 0
}

/// ACK request modes, sec 3.15.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AckReq {
    NoAck = 0x0,
    CtAck = 0x1,
    OcAck = 0x2,
    Ack = 0x3,
}

/// Priority vs overflow list, sec 3.11.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ListKind {
    Priority = 0x0,
    Overflow = 0x1,
}

/// Event kinds, sec 3.13.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    Get = 0,
    GetOverflow = 1,
    Put = 2,
    PutOverflow = 3,
    Atomic = 4,
    AtomicOverflow = 5,
    FetchAtomic = 6,
    FetchAtomicOverflow = 7,
    Reply = 8,
    Send = 9,
    Ack = 10,
    PtDisabled = 11,
    AutoUnlink = 12,
    AutoFree = 13,
    Search = 14,
    Link = 15,
}

/// NI fail types, sec 3.13.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum NiFail {
    #[default]
    Ok = 0x0,
    PermViolation = 0x1,
    Segv = 0x2,
    PtDisabled = 0x3,
    Dropped = 0x4,
    Undeliverable = 0x5,
    Fail = 0x6,
    ArgInvalid = 0x7,
    InUse = 0x8,
    NoMatch = 0x9,
    TargetInvalid = 0xa,
    OpViolation = 0xb,
}

/// Atomic operations, sec 3.15.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AtomicOp {
    Min = 0x0,
    Max = 0x1,
    Sum = 0x2,
    Prod = 0x3,
    Lor = 0x4,
    Land = 0x5,
    Lxor = 0x6,
    Bor = 0x8,
    Band = 0x9,
    Bxor = 0xa,
    Swap = 0xc,
    CswapGt = 0x10,
    CswapLt = 0x11,
    CswapGe = 0x12,
    CswapLe = 0x13,
    Cswap = 0x14,
    CswapNe = 0x15,
    Mswap = 0x18,
}

impl AtomicOp {
    /// Swap-family operations take exactly one element and may use the
    /// operation constant.
    pub fn is_swap(self) -> bool {
        matches!(
            self,
            AtomicOp::Swap
                | AtomicOp::Cswap
                | AtomicOp::CswapNe
                | AtomicOp::CswapLe
                | AtomicOp::CswapLt
                | AtomicOp::CswapGe
                | AtomicOp::CswapGt
                | AtomicOp::Mswap
        )
    }
}

/// Atomic datatypes, sec 3.15.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AtomicDatatype {
    Int8 = 0x0,
    Uint8 = 0x1,
    Int16 = 0x2,
    Uint16 = 0x3,
    Int32 = 0x4,
    Uint32 = 0x5,
    Int64 = 0x6,
    Uint64 = 0x7,
    Float = 0xa,
    FloatComplex = 0xb,
    Double = 0xc,
    DoubleComplex = 0xd,
    LongDouble = 0x14,
    LongDoubleComplex = 0x15,
}

impl AtomicDatatype {
    /// Element size in bytes. Long double keeps its 16-byte ABI slot even
    /// though the arithmetic is done in f64.
    pub fn size(self) -> usize {
        match self {
            AtomicDatatype::Int8 | AtomicDatatype::Uint8 => 1,
            AtomicDatatype::Int16 | AtomicDatatype::Uint16 => 2,
            AtomicDatatype::Int32 | AtomicDatatype::Uint32 | AtomicDatatype::Float => 4,
            AtomicDatatype::Int64
            | AtomicDatatype::Uint64
            | AtomicDatatype::Double
            | AtomicDatatype::FloatComplex => 8,
            AtomicDatatype::DoubleComplex | AtomicDatatype::LongDouble => 16,
            AtomicDatatype::LongDoubleComplex => 32,
        }
    }
}

/// Search operations, sec 3.11.4.
pub const PTL_SEARCH_ONLY: u32 = 0x0;
pub const PTL_SEARCH_DELETE: u32 = 0x1;

/// Process identifier: either physical (nid, pid) or a logical rank that an
/// NI's map resolves to a physical pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessId {
    Phys { nid: Nid, pid: Pid },
    Rank(u32),
}

impl ProcessId {
    pub fn phys(nid: Nid, pid: Pid) -> Self {
        ProcessId::Phys { nid, pid }
    }
}

/// NI limits, sec 3.6.1. Defaults and caps are those of the modelled NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiLimits {
    pub max_entries: i32,
    pub max_unexpected_headers: i32,
    pub max_mds: i32,
    pub max_cts: i32,
    pub max_eqs: i32,
    pub max_pt_index: i32,
    pub max_iovecs: i32,
    pub max_list_size: i32,
    pub max_triggered_ops: i32,
    pub max_msg_size: Size,
    pub max_atomic_size: Size,
    pub max_fetch_atomic_size: Size,
    pub max_waw_ordered_size: Size,
    pub max_war_ordered_size: Size,
    pub max_volatile_size: Size,
    pub features: u32,
}

impl Default for NiLimits {
    fn default() -> Self {
        Self {
            max_entries: 4080,
            max_unexpected_headers: 16319,
            max_mds: 1024,
            max_cts: 1024,
            max_eqs: 960,
            max_pt_index: 255,
            max_iovecs: 0,
            max_list_size: 16582,
            max_triggered_ops: 16378,
            max_msg_size: 67_108_864,
            max_atomic_size: 1024,
            max_fetch_atomic_size: 64,
            max_waw_ordered_size: 0,
            max_war_ordered_size: 0,
            max_volatile_size: 64,
            features: 7,
        }
    }
}

impl NiLimits {
    /// Clamp a desired set of limits to what the hardware supports.
    pub fn clamp(desired: &NiLimits) -> Self {
        Self {
            max_entries: desired.max_entries.min(16319),
            max_unexpected_headers: desired.max_unexpected_headers.min(16319),
            max_mds: desired.max_mds.min(8191),
            max_cts: desired.max_cts.min(2047),
            max_eqs: desired.max_eqs.min(2046),
            max_pt_index: desired.max_pt_index.min(255),
            max_iovecs: desired.max_iovecs.min(0),
            max_list_size: desired.max_list_size.min(65535),
            max_triggered_ops: desired.max_triggered_ops.min(16378),
            max_msg_size: desired.max_msg_size.min(67_108_864),
            max_atomic_size: desired.max_atomic_size.min(1024),
            max_fetch_atomic_size: desired.max_fetch_atomic_size.min(64),
            max_waw_ordered_size: desired.max_waw_ordered_size.min(0),
            max_war_ordered_size: desired.max_war_ordered_size.min(0),
            max_volatile_size: desired.max_volatile_size.min(64),
            features: desired.features,
        }
    }
}

/// Virtual network classes: request/response crossed with service/compute.
/// Requests and their responses stay within one {service, compute} family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Vn {
    ServiceRequest = 0,
    ComputeRequest = 1,
    ServiceResponse = 2,
    ComputeResponse = 3,
}

pub const VN_COUNT: usize = 4;
pub const ALL_VNS: [Vn; VN_COUNT] = [
    Vn::ServiceRequest,
    Vn::ComputeRequest,
    Vn::ServiceResponse,
    Vn::ComputeResponse,
];

impl Vn {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_request(self) -> bool {
        matches!(self, Vn::ServiceRequest | Vn::ComputeRequest)
    }

    /// The response class within the same service/compute family.
    pub fn response_family(self) -> Vn {
        match self {
            Vn::ServiceRequest | Vn::ServiceResponse => Vn::ServiceResponse,
            Vn::ComputeRequest | Vn::ComputeResponse => Vn::ComputeResponse,
        }
    }
}

/// Fixed sizes used by the transmit path, in bytes.
pub const ACK_SIZE: u64 = 32;
pub const EVENT_SIZE: u64 = 96;
pub const COMMAND_SIZE: u64 = 64;
pub const INLINE_BASE_SIZE: u64 = 8;
pub const MATCH_BITS_SIZE: u64 = 8;
pub const PIO_BASE_SIZE: u64 = 408;
/// Payloads at or below this ride in the command itself ("buffered put").
pub const BUFFERED_PUT_MAX: u64 = 64;

/// Inline budget: non-matching requests have room for the unused match bits.
pub fn inline_size(matching: bool) -> u64 {
    INLINE_BASE_SIZE + if matching { 0 } else { MATCH_BITS_SIZE }
}

/// PIO budget, same match-bits adjustment.
pub fn pio_size(matching: bool) -> u64 {
    PIO_BASE_SIZE + if matching { 0 } else { MATCH_BITS_SIZE }
}
