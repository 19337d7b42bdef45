//! Portals return codes.
//!
//! The numeric values mirror the governing header so that code ported from C
//! can compare against the same constants.

use thiserror::Error;

/// Error half of a Portals call. `PTL_OK` is the `Ok(..)` side of `Result`,
/// so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PtlError {
    #[error("invalid argument")]
    ArgInvalid,
    #[error("resource in use")]
    InUse,
    #[error("no counter reached its threshold")]
    CtNoneReached,
    #[error("event queue overflowed; events were dropped")]
    EqDropped,
    #[error("event queue is empty")]
    EqEmpty,
    #[error("ignored")]
    Ignored,
    #[error("interrupted")]
    Interrupted,
    #[error("list too long")]
    ListTooLong,
    #[error("interface not initialized")]
    NoInit,
    #[error("out of space")]
    NoSpace,
    #[error("pid already in use")]
    PidInUse,
    #[error("portal table is full")]
    PtFull,
    #[error("portal table entry requires an event queue")]
    PtEqNeeded,
    #[error("portal table entry is in use")]
    PtInUse,
    #[error("invalid size")]
    SizeInvalid,
    #[error("resource temporarily unavailable, try again")]
    TryAgain,
    #[error("operation not provided by this implementation")]
    Unimplemented,
}

impl PtlError {
    /// Header value of the code (`PTL_ARG_INVALID` etc.).
    pub fn code(self) -> i32 {
        match self {
            PtlError::ArgInvalid => 0x7,
            PtlError::InUse => 0x8,
            PtlError::CtNoneReached => 32,
            PtlError::EqDropped => 33,
            PtlError::EqEmpty => 34,
            PtlError::Ignored => 36,
            PtlError::Interrupted => 37,
            PtlError::ListTooLong => 38,
            PtlError::NoInit => 39,
            PtlError::NoSpace => 40,
            PtlError::PidInUse => 41,
            PtlError::PtFull => 42,
            PtlError::PtEqNeeded => 43,
            PtlError::PtInUse => 44,
            PtlError::SizeInvalid => 45,
            PtlError::TryAgain => 46,
            PtlError::Unimplemented => 47,
        }
    }
}

pub type Result<T> = std::result::Result<T, PtlError>;
