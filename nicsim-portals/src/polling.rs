//! Timeout handling shared by the EQ and CT poll paths.

use std::pin::Pin;

use futures::future::select_all;
use tokio::sync::futures::Notified;
use tokio::time::{Duration, Instant};

use crate::error::{PtlError, Result};
use crate::types::PTL_TIME_FOREVER;

/// Parsed Portals timeout: -1 waits forever, 0 is a non-blocking probe,
/// positive values are milliseconds. Any other negative value is an
/// argument error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollTimeout {
    Forever,
    Probe,
    Until(Instant),
}

impl PollTimeout {
    pub(crate) fn parse(timeout_ms: i64) -> Result<Self> {
        match timeout_ms {
            PTL_TIME_FOREVER => Ok(PollTimeout::Forever),
            0 => Ok(PollTimeout::Probe),
            ms if ms > 0 => Ok(PollTimeout::Until(
                Instant::now() + Duration::from_millis(ms as u64),
            )),
            _ => Err(PtlError::ArgInvalid),
        }
    }
}

/// Wait until any of the armed notified futures fires, or the deadline
/// passes. Returns false on deadline expiry. Losing futures are dropped,
/// which cancels their registration.
pub(crate) async fn wait_any(
    futs: Vec<Pin<Box<Notified<'_>>>>,
    timeout: PollTimeout,
) -> bool {
    match timeout {
        PollTimeout::Probe => false,
        PollTimeout::Forever => {
            select_all(futs).await;
            true
        }
        PollTimeout::Until(deadline) => {
            tokio::select! {
                _ = select_all(futs) => true,
                _ = tokio::time::sleep_until(deadline) => false,
            }
        }
    }
}
