//! Deterministic discrete-event substrate for the NIC simulator.
//!
//! Everything runs on a tokio current-thread runtime whose clock is paused:
//! simulated time only advances when every actor is blocked on a timer, which
//! is exactly the discrete-event contract. Actors are plain tokio tasks,
//! mailboxes are mpsc channels, and modelled transfers are virtual-time
//! sleeps sized by the platform's bandwidth/latency figures.

pub mod clock;
pub mod link;
pub mod platform;

pub use clock::SimClock;
pub use link::{NetLink, PciLink};
pub use platform::{Platform, PlatformError};

use std::future::Future;

/// Spawn a daemon actor: a task that is expected to run for the whole
/// simulation and is dropped with the runtime.
pub fn spawn_daemon<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut)
}

/// Build a current-thread runtime with the paused virtual clock.
///
/// Tests normally use `#[tokio::test(start_paused = true)]` instead; this is
/// for binaries that drive a simulation from `main`.
pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
}
