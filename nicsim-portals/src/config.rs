//! Simulation tunables.

use serde::{Deserialize, Serialize};

/// Global configuration of the protocol engine, read once at start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Maximum number of E2E retries before giving up.
    pub max_retries: u32,
    /// E2E timeout between retries, in seconds.
    pub retry_timeout: f64,
    /// If false, payload bytes are not actually copied (timing is still
    /// charged).
    pub use_real_memory: bool,
    /// Model PCI transfers.
    pub model_pci: bool,
    /// Additionally model the small command transfers to the NIC.
    /// Meaningless without `model_pci`.
    pub model_pci_commands: bool,
    /// Disable E2E acknowledgements entirely (best-effort delivery).
    pub e2e_off: bool,
    /// Cap on actual memcpy size in bytes, -1 for uncapped.
    pub max_memcpy: i64,
    /// Trigger ACK/SEND at the target side without putting a real ACK on
    /// the wire.
    pub quick_acks: bool,
    /// Per-destination-node in-flight cap per VN; 0 disables.
    pub max_inflight_to_target: u32,
    /// Per-process-pair in-flight cap per VN; 0 disables.
    pub max_inflight_to_process: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_timeout: 10.0,
            use_real_memory: true,
            model_pci: true,
            model_pci_commands: true,
            e2e_off: false,
            max_memcpy: -1,
            quick_acks: false,
            max_inflight_to_target: 0,
            max_inflight_to_process: 0,
        }
    }
}

impl SimConfig {
    pub fn model_pci_commands(&self) -> bool {
        self.model_pci && self.model_pci_commands
    }
}
