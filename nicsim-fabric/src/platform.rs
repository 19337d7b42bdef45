//! Platform description: how many nodes, and how fast their wires are.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::link::{NetLink, PciLink};

/// Reference PCI figures for the modelled adapter (PCIe gen3 x16-ish).
pub const DEFAULT_PCI_BANDWIDTH: f64 = 15.75e9; // bytes/s
pub const DEFAULT_PCI_LATENCY: f64 = 200e-9; // seconds

/// Reference network figures (100 Gb/s class fabric).
pub const DEFAULT_NET_BANDWIDTH: f64 = 12.5e9; // bytes/s
pub const DEFAULT_NET_LATENCY: f64 = 500e-9; // seconds

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to read platform file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse platform file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("platform must describe at least one node, got {0}")]
    NoNodes(usize),
    #[error("non-positive bandwidth or latency")]
    BadFigures,
}

/// Uniform cluster description. Per spec, anything below the host-to-host
/// bandwidth/latency abstraction is out of scope, so a single figure per
/// medium is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    /// Number of simulated nodes (NIDs are 0..nodes).
    pub nodes: u32,
    /// Host-to-host wire bandwidth in bytes per second.
    #[serde(default = "default_net_bandwidth")]
    pub net_bandwidth: f64,
    /// Host-to-host wire latency in seconds.
    #[serde(default = "default_net_latency")]
    pub net_latency: f64,
    /// PCI bandwidth between a node's CPU and NIC endpoints, bytes per second.
    #[serde(default = "default_pci_bandwidth")]
    pub pci_bandwidth: f64,
    /// PCI latency in seconds.
    #[serde(default = "default_pci_latency")]
    pub pci_latency: f64,
}

fn default_net_bandwidth() -> f64 {
    DEFAULT_NET_BANDWIDTH
}
fn default_net_latency() -> f64 {
    DEFAULT_NET_LATENCY
}
fn default_pci_bandwidth() -> f64 {
    DEFAULT_PCI_BANDWIDTH
}
fn default_pci_latency() -> f64 {
    DEFAULT_PCI_LATENCY
}

impl Platform {
    /// A uniform cluster with the reference figures.
    pub fn uniform(nodes: u32) -> Self {
        Self {
            nodes,
            net_bandwidth: DEFAULT_NET_BANDWIDTH,
            net_latency: DEFAULT_NET_LATENCY,
            pci_bandwidth: DEFAULT_PCI_BANDWIDTH,
            pci_latency: DEFAULT_PCI_LATENCY,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, PlatformError> {
        let raw = fs::read_to_string(path)?;
        let platform: Platform = serde_json::from_str(&raw)?;
        platform.validate()?;
        Ok(platform)
    }

    pub fn validate(&self) -> Result<(), PlatformError> {
        if self.nodes == 0 {
            return Err(PlatformError::NoNodes(0));
        }
        if self.net_bandwidth <= 0.0
            || self.net_latency < 0.0
            || self.pci_bandwidth <= 0.0
            || self.pci_latency < 0.0
        {
            return Err(PlatformError::BadFigures);
        }
        Ok(())
    }

    /// Wire between two nodes. Loopback uses the same figures: the simulated
    /// NIC does not short-circuit self-sends.
    pub fn net_link(&self, _src: u32, _dst: u32) -> NetLink {
        NetLink::new(self.net_bandwidth, self.net_latency)
    }

    /// The CPU<->NIC link of one node.
    pub fn pci_link(&self, _nid: u32) -> PciLink {
        PciLink::new(self.pci_bandwidth, self.pci_latency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fill_in() {
        let p: Platform = serde_json::from_str(r#"{ "nodes": 4 }"#).unwrap();
        assert_eq!(p.nodes, 4);
        assert_eq!(p.pci_latency, DEFAULT_PCI_LATENCY);
        assert_eq!(p.net_bandwidth, DEFAULT_NET_BANDWIDTH);
    }

    #[test]
    fn rejects_empty_cluster() {
        let p: Platform = serde_json::from_str(r#"{ "nodes": 0 }"#).unwrap();
        assert!(p.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "nodes": 2, "net_latency": 1e-6 }}"#).unwrap();
        let p = Platform::from_file(file.path()).unwrap();
        assert_eq!(p.nodes, 2);
        assert_eq!(p.net_latency, 1e-6);
    }
}
