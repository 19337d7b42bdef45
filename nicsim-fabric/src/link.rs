//! Bandwidth/latency-modelled transfers.
//!
//! A transfer is a virtual-time sleep of `latency + bytes / bandwidth`.
//! The detached variants spawn the sleep so the caller can overlap it with
//! other work, which is how the NIC pipelines its PCI and wire legs.

use std::time::Duration;

fn transfer_duration(bytes: u64, bandwidth: f64, latency: f64) -> Duration {
    Duration::from_secs_f64(latency + bytes as f64 / bandwidth)
}

/// Host-to-host wire.
#[derive(Debug, Clone, Copy)]
pub struct NetLink {
    bandwidth: f64,
    latency: f64,
}

impl NetLink {
    pub fn new(bandwidth: f64, latency: f64) -> Self {
        Self { bandwidth, latency }
    }

    /// Occupy the wire for `bytes`; completes when the payload has landed.
    pub async fn transfer(&self, bytes: u64) {
        tokio::time::sleep(transfer_duration(bytes, self.bandwidth, self.latency)).await;
    }

    pub fn duration(&self, bytes: u64) -> Duration {
        transfer_duration(bytes, self.bandwidth, self.latency)
    }
}

/// CPU<->NIC PCI leg of one node.
#[derive(Debug, Clone, Copy)]
pub struct PciLink {
    bandwidth: f64,
    latency: f64,
}

impl PciLink {
    pub fn new(bandwidth: f64, latency: f64) -> Self {
        Self { bandwidth, latency }
    }

    /// Synchronous PCI transfer (either direction; the link is symmetric).
    pub async fn transfer(&self, bytes: u64) {
        tokio::time::sleep(transfer_duration(bytes, self.bandwidth, self.latency)).await;
    }

    /// Fire-and-forget PCI transfer; returns the spawned leg so a caller can
    /// still wait for it if it wants DMA completion.
    pub fn transfer_detached(&self, bytes: u64) -> tokio::task::JoinHandle<()> {
        let link = *self;
        tokio::spawn(async move { link.transfer(bytes).await })
    }

    /// Time until the first PCI packet of a transfer has crossed the link.
    /// 512 bytes is the reference packet size; smaller transfers fit in one.
    pub fn first_packet_wait(&self, bytes: u64) -> Duration {
        let capped = bytes.min(512);
        Duration::from_secs_f64(self.latency + capped as f64 / self.bandwidth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn transfer_charges_latency_plus_serialization() {
        let link = NetLink::new(1e9, 1e-6);
        let before = tokio::time::Instant::now();
        link.transfer(1000).await;
        let elapsed = before.elapsed().as_secs_f64();
        assert!((elapsed - (1e-6 + 1e-6)).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_transfer_overlaps() {
        let link = PciLink::new(1e9, 0.0);
        let before = tokio::time::Instant::now();
        let dma = link.transfer_detached(2000);
        link.transfer(1000).await;
        dma.await.unwrap();
        // Both legs ran concurrently: total time is the longer one.
        assert!((before.elapsed().as_secs_f64() - 2e-6).abs() < 1e-12);
    }

    #[test]
    fn first_packet_caps_at_reference_size() {
        let link = PciLink::new(15.75e9, 200e-9);
        assert_eq!(link.first_packet_wait(4096), link.first_packet_wait(512));
        assert!(link.first_packet_wait(64) < link.first_packet_wait(512));
    }
}
