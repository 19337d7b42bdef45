//! Command-line runner: two-node traffic scenarios over the simulated NIC.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nicsim_fabric::Platform;
use nicsim_portals::api::{MdParams, MeParams, Portals};
use nicsim_portals::types::{PTL_IFACE_DEFAULT, PTL_NI_MATCHING, PTL_NI_PHYSICAL};
use nicsim_portals::{
    AckReq, EventKind, ListKind, MemRegion, ProcessId, SimConfig, Simulation,
};

const PID: u32 = 100;
const MATCH: u64 = 1;

#[derive(Parser)]
#[command(name = "nicsim", about = "Discrete-event Portals 4 NIC simulator")]
struct Cli {
    /// Platform description (JSON); defaults to a uniform two-node cluster.
    #[arg(long)]
    platform: Option<PathBuf>,

    /// Disable E2E reliability (best-effort delivery).
    #[arg(long)]
    e2e_off: bool,

    /// Collapse acknowledgements at the target (quick-ACK mode).
    #[arg(long)]
    quick_acks: bool,

    /// Skip PCI modelling.
    #[arg(long)]
    no_pci: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Round-trip latency between two nodes.
    Pingpong {
        /// Payload size in bytes.
        #[arg(long, default_value_t = 8)]
        size: u64,
        /// Number of round trips.
        #[arg(long, default_value_t = 1000)]
        iterations: u32,
    },
    /// Streaming bandwidth from node 0 to node 1.
    Bandwidth {
        /// Payload size in bytes.
        #[arg(long, default_value_t = 1 << 20)]
        size: u64,
        /// Number of messages.
        #[arg(long, default_value_t = 64)]
        messages: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let platform = match &cli.platform {
        Some(path) => Platform::from_file(path)
            .with_context(|| format!("loading platform {}", path.display()))?,
        None => Platform::uniform(2),
    };
    let config = SimConfig {
        e2e_off: cli.e2e_off,
        quick_acks: cli.quick_acks,
        model_pci: !cli.no_pci,
        model_pci_commands: !cli.no_pci,
        ..SimConfig::default()
    };

    let runtime = nicsim_fabric::runtime()?;
    runtime.block_on(async move {
        let sim = Simulation::new(platform, config);
        match cli.command {
            Command::Pingpong { size, iterations } => pingpong(&sim, size, iterations).await,
            Command::Bandwidth { size, messages } => bandwidth(&sim, size, messages).await,
        }
    })
}

struct Peer {
    ptl: Portals,
    eqh: nicsim_portals::EqHandle,
    mdh: nicsim_portals::MdHandle,
}

/// Open an NI with a portal, a catch-all matching entry and a bound MD of
/// `size` bytes on one node.
async fn peer(sim: &Simulation, nid: u32, size: u64) -> Result<Peer> {
    let ptl = sim.process(nid);
    let (nih, _) = ptl
        .ni_init(PTL_IFACE_DEFAULT, PTL_NI_MATCHING | PTL_NI_PHYSICAL, PID, None)
        .await
        .map_err(|e| anyhow::anyhow!("ni_init on node {nid}: {e}"))?;
    let eqh = ptl
        .eq_alloc(nih, 1024)
        .map_err(|e| anyhow::anyhow!("eq_alloc on node {nid}: {e}"))?;
    ptl.pt_alloc(nih, 0, Some(eqh), 0)
        .await
        .map_err(|e| anyhow::anyhow!("pt_alloc on node {nid}: {e}"))?;

    let recv_buf = MemRegion::new(size as usize);
    ptl.me_append(
        nih,
        0,
        &MeParams::over(recv_buf).with_match(MATCH, 0),
        ListKind::Priority,
        0,
    )
    .await
    .map_err(|e| anyhow::anyhow!("me_append on node {nid}: {e}"))?;
    // Consume the LINK event.
    ptl.eq_wait(eqh)
        .await
        .map_err(|e| anyhow::anyhow!("eq_wait on node {nid}: {e}"))?;

    let send_buf = MemRegion::new(size as usize);
    let mdh = ptl
        .md_bind(nih, &MdParams::over(send_buf).with_eq(eqh))
        .await
        .map_err(|e| anyhow::anyhow!("md_bind on node {nid}: {e}"))?;

    Ok(Peer { ptl, eqh, mdh })
}

async fn put_to(peer: &Peer, target: u32, size: u64) -> Result<()> {
    peer.ptl
        .put(
            peer.mdh,
            0,
            size,
            AckReq::NoAck,
            ProcessId::phys(target, PID),
            0,
            MATCH,
            0,
            0,
            0,
        )
        .await
        .map_err(|e| anyhow::anyhow!("put to node {target}: {e}"))?;
    Ok(())
}

async fn wait_for(peer: &Peer, kind: EventKind) -> Result<()> {
    loop {
        let event = peer
            .ptl
            .eq_wait(peer.eqh)
            .await
            .map_err(|e| anyhow::anyhow!("eq_wait: {e}"))?
            .into_event();
        if event.kind == kind {
            return Ok(());
        }
    }
}

async fn pingpong(sim: &Simulation, size: u64, iterations: u32) -> Result<()> {
    let ping = peer(sim, 0, size).await?;
    let pong = peer(sim, 1, size).await?;
    let clock = sim.clock();

    info!(size, iterations, "pingpong starting");
    let start = clock.now_secs();

    let ping_side = async {
        for _ in 0..iterations {
            put_to(&ping, 1, size).await?;
            wait_for(&ping, EventKind::Put).await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    let pong_side = async {
        for _ in 0..iterations {
            wait_for(&pong, EventKind::Put).await?;
            put_to(&pong, 0, size).await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    let (a, b) = tokio::join!(ping_side, pong_side);
    a?;
    b?;

    let elapsed = clock.now_secs() - start;
    let half_round_trip = elapsed / (2.0 * iterations as f64);
    println!(
        "pingpong: {size} B x {iterations} round trips in {:.6} s simulated ({:.3} us half round trip)",
        elapsed,
        half_round_trip * 1e6
    );
    Ok(())
}

async fn bandwidth(sim: &Simulation, size: u64, messages: u32) -> Result<()> {
    let sender = peer(sim, 0, size).await?;
    let receiver = peer(sim, 1, size).await?;
    let clock = sim.clock();

    info!(size, messages, "bandwidth run starting");
    let start = clock.now_secs();

    let send_side = async {
        for _ in 0..messages {
            put_to(&sender, 1, size).await?;
        }
        // Drain the SENDs so the queue cannot overflow on long runs.
        for _ in 0..messages {
            wait_for(&sender, EventKind::Send).await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    let recv_side = async {
        for _ in 0..messages {
            wait_for(&receiver, EventKind::Put).await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    let (a, b) = tokio::join!(send_side, recv_side);
    a?;
    b?;

    let elapsed = clock.now_secs() - start;
    let total = size as f64 * messages as f64;
    println!(
        "bandwidth: {messages} x {size} B in {:.6} s simulated ({:.3} GB/s)",
        elapsed,
        total / elapsed / 1e9
    );
    Ok(())
}
