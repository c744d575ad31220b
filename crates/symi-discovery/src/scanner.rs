//! LAN scanner that probes address ranges for gateways

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use symi_core::protocol::DISCOVERY_PORT;

use crate::probe::{probe_gateway, GatewayCandidate};

/// Widest range probed per interface
const MAX_SCAN_PREFIX: u8 = 24;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(#[from] network_interface::Error),
    #[error("no IPv4 interface to scan from")]
    NoRanges,
}

/// Scanner configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Port probed on each host
    pub port: u16,
    /// Connect and reply timeout per host
    pub timeout_ms: u64,
    /// Hosts probed at once
    pub concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            timeout_ms: 2000,
            concurrency: 64,
        }
    }
}

/// An IPv4 network to probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanRange {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        0xFFFF_FFFF
    } else {
        !0u32 << (32 - prefix_len)
    }
}

impl ScanRange {
    /// Range containing `addr`; host bits are cleared
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        Self {
            network: Ipv4Addr::from(u32::from(addr) & prefix_mask(prefix_len)),
            prefix_len,
        }
    }

    /// Range around an interface address, narrowed to at most a /24
    pub fn for_interface(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self::new(addr, prefix_len.max(MAX_SCAN_PREFIX))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.prefix_len);
        (u32::from(ip) & mask) == (u32::from(self.network) & mask)
    }

    /// Host addresses, without network and broadcast for ranges wider than /31
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        let mask = prefix_mask(self.prefix_len);
        let network = u32::from(self.network) & mask;
        let broadcast = network | !mask;
        if self.prefix_len >= 31 {
            (network..=broadcast).map(Ipv4Addr::from).collect()
        } else {
            ((network + 1)..broadcast).map(Ipv4Addr::from).collect()
        }
    }
}

impl std::fmt::Display for ScanRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn is_virtual_interface(name: &str) -> bool {
    name.starts_with("lo")
        || name.starts_with("docker")
        || name.starts_with("br-")
        || name.starts_with("veth")
        || name.starts_with("virbr")
}

/// Ranges of the local IPv4 interfaces, skipping loopback and virtual ones
pub fn local_ranges() -> Result<Vec<ScanRange>, ScanError> {
    use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};

    let mut ranges = Vec::new();
    for iface in NetworkInterface::show()? {
        if is_virtual_interface(&iface.name) {
            continue;
        }
        for addr in &iface.addr {
            let Addr::V4(v4) = addr else { continue };
            if v4.ip.is_loopback() || v4.ip.is_link_local() {
                continue;
            }
            let prefix = v4
                .netmask
                .map(|m| u32::from(m).count_ones() as u8)
                .unwrap_or(MAX_SCAN_PREFIX);
            let range = ScanRange::for_interface(v4.ip, prefix);
            debug!(interface = %iface.name, ip = %v4.ip, range = %range, "Local scan range");
            if !ranges.contains(&range) {
                ranges.push(range);
            }
        }
    }

    if ranges.is_empty() {
        return Err(ScanError::NoRanges);
    }
    Ok(ranges)
}

/// Probes address ranges for gateways
#[derive(Debug, Clone, Default)]
pub struct LanScanner {
    config: ScanConfig,
}

impl LanScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Start probing every host in `ranges`. Results arrive as hosts answer.
    pub fn scan(&self, ranges: &[ScanRange]) -> GatewayScan {
        let mut hosts: Vec<Ipv4Addr> = ranges.iter().flat_map(ScanRange::hosts).collect();
        hosts.sort();
        hosts.dedup();

        info!(
            hosts = hosts.len(),
            port = self.config.port,
            concurrency = self.config.concurrency,
            "Starting gateway scan"
        );

        let (tx, rx) = mpsc::channel(self.config.concurrency.max(1));
        let driver = tokio::spawn(run_scan(hosts, self.config, tx));
        GatewayScan { rx, driver }
    }

    /// Scan the ranges of the local interfaces
    pub fn scan_local(&self) -> Result<GatewayScan, ScanError> {
        let ranges = local_ranges()?;
        Ok(self.scan(&ranges))
    }
}

async fn run_scan(hosts: Vec<Ipv4Addr>, config: ScanConfig, tx: mpsc::Sender<GatewayCandidate>) {
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let wait = Duration::from_millis(config.timeout_ms);
    let total = hosts.len();
    let mut tasks = JoinSet::new();

    for host in hosts {
        if tx.is_closed() {
            break;
        }
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let tx = tx.clone();
        let addr = SocketAddr::new(host.into(), config.port);
        tasks.spawn(async move {
            let _permit = permit;
            if let Some(candidate) = probe_gateway(addr, wait).await {
                info!(addr = %candidate.address, gateway = %candidate.gateway_id, "Found gateway");
                let _ = tx.send(candidate).await;
            }
        });
        while tasks.try_join_next().is_some() {}
    }

    while tasks.join_next().await.is_some() {}
    debug!(hosts = total, "Gateway scan finished");
}

/// Incremental results of one scan.
///
/// Yields each candidate once and ends when every host has been probed.
/// Dropping the scan or calling [`cancel`](Self::cancel) stops all probes.
pub struct GatewayScan {
    rx: mpsc::Receiver<GatewayCandidate>,
    driver: JoinHandle<()>,
}

impl GatewayScan {
    /// Next candidate, or `None` once the scan is exhausted
    pub async fn next(&mut self) -> Option<GatewayCandidate> {
        self.rx.recv().await
    }

    /// Stop probing; candidates already found are still returned
    pub fn cancel(&mut self) {
        self.driver.abort();
        self.rx.close();
    }

    /// Drain the scan into a list
    pub async fn collect(mut self) -> Vec<GatewayCandidate> {
        let mut found = Vec::new();
        while let Some(candidate) = self.next().await {
            found.push(candidate);
        }
        found
    }
}

impl Stream for GatewayScan {
    type Item = GatewayCandidate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for GatewayScan {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
