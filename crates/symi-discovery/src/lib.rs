//! Symi Discovery - Finding gateways on the local network
//!
//! Probes IPv4 ranges on the discovery port with a bounded pool of
//! connections. Each host that answers a read-MAC request becomes a
//! [`GatewayCandidate`]; silent hosts are dropped without error.

pub mod probe;
pub mod scanner;

pub use probe::{probe_gateway, CandidateMetadata, GatewayCandidate};
pub use scanner::{local_ranges, GatewayScan, LanScanner, ScanConfig, ScanError, ScanRange};
