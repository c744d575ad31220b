//! Single-host gateway probe

use bytes::BytesMut;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use symi_core::frame::{decode, encode_frame, Decoded, Frame};
use symi_core::protocol::opcode;
use symi_core::{command, MacAddress};

const REPLY_BUF_LEN: usize = 64;

/// Extra details about a candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateMetadata {
    /// Gateway MAC, when the reply decoded as a MAC response
    pub mac: Option<String>,
    /// Opcode of the first decoded reply frame
    pub reply_opcode: Option<u8>,
    pub reply_len: usize,
    pub latency_ms: u64,
}

/// A host that answered on the discovery port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayCandidate {
    pub address: SocketAddr,
    pub gateway_id: String,
    pub metadata: CandidateMetadata,
}

/// Stable id for a gateway that did not report its MAC
fn address_id(addr: &SocketAddr) -> String {
    format!("symi-{}", addr.ip().to_string().replace(['.', ':'], "-"))
}

/// First valid frame in `buf`, skipping noise
fn first_frame(mut buf: &[u8]) -> Option<Frame> {
    loop {
        match decode(buf) {
            Decoded::Frame { frame, .. } => return Some(frame),
            Decoded::Incomplete => return None,
            Decoded::Skipped { consumed, .. } => buf = &buf[consumed..],
        }
    }
}

/// Connect, send a read-MAC request and wait for any reply.
///
/// Connection failures, silence and a peer that closes without answering all
/// yield `None`.
pub async fn probe_gateway(addr: SocketAddr, wait: Duration) -> Option<GatewayCandidate> {
    let started = Instant::now();

    let mut stream = match timeout(wait, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            trace!(addr = %addr, error = %e, "Probe connect failed");
            return None;
        }
        Err(_) => {
            trace!(addr = %addr, "Probe connect timed out");
            return None;
        }
    };

    let mut request = BytesMut::new();
    if encode_frame(&command::encode_read_mac(), &mut request).is_err() {
        return None;
    }
    if let Err(e) = stream.write_all(&request).await {
        trace!(addr = %addr, error = %e, "Probe write failed");
        return None;
    }

    let mut buf = [0u8; REPLY_BUF_LEN];
    let n = match timeout(wait, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => n,
        Ok(Ok(_)) => {
            trace!(addr = %addr, "Probe peer closed without reply");
            return None;
        }
        Ok(Err(e)) => {
            trace!(addr = %addr, error = %e, "Probe read failed");
            return None;
        }
        Err(_) => {
            trace!(addr = %addr, "No reply to probe");
            return None;
        }
    };

    let frame = first_frame(&buf[..n]);
    let mac = frame
        .as_ref()
        .filter(|f| f.opcode == opcode::RESP_READ_MAC_ADDRESS)
        .and_then(|f| MacAddress::from_slice(&f.payload));
    let gateway_id = match &mac {
        Some(mac) => hex_id(mac),
        None => address_id(&addr),
    };

    debug!(addr = %addr, gateway = %gateway_id, bytes = n, "Gateway candidate answered");
    Some(GatewayCandidate {
        address: addr,
        gateway_id,
        metadata: CandidateMetadata {
            mac: mac.map(|m| m.to_string()),
            reply_opcode: frame.map(|f| f.opcode),
            reply_len: n,
            latency_ms: started.elapsed().as_millis() as u64,
        },
    })
}

fn hex_id(mac: &MacAddress) -> String {
    symi_core::DeviceId::from_mac(mac).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use symi_core::protocol::status;
    use tokio::net::TcpListener;

    async fn gateway_stub(reply: Option<Vec<u8>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 4];
            socket.read_exact(&mut req).await.unwrap();
            assert_eq!(req[1], opcode::READ_MAC_ADDRESS);
            match reply {
                Some(bytes) => socket.write_all(&bytes).await.unwrap(),
                None => tokio::time::sleep(Duration::from_secs(30)).await,
            }
        });
        addr
    }

    fn mac_reply() -> Vec<u8> {
        let frame = Frame::response(
            opcode::RESP_READ_MAC_ADDRESS,
            status::SUCCESS,
            vec![0x1A, 0xD0, 0x7D, 0x3D, 0x44, 0x9C],
        );
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_probe_reads_gateway_mac() {
        let addr = gateway_stub(Some(mac_reply())).await;
        let candidate = probe_gateway(addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(candidate.gateway_id, "1ad07d3d449c");
        assert_eq!(candidate.metadata.mac.as_deref(), Some("1A:D0:7D:3D:44:9C"));
        assert_eq!(candidate.metadata.reply_opcode, Some(opcode::RESP_READ_MAC_ADDRESS));
    }

    #[tokio::test]
    async fn test_probe_accepts_any_reply() {
        let addr = gateway_stub(Some(vec![0xFF, 0x00])).await;
        let candidate = probe_gateway(addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(candidate.gateway_id, "symi-127-0-0-1");
        assert_eq!(candidate.metadata.mac, None);
        assert_eq!(candidate.metadata.reply_len, 2);
    }

    #[tokio::test]
    async fn test_probe_silent_host_is_dropped() {
        let addr = gateway_stub(None).await;
        assert!(probe_gateway(addr, Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(probe_gateway(addr, Duration::from_millis(500)).await.is_none());
    }

    #[test]
    fn test_first_frame_skips_noise() {
        let mut bytes = vec![0x00, 0x53];
        bytes.extend(mac_reply());
        let frame = first_frame(&bytes).unwrap();
        assert_eq!(frame.opcode, opcode::RESP_READ_MAC_ADDRESS);
        assert!(first_frame(&[0x53, 0x83]).is_none());
    }
}
