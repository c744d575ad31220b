//! Byte-stream transports to the gateway
//!
//! Serial and TCP connections are boxed into one stream type at open time, so
//! nothing past [`Transport::open`] branches on the kind of link. The
//! transport reports a lost connection as [`TransportError::Disconnected`] and
//! leaves reconnecting to its owner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::{debug, info, trace};

use symi_core::protocol::{DEFAULT_TCP_PORT, SERIAL_BAUD_RATE};

use crate::error::{Result, TransportError};

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Any bidirectional byte stream the engine can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// How to reach the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// 115200-8N1, no flow control
    Serial { path: String },
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl TransportConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    pub fn serial(path: impl Into<String>) -> Self {
        Self::Serial { path: path.into() }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { path } => write!(f, "serial:{}", path),
            Self::Tcp { host, port, .. } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

/// An open connection to the gateway
pub struct Transport {
    stream: Option<BoxedStream>,
    peer: String,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl Transport {
    /// Open the link described by `config`
    pub async fn open(config: &TransportConfig) -> Result<Self> {
        let peer = config.to_string();
        let stream: BoxedStream = match config {
            TransportConfig::Serial { path } => {
                let port = tokio_serial::new(path, SERIAL_BAUD_RATE)
                    .data_bits(DataBits::Eight)
                    .parity(Parity::None)
                    .stop_bits(StopBits::One)
                    .flow_control(FlowControl::None)
                    .open_native_async()
                    .map_err(|source| TransportError::Serial {
                        path: path.clone(),
                        source,
                    })?;
                Box::new(port)
            }
            TransportConfig::Tcp {
                host,
                port,
                connect_timeout_ms,
            } => {
                let addr = format!("{}:{}", host, port);
                let duration = Duration::from_millis(*connect_timeout_ms);
                let stream = timeout(duration, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| TransportError::ConnectTimeout {
                        addr: addr.clone(),
                        timeout_ms: *connect_timeout_ms,
                    })?
                    .map_err(|source| TransportError::Connect {
                        addr: addr.clone(),
                        source,
                    })?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
        };
        info!(peer = %peer, "Transport opened");
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    /// Wrap an already-connected stream
    pub fn from_stream<S: ByteStream + 'static>(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> Result<&mut BoxedStream> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    /// Read whatever bytes are available, waiting for at least one.
    /// End of stream is reported as `Disconnected`.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self
            .stream()?
            .read(buf)
            .await
            .map_err(TransportError::from_io)?;
        if n == 0 && !buf.is_empty() {
            debug!(peer = %self.peer, "Transport reached end of stream");
            return Err(TransportError::Disconnected);
        }
        trace!(peer = %self.peer, bytes = n, "Read chunk");
        Ok(n)
    }

    /// Write all bytes and flush
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(bytes).await.map_err(TransportError::from_io)?;
        stream.flush().await.map_err(TransportError::from_io)?;
        trace!(peer = %self.peer, bytes = bytes.len(), "Wrote frame bytes");
        Ok(())
    }

    /// Shut the link down. Later reads and writes fail with `Closed`.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // The peer may already be gone
            if let Err(e) = stream.shutdown().await {
                debug!(peer = %self.peer, error = %e, "Shutdown after disconnect");
            }
            info!(peer = %self.peer, "Transport closed");
        }
        Ok(())
    }

    /// Split into independent read and write halves
    pub fn split(mut self) -> Result<(ReadHalf<BoxedStream>, WriteHalf<BoxedStream>)> {
        let stream = self.stream.take().ok_or(TransportError::Closed)?;
        Ok(tokio::io::split(stream))
    }
}

/// A serial port present on this machine
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl From<tokio_serial::SerialPortInfo> for PortInfo {
    fn from(info: tokio_serial::SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product) = match info.port_type {
            tokio_serial::SerialPortType::UsbPort(usb) => {
                (Some(usb.vid), Some(usb.pid), usb.manufacturer, usb.product)
            }
            _ => (None, None, None, None),
        };
        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
        }
    }
}

/// List serial ports, USB adapters first
pub fn list_serial_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = tokio_serial::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.sort_by(|a, b| {
        b.vid
            .is_some()
            .cmp(&a.vid.is_some())
            .then_with(|| a.name.cmp(&b.name))
    });
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_duplex_roundtrip() {
        let (local, mut remote) = duplex(64);
        let mut transport = Transport::from_stream(local, "duplex");

        transport.write(&[0x53, 0x12, 0x00, 0x41]).await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x53, 0x12, 0x00, 0x41]);

        remote.write_all(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = transport.read_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_peer_drop_is_disconnected() {
        let (local, remote) = duplex(64);
        let mut transport = Transport::from_stream(local, "duplex");
        drop(remote);

        let mut buf = [0u8; 16];
        let err = transport.read_chunk(&mut buf).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_io() {
        let (local, _remote) = duplex(64);
        let mut transport = Transport::from_stream(local, "duplex");
        transport.close().await.unwrap();
        assert!(!transport.is_open());
        assert!(matches!(transport.write(&[1]).await, Err(TransportError::Closed)));
        assert!(matches!(transport.split(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_tcp_open_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut transport = Transport::open(&TransportConfig::tcp("127.0.0.1", port))
            .await
            .unwrap();
        assert_eq!(transport.peer(), format!("tcp:127.0.0.1:{}", port));
        transport.write(&[7, 8]).await.unwrap();

        let mut buf = [0u8; 8];
        let n = transport.read_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[7, 8]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_split_halves() {
        let (local, mut remote) = duplex(64);
        let transport = Transport::from_stream(local, "duplex");
        let (mut reader, mut writer) = transport.split().unwrap();

        writer.write_all(&[9]).await.unwrap();
        let mut one = [0u8; 1];
        remote.read_exact(&mut one).await.unwrap();
        assert_eq!(one, [9]);

        remote.write_all(&[4]).await.unwrap();
        reader.read_exact(&mut one).await.unwrap();
        assert_eq!(one, [4]);
    }

    #[test]
    fn test_config_serde() {
        let config: TransportConfig =
            serde_json::from_str(r#"{ "kind": "tcp", "host": "10.0.0.2" }"#).unwrap();
        assert_eq!(config, TransportConfig::tcp("10.0.0.2", DEFAULT_TCP_PORT));
        assert_eq!(config.to_string(), "tcp:10.0.0.2:8899");
    }
}
