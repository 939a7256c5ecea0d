use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::rtun::net::normalize_dial_addr;
use crate::rtun::tunnel::TunnelError;
use crate::rtun::tunnel::model::Dial;
use crate::rtun::tunnel::mux::Tunnel;
use crate::rtun::tunnel::packet::Packet;
use crate::rtun::tunnel::stream::BoxedStream;

/// Decides whether a peer's Register request is accepted.
///
/// The returned bytes are sent back as the Register response payload.
#[async_trait]
pub trait RegisterHandler: Send + Sync {
    async fn on_register(&self, tunnel: &Tunnel, packet: &Packet) -> Result<Bytes, TunnelError>;
}

/// A freshly dialed backend connection.
pub struct Dialed {
    pub conn: BoxedStream,
    /// Key the virtual stream is bound to on both sides.
    pub key: String,
    /// Descriptor that was actually dialed.
    pub dial: Dial,
}

/// Connects to the backend named by an Open request.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, dial: &Dial) -> Result<Dialed, TunnelError>;
}

/// Lifecycle notifications. Both methods default to no-ops.
#[async_trait]
pub trait TunnelObserver: Send + Sync {
    async fn on_dialed(&self, _dial: &Dial, _key: &str) {}
    async fn on_closed(&self, _tunnel: &Tunnel, _err: &TunnelError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from the backend, about to enter the tunnel.
    ToTunnel,
    /// Bytes that came out of the tunnel, about to reach the backend.
    ToBackend,
}

/// Rewrites bytes copied between a virtual stream and its backend.
pub trait Transform: Send + Sync {
    fn apply(&self, direction: Direction, key: &str, data: Bytes) -> Bytes;
}

/// Dials whatever descriptor the peer asks for.
#[derive(Debug, Clone)]
pub struct RemoteDialer {
    pub default_timeout: Duration,
}

impl Default for RemoteDialer {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
        }
    }
}

impl RemoteDialer {
    pub async fn connect(&self, dial: &Dial) -> Result<Dialed, TunnelError> {
        let kind = dial.normalized_kind();
        if kind != "tcp" {
            return Err(TunnelError::Rejected(format!(
                "unsupported dial kind {:?}",
                dial.kind
            )));
        }
        let addr = normalize_dial_addr(&dial.address).into_owned();
        let timeout = dial.timeout().unwrap_or(self.default_timeout);
        let conn = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| TunnelError::Io(format!("dial {addr}: timed out")))?
            .map_err(|e| TunnelError::Io(format!("dial {addr}: {e}")))?;
        let _ = conn.set_nodelay(true);
        let key = conn.local_addr()?.to_string();
        Ok(Dialed {
            conn: Box::new(conn),
            key,
            dial: dial.clone(),
        })
    }
}

#[async_trait]
impl Dialer for RemoteDialer {
    async fn dial(&self, dial: &Dial) -> Result<Dialed, TunnelError> {
        self.connect(dial).await
    }
}

/// Ignores the requested descriptor and always dials `target`.
#[derive(Debug, Clone)]
pub struct FixedDialer {
    pub target: Dial,
    pub inner: RemoteDialer,
}

impl FixedDialer {
    pub fn new(target: Dial) -> Self {
        Self {
            target,
            inner: RemoteDialer::default(),
        }
    }
}

#[async_trait]
impl Dialer for FixedDialer {
    async fn dial(&self, _dial: &Dial) -> Result<Dialed, TunnelError> {
        self.inner.connect(&self.target).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn remote_dialer_keys_stream_by_local_addr() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (mut c, peer) = ln.accept().await.unwrap();
            c.write_all(b"hi").await.unwrap();
            peer
        });

        let d = Dial::tcp(format!(":{port}"));
        let mut dialed = RemoteDialer::default().dial(&d).await.unwrap();
        let mut buf = [0u8; 2];
        dialed.conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        let peer = accept.await.unwrap();
        assert_eq!(dialed.key, peer.to_string());
        assert_eq!(dialed.dial, d);
    }

    #[tokio::test]
    async fn remote_dialer_rejects_unknown_kinds() {
        let d = Dial {
            kind: "serial".into(),
            address: "/dev/ttyS0".into(),
            ..Default::default()
        };
        let err = RemoteDialer::default().dial(&d).await.err().unwrap();
        assert!(err.to_string().contains("unsupported dial kind"));
    }

    #[tokio::test]
    async fn fixed_dialer_reports_its_own_target() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = ln.accept().await;
        });

        let target = Dial::tcp(addr);
        let dialer = FixedDialer::new(target.clone());
        let dialed = dialer.dial(&Dial::tcp("10.0.0.1:1")).await.unwrap();
        assert_eq!(dialed.dial, target);
    }
}
