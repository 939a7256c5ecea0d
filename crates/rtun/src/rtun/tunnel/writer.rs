use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};

use crate::rtun::tunnel::TunnelError;
use crate::rtun::tunnel::frame::FrameCodec;
use crate::rtun::tunnel::packet::Packet;

pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Shared write half of a tunnel connection.
///
/// Each packet is encoded up front and written and flushed while holding the
/// lock, so frames from concurrent writers never interleave. A pending write
/// is abandoned once `shutdown` starts, so a peer that stopped reading cannot
/// hold the lock past teardown.
pub struct FrameWriter {
    codec: FrameCodec,
    inner: Mutex<Option<BoxedWrite>>,
    closing: watch::Sender<bool>,
}

impl FrameWriter {
    pub fn new(codec: FrameCodec, w: BoxedWrite) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            codec,
            inner: Mutex::new(Some(w)),
            closing,
        }
    }

    pub async fn write_packet(&self, p: &Packet) -> Result<(), TunnelError> {
        let frame = self.codec.encode(p)?;
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let write = async {
            let mut guard = self.inner.lock().await;
            let w = guard.as_mut().ok_or(TunnelError::Closed)?;
            w.write_all(&frame).await?;
            w.flush().await?;
            Ok::<(), TunnelError>(())
        };
        tokio::select! {
            r = write => r?,
            _ = self.closing() => return Err(TunnelError::Closed),
        }

        metrics::counter!("rtun_frames_written_total").increment(1);
        tracing::trace!(packet = %p, "tunnel: sent");
        Ok(())
    }

    /// Shuts the write half down; later writes fail with `Closed`.
    pub async fn shutdown(&self) {
        self.closing.send_replace(true);
        let taken = self.inner.lock().await.take();
        if let Some(mut w) = taken {
            let _ = w.shutdown().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }

    async fn closing(&self) {
        let mut rx = self.closing.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::rtun::tunnel::packet::MessageType;

    #[tokio::test]
    async fn concurrent_writers_never_interleave_frames() {
        let codec = FrameCodec::default();
        let (a, mut b) = tokio::io::duplex(256);
        let w = Arc::new(FrameWriter::new(codec, Box::new(a)));

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let w = w.clone();
            tasks.push(tokio::spawn(async move {
                let p = Packet::request(format!("k{i}"), MessageType::Write, false, vec![i; 1000]);
                w.write_packet(&p).await.unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let p = codec.read_packet(&mut b).await.unwrap();
            let i: u8 = p.key[1..].parse().unwrap();
            assert_eq!(p.data, Bytes::from(vec![i; 1000]));
            seen.push(i);
        }
        for t in tasks {
            t.await.unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn writes_after_shutdown_fail_closed() {
        let (a, _b) = tokio::io::duplex(64);
        let w = FrameWriter::new(FrameCodec::default(), Box::new(a));
        w.shutdown().await;
        assert!(w.is_closed());
        let p = Packet::request("k", MessageType::Close, false, Bytes::new());
        assert_eq!(w.write_packet(&p).await.unwrap_err(), TunnelError::Closed);
    }

    #[tokio::test]
    async fn shutdown_abandons_write_to_stalled_peer() {
        let (a, _stalled) = tokio::io::duplex(64);
        let w = Arc::new(FrameWriter::new(FrameCodec::default(), Box::new(a)));
        let pending = tokio::spawn({
            let w = w.clone();
            async move {
                let p = Packet::request("k", MessageType::Write, false, vec![0u8; 4096]);
                w.write_packet(&p).await
            }
        });
        tokio::task::yield_now().await;

        tokio::time::timeout(std::time::Duration::from_secs(2), w.shutdown())
            .await
            .unwrap();
        let err = tokio::time::timeout(std::time::Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err, TunnelError::Closed);
    }
}
