use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::rtun::tunnel::TunnelError;
use crate::rtun::tunnel::hooks::{Direction, Transform};
use crate::rtun::tunnel::stream::BoxedStream;
use crate::rtun::tunnel::virtual_io::VirtualIo;

/// Closes the stream if a copy task is dropped or panics before it closed
/// the stream itself.
struct CloseGuard {
    v: Option<VirtualIo>,
}

impl CloseGuard {
    fn new(v: VirtualIo) -> Self {
        Self { v: Some(v) }
    }

    async fn close(mut self, err: Option<TunnelError>) {
        if let Some(v) = self.v.take() {
            if let Some(e) = &err {
                tracing::debug!(key = %v.key(), err = %e, "tunnel: stream copy ended");
            }
            v.close_with_error(err).await;
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(v) = self.v.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { v.close_with_error(Some(TunnelError::Closed)).await });
            }
        }
    }
}

fn apply(t: &Option<Arc<dyn Transform>>, dir: Direction, key: &str, data: Bytes) -> Bytes {
    match t {
        Some(t) => t.apply(dir, key, data),
        None => data,
    }
}

/// Copies backend bytes into the tunnel until the backend ends or the
/// stream closes. Returns the error to close the stream with.
async fn backend_to_virtual<R>(
    mut rd: R,
    v: &VirtualIo,
    buffer_size: usize,
    transform: &Option<Arc<dyn Transform>>,
) -> Option<TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = tokio::select! {
            r = rd.read(&mut buf) => r,
            _ = v.closed() => return None,
        };
        let n = match n {
            Ok(0) => return None,
            Ok(n) => n,
            Err(err) => return Some(err.into()),
        };
        let data = apply(transform, Direction::ToTunnel, v.key(), Bytes::copy_from_slice(&buf[..n]));
        if let Err(err) = v.write(&data).await {
            return Some(err);
        }
    }
}

/// Copies bytes from the tunnel to the backend until the stream is drained
/// after close or the backend fails. Once the stream is closed a write the
/// backend does not accept right away is abandoned, so a stalled backend never
/// keeps its socket alive.
async fn virtual_to_backend<W>(
    mut wr: W,
    v: &VirtualIo,
    buffer_size: usize,
    transform: &Option<Arc<dyn Transform>>,
) -> Option<TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let err = loop {
        let n = match v.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(err) => break Some(err),
        };
        let data = apply(transform, Direction::ToBackend, v.key(), Bytes::copy_from_slice(&buf[..n]));
        let written = tokio::select! {
            biased;
            r = wr.write_all(&data) => r,
            _ = v.closed() => break None,
        };
        if let Err(err) = written {
            break Some(err.into());
        }
    };
    let _ = wr.shutdown().await;
    err
}

/// Spawns the two copy tasks between a virtual stream and its backend.
///
/// Both tasks hold off until `gate` resolves; each closes the stream when its
/// direction ends, whichever finishes first wins.
pub fn spawn_pipe(
    v: VirtualIo,
    conn: BoxedStream,
    buffer_size: usize,
    transform: Option<Arc<dyn Transform>>,
    gate: Option<BoxFuture<'static, ()>>,
) {
    let gate = gate.unwrap_or_else(|| async {}.boxed()).shared();
    let (rd, wr) = tokio::io::split(conn);

    {
        let guard = CloseGuard::new(v.clone());
        let v = v.clone();
        let transform = transform.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            gate.await;
            let err = backend_to_virtual(rd, &v, buffer_size, &transform).await;
            guard.close(err).await;
        });
    }

    let guard = CloseGuard::new(v.clone());
    tokio::spawn(async move {
        gate.await;
        let err = virtual_to_backend(wr, &v, buffer_size, &transform).await;
        guard.close(err).await;
    });
}

/// Relays bytes between a virtual stream and a local connection until either
/// side ends, then closes both.
pub async fn swap<S>(v: VirtualIo, conn: S, buffer_size: usize) -> Option<TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (rd, wr) = tokio::io::split(conn);
    let guard = CloseGuard::new(v.clone());
    let up = async {
        let err = backend_to_virtual(rd, &v, buffer_size, &None).await;
        v.close_with_error(err.clone()).await;
        err
    };
    let down = async {
        let err = virtual_to_backend(wr, &v, buffer_size, &None).await;
        v.close_with_error(err.clone()).await;
        err
    };
    let (up, down) = tokio::join!(up, down);
    let err = up.or(down);
    guard.close(err.clone()).await;
    err
}
