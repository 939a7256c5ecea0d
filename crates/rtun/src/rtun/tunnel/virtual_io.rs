use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use crate::rtun::tunnel::TunnelError;
use crate::rtun::tunnel::mux::Reply;
use crate::rtun::tunnel::packet::{MessageType, Packet, decode_count};
use crate::rtun::tunnel::wait::{WaitError, WaitRegistry};
use crate::rtun::tunnel::writer::FrameWriter;

pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// Wraps outgoing bytes into the packet written to the tunnel.
pub type WrapFn = Arc<dyn Fn(&str, Bytes) -> Packet + Send + Sync>;
/// Runs once on the first close with the recorded error.
pub type CloseHook = Box<dyn FnOnce(TunnelError) -> BoxFuture<'static, ()> + Send>;

struct ReadState {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

struct Acks {
    waits: Arc<WaitRegistry<Reply>>,
    timeout: Duration,
}

struct Inner {
    key: String,
    sink: Arc<FrameWriter>,
    wrap: Option<WrapFn>,
    acks: Option<Acks>,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    read: tokio::sync::Mutex<ReadState>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    error: OnceLock<TunnelError>,
    on_close: Mutex<Option<CloseHook>>,
}

/// One logical byte stream multiplexed over a tunnel.
///
/// Inbound bytes are queued by the dispatch loop via `feed`; outbound bytes
/// are written straight to the tunnel as Write packets. Cheap to clone.
#[derive(Clone)]
pub struct VirtualIo {
    inner: Arc<Inner>,
}

pub struct VirtualIoBuilder {
    key: String,
    sink: Arc<FrameWriter>,
    capacity: usize,
    wrap: Option<WrapFn>,
    acks: Option<Acks>,
    on_close: Option<CloseHook>,
}

impl VirtualIoBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn wrap(mut self, wrap: WrapFn) -> Self {
        self.wrap = Some(wrap);
        self
    }

    pub fn acks(mut self, waits: Arc<WaitRegistry<Reply>>, timeout: Duration) -> Self {
        self.acks = Some(Acks { waits, timeout });
        self
    }

    pub fn on_close(mut self, hook: CloseHook) -> Self {
        self.on_close = Some(hook);
        self
    }

    pub fn build(self) -> VirtualIo {
        let (tx, rx) = mpsc::channel(self.capacity);
        let (closed_tx, _) = watch::channel(false);
        metrics::gauge!("rtun_virtual_active").increment(1.0);
        VirtualIo {
            inner: Arc::new(Inner {
                key: self.key,
                sink: self.sink,
                wrap: self.wrap,
                acks: self.acks,
                tx: Mutex::new(Some(tx)),
                read: tokio::sync::Mutex::new(ReadState {
                    rx,
                    pending: Bytes::new(),
                }),
                closed: AtomicBool::new(false),
                closed_tx,
                error: OnceLock::new(),
                on_close: Mutex::new(self.on_close),
            }),
        }
    }
}

impl VirtualIo {
    pub fn builder(key: impl Into<String>, sink: Arc<FrameWriter>) -> VirtualIoBuilder {
        VirtualIoBuilder {
            key: key.into(),
            sink,
            capacity: DEFAULT_QUEUE_CAPACITY,
            wrap: None,
            acks: None,
            on_close: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn ptr_eq(&self, other: &VirtualIo) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Error recorded by the first close, if closed.
    pub fn error(&self) -> Option<TunnelError> {
        self.inner.error.get().cloned()
    }

    /// Resolves once the stream is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    /// Reads queued bytes into `buf`.
    ///
    /// After close, queued bytes are still returned; then `Ok(0)` for a clean
    /// end of stream or the recorded error otherwise.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut st = self.inner.read.lock().await;
        // Empty chunks (zero-length Write packets) are skipped, never reported as end of stream.
        while st.pending.is_empty() {
            let next = tokio::select! {
                biased;
                v = st.rx.recv() => v,
                _ = self.closed() => st.rx.try_recv().ok(),
            };
            match next {
                Some(b) => st.pending = b,
                None => return self.end_of_stream(),
            }
        }
        let n = buf.len().min(st.pending.len());
        buf[..n].copy_from_slice(&st.pending[..n]);
        let _ = st.pending.split_to(n);
        Ok(n)
    }

    /// Takes up to `max` already-queued bytes without waiting.
    pub async fn try_read(&self, max: usize) -> Bytes {
        let mut st = self.inner.read.lock().await;
        while st.pending.is_empty() {
            match st.rx.try_recv() {
                Ok(b) => st.pending = b,
                Err(_) => return Bytes::new(),
            }
        }
        let n = max.min(st.pending.len());
        st.pending.split_to(n)
    }

    fn end_of_stream(&self) -> Result<usize, TunnelError> {
        match self.inner.error.get() {
            None | Some(TunnelError::Eof) => Ok(0),
            Some(e) => Err(e.clone()),
        }
    }

    fn write_error(&self) -> TunnelError {
        match self.inner.error.get() {
            Some(e) if !e.is_eof() => e.clone(),
            _ => TunnelError::Closed,
        }
    }

    fn wrap(&self, data: Bytes, need_ack: bool) -> Packet {
        match &self.inner.wrap {
            Some(wrap) => wrap(&self.inner.key, data),
            None => Packet::request(self.inner.key.clone(), MessageType::Write, need_ack, data),
        }
    }

    /// Sends `data` to the peer as one Write packet.
    pub async fn write(&self, data: &[u8]) -> Result<usize, TunnelError> {
        if self.is_closed() {
            return Err(self.write_error());
        }
        let p = self.wrap(Bytes::copy_from_slice(data), false);
        self.inner.sink.write_packet(&p).await?;
        Ok(data.len())
    }

    /// Like `write`, but waits for the peer to confirm how many bytes it queued.
    pub async fn write_acked(&self, data: &[u8]) -> Result<usize, TunnelError> {
        if self.is_closed() {
            return Err(self.write_error());
        }
        let Some(acks) = &self.inner.acks else {
            return self.write(data).await;
        };
        let waiter = acks.waits.register(format!("{}.write", self.inner.key));
        let mut p = self.wrap(Bytes::copy_from_slice(data), true);
        p.control.need_ack = true;
        self.inner.sink.write_packet(&p).await?;
        let data = match waiter.wait(acks.timeout).await {
            Ok(reply) => reply?,
            Err(WaitError::Timeout) => return Err(TunnelError::Timeout("write")),
            Err(WaitError::Canceled) => return Err(self.write_error()),
        };
        decode_count(&data)
            .map(|n| n as usize)
            .ok_or_else(|| TunnelError::Payload("short write count".into()))
    }

    /// Queues inbound bytes, waiting for room while the stream stays open.
    pub async fn feed(&self, data: Bytes) -> Result<(), TunnelError> {
        let tx = self
            .inner
            .tx
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or(TunnelError::Closed)?;
        tokio::select! {
            r = tx.send(data) => r.map_err(|_| TunnelError::Closed),
            _ = self.closed() => Err(TunnelError::Closed),
        }
    }

    /// Closes the stream. Only the first call has any effect; `None` records
    /// a clean end of stream.
    ///
    /// The stream is marked closed before the close hook runs. The tunnel's
    /// hook relies on that order: it only treats a close as local (and tells
    /// the peer) when the map entry it removes is already closed.
    pub async fn close_with_error(&self, err: Option<TunnelError>) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let err = err.unwrap_or(TunnelError::Eof);
        let _ = self.inner.error.set(err.clone());
        if let Ok(mut tx) = self.inner.tx.lock() {
            tx.take();
        }
        self.inner.closed_tx.send_replace(true);
        metrics::gauge!("rtun_virtual_active").decrement(1.0);

        let hook = self.inner.on_close.lock().ok().and_then(|mut h| h.take());
        if let Some(hook) = hook {
            hook(err).await;
        }
    }

    pub async fn close(&self) {
        self.close_with_error(None).await;
    }
}

impl std::fmt::Debug for VirtualIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualIo")
            .field("key", &self.inner.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}
