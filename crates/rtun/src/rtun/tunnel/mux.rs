use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::FutureExt;
use rand::{RngExt, rng};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{oneshot, watch};

use crate::rtun::tunnel::TunnelError;
use crate::rtun::tunnel::frame::FrameCodec;
use crate::rtun::tunnel::hooks::{Dialer, RegisterHandler, RemoteDialer, Transform, TunnelObserver};
use crate::rtun::tunnel::model::{Dial, DialResponse};
use crate::rtun::tunnel::packet::{MessageType, Packet, decode_count, encode_count};
use crate::rtun::tunnel::relay;
use crate::rtun::tunnel::virtual_io::{DEFAULT_QUEUE_CAPACITY, VirtualIo};
use crate::rtun::tunnel::wait::{WaitError, WaitRegistry};
use crate::rtun::tunnel::writer::FrameWriter;

/// Result carried through the wait registry for a correlated response.
pub type Reply = Result<Bytes, TunnelError>;
type Opened = Result<(VirtualIo, Dial), TunnelError>;

type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Tunnel identity; a random key is generated when empty.
    pub key: String,
    pub codec: FrameCodec,
    pub wait_timeout: Duration,
    pub copy_buffer_size: usize,
    pub queue_capacity: usize,
    /// Skip the Register handshake.
    pub registered: bool,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            key: String::new(),
            codec: FrameCodec::default(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            registered: false,
        }
    }
}

struct Shared {
    key: ArcSwap<String>,
    opts: TunnelOptions,
    registered: AtomicBool,
    running: AtomicBool,
    writer: Arc<FrameWriter>,
    reader: tokio::sync::Mutex<Option<BufReader<BoxedRead>>>,
    virtuals: DashMap<String, VirtualIo>,
    waits: Arc<WaitRegistry<Reply>>,
    opens: WaitRegistry<Opened>,
    terminal: OnceLock<TunnelError>,
    closed_tx: watch::Sender<bool>,
    register: Option<Arc<dyn RegisterHandler>>,
    dialer: Arc<dyn Dialer>,
    observer: Option<Arc<dyn TunnelObserver>>,
    transform: Option<Arc<dyn Transform>>,
}

/// Multiplexes virtual streams over one physical connection.
///
/// Cheap to clone; all clones drive the same tunnel. `run` must be polled for
/// anything to be received.
#[derive(Clone)]
pub struct Tunnel {
    shared: Arc<Shared>,
}

pub struct TunnelBuilder {
    reader: BoxedRead,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    opts: TunnelOptions,
    register: Option<Arc<dyn RegisterHandler>>,
    dialer: Option<Arc<dyn Dialer>>,
    observer: Option<Arc<dyn TunnelObserver>>,
    transform: Option<Arc<dyn Transform>>,
}

impl TunnelBuilder {
    pub fn options(mut self, opts: TunnelOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.opts.key = key.into();
        self
    }

    pub fn registered(mut self, registered: bool) -> Self {
        self.opts.registered = registered;
        self
    }

    pub fn register_handler(mut self, h: Arc<dyn RegisterHandler>) -> Self {
        self.register = Some(h);
        self
    }

    pub fn dialer(mut self, d: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(d);
        self
    }

    pub fn observer(mut self, o: Arc<dyn TunnelObserver>) -> Self {
        self.observer = Some(o);
        self
    }

    pub fn transform(mut self, t: Arc<dyn Transform>) -> Self {
        self.transform = Some(t);
        self
    }

    pub fn build(self) -> Tunnel {
        let mut opts = self.opts;
        if opts.key.is_empty() {
            opts.key = random_key();
        }
        opts.copy_buffer_size = opts.copy_buffer_size.max(1);
        opts.queue_capacity = opts.queue_capacity.max(1);

        let (closed_tx, _) = watch::channel(false);
        metrics::gauge!("rtun_tunnels_active").increment(1.0);
        Tunnel {
            shared: Arc::new(Shared {
                key: ArcSwap::from_pointee(opts.key.clone()),
                registered: AtomicBool::new(opts.registered),
                running: AtomicBool::new(false),
                writer: Arc::new(FrameWriter::new(opts.codec, self.writer)),
                reader: tokio::sync::Mutex::new(Some(BufReader::new(self.reader))),
                virtuals: DashMap::new(),
                waits: Arc::new(WaitRegistry::new()),
                opens: WaitRegistry::new(),
                terminal: OnceLock::new(),
                closed_tx,
                register: self.register,
                dialer: self
                    .dialer
                    .unwrap_or_else(|| Arc::new(RemoteDialer::default())),
                observer: self.observer,
                transform: self.transform,
                opts,
            }),
        }
    }
}

/// What a handled request sends back, and what runs once the reply is out.
struct Handled {
    result: Reply,
    /// Reply even without NeedAck.
    always_reply: bool,
    after_reply: Option<oneshot::Sender<()>>,
}

impl Handled {
    fn reply(result: Reply) -> Self {
        Self {
            result,
            always_reply: false,
            after_reply: None,
        }
    }

    fn unknown_key() -> Self {
        Self {
            result: Err(TunnelError::RemoteClosed),
            always_reply: true,
            after_reply: None,
        }
    }
}

impl Tunnel {
    pub fn builder<S>(conn: S) -> TunnelBuilder
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(conn);
        TunnelBuilder {
            reader: Box::new(r),
            writer: Box::new(w),
            opts: TunnelOptions::default(),
            register: None,
            dialer: None,
            observer: None,
            transform: None,
        }
    }

    pub fn key(&self) -> String {
        self.shared.key.load().as_ref().clone()
    }

    pub fn set_key(&self, key: impl Into<String>) {
        self.shared.key.store(Arc::new(key.into()));
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.shared.opts
    }

    pub fn is_closed(&self) -> bool {
        self.shared.terminal.get().is_some()
    }

    /// Terminal error, once closed.
    pub fn error(&self) -> Option<TunnelError> {
        self.shared.terminal.get().cloned()
    }

    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    pub fn virtual_count(&self) -> usize {
        self.shared.virtuals.len()
    }

    pub fn get_virtual(&self, key: &str) -> Option<VirtualIo> {
        self.shared.virtuals.get(key).map(|v| v.value().clone())
    }

    pub fn ptr_eq(&self, other: &Tunnel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Runs the dispatch loop until the tunnel closes and returns the
    /// terminal error. A second caller waits for the first loop instead.
    pub async fn run(&self) -> TunnelError {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            self.closed().await;
            return self.terminal_or(TunnelError::Closed);
        }
        let reader = self.shared.reader.lock().await.take();
        let Some(mut reader) = reader else {
            return self.terminal_or(TunnelError::Closed);
        };

        let err = tokio::select! {
            err = self.read_loop(&mut reader) => err,
            _ = self.closed() => self.terminal_or(TunnelError::Closed),
        };
        drop(reader);
        self.close_with_error(Some(err.clone())).await;
        self.terminal_or(err)
    }

    fn terminal_or(&self, fallback: TunnelError) -> TunnelError {
        self.error().unwrap_or(fallback)
    }

    async fn read_loop(&self, r: &mut BufReader<BoxedRead>) -> TunnelError {
        let codec = self.shared.opts.codec;
        loop {
            let p = match codec.read_packet(r).await {
                Ok(p) => p,
                Err(err) => return err.into(),
            };
            metrics::counter!("rtun_frames_read_total").increment(1);
            tracing::trace!(packet = %p, "tunnel: received");

            if p.is_request() {
                self.handle_request(p).await;
            } else {
                self.handle_response(p).await;
            }
        }
    }

    async fn handle_request(&self, p: Packet) {
        let kind = p.message_type();
        let handled = if !self.is_registered() && kind != MessageType::Register {
            if !p.needs_ack() {
                tracing::warn!(tunnel = %self.key(), packet = %p, "tunnel: dropping request before registration");
            }
            Handled::reply(Err(TunnelError::NotRegistered))
        } else {
            match kind {
                MessageType::Register => Handled::reply(self.on_register_request(&p).await),
                MessageType::Open => self.on_open_request(&p).await,
                MessageType::Write => match self.get_virtual(&p.key) {
                    Some(v) => {
                        let n = p.data.len();
                        Handled::reply(v.feed(p.data.clone()).await.map(|_| encode_count(n)))
                    }
                    None => Handled::unknown_key(),
                },
                MessageType::Read => match self.get_virtual(&p.key) {
                    Some(v) => {
                        let max = decode_count(&p.data).unwrap_or(0) as usize;
                        Handled::reply(Ok(v.try_read(max).await))
                    }
                    None => Handled::unknown_key(),
                },
                MessageType::Close => {
                    if let Some((_, v)) = self.shared.virtuals.remove(&p.key) {
                        let err = TunnelError::from_remote(&p.text());
                        tracing::debug!(key = %p.key, err = %err, "tunnel: remote closed stream");
                        v.close_with_error(Some(err)).await;
                    }
                    Handled::reply(Ok(Bytes::new()))
                }
            }
        };

        if p.needs_ack() || (handled.always_reply && handled.result.is_err()) {
            let res = match handled.result {
                Ok(data) => p.new_response(true, data),
                Err(err) => p.new_response(false, err.to_string()),
            };
            if let Err(err) = self.shared.writer.write_packet(&res).await {
                tracing::debug!(tunnel = %self.key(), err = %err, "tunnel: failed to write response");
            }
        }
        if let Some(gate) = handled.after_reply {
            let _ = gate.send(());
        }
    }

    async fn on_register_request(&self, p: &Packet) -> Reply {
        let Some(h) = self.shared.register.clone() else {
            return Err(TunnelError::Rejected("registration is not accepted".into()));
        };
        match h.on_register(self, p).await {
            Ok(data) => {
                self.shared.registered.store(true, Ordering::Release);
                metrics::counter!("rtun_registrations_total", "result" => "accepted").increment(1);
                tracing::info!(tunnel = %self.key(), "tunnel: registered");
                Ok(data)
            }
            Err(err) => {
                metrics::counter!("rtun_registrations_total", "result" => "rejected").increment(1);
                tracing::warn!(tunnel = %self.key(), err = %err, "tunnel: registration rejected");
                Err(err)
            }
        }
    }

    async fn on_open_request(&self, p: &Packet) -> Handled {
        let dial: Dial = match serde_json::from_slice(&p.data) {
            Ok(d) => d,
            Err(err) => return Handled::reply(Err(err.into())),
        };
        let dialed = match self.shared.dialer.dial(&dial).await {
            Ok(d) => d,
            Err(err) => {
                tracing::debug!(key = %p.key, address = %dial.address, err = %err, "tunnel: dial failed");
                return Handled::reply(Err(err));
            }
        };
        if let Some(o) = &self.shared.observer {
            o.on_dialed(&dialed.dial, &dialed.key).await;
        }
        let body = DialResponse {
            key: dialed.key.clone(),
            dial: dialed.dial,
        };
        let body = match serde_json::to_vec(&body) {
            Ok(b) => Bytes::from(b),
            Err(err) => return Handled::reply(Err(err.into())),
        };

        let v = self.new_virtual(&dialed.key);
        let (gate_tx, gate_rx) = oneshot::channel();
        relay::spawn_pipe(
            v,
            dialed.conn,
            self.shared.opts.copy_buffer_size,
            self.shared.transform.clone(),
            Some(gate_rx.map(|_| ()).boxed()),
        );
        tracing::debug!(tunnel = %self.key(), key = %dialed.key, "tunnel: opened stream");
        Handled {
            result: Ok(body),
            always_reply: false,
            after_reply: Some(gate_tx),
        }
    }

    async fn handle_response(&self, p: Packet) {
        let result = if p.is_success() {
            Ok(p.data.clone())
        } else {
            Err(TunnelError::from_remote(&p.text()))
        };
        match p.message_type() {
            MessageType::Register => {
                if result.is_ok() {
                    self.shared.registered.store(true, Ordering::Release);
                    tracing::info!(tunnel = %self.key(), "tunnel: registered with server");
                }
                self.shared.waits.done(&p.key, result);
            }
            MessageType::Open => {
                let opened = match result {
                    Ok(data) => match serde_json::from_slice::<DialResponse>(&data) {
                        Ok(res) => Ok((self.new_virtual(&res.key), res.dial)),
                        Err(err) => Err(err.into()),
                    },
                    Err(err) => Err(err),
                };
                let orphan = opened.as_ref().ok().map(|(v, _)| v.clone());
                if !self.shared.opens.done(&p.key, opened) {
                    if let Some(v) = orphan {
                        tracing::debug!(key = %v.key(), "tunnel: open response arrived after timeout");
                        v.close().await;
                    }
                }
            }
            MessageType::Write => {
                if let Err(err) = &result {
                    if let Some((_, v)) = self.shared.virtuals.remove(&p.key) {
                        v.close_with_error(Some(err.clone())).await;
                    }
                }
                self.shared.waits.done(&format!("{}.write", p.key), result);
            }
            MessageType::Read => {
                self.shared.waits.done(&format!("{}.read", p.key), result);
            }
            MessageType::Close => {}
        }
    }

    /// Creates a virtual stream bound to `key`, replacing any previous one.
    fn new_virtual(&self, key: &str) -> VirtualIo {
        let weak = Arc::downgrade(&self.shared);
        let hook_key = key.to_string();
        let v = VirtualIo::builder(key, self.shared.writer.clone())
            .capacity(self.shared.opts.queue_capacity)
            .acks(self.shared.waits.clone(), self.shared.opts.wait_timeout)
            .on_close(Box::new(move |err| {
                async move {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    // Still mapped means the close started locally, so the peer must be told.
                    let owned = shared
                        .virtuals
                        .remove_if(&hook_key, |_, v| v.is_closed())
                        .is_some();
                    if !owned || shared.terminal.get().is_some() {
                        return;
                    }
                    let p = Packet::request(hook_key, MessageType::Close, false, err.wire_text());
                    if let Err(err) = shared.writer.write_packet(&p).await {
                        tracing::debug!(err = %err, "tunnel: failed to send close");
                    }
                }
                .boxed()
            }))
            .build();

        if let Some(old) = self.shared.virtuals.insert(key.to_string(), v.clone()) {
            tracing::debug!(key = %key, "tunnel: replacing stream with duplicate key");
            let old_v = old;
            tokio::spawn(async move { old_v.close().await });
        }
        if self.is_closed() {
            let v = v.clone();
            let err = self.terminal_or(TunnelError::Closed);
            tokio::spawn(async move { v.close_with_error(Some(err)).await });
        }
        v
    }

    /// Sends a Register request carrying `payload` and waits for the answer.
    pub async fn register(&self, payload: impl Into<Bytes>) -> Result<Bytes, TunnelError> {
        let key = self.key();
        let waiter = self.shared.waits.register(key.clone());
        let p = Packet::request(key, MessageType::Register, true, payload);
        self.shared.writer.write_packet(&p).await?;
        match waiter.wait(self.shared.opts.wait_timeout).await {
            Ok(reply) => reply,
            Err(err) => Err(self.wait_error(err, "register")),
        }
    }

    /// Asks the peer to dial `dial` and returns the local end of the new
    /// stream with the descriptor the peer actually used. The stream is bound
    /// to the key the peer answered with, which may differ from `key`.
    pub async fn dial(&self, key: Option<String>, dial: Dial) -> Result<(VirtualIo, Dial), TunnelError> {
        let key = key.filter(|k| !k.is_empty()).unwrap_or_else(random_key);
        let payload = serde_json::to_vec(&dial)?;
        let waiter = self.shared.opens.register(key.clone());
        let p = Packet::request(key, MessageType::Open, true, payload);
        self.shared.writer.write_packet(&p).await?;
        match waiter.wait(self.shared.opts.wait_timeout).await {
            Ok(opened) => opened,
            Err(err) => Err(self.wait_error(err, "open")),
        }
    }

    /// Pulls up to `max` bytes the peer has queued for `key`.
    pub async fn read_remote(&self, key: &str, max: u32) -> Result<Bytes, TunnelError> {
        let waiter = self.shared.waits.register(format!("{key}.read"));
        let p = Packet::request(key, MessageType::Read, true, encode_count(max as usize));
        self.shared.writer.write_packet(&p).await?;
        match waiter.wait(self.shared.opts.wait_timeout).await {
            Ok(reply) => reply,
            Err(err) => Err(self.wait_error(err, "read")),
        }
    }

    fn wait_error(&self, err: WaitError, op: &'static str) -> TunnelError {
        match err {
            WaitError::Timeout => TunnelError::Timeout(op),
            WaitError::Canceled => self.terminal_or(TunnelError::Closed),
        }
    }

    /// Tears the tunnel down. Only the first call has any effect.
    pub async fn close_with_error(&self, err: Option<TunnelError>) {
        let err = err.unwrap_or(TunnelError::Closed);
        if self.shared.terminal.set(err.clone()).is_err() {
            return;
        }
        self.shared.closed_tx.send_replace(true);

        let keys: Vec<String> = self
            .shared
            .virtuals
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, v)) = self.shared.virtuals.remove(&key) {
                v.close_with_error(Some(err.clone())).await;
            }
        }
        self.shared.waits.cancel_all();
        self.shared.opens.cancel_all();
        self.shared.writer.shutdown().await;
        if let Ok(mut r) = self.shared.reader.try_lock() {
            r.take();
        }

        metrics::gauge!("rtun_tunnels_active").decrement(1.0);
        if err.is_eof() {
            tracing::info!(tunnel = %self.key(), "tunnel: closed by peer");
        } else {
            tracing::info!(tunnel = %self.key(), err = %err, "tunnel: closed");
        }
        if let Some(o) = &self.shared.observer {
            o.on_closed(self, &err).await;
        }
    }

    pub async fn close(&self) {
        self.close_with_error(None).await;
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("key", &self.key())
            .field("registered", &self.is_registered())
            .field("virtuals", &self.virtual_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn random_key() -> String {
    format!("{:032x}", rng().random::<u128>())
}
