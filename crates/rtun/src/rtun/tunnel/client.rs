use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;

use crate::rtun::net::normalize_dial_addr;
use crate::rtun::tunnel::hooks::{Dialer, FixedDialer, RemoteDialer};
use crate::rtun::tunnel::model::{Dial, Listen, RegisterRequest};
use crate::rtun::tunnel::mux::{Tunnel, TunnelOptions};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    /// Tunnel key; the connection's local address when empty.
    pub key: String,
    pub username: String,
    pub password: String,
    /// Port the server should expose for us.
    pub listen: Option<Listen>,
    /// Backend every Open is sent to. When unset, the server's descriptor is dialed.
    pub backend: Option<Dial>,
    pub dial_timeout: Duration,
    pub tunnel: TunnelOptions,
}

pub struct Client {
    opts: ClientOptions,
    dialer: Arc<dyn Dialer>,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(5);
        }
        if opts.key.contains('#') {
            anyhow::bail!("tunnel: client key must not contain '#'");
        }
        let remote = RemoteDialer {
            default_timeout: opts.dial_timeout,
        };
        let dialer: Arc<dyn Dialer> = match &opts.backend {
            Some(target) => Arc::new(FixedDialer {
                target: target.clone(),
                inner: remote,
            }),
            None => Arc::new(remote),
        };
        Ok(Self { opts, dialer })
    }

    /// Keeps one registered tunnel alive until shutdown, reconnecting with
    /// exponential backoff.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        err = %format!("{err:#}"),
                        backoff = %humantime::format_duration(backoff),
                        "tunnel: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                r = shutdown.changed() => {
                    if r.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    /// Connects, registers and serves one tunnel. `Ok` only on shutdown.
    pub async fn run_once(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = normalize_dial_addr(&self.opts.server_addr).into_owned();
        let conn = tokio::time::timeout(self.opts.dial_timeout, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("tunnel: dial {addr}: timed out"))?
            .with_context(|| format!("tunnel: dial {addr}"))?;
        let _ = conn.set_nodelay(true);
        let key = if self.opts.key.trim().is_empty() {
            conn.local_addr()?.to_string()
        } else {
            self.opts.key.trim().to_string()
        };

        let mut topts = self.opts.tunnel.clone();
        topts.key = key.clone();
        let tunnel = Tunnel::builder(conn)
            .options(topts)
            .dialer(self.dialer.clone())
            .build();
        let mut runner = tokio::spawn({
            let t = tunnel.clone();
            async move { t.run().await }
        });
        tracing::info!(server = %addr, key = %key, "tunnel: connected");

        let req = RegisterRequest {
            listen: self.opts.listen.clone(),
            key: Some(key.clone()),
            username: Some(self.opts.username.clone()).filter(|s| !s.is_empty()),
            password: Some(self.opts.password.clone()).filter(|s| !s.is_empty()),
            params: None,
        };
        let granted = match self.register(&tunnel, &req).await {
            Ok(l) => l,
            Err(err) => {
                tunnel.close().await;
                return Err(err);
            }
        };
        match &granted {
            Some(l) => tracing::info!(key = %key, port = l.port, "tunnel: registered; server exposes port"),
            None => tracing::info!(key = %key, "tunnel: registered"),
        }

        loop {
            tokio::select! {
                r = shutdown.changed() => {
                    if r.is_err() || *shutdown.borrow() {
                        tunnel.close().await;
                        return Ok(());
                    }
                }
                res = &mut runner => {
                    let err = res.context("tunnel: run loop panicked")?;
                    anyhow::bail!("tunnel: closed: {err}");
                }
            }
        }
    }

    async fn register(&self, tunnel: &Tunnel, req: &RegisterRequest) -> anyhow::Result<Option<Listen>> {
        let payload = serde_json::to_vec(req)?;
        let res = tunnel
            .register(payload)
            .await
            .context("tunnel: register")?;
        let granted: Option<Listen> =
            serde_json::from_slice(&res).context("tunnel: decode register response")?;
        Ok(granted)
    }
}
