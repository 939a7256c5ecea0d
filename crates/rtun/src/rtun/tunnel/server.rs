use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};

use crate::rtun::net::{listen_port_addr, normalize_bind_addr};
use crate::rtun::tunnel::TunnelError;
use crate::rtun::tunnel::hooks::RegisterHandler;
use crate::rtun::tunnel::manager::{ListenerRelease, Manager};
use crate::rtun::tunnel::model::{Dial, Listen, RegisterRequest};
use crate::rtun::tunnel::mux::{Tunnel, TunnelOptions};
use crate::rtun::tunnel::packet::Packet;
use crate::rtun::tunnel::relay;

/// Checks the credentials carried by a Register request.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, req: &RegisterRequest) -> Result<(), TunnelError>;
}

/// Accepts everything when both fields are empty.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    pub username: String,
    pub password: String,
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, req: &RegisterRequest) -> Result<(), TunnelError> {
        if self.username.is_empty() && self.password.is_empty() {
            return Ok(());
        }
        let user = req.username.as_deref().unwrap_or_default();
        let pass = req.password.as_deref().unwrap_or_default();
        if user == self.username && pass == self.password {
            Ok(())
        } else {
            Err(TunnelError::Rejected("incorrect credentials".into()))
        }
    }
}

#[derive(Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub auth: Arc<dyn Authenticator>,
    /// Sent with every Open; an empty address lets the client pick its backend.
    pub dial: Dial,
    pub tunnel: TunnelOptions,
    pub manager: Arc<Manager>,
}

pub struct Server {
    opts: ServerOptions,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        Self { opts }
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = normalize_bind_addr(&self.opts.listen_addr).into_owned();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("tunnel: bind {addr}"))
    }

    pub async fn listen_and_serve(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let ln = self.bind().await?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: TcpListener,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(addr = %ln.local_addr()?, "tunnel: listening");

        loop {
            tokio::select! {
                r = shutdown.changed() => {
                    if r.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "tunnel: accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let opts = self.opts.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_conn(opts, conn, peer.to_string(), shutdown).await;
                    });
                }
            }
        }
        Ok(())
    }
}

async fn handle_conn(
    opts: ServerOptions,
    conn: TcpStream,
    remote: String,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let _ = conn.set_nodelay(true);
    let mut topts = opts.tunnel.clone();
    topts.key = remote.clone();
    topts.registered = false;

    let registrar = Registrar {
        auth: opts.auth.clone(),
        dial: opts.dial.clone(),
        manager: opts.manager.clone(),
        remote: remote.clone(),
    };
    let tunnel = Tunnel::builder(conn)
        .options(topts)
        .register_handler(Arc::new(registrar))
        .build();
    tracing::info!(client = %remote, "tunnel: client connected");

    let err = tokio::select! {
        err = tunnel.run() => err,
        true = stopped(&mut shutdown) => {
            tunnel.close().await;
            tunnel.run().await
        }
    };

    opts.manager.unregister_client(&tunnel.key(), &tunnel);
    if err.is_eof() {
        tracing::info!(client = %remote, key = %tunnel.key(), "tunnel: client disconnected");
    } else {
        tracing::warn!(client = %remote, key = %tunnel.key(), err = %err, "tunnel: client dropped");
    }
}

async fn stopped(shutdown: &mut tokio::sync::watch::Receiver<bool>) -> bool {
    shutdown.wait_for(|v| *v).await.is_ok()
}

struct Registrar {
    auth: Arc<dyn Authenticator>,
    dial: Dial,
    manager: Arc<Manager>,
    remote: String,
}

#[async_trait]
impl RegisterHandler for Registrar {
    async fn on_register(&self, tunnel: &Tunnel, p: &Packet) -> Result<Bytes, TunnelError> {
        let req: RegisterRequest = serde_json::from_slice(&p.data)?;
        self.auth.authenticate(&req)?;

        let key = match req.key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            Some(k) if k.contains('#') => {
                return Err(TunnelError::Rejected(format!("invalid key {k:?}")));
            }
            Some(k) => k.to_string(),
            None => tunnel.key(),
        };

        // The previous holder of the key must give up its port before we bind.
        if let Some((old, release)) = self.manager.evict(&key, tunnel) {
            tracing::info!(key = %key, "tunnel: replacing previous client");
            old.close_with_error(Some(replaced())).await;
            if let Some(release) = release {
                let wait = tunnel.options().wait_timeout;
                if tokio::time::timeout(wait, release.wait()).await.is_err() {
                    tracing::warn!(key = %key, "tunnel: previous listener still open");
                }
            }
        }

        let (listen, release) = match req.listen {
            Some(l) => {
                let (l, release) = self.expose(tunnel, l).await?;
                (Some(l), Some(release))
            }
            None => (None, None),
        };

        tunnel.set_key(key.clone());
        if let Some(old) = self.manager.register_client(
            &key,
            tunnel.clone(),
            self.remote.clone(),
            listen.clone(),
            release,
        ) {
            tracing::info!(key = %key, "tunnel: replacing concurrent client");
            tokio::spawn(async move { old.close_with_error(Some(replaced())).await });
        }
        tracing::info!(
            key = %key,
            client = %self.remote,
            port = listen.as_ref().map(|l| l.port),
            "tunnel: client registered"
        );
        Ok(Bytes::from(serde_json::to_vec(&listen)?))
    }
}

fn replaced() -> TunnelError {
    TunnelError::Rejected("replaced by a newer registration".into())
}

impl Registrar {
    /// Opens the requested port and starts forwarding its connections
    /// through `tunnel`. Returns the descriptor actually bound.
    async fn expose(
        &self,
        tunnel: &Tunnel,
        listen: Listen,
    ) -> Result<(Listen, ListenerRelease), TunnelError> {
        let kind = listen.normalized_kind();
        if kind != "tcp" {
            return Err(TunnelError::Rejected(format!(
                "unsupported listen kind {:?}",
                listen.kind
            )));
        }
        let ln = TcpListener::bind(listen_port_addr(listen.port))
            .await
            .map_err(|e| TunnelError::Io(format!("listen on port {}: {e}", listen.port)))?;
        let port = ln.local_addr()?.port();

        let (released, release) = ListenerRelease::channel();
        let t = tunnel.clone();
        let dial = self.dial.clone();
        tokio::spawn(async move {
            forward_accepted(t, ln, dial).await;
            drop(released);
        });

        Ok((
            Listen {
                kind,
                port,
                params: listen.params,
            },
            release,
        ))
    }
}

/// Carries every connection accepted on `ln` through `tunnel` until the
/// tunnel closes.
async fn forward_accepted(tunnel: Tunnel, ln: TcpListener, dial: Dial) {
    let port = ln.local_addr().map(|a| a.port()).unwrap_or_default();
    tracing::info!(key = %tunnel.key(), port, "tunnel: exposing port");
    let buffer_size = tunnel.options().copy_buffer_size;

    loop {
        let (conn, peer) = tokio::select! {
            _ = tunnel.closed() => break,
            res = ln.accept() => match res {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(port, err = %err, "tunnel: accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let _ = conn.set_nodelay(true);
        let t = tunnel.clone();
        let dial = dial.clone();
        tokio::spawn(async move {
            match t.dial(Some(peer.to_string()), dial).await {
                Ok((v, _)) => {
                    if let Some(err) = relay::swap(v, conn, buffer_size).await {
                        tracing::debug!(peer = %peer, err = %err, "tunnel: proxied connection ended");
                    }
                }
                Err(err) => {
                    tracing::debug!(peer = %peer, err = %err, "tunnel: open failed");
                }
            }
        });
    }
    tracing::info!(port, "tunnel: stopped exposing port");
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn creds(user: &str, pass: &str) -> RegisterRequest {
        RegisterRequest {
            username: Some(user.into()),
            password: Some(pass.into()),
            ..Default::default()
        }
    }

    #[test]
    fn static_credentials_check() {
        let open = StaticCredentials::default();
        assert!(open.authenticate(&RegisterRequest::default()).is_ok());

        let c = StaticCredentials {
            username: "u".into(),
            password: "p".into(),
        };
        assert!(c.authenticate(&creds("u", "p")).is_ok());
        let err = c.authenticate(&creds("u", "x")).unwrap_err();
        assert_eq!(err.to_string(), "incorrect credentials");
        assert!(c.authenticate(&RegisterRequest::default()).is_err());
    }

    async fn echo_backend() -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut c, _)) = ln.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = c.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn start_server(
        auth: StaticCredentials,
    ) -> (String, Arc<Manager>, tokio::sync::watch::Sender<bool>) {
        let manager = Arc::new(Manager::new());
        let server = Server::new(ServerOptions {
            listen_addr: "127.0.0.1:0".into(),
            auth: Arc::new(auth),
            dial: Dial::default(),
            tunnel: TunnelOptions::default(),
            manager: manager.clone(),
        });
        let ln = server.bind().await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move { server.serve(ln, rx).await });
        (addr, manager, tx)
    }

    #[tokio::test]
    async fn exposed_port_reaches_client_backend() {
        let backend = echo_backend().await;
        let (addr, manager, _stop) = start_server(StaticCredentials {
            username: "u".into(),
            password: "p".into(),
        })
        .await;

        let conn = TcpStream::connect(&addr).await.unwrap();
        let client = Tunnel::builder(conn)
            .key("edge-1")
            .dialer(Arc::new(crate::rtun::tunnel::FixedDialer::new(Dial::tcp(
                backend,
            ))))
            .build();
        tokio::spawn({
            let c = client.clone();
            async move { c.run().await }
        });

        let req = RegisterRequest {
            listen: Some(Listen::tcp(0)),
            key: Some("edge-1".into()),
            ..creds("u", "p")
        };
        let res = client
            .register(serde_json::to_vec(&req).unwrap())
            .await
            .unwrap();
        let listen: Option<Listen> = serde_json::from_slice(&res).unwrap();
        let port = listen.unwrap().port;
        assert_ne!(port, 0);
        assert!(manager.get("edge-1").is_some());

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        user.write_all(b"through the tunnel").await.unwrap();
        let mut buf = [0u8; 18];
        tokio::time::timeout(Duration::from_secs(5), user.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"through the tunnel");

        client.close().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.get("edge-1").is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn connect_client(addr: &str) -> Tunnel {
        let conn = TcpStream::connect(addr).await.unwrap();
        let client = Tunnel::builder(conn).build();
        tokio::spawn({
            let c = client.clone();
            async move { c.run().await }
        });
        client
    }

    #[tokio::test]
    async fn reregistering_a_key_takes_over_its_port() {
        let (addr, manager, _stop) = start_server(StaticCredentials::default()).await;
        let port = {
            let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
            spare.local_addr().unwrap().port()
        };
        let req = serde_json::to_vec(&RegisterRequest {
            listen: Some(Listen::tcp(port)),
            key: Some("edge".into()),
            ..Default::default()
        })
        .unwrap();

        let first = connect_client(&addr).await;
        let res = first.register(req.clone()).await.unwrap();
        let granted: Option<Listen> = serde_json::from_slice(&res).unwrap();
        assert_eq!(granted.map(|l| l.port), Some(port));

        // The first tunnel is still up when its successor asks for the same port.
        let second = connect_client(&addr).await;
        let res = second.register(req).await.unwrap();
        let granted: Option<Listen> = serde_json::from_slice(&res).unwrap();
        assert_eq!(granted.map(|l| l.port), Some(port));

        tokio::time::timeout(Duration::from_secs(5), first.closed())
            .await
            .unwrap();
        let snap = manager.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].key, "edge");
        assert_eq!(snap[0].listen.as_ref().map(|l| l.port), Some(port));
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn failed_expose_registers_nothing() {
        let (addr, manager, _stop) = start_server(StaticCredentials::default()).await;
        let busy = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = busy.local_addr().unwrap().port();

        let client = connect_client(&addr).await;
        let req = RegisterRequest {
            listen: Some(Listen::tcp(port)),
            key: Some("edge".into()),
            ..Default::default()
        };
        let err = client
            .register(serde_json::to_vec(&req).unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("listen on port"));
        assert!(manager.get("edge").is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (addr, manager, _stop) = start_server(StaticCredentials {
            username: "u".into(),
            password: "p".into(),
        })
        .await;

        let conn = TcpStream::connect(&addr).await.unwrap();
        let client = Tunnel::builder(conn).build();
        tokio::spawn({
            let c = client.clone();
            async move { c.run().await }
        });
        let err = client
            .register(serde_json::to_vec(&creds("u", "nope")).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "incorrect credentials");
        assert!(!client.is_registered());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn unsupported_listen_kind_fails_registration() {
        let (addr, _manager, _stop) = start_server(StaticCredentials::default()).await;
        let conn = TcpStream::connect(&addr).await.unwrap();
        let client = Tunnel::builder(conn).build();
        tokio::spawn({
            let c = client.clone();
            async move { c.run().await }
        });
        let req = RegisterRequest {
            listen: Some(Listen {
                kind: "udp".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = client
            .register(serde_json::to_vec(&req).unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported listen kind"));
    }
}
