use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::rtun::tunnel::model::Listen;
use crate::rtun::tunnel::mux::Tunnel;

#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub key: String,
    pub remote: String,
    pub listen: Option<Listen>,
    pub virtuals: usize,
    pub uptime_secs: u64,
}

/// Resolves once the listener exposed for a client has been dropped.
#[derive(Debug, Clone)]
pub struct ListenerRelease(watch::Receiver<()>);

impl ListenerRelease {
    /// The listener owner keeps the sender and drops it with the listener.
    pub fn channel() -> (watch::Sender<()>, Self) {
        let (tx, rx) = watch::channel(());
        (tx, Self(rx))
    }

    pub async fn wait(mut self) {
        while self.0.changed().await.is_ok() {}
    }
}

struct ClientConn {
    tunnel: Tunnel,
    remote: String,
    listen: Option<Listen>,
    release: Option<ListenerRelease>,
    started: Instant,
}

/// Registered tunnel clients, keyed by tunnel key.
#[derive(Default)]
pub struct Manager {
    clients: DashMap<String, ClientConn>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `tunnel` under `key` and returns the tunnel it replaced, if
    /// that was a different one.
    pub fn register_client(
        &self,
        key: &str,
        tunnel: Tunnel,
        remote: String,
        listen: Option<Listen>,
        release: Option<ListenerRelease>,
    ) -> Option<Tunnel> {
        let old = self.clients.insert(
            key.to_string(),
            ClientConn {
                tunnel: tunnel.clone(),
                remote,
                listen,
                release,
                started: Instant::now(),
            },
        );
        old.map(|c| c.tunnel).filter(|t| !t.ptr_eq(&tunnel))
    }

    /// Removes whatever other tunnel holds `key`, handing back its listener
    /// release so the caller can reuse the port.
    pub fn evict(&self, key: &str, keep: &Tunnel) -> Option<(Tunnel, Option<ListenerRelease>)> {
        self.clients
            .remove_if(key, |_, c| !c.tunnel.ptr_eq(keep))
            .map(|(_, c)| (c.tunnel, c.release))
    }

    /// Removes `key` only while it still maps to `tunnel`.
    pub fn unregister_client(&self, key: &str, tunnel: &Tunnel) -> bool {
        self.clients
            .remove_if(key, |_, c| c.tunnel.ptr_eq(tunnel))
            .is_some()
    }

    pub fn get(&self, key: &str) -> Option<Tunnel> {
        self.clients.get(key).map(|c| c.tunnel.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ClientSnapshot> {
        let mut out: Vec<ClientSnapshot> = self
            .clients
            .iter()
            .map(|e| ClientSnapshot {
                key: e.key().clone(),
                remote: e.remote.clone(),
                listen: e.listen.clone(),
                virtuals: e.tunnel.virtual_count(),
                uptime_secs: e.started.elapsed().as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel() -> Tunnel {
        let (a, _b) = tokio::io::duplex(64);
        Tunnel::builder(a).build()
    }

    #[tokio::test]
    async fn replacing_a_key_returns_the_previous_tunnel() {
        let m = Manager::new();
        let t1 = tunnel();
        let t2 = tunnel();

        assert!(m.register_client("c", t1.clone(), "1.1.1.1:1".into(), None, None).is_none());
        let old = m
            .register_client("c", t2.clone(), "2.2.2.2:2".into(), Some(Listen::tcp(9000)), None)
            .unwrap();
        assert!(old.ptr_eq(&t1));

        // The stale tunnel's cleanup must not evict its replacement.
        assert!(!m.unregister_client("c", &t1));
        assert!(m.get("c").unwrap().ptr_eq(&t2));

        let snap = m.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].remote, "2.2.2.2:2");
        assert_eq!(snap[0].listen.as_ref().map(|l| l.port), Some(9000));

        assert!(m.unregister_client("c", &t2));
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn re_registering_same_tunnel_is_not_a_replacement() {
        let m = Manager::new();
        let t = tunnel();
        m.register_client("c", t.clone(), String::new(), None, None);
        assert!(m.register_client("c", t.clone(), String::new(), None, None).is_none());
        assert_eq!(m.len(), 1);
    }

    #[tokio::test]
    async fn evict_hands_back_listener_release() {
        let m = Manager::new();
        let old = tunnel();
        let new = tunnel();
        let (tx, release) = ListenerRelease::channel();
        m.register_client("c", old.clone(), String::new(), Some(Listen::tcp(9000)), Some(release));

        assert!(m.evict("c", &old).is_none());
        let (evicted, release) = m.evict("c", &new).unwrap();
        assert!(evicted.ptr_eq(&old));
        assert!(m.is_empty());

        let waiting = tokio::spawn(release.unwrap().wait());
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap();
    }
}
