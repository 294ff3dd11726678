//! Outgoing clients, cached per peer.

use crate::client::HostClient;
use crate::errors::ConnectError;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use libp2p::PeerId;
use log::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

type PendingConnect = Shared<BoxFuture<'static, Result<HostClient, ConnectError>>>;

#[derive(Default)]
struct PoolState {
    clients: HashMap<PeerId, HostClient>,
    connecting: HashMap<PeerId, PendingConnect>,
}

/// A cache of established clients keyed by peer id. Cheap to clone.
///
/// [`ClientPool::ensure_client`] never runs two connects for the same peer at once: callers that arrive while one is
/// in flight wait for it and get its result, success or failure.
#[derive(Default, Clone)]
pub struct ClientPool {
    state: Arc<Mutex<PoolState>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live client. Never touches the network.
    pub fn get_client(&self, peer: &PeerId) -> Option<HostClient> {
        let state = self.state.lock();
        state.clients.get(peer).filter(|c| !c.is_closed()).cloned()
    }

    /// Return the cached client for `peer`, or establish one with `connect` and cache it.
    pub async fn ensure_client<F, Fut>(&self, peer: PeerId, connect: F) -> Result<HostClient, ConnectError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HostClient, ConnectError>> + Send + 'static,
    {
        let pending = {
            let mut state = self.state.lock();
            if let Some(client) = state.clients.get(&peer) {
                if !client.is_closed() {
                    return Ok(client.clone());
                }
                trace!("Dropping closed client for {peer}");
                state.clients.remove(&peer);
            }
            match state.connecting.get(&peer) {
                Some(pending) => {
                    trace!("Joining in-flight connect to {peer}");
                    pending.clone()
                }
                None => {
                    let pending = connect().boxed().shared();
                    state.connecting.insert(peer, pending.clone());
                    pending
                }
            }
        };
        let result = pending.clone().await;
        let mut state = self.state.lock();
        // Only the first waiter to get here settles the entry; later ones find it gone or replaced.
        if state.connecting.get(&peer).is_some_and(|p| p.ptr_eq(&pending)) {
            state.connecting.remove(&peer);
            if let Ok(client) = &result {
                state.clients.insert(peer, client.clone());
            }
        }
        result
    }

    /// Cache a client that was established elsewhere, replacing any earlier one.
    pub fn insert(&self, client: HostClient) -> Option<HostClient> {
        let peer = client.remote_peer();
        self.state.lock().clients.insert(peer, client)
    }

    pub fn remove(&self, peer: &PeerId) -> Option<HostClient> {
        self.state.lock().clients.remove(peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.state.lock().clients.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget every cached client.
    pub fn close_all(&self) {
        let clients: Vec<HostClient> = {
            let mut state = self.state.lock();
            state.clients.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            client.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::test::connected_client;
    use libp2p::identity::Keypair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn peer() -> PeerId {
        Keypair::generate_ed25519().public().to_peer_id()
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_connect() {
        let pool = ClientPool::new();
        let (client, _handlers) = connected_client().await;
        let target = client.remote_peer();
        let dials = Arc::new(AtomicUsize::new(0));
        let attempt = || {
            let dials = Arc::clone(&dials);
            let client = client.clone();
            move || async move {
                dials.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, ConnectError>(client)
            }
        };
        let (a, b, c) = tokio::join!(
            pool.ensure_client(target, attempt()),
            pool.ensure_client(target, attempt()),
            pool.ensure_client(target, attempt()),
        );
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        for res in [a, b, c] {
            assert_eq!(res.unwrap().remote_peer(), target);
        }
        assert_eq!(pool.peers(), vec![target]);
        assert!(pool.get_client(&target).is_some());
    }

    #[tokio::test]
    async fn failures_are_shared_and_not_cached() {
        let pool = ClientPool::new();
        let target = peer();
        let failing = move || async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<HostClient, _>(ConnectError::DialAllFailed { peer: target, attempts: 2 })
        };
        let (a, b) = tokio::join!(pool.ensure_client(target, failing), pool.ensure_client(target, failing));
        assert_eq!(a.unwrap_err(), ConnectError::DialAllFailed { peer: target, attempts: 2 });
        assert!(b.is_err());
        assert!(pool.is_empty());
        assert!(pool.get_client(&target).is_none());
    }

    #[tokio::test]
    async fn cached_clients_are_reused_until_closed() {
        let pool = ClientPool::new();
        let (client, _handlers) = connected_client().await;
        let target = client.remote_peer();
        assert!(pool.insert(client.clone()).is_none());
        let reused = pool
            .ensure_client(target, || async { Err::<HostClient, _>(ConnectError::Cancelled) })
            .await
            .expect("cached client should be returned without connecting");
        assert_eq!(reused.remote_peer(), target);

        client.close();
        assert!(pool.get_client(&target).is_none());
        let err =
            pool.ensure_client(target, || async { Err::<HostClient, _>(ConnectError::Cancelled) }).await.unwrap_err();
        assert_eq!(err, ConnectError::Cancelled);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn close_all_empties_the_pool() {
        let pool = ClientPool::new();
        let (client, _handlers) = connected_client().await;
        pool.insert(client.clone());
        pool.close_all();
        assert!(pool.is_empty());
        assert!(client.is_closed());
    }
}
