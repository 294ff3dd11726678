use crate::client::HostClient;
use crate::config::HostConfig;
use crate::errors::{ConnectError, HostError, SendError};
use crate::feedback::{spawn_snapshot_task, FeedbackCollector};
use crate::identity::{HostIdentity, PeerInfo};
use crate::pool::ClientPool;
use crate::race::race_connect;
use crate::rpc::DispatchTable;
use crate::score::Scorer;
use crate::server::{serve, ServeOptions};
use crate::services::{AddrService, HandlerMap, MessageHandler, MsgService, ADDR_SERVICE, MSG_SERVICE};
use crate::transport::{multiaddr_to_socket_addr, reachable_addrs, strip_peer_id, TcpDialer};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use log::*;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A p2p host: serves the identity and message surfaces to inbound peers, and connects to and messages remote peers
/// while keeping score of how well each one answers.
///
/// `Host` is cheap to clone. Clones share the listener, the client pool and the feedback table. The usual pattern is
/// to spawn [`Host::accept`] on one clone and use another to talk to peers.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

struct HostInner {
    config: HostConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    handlers: HandlerMap,
    pool: ClientPool,
    feedback: FeedbackCollector,
    dialer: Arc<TcpDialer>,
    shutdown: CancellationToken,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HostInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Host {
    /// Binds the listen address and starts the snapshot task. Nothing is served until [`Host::accept`] is called.
    pub async fn bind(config: HostConfig) -> Result<Self, HostError> {
        config.validate()?;
        let addr = multiaddr_to_socket_addr(&config.listen_addr)
            .ok_or_else(|| HostError::UnsupportedAddress(config.listen_addr.to_string()))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HostError::Bind { addr: config.listen_addr.to_string(), source })?;
        let local_addr =
            listener.local_addr().map_err(|source| HostError::Bind { addr: config.listen_addr.to_string(), source })?;
        if let Some(endpoint) = config.profiling_endpoint {
            info!("A profiling endpoint was requested on {endpoint}. Profiling is not served by this host.");
        }
        let feedback = FeedbackCollector::new(Scorer::from(config.score_weights));
        let shutdown = CancellationToken::new();
        let snapshot_task = spawn_snapshot_task(
            feedback.clone(),
            config.snapshot_path.clone(),
            config.snapshot_interval,
            shutdown.child_token(),
        );
        info!("Host {} listening on {local_addr}", config.identity);
        let inner = HostInner {
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            handlers: HandlerMap::default(),
            pool: ClientPool::new(),
            feedback,
            dialer: Arc::new(TcpDialer),
            shutdown,
            snapshot_task: Mutex::new(Some(snapshot_task)),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.inner.config.identity
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.config.identity.peer_id()
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The addresses other peers can reach this host on.
    ///
    /// A host bound to a wildcard address advertises each non-loopback interface address with the bound port. Configured
    /// announce addresses follow.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let bound = reachable_addrs(self.inner.local_addr);
        bound.into_iter().chain(self.inner.config.announce_addrs.iter().cloned()).collect()
    }

    /// What this host tells peers about itself.
    pub fn local_info(&self) -> PeerInfo {
        PeerInfo::new(self.identity(), self.addrs())
    }

    /// Registers `handler` for incoming messages with `msg_id`. Returns `true` if it replaced an earlier handler.
    pub fn register_handler<H: MessageHandler>(&self, msg_id: i32, handler: H) -> bool {
        self.inner.handlers.register(msg_id, handler)
    }

    pub fn handlers(&self) -> &HandlerMap {
        &self.inner.handlers
    }

    pub fn feedback(&self) -> &FeedbackCollector {
        &self.inner.feedback
    }

    pub fn pool(&self) -> &ClientPool {
        &self.inner.pool
    }

    /// Serves inbound connections until [`Host::shutdown`] is called.
    ///
    /// Only one accept loop can run per host; a second call fails with [`HostError::AlreadyAccepting`].
    pub async fn accept(&self) -> Result<(), HostError> {
        let listener = self.inner.listener.lock().take().ok_or(HostError::AlreadyAccepting)?;
        let mut dispatch = DispatchTable::new();
        dispatch.register(ADDR_SERVICE, AddrService { info: self.local_info() })?;
        dispatch.register(MSG_SERVICE, MsgService { handlers: self.inner.handlers.clone() })?;
        let options = ServeOptions {
            idle_timeout: self.inner.config.idle_timeout,
            max_connections: self.inner.config.max_connections,
            ..Default::default()
        };
        serve(listener, Arc::new(dispatch), options, self.inner.shutdown.child_token()).await;
        Ok(())
    }

    /// Race-dials `endpoints`, identifies the peer and caches the client in the pool.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        peer: PeerId,
        endpoints: &[Multiaddr],
    ) -> Result<HostClient, ConnectError> {
        let client = self.dial_client(cancel, peer, endpoints).await?;
        if let Some(old) = self.inner.pool.insert(client.clone()) {
            old.close();
        }
        Ok(client)
    }

    /// [`Host::connect`] with the peer id and endpoints given as strings.
    ///
    /// Endpoints that do not parse, or that name a different peer in a `/p2p/` suffix, are skipped with a warning.
    pub async fn connect_addr_strings<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        peer: &str,
        endpoints: &[S],
    ) -> Result<HostClient, ConnectError> {
        let peer = PeerId::from_str(peer).map_err(|e| ConnectError::InvalidPeerId(format!("{peer}: {e}")))?;
        let endpoints = parse_endpoints(peer, endpoints);
        self.connect(cancel, peer, &endpoints).await
    }

    /// Returns the pooled client for `peer`, connecting through `endpoints` if there is none.
    ///
    /// Concurrent calls for the same peer share a single connection attempt, made with the first caller's `cancel`.
    pub async fn ensure_client(
        &self,
        cancel: &CancellationToken,
        peer: PeerId,
        endpoints: &[Multiaddr],
    ) -> Result<HostClient, ConnectError> {
        let host = self.clone();
        let cancel = cancel.clone();
        let endpoints = endpoints.to_vec();
        self.inner
            .pool
            .ensure_client(peer, move || async move { host.dial_client(&cancel, peer, &endpoints).await })
            .await
    }

    async fn dial_client(
        &self,
        cancel: &CancellationToken,
        peer: PeerId,
        endpoints: &[Multiaddr],
    ) -> Result<HostClient, ConnectError> {
        let options = self.inner.config.race_options();
        let raced = race_connect(cancel, peer, endpoints, Arc::clone(&self.inner.dialer), &options).await?;
        debug!("Connected to {peer} on {}", raced.endpoint);
        HostClient::handshake(cancel, raced.stream, peer, self.local_info()).await
    }

    /// Sends a message to `peer` over its pooled client.
    ///
    /// This never dials: without a live client for `peer` it fails with [`SendError::NoClient`]. Every call, including
    /// that one and calls abandoned by dropping the future, is recorded once in the feedback table.
    pub async fn send_msg(
        &self,
        cancel: &CancellationToken,
        peer: PeerId,
        msg_id: i32,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, SendError> {
        let mut record = CallRecord::start(self.inner.feedback.clone(), peer);
        let client = self.inner.pool.get_client(&peer).ok_or(SendError::NoClient(peer))?;
        let response = client.send_msg(cancel, msg_id, payload).await?;
        record.succeeded();
        Ok(response)
    }

    /// Like [`Host::send_msg`], but connects through `endpoints` first if there is no pooled client. Connection time
    /// counts towards the call's latency.
    pub async fn send_msg_with_addrs(
        &self,
        cancel: &CancellationToken,
        peer: PeerId,
        endpoints: &[Multiaddr],
        msg_id: i32,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, SendError> {
        let mut record = CallRecord::start(self.inner.feedback.clone(), peer);
        let client = self.ensure_client(cancel, peer, endpoints).await?;
        let response = client.send_msg(cancel, msg_id, payload).await?;
        record.succeeded();
        Ok(response)
    }

    /// Stops the accept loop and the snapshot task, and closes every pooled client.
    pub fn shutdown(&self) {
        info!("Shutting down host {}", self.inner.config.identity);
        self.inner.shutdown.cancel();
        self.inner.pool.close_all();
    }

    /// Waits for the snapshot task to finish after [`Host::shutdown`].
    pub async fn stopped(&self) {
        let task = self.inner.snapshot_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!("The snapshot task ended abnormally: {err}");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

fn parse_endpoints<S: AsRef<str>>(peer: PeerId, endpoints: &[S]) -> Vec<Multiaddr> {
    endpoints
        .iter()
        .filter_map(|s| {
            let s = s.as_ref();
            let addr = match Multiaddr::from_str(s) {
                Ok(addr) => addr,
                Err(err) => {
                    warn!("Skipping invalid address '{s}': {err}");
                    return None;
                }
            };
            match addr.iter().last() {
                Some(Protocol::P2p(id)) if id != peer => {
                    warn!("Skipping address '{s}': it belongs to {id}, not {peer}");
                    None
                }
                _ => Some(strip_peer_id(addr)),
            }
        })
        .collect()
}

/// Records one outbound call in the feedback table when dropped, so the call is counted however it ends.
struct CallRecord {
    feedback: FeedbackCollector,
    peer: PeerId,
    started: Instant,
    succeeded: bool,
}

impl CallRecord {
    fn start(feedback: FeedbackCollector, peer: PeerId) -> Self {
        Self { feedback, peer, started: Instant::now(), succeeded: false }
    }

    fn succeeded(&mut self) {
        self.succeeded = true;
    }
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        trace!("Call to {} finished in {elapsed:?} (ok: {})", self.peer, self.succeeded);
        self.feedback.record_call(&self.peer, self.succeeded, elapsed);
    }
}
