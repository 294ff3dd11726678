//! Multi-address race connect.
//!
//! Every candidate endpoint of a peer is dialled concurrently and the first stream to come up wins. The attempts
//! share one cancellation scope forked from the caller's token. As soon as the race is decided (a winner, every
//! attempt failed, or the caller gave up) the scope is cancelled and whatever is still outstanding is handed to a
//! reaper task. The reaper closes connections that complete after the fact and aborts anything still running after the
//! grace period, so no network handle outlives the race by more than that.

use crate::errors::ConnectError;
use crate::transport::Dialer;
use libp2p::{Multiaddr, PeerId};
use log::*;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LOSER_GRACE: Duration = Duration::from_millis(500);

type Attempts<S> = JoinSet<(Multiaddr, io::Result<S>)>;

#[derive(Debug, Clone)]
pub struct RaceOptions {
    /// How long the reaper waits for outstanding attempts to wind down before aborting them.
    pub loser_grace: Duration,
    /// Log each failed attempt at `warn` instead of `trace`.
    pub log_dial_errors: bool,
}

impl Default for RaceOptions {
    fn default() -> Self {
        Self { loser_grace: DEFAULT_LOSER_GRACE, log_dial_errors: false }
    }
}

/// The winning stream of a race, along with the endpoint that produced it.
#[derive(Debug)]
pub struct RacedConnection<S> {
    pub endpoint: Multiaddr,
    pub stream: S,
}

/// Dial all `endpoints` of `peer` at once and return the first stream that connects.
///
/// Returns [`ConnectError::Cancelled`] as soon as `cancel` fires, without waiting for the attempts, and
/// [`ConnectError::DialAllFailed`] once the last attempt has failed. An empty endpoint list fails immediately.
pub async fn race_connect<D: Dialer>(
    cancel: &CancellationToken,
    peer: PeerId,
    endpoints: &[Multiaddr],
    dialer: Arc<D>,
    options: &RaceOptions,
) -> Result<RacedConnection<D::Stream>, ConnectError> {
    if cancel.is_cancelled() {
        return Err(ConnectError::Cancelled);
    }
    if endpoints.is_empty() {
        debug!("No endpoints to dial for {peer}");
        return Err(ConnectError::DialAllFailed { peer, attempts: 0 });
    }
    let scope = cancel.child_token();
    let mut attempts: Attempts<D::Stream> = JoinSet::new();
    for endpoint in endpoints.iter().cloned() {
        let dialer = Arc::clone(&dialer);
        let token = scope.child_token();
        attempts.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "dial abandoned")),
                res = dialer.dial(&endpoint) => res,
            };
            (endpoint, result)
        });
    }
    trace!("Racing {} endpoints for {peer}", endpoints.len());

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(ConnectError::Cancelled),
            next = attempts.join_next() => match next {
                Some(Ok((endpoint, Ok(stream)))) => {
                    debug!("Connected to {peer} via {endpoint}");
                    break Ok(RacedConnection { endpoint, stream });
                }
                Some(Ok((endpoint, Err(err)))) => {
                    if options.log_dial_errors {
                        warn!("conn error: {peer} at {endpoint}: {err}");
                    } else {
                        trace!("conn error: {peer} at {endpoint}: {err}");
                    }
                }
                Some(Err(err)) => warn!("Dial task for {peer} did not complete: {err}"),
                None => break Err(ConnectError::DialAllFailed { peer, attempts: endpoints.len() }),
            }
        }
    };

    scope.cancel();
    if !attempts.is_empty() {
        tokio::spawn(reap_losers(attempts, options.loser_grace));
    }
    outcome
}

/// Waits up to `grace` for abandoned attempts to finish, closing any stream they still produced, then aborts the rest.
async fn reap_losers<S>(mut attempts: Attempts<S>, grace: Duration)
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    let drain = async {
        while let Some(res) = attempts.join_next().await {
            if let Ok((endpoint, Ok(mut stream))) = res {
                trace!("Closing late connection to {endpoint}");
                let _ = stream.shutdown().await;
            }
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        debug!("Aborting {} dial attempts that outlived the race", attempts.len());
        attempts.abort_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::time::Instant;

    #[derive(Default)]
    struct FakeDialer {
        /// endpoint -> (delay, succeeds)
        plan: HashMap<Multiaddr, (Duration, bool)>,
        finished: AtomicUsize,
        /// The far ends of the streams handed out, by endpoint.
        remotes: Mutex<HashMap<Multiaddr, DuplexStream>>,
    }

    impl FakeDialer {
        fn with(mut self, addr: &Multiaddr, delay_ms: u64, ok: bool) -> Self {
            self.plan.insert(addr.clone(), (Duration::from_millis(delay_ms), ok));
            self
        }

        fn take_remote(&self, addr: &Multiaddr) -> Option<DuplexStream> {
            self.remotes.lock().remove(addr)
        }
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        type Stream = DuplexStream;

        async fn dial(&self, addr: &Multiaddr) -> io::Result<DuplexStream> {
            let (delay, ok) = self.plan.get(addr).copied().unwrap_or((Duration::ZERO, false));
            // A zero delay connects on the first poll.
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            if ok {
                let (local, remote) = duplex(64);
                self.remotes.lock().insert(addr.clone(), remote);
                Ok(local)
            } else {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            }
        }
    }

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/10.0.0.1/tcp/{port}").parse().unwrap()
    }

    fn peer() -> PeerId {
        libp2p::identity::Keypair::generate_ed25519().public().to_peer_id()
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_wins_regardless_of_order() {
        let (slow, fast, broken) = (addr(1), addr(2), addr(3));
        let orders = [
            vec![slow.clone(), fast.clone(), broken.clone()],
            vec![broken.clone(), slow.clone(), fast.clone()],
            vec![fast.clone(), broken.clone(), slow.clone()],
        ];
        for endpoints in orders {
            let dialer = Arc::new(
                FakeDialer::default().with(&slow, 200, true).with(&fast, 50, true).with(&broken, 10, false),
            );
            let token = CancellationToken::new();
            let started = Instant::now();
            let conn = race_connect(&token, peer(), &endpoints, dialer, &RaceOptions::default()).await.unwrap();
            assert_eq!(conn.endpoint, fast);
            assert!(started.elapsed() < Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_failing_endpoints_report_dial_all_failed() {
        let endpoints = vec![addr(1), addr(2)];
        let dialer = Arc::new(FakeDialer::default().with(&endpoints[0], 10, false).with(&endpoints[1], 40, false));
        let token = CancellationToken::new();
        let target = peer();
        let started = Instant::now();
        let err = race_connect(&token, target, &endpoints, dialer, &RaceOptions::default()).await.unwrap_err();
        assert_eq!(err, ConnectError::DialAllFailed { peer: target, attempts: 2 });
        assert!(started.elapsed() < Duration::from_millis(40) + DEFAULT_LOSER_GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_token_returns_immediately() {
        let endpoints = vec![addr(1)];
        let dialer = Arc::new(FakeDialer::default().with(&endpoints[0], 10, true));
        let token = CancellationToken::new();
        token.cancel();
        let started = Instant::now();
        let err = race_connect(&token, peer(), &endpoints, dialer.clone(), &RaceOptions::default()).await.unwrap_err();
        assert_eq!(err, ConnectError::Cancelled);
        assert_eq!(started.elapsed(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dialer.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_mid_race_abandons_outstanding_dials() {
        let endpoints = vec![addr(1), addr(2)];
        let dialer = Arc::new(FakeDialer::default().with(&endpoints[0], 100, true).with(&endpoints[1], 150, true));
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = race_connect(&token, peer(), &endpoints, dialer.clone(), &RaceOptions::default()).await.unwrap_err();
        assert_eq!(err, ConnectError::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(dialer.finished.load(Ordering::SeqCst), 0, "no dial may complete after cancellation");
    }

    #[tokio::test(start_paused = true)]
    async fn losers_are_abandoned_once_a_winner_is_chosen() {
        let endpoints = vec![addr(1), addr(2)];
        let dialer = Arc::new(FakeDialer::default().with(&endpoints[0], 10, true).with(&endpoints[1], 300, true));
        let token = CancellationToken::new();
        let conn = race_connect(&token, peer(), &endpoints, dialer.clone(), &RaceOptions::default()).await.unwrap();
        assert_eq!(conn.endpoint, endpoints[0]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(dialer.finished.load(Ordering::SeqCst), 1);
        assert!(!token.is_cancelled(), "the caller's token is never cancelled by the race");
    }

    #[tokio::test(start_paused = true)]
    async fn connections_completing_after_the_winner_are_closed() {
        let endpoints = vec![addr(1), addr(2)];
        let dialer = Arc::new(FakeDialer::default().with(&endpoints[0], 0, true).with(&endpoints[1], 0, true));
        let token = CancellationToken::new();
        let mut conn = race_connect(&token, peer(), &endpoints, dialer.clone(), &RaceOptions::default()).await.unwrap();
        assert_eq!(dialer.finished.load(Ordering::SeqCst), 2, "both dials connect before the race is decided");
        let loser = endpoints.iter().find(|e| **e != conn.endpoint).unwrap();
        let mut loser_remote = dialer.take_remote(loser).unwrap();
        let mut winner_remote = dialer.take_remote(&conn.endpoint).unwrap();

        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(DEFAULT_LOSER_GRACE, loser_remote.read(&mut buf))
            .await
            .expect("the losing connection is closed within the grace period")
            .unwrap();
        assert_eq!(n, 0);

        conn.stream.write_all(b"ping").await.unwrap();
        winner_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn empty_endpoint_list_fails_without_dialling() {
        let dialer = Arc::new(FakeDialer::default());
        let target = peer();
        let err = race_connect(&CancellationToken::new(), target, &[], dialer.clone(), &RaceOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ConnectError::DialAllFailed { peer: target, attempts: 0 });
        assert_eq!(dialer.finished.load(Ordering::SeqCst), 0);
    }
}
