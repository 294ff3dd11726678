//! The accept loop.

use crate::idle::{IdleTimeout, DEFAULT_IDLE_TIMEOUT};
use crate::rpc::{serve_connection, DispatchTable};
use crate::transport::Listener;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
pub const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub idle_timeout: Duration,
    /// At most this many connections are served at once. Further connections wait in the listener's backlog.
    pub max_connections: Option<usize>,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: None,
            min_backoff: MIN_ACCEPT_BACKOFF,
            max_backoff: MAX_ACCEPT_BACKOFF,
        }
    }
}

/// Accepts connections from `listener` and serves each one on its own task until `shutdown` fires.
///
/// Accept errors are logged and retried after a backoff that doubles on every consecutive failure. Each connection is
/// closed after `idle_timeout` without traffic. A failing connection only ends its own task.
pub async fn serve<L: Listener>(
    mut listener: L,
    dispatch: Arc<DispatchTable>,
    options: ServeOptions,
    shutdown: CancellationToken,
) {
    let admission = options.max_connections.map(|n| Arc::new(Semaphore::new(n)));
    let mut backoff = options.min_backoff;
    info!("Accepting connections (idle timeout {:?})", options.idle_timeout);
    loop {
        let permit = match &admission {
            Some(semaphore) => {
                let acquire = Arc::clone(semaphore).acquire_owned();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = acquire => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    }
                }
            }
            None => None,
        };
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                backoff = options.min_backoff;
                debug!("Accepted connection from {remote}");
                let stream = IdleTimeout::new(stream, options.idle_timeout);
                let dispatch = Arc::clone(&dispatch);
                let token = shutdown.child_token();
                tokio::spawn(async move {
                    serve_connection(stream, dispatch, token).await;
                    debug!("Connection from {remote} closed");
                    drop(permit);
                });
            }
            Err(err) => {
                warn!("Error accepting connection, retrying in {backoff:?}: {err}");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(options.max_backoff);
            }
        }
    }
    info!("Stopped accepting connections");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::RemoteServerError;
    use crate::rpc::{RpcClient, Service};
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    /// A listener fed by the test: each item is handed out by one `accept`.
    struct ChannelListener {
        incoming: mpsc::UnboundedReceiver<io::Result<DuplexStream>>,
        accepts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Listener for ChannelListener {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> io::Result<(DuplexStream, SocketAddr)> {
            self.accepts.fetch_add(1, Ordering::SeqCst);
            match self.incoming.next().await {
                Some(Ok(stream)) => Ok((stream, SocketAddr::from(([127, 0, 0, 1], 4000)))),
                Some(Err(err)) => Err(err),
                None => std::future::pending().await,
            }
        }
    }

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        async fn call(&self, _method: &str, body: Value) -> Result<Value, RemoteServerError> {
            Ok(body)
        }
    }

    fn start(
        options: ServeOptions,
    ) -> (mpsc::UnboundedSender<io::Result<DuplexStream>>, Arc<AtomicUsize>, CancellationToken) {
        let (tx, incoming) = mpsc::unbounded();
        let accepts = Arc::new(AtomicUsize::new(0));
        let mut table = DispatchTable::new();
        table.register("echo", Echo).unwrap();
        let shutdown = CancellationToken::new();
        let listener = ChannelListener { incoming, accepts: Arc::clone(&accepts) };
        tokio::spawn(serve(listener, Arc::new(table), options, shutdown.clone()));
        (tx, accepts, shutdown)
    }

    fn connect(tx: &mpsc::UnboundedSender<io::Result<DuplexStream>>) -> DuplexStream {
        let (client, server) = duplex(4096);
        tx.unbounded_send(Ok(server)).unwrap();
        client
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_closed_without_affecting_others() {
        let options = ServeOptions { idle_timeout: Duration::from_secs(1), ..Default::default() };
        let (tx, _, _shutdown) = start(options);
        let mut silent = connect(&tx);
        let busy = RpcClient::new(connect(&tx));
        let token = CancellationToken::new();

        let chatter = async {
            for i in 0..10 {
                tokio::time::sleep(Duration::from_millis(400)).await;
                assert_eq!(busy.call(&token, "echo", "Echo", json!(i)).await.unwrap(), json!(i));
            }
        };
        let watch_silent = async {
            let mut buf = [0u8; 16];
            let n = tokio::time::timeout(Duration::from_secs(2), silent.read(&mut buf)).await;
            assert!(matches!(n, Ok(Ok(0))), "silent connection was not closed: {n:?}");
        };
        tokio::join!(chatter, watch_silent);
        assert!(!busy.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_errors_back_off_and_recover() {
        let (tx, accepts, _shutdown) = start(ServeOptions::default());
        for _ in 0..3 {
            tx.unbounded_send(Err(io::Error::other("too many open files"))).unwrap();
        }
        let client = RpcClient::new(connect(&tx));
        let res = client.call(&CancellationToken::new(), "echo", "Echo", json!("still here")).await.unwrap();
        assert_eq!(res, json!("still here"));
        // Three failures, the good connection, and the accept now waiting.
        assert_eq!(accepts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn admission_cap_holds_back_extra_connections() {
        let options = ServeOptions { max_connections: Some(1), ..Default::default() };
        let (tx, accepts, _shutdown) = start(options);
        let first = RpcClient::new(connect(&tx));
        let token = CancellationToken::new();
        first.call(&token, "echo", "Echo", json!(1)).await.unwrap();

        let second = RpcClient::new(connect(&tx));
        let waiting = tokio::time::timeout(Duration::from_millis(100), second.call(&token, "echo", "Echo", json!(2)));
        assert!(waiting.await.is_err(), "the second connection should not be served yet");
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        first.close();
        let res = tokio::time::timeout(Duration::from_secs(5), second.call(&token, "echo", "Echo", json!(3))).await;
        assert_eq!(res.unwrap().unwrap(), json!(3));
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_and_its_connections() {
        let (tx, _, shutdown) = start(ServeOptions::default());
        let client = RpcClient::new(connect(&tx));
        client.call(&CancellationToken::new(), "echo", "Echo", json!(1)).await.unwrap();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
