//! A small request/response protocol over any duplex stream.
//!
//! Frames are length-delimited and carry JSON envelopes. A request names a service and a method; the server looks the
//! service up in its [`DispatchTable`] and answers with a response carrying the same sequence number, so one connection
//! can carry many calls at once.
//!
//! - [`RpcClient`]: the calling side. A driver task owns the connection and matches responses to callers.
//! - [`serve_connection`]: the serving side. Requests are handled concurrently and answered through one writer.

use crate::errors::{CallError, DispatchRegistrationError, RemoteServerError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub seq: u64,
    pub service: String,
    pub method: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub seq: u64,
    pub result: Result<Value, RemoteServerError>,
}

/// A named surface that can be called over a connection.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn call(&self, method: &str, body: Value) -> Result<Value, RemoteServerError>;
}

/// Maps short service names to their implementations.
#[derive(Default, Clone)]
pub struct DispatchTable {
    services: HashMap<String, Arc<dyn Service>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Service>(&mut self, name: &str, service: S) -> Result<(), DispatchRegistrationError> {
        if name.is_empty() {
            return Err(DispatchRegistrationError::EmptyName);
        }
        if self.services.contains_key(name) {
            return Err(DispatchRegistrationError::Duplicate(name.to_string()));
        }
        self.services.insert(name.to_string(), Arc::new(service));
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest { seq, service, method, body } = request;
        let result = match self.services.get(&service) {
            Some(svc) => svc.call(&method, body).await,
            None => Err(RemoteServerError::UnknownService(service)),
        };
        RpcResponse { seq, result }
    }
}

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> Framed<S, LengthDelimitedCodec> {
    Framed::new(stream, LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LENGTH).new_codec())
}

fn encode<T: Serialize>(msg: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(msg).map(Bytes::from)
}

/// Serves RPC calls on one connection until the peer hangs up, the stream fails (idle timeout included), or `shutdown`
/// fires. Errors are logged here and never propagate beyond this connection.
pub async fn serve_connection<S>(stream: S, dispatch: Arc<DispatchTable>, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut sink, mut frames) = framed(stream).split();
    let mut in_flight = FuturesUnordered::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(response) = in_flight.next(), if !in_flight.is_empty() => {
                let response: RpcResponse = response;
                let bytes = match encode(&response) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        error!("Could not encode response {}: {err}", response.seq);
                        continue;
                    }
                };
                if let Err(err) = sink.send(bytes).await {
                    debug!("Could not write response: {err}");
                    break;
                }
            }
            frame = frames.next() => match frame {
                Some(Ok(bytes)) => match serde_json::from_slice::<RpcRequest>(&bytes) {
                    Ok(request) => {
                        trace!("rpc: {}.{} (seq {})", request.service, request.method, request.seq);
                        let dispatch = Arc::clone(&dispatch);
                        in_flight.push(async move { dispatch.dispatch(request).await });
                    }
                    Err(err) => {
                        warn!("Dropping connection after a malformed request frame: {err}");
                        break;
                    }
                },
                Some(Err(err)) => {
                    debug!("Connection ended: {err}");
                    break;
                }
                None => {
                    trace!("Connection closed by peer");
                    break;
                }
            }
        }
    }
}

type Responder = oneshot::Sender<Result<Value, CallError>>;

struct Call {
    service: String,
    method: String,
    body: Value,
    responder: Responder,
}

/// The calling side of a connection. Cheap to clone; all clones share the one connection.
#[derive(Clone)]
pub struct RpcClient {
    sender: mpsc::Sender<Call>,
    closed: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl RpcClient {
    /// Takes ownership of `stream` and spawns the driver task that runs it.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, receiver) = mpsc::channel(32);
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let pending = Arc::new(AtomicUsize::new(0));
        let driver = ClientDriver { next_seq: 1, pending: HashMap::new(), waiting: Arc::clone(&pending) };
        let flag = Arc::clone(&closed);
        let token = shutdown.clone();
        tokio::spawn(async move {
            driver.run(framed(stream), receiver, token).await;
            flag.store(true, Ordering::SeqCst);
        });
        Self { sender, closed, pending, shutdown }
    }

    /// Call `service.method` on the remote. `cancel` abandons the wait; the connection stays usable.
    pub async fn call(
        &self,
        cancel: &CancellationToken,
        service: &str,
        method: &str,
        body: Value,
    ) -> Result<Value, CallError> {
        if self.is_closed() {
            return Err(CallError::ConnectionClosed);
        }
        let (responder, receiver) = oneshot::channel();
        let call = Call { service: service.into(), method: method.into(), body, responder };
        let exchange = async {
            self.sender.clone().send(call).await.map_err(|_| CallError::ConnectionClosed)?;
            receiver.await.map_err(|_| CallError::ConnectionClosed)?
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CallError::Cancelled),
            result = exchange => result,
        }
    }

    /// Typed convenience wrapper around [`RpcClient::call`].
    pub async fn call_typed<Req, Resp>(
        &self,
        cancel: &CancellationToken,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize,
        Resp: for<'de> Deserialize<'de>,
    {
        let body = serde_json::to_value(request)?;
        let value = self.call(cancel, service, method, body).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }

    /// Calls sent on the connection whose caller is still waiting for the response.
    pub fn pending_calls(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Closes the connection. Calls still waiting fail with [`CallError::ConnectionClosed`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

struct ClientDriver {
    next_seq: u64,
    pending: HashMap<u64, Responder>,
    waiting: Arc<AtomicUsize>,
}

impl ClientDriver {
    async fn run<S>(
        mut self,
        conn: Framed<S, LengthDelimitedCodec>,
        mut calls: mpsc::Receiver<Call>,
        shutdown: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut frames) = conn.split();
        loop {
            // Callers that gave up no longer need their slot. A late response for one is dropped.
            self.pending.retain(|_, responder| !responder.is_canceled());
            self.waiting.store(self.pending.len(), Ordering::SeqCst);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                call = calls.next() => {
                    let Some(call) = call else { break };
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    let request = RpcRequest { seq, service: call.service, method: call.method, body: call.body };
                    let bytes = match encode(&request) {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            let _ = call.responder.send(Err(err.into()));
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(bytes).await {
                        let _ = call.responder.send(Err(err.into()));
                        break;
                    }
                    self.pending.insert(seq, call.responder);
                }
                frame = frames.next() => match frame {
                    Some(Ok(bytes)) => match serde_json::from_slice::<RpcResponse>(&bytes) {
                        Ok(response) => match self.pending.remove(&response.seq) {
                            Some(responder) => {
                                let _ = responder.send(response.result.map_err(CallError::Remote));
                            }
                            None => trace!("Dropping the response to abandoned call {}", response.seq),
                        },
                        Err(err) => {
                            warn!("Malformed response frame, closing connection: {err}");
                            break;
                        }
                    },
                    Some(Err(err)) => {
                        debug!("Client connection failed: {err}");
                        break;
                    }
                    None => {
                        trace!("Client connection closed by peer");
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
        // Dropping the responders wakes every waiting caller with `ConnectionClosed`.
        self.pending.clear();
        self.waiting.store(0, Ordering::SeqCst);
    }
}
