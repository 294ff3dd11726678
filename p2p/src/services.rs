//! The two surfaces every host serves: identity (`"as"`) and messages (`"ms"`).

use crate::errors::RemoteServerError;
use crate::identity::PeerInfo;
use crate::rpc::Service;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub const ADDR_SERVICE: &str = "as";
pub const MSG_SERVICE: &str = "ms";
pub const REMOTE_PEER_INFO: &str = "RemotePeerInfo";
pub const HANDLE_MSG: &str = "HandleMsg";

/// The body of a `ms.HandleMsg` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgRequest {
    pub msg_id: i32,
    pub payload: Vec<u8>,
    /// Who is calling, so the handler knows whom it is talking to.
    pub sender: PeerInfo,
}

/// Context handed to a [`MessageHandler`] with each message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub msg_id: i32,
    pub remote: PeerInfo,
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, head: MessageHead, payload: Vec<u8>) -> Result<Vec<u8>, String>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageHead, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, String>> + Send + 'static,
{
    async fn handle(&self, head: MessageHead, payload: Vec<u8>) -> Result<Vec<u8>, String> {
        (self)(head, payload).await
    }
}

/// The registry of message handlers, keyed by message id. Shared between the host and its message service, so
/// handlers can be added while the host is serving.
#[derive(Default, Clone)]
pub struct HandlerMap {
    handlers: Arc<RwLock<HashMap<i32, Arc<dyn MessageHandler>>>>,
}

impl HandlerMap {
    /// Registers `handler` for `msg_id`, returning `true` if it replaced an earlier one.
    pub fn register<H: MessageHandler>(&self, msg_id: i32, handler: H) -> bool {
        let replaced = self.handlers.write().insert(msg_id, Arc::new(handler)).is_some();
        if replaced {
            debug!("Replaced the handler for message id {msg_id}");
        }
        replaced
    }

    pub fn remove(&self, msg_id: i32) -> bool {
        self.handlers.write().remove(&msg_id).is_some()
    }

    pub fn get(&self, msg_id: i32) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(&msg_id).cloned()
    }

    pub fn contains(&self, msg_id: i32) -> bool {
        self.handlers.read().contains_key(&msg_id)
    }

    /// Runs the handler for `head.msg_id`. The registry lock is released before the handler runs.
    pub fn dispatch(
        &self,
        head: MessageHead,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<Vec<u8>, RemoteServerError>> {
        match self.get(head.msg_id) {
            Some(handler) => {
                async move { handler.handle(head, payload).await.map_err(RemoteServerError::Handler) }.boxed()
            }
            None => futures::future::ready(Err(RemoteServerError::NoHandler(head.msg_id))).boxed(),
        }
    }
}

fn expect_method(service: &str, method: &str, expected: &str) -> Result<(), RemoteServerError> {
    if method == expected {
        Ok(())
    } else {
        Err(RemoteServerError::UnknownMethod { service: service.into(), method: method.into() })
    }
}

/// Answers "who are you": this host's id, public addresses and public key.
pub struct AddrService {
    pub info: PeerInfo,
}

#[async_trait]
impl Service for AddrService {
    async fn call(&self, method: &str, _body: Value) -> Result<Value, RemoteServerError> {
        expect_method(ADDR_SERVICE, method, REMOTE_PEER_INFO)?;
        serde_json::to_value(&self.info).map_err(|e| RemoteServerError::Handler(e.to_string()))
    }
}

/// Routes incoming messages to the handler registered for their id.
pub struct MsgService {
    pub handlers: HandlerMap,
}

#[async_trait]
impl Service for MsgService {
    async fn call(&self, method: &str, body: Value) -> Result<Value, RemoteServerError> {
        expect_method(MSG_SERVICE, method, HANDLE_MSG)?;
        let request: MsgRequest =
            serde_json::from_value(body).map_err(|e| RemoteServerError::bad_request(e.to_string()))?;
        let head = MessageHead { msg_id: request.msg_id, remote: request.sender };
        trace!("Message {} from {}", head.msg_id, head.remote.id);
        let response = self.handlers.dispatch(head, request.payload).await?;
        serde_json::to_value(response).map_err(|e| RemoteServerError::Handler(e.to_string()))
    }
}
