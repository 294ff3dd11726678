use crate::errors::{CallError, ConnectError};
use crate::identity::PeerInfo;
use crate::rpc::RpcClient;
use crate::services::{MsgRequest, ADDR_SERVICE, HANDLE_MSG, MSG_SERVICE, REMOTE_PEER_INFO};
use libp2p::PeerId;
use log::*;
use serde_json::Value;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// An RPC handle on one outgoing connection, bound to the peer at the other end and to our own identity.
///
/// Cloning is cheap and every clone talks over the same connection.
#[derive(Clone)]
pub struct HostClient {
    rpc: RpcClient,
    inner: Arc<ClientInfo>,
}

struct ClientInfo {
    local: PeerInfo,
    remote: PeerInfo,
}

impl HostClient {
    /// Wraps `stream` and identifies the peer on the other side.
    ///
    /// The remote must report the peer id we dialled and a public key that derives it, otherwise the connection is
    /// dropped and the client is never handed out.
    pub async fn handshake<S>(
        cancel: &CancellationToken,
        stream: S,
        expected: PeerId,
        local: PeerInfo,
    ) -> Result<Self, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let rpc = RpcClient::new(stream);
        let remote = match rpc.call_typed::<_, PeerInfo>(cancel, ADDR_SERVICE, REMOTE_PEER_INFO, &Value::Null).await {
            Ok(info) => info,
            Err(CallError::Cancelled) => {
                rpc.close();
                return Err(ConnectError::Cancelled);
            }
            Err(err) => {
                rpc.close();
                return Err(ConnectError::Handshake(err.to_string()));
            }
        };
        if remote.id != expected {
            rpc.close();
            return Err(ConnectError::PeerMismatch { expected, actual: remote.id });
        }
        if !remote.verify() {
            rpc.close();
            return Err(ConnectError::Handshake(format!("{} sent a public key that does not match its id", remote.id)));
        }
        debug!("Client for {} ready ({} advertised addresses)", remote.id, remote.addrs.len());
        Ok(Self { rpc, inner: Arc::new(ClientInfo { local, remote }) })
    }

    pub fn remote_peer(&self) -> PeerId {
        self.inner.remote.id
    }

    pub fn remote_info(&self) -> &PeerInfo {
        &self.inner.remote
    }

    pub fn local_info(&self) -> &PeerInfo {
        &self.inner.local
    }

    /// Send `payload` to the handler registered under `msg_id` on the remote peer and return its response.
    pub async fn send_msg(&self, cancel: &CancellationToken, msg_id: i32, payload: Vec<u8>) -> Result<Vec<u8>, CallError> {
        let request = MsgRequest { msg_id, payload, sender: self.inner.local.clone() };
        self.rpc.call_typed(cancel, MSG_SERVICE, HANDLE_MSG, &request).await
    }

    /// Asks the remote for its current peer info.
    pub async fn remote_peer_info(&self, cancel: &CancellationToken) -> Result<PeerInfo, CallError> {
        self.rpc.call_typed(cancel, ADDR_SERVICE, REMOTE_PEER_INFO, &Value::Null).await
    }

    pub fn is_closed(&self) -> bool {
        self.rpc.is_closed()
    }

    pub fn close(&self) {
        self.rpc.close();
    }
}

impl Debug for HostClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostClient({} -> {}, closed: {})", self.inner.local.id, self.inner.remote.id, self.is_closed())
    }
}
