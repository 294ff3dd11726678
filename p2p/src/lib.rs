mod client;
mod config;
pub mod errors;
pub mod feedback;
mod host;
mod identity;
pub mod idle;
mod pool;
pub mod race;
pub mod rpc;
pub mod score;
pub mod server;
pub mod services;
pub mod transport;

pub use client::HostClient;
pub use config::{HostConfig, DEFAULT_LISTEN_ADDR};
pub use errors::{CallError, ConnectError, HostError, RemoteServerError, ScoringFault, SendError};
pub use feedback::{FeedbackCollector, Outcome, SnapshotRecord};
pub use host::Host;
pub use identity::{HostIdentity, IdentityError, PeerInfo};
pub use pool::ClientPool;
pub use score::{ScorePolicy, ScoreWeights, Scorer};
pub use services::{MessageHandler, MessageHead};

pub use libp2p::{Multiaddr, PeerId};
