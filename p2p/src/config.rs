use crate::errors::HostError;
use crate::feedback::{default_snapshot_path, DEFAULT_SNAPSHOT_INTERVAL};
use crate::identity::{HostIdentity, IdentityError};
use crate::idle::DEFAULT_IDLE_TIMEOUT;
use crate::race::{RaceOptions, DEFAULT_LOSER_GRACE};
use crate::score::ScoreWeights;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/9001";

/// Everything needed to build a [`crate::Host`]. Every option has a default; use the `with_*` methods to change them.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub listen_addr: Multiaddr,
    /// Log failed dial attempts and other per-connection detail at `warn`.
    pub debug: bool,
    /// Recorded and logged, but nothing is served on it.
    pub profiling_endpoint: Option<SocketAddr>,
    pub identity: HostIdentity,
    pub idle_timeout: Duration,
    pub score_weights: ScoreWeights,
    pub snapshot_interval: Duration,
    pub snapshot_path: PathBuf,
    /// Cap on concurrently served connections. `None` means no cap.
    pub max_connections: Option<usize>,
    /// Public addresses advertised in addition to the bound one.
    pub announce_addrs: Vec<Multiaddr>,
    pub loser_grace: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            debug: false,
            profiling_endpoint: None,
            identity: HostIdentity::random(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            score_weights: ScoreWeights::default(),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            snapshot_path: default_snapshot_path(),
            max_connections: None,
            announce_addrs: Vec::new(),
            loser_grace: DEFAULT_LOSER_GRACE,
        }
    }
}

fn default_listen_addr() -> Multiaddr {
    Multiaddr::empty().with(Protocol::Ip4([0, 0, 0, 0].into())).with(Protocol::Tcp(9001))
}

impl HostConfig {
    pub fn new(identity: HostIdentity) -> Self {
        Self { identity, ..Default::default() }
    }

    pub fn with_listen_addr(mut self, addr: Multiaddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_profiling_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.profiling_endpoint = Some(endpoint);
        self
    }

    pub fn with_identity(mut self, identity: HostIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_score_weights(mut self, weights: ScoreWeights) -> Self {
        self.score_weights = weights;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_snapshot_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.snapshot_path = path.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn with_announce_addr(mut self, addr: Multiaddr) -> Self {
        self.announce_addrs.push(addr);
        self
    }

    pub fn with_loser_grace(mut self, grace: Duration) -> Self {
        self.loser_grace = grace;
        self
    }

    pub fn race_options(&self) -> RaceOptions {
        RaceOptions { loser_grace: self.loser_grace, log_dial_errors: self.debug }
    }

    /// Rejects settings the host cannot run with.
    pub fn validate(&self) -> Result<(), HostError> {
        if self.idle_timeout.is_zero() {
            return Err(HostError::InvalidConfig("the idle timeout must be greater than zero".into()));
        }
        if self.snapshot_interval.is_zero() {
            return Err(HostError::InvalidConfig("the snapshot interval must be greater than zero".into()));
        }
        if self.max_connections == Some(0) {
            return Err(HostError::InvalidConfig("max_connections must be at least 1".into()));
        }
        if !self.identity.check() {
            return Err(IdentityError::Inconsistent(self.identity.name().to_string()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = HostConfig::default();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert!(!config.debug);
        assert!(config.profiling_endpoint.is_none());
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.score_weights, ScoreWeights([50, -25, -5, -10, -15]));
        assert_eq!(config.snapshot_interval, Duration::from_secs(60));
        assert!(config.snapshot_path.ends_with("opt.log"));
        assert!(config.max_connections.is_none());
        assert!(config.announce_addrs.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn options_are_independent() {
        let config = HostConfig::default().with_debug(true).with_max_connections(4);
        assert!(config.debug);
        assert_eq!(config.max_connections, Some(4));
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert!(config.race_options().log_dial_errors);
    }

    #[test]
    fn zero_durations_are_invalid() {
        let config = HostConfig::default().with_idle_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(HostError::InvalidConfig(_))));
        let config = HostConfig::default().with_max_connections(0);
        assert!(matches!(config.validate(), Err(HostError::InvalidConfig(_))));
    }

    #[test]
    fn inconsistent_identities_are_rejected() {
        let alice = HostIdentity::random_with_name("alice");
        let bob = HostIdentity::random_with_name("bob");
        let yml = alice.to_yml().unwrap().replace(&alice.peer_id().to_base58(), &bob.peer_id().to_base58());
        let forged: HostIdentity = serde_yml::from_str(&yml).unwrap();
        assert!(!forged.check());
        let err = HostConfig::new(forged).validate().unwrap_err();
        assert!(matches!(err, HostError::Identity(IdentityError::Inconsistent(name)) if name == "alice"));
    }
}
