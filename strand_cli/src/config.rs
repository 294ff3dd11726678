use clap::{Args, Parser, Subcommand};
use libp2p::Multiaddr;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Strand p2p host.
///
/// Runs a p2p host, sends messages to other hosts and reports how well peers have been answering.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Path to the identity file. The default is `$HOME/.strand/config.yml`.
    #[arg(long = "config-file", short = 'c', env = "STRAND_CONFIG")]
    pub config_file: Option<PathBuf>,
    /// Identity name to use. If omitted, the first identity in the identity file is used.
    #[arg(long = "id")]
    pub id_name: Option<String>,
    /// Log at debug level unless RUST_LOG says otherwise, and report every failed dial attempt.
    #[arg(long = "debug", short = 'd', default_value_t = false)]
    pub debug: bool,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Add, list or delete local identities.
    #[command(subcommand, name = "id")]
    Id(IdCommand),
    /// Run a host until Ctrl-C.
    #[command(name = "serve", alias = "start")]
    Serve(ServeCommand),
    /// Connect to a peer, send it one message and print the reply.
    #[command(name = "send")]
    Send(SendCommand),
    /// Print the counters and score of every peer in a snapshot file.
    #[command(name = "scores")]
    Scores(ScoresCommand),
}

#[derive(Debug, Subcommand)]
pub enum IdCommand {
    /// Create a new identity.
    #[command(name = "new", alias = "create")]
    Create {
        /// The name of the new identity. If omitted, a random name is generated.
        name: Option<String>,
    },
    /// List all identities.
    #[command(name = "list", alias = "ls")]
    List,
    /// Delete an identity.
    #[command(name = "delete", alias = "del", alias = "rm")]
    Delete {
        /// The name of the identity to delete.
        name: String,
    },
}

#[derive(Debug, Args)]
pub struct ServeCommand {
    /// The address to listen on.
    #[arg(long = "listen-address", short = 'a', default_value = strand_p2p::DEFAULT_LISTEN_ADDR)]
    pub listen_address: Multiaddr,
    /// Close connections that have been silent for this many seconds.
    #[arg(long = "idle-timeout-secs", default_value_t = 300)]
    pub idle_timeout_secs: u64,
    /// Where to write the peer counter snapshot. The default is `opt.log` next to the executable.
    #[arg(long = "snapshot-file")]
    pub snapshot_file: Option<PathBuf>,
    /// Serve at most this many connections at once.
    #[arg(long = "max-connections")]
    pub max_connections: Option<usize>,
    /// Additional public address to advertise. May be repeated.
    #[arg(long = "announce")]
    pub announce: Vec<Multiaddr>,
    /// Profiling endpoint. Accepted for compatibility; nothing is served on it.
    #[arg(long = "profile-address")]
    pub profile_address: Option<SocketAddr>,
}

#[derive(Debug, Args)]
pub struct SendCommand {
    /// The peer id of the recipient.
    #[arg(long = "peer", short = 'p')]
    pub peer: String,
    /// An address of the recipient. May be repeated; all of them are dialled at once.
    #[arg(long = "addr", required = true)]
    pub addrs: Vec<String>,
    /// The message id the recipient has a handler for.
    #[arg(long = "msg-id", short = 'm', default_value_t = 0)]
    pub msg_id: i32,
    /// Give up after this many seconds.
    #[arg(long = "timeout-secs", default_value_t = 30)]
    pub timeout_secs: u64,
    /// The local address to bind while sending.
    #[arg(long = "listen-address", short = 'a', default_value = "/ip4/127.0.0.1/tcp/0")]
    pub listen_address: Multiaddr,
    /// The message payload, sent as UTF-8.
    pub payload: String,
}

#[derive(Debug, Args)]
pub struct ScoresCommand {
    /// The snapshot file to read. The default is `opt.log` next to the executable.
    pub file: Option<PathBuf>,
}

pub struct GlobalOptions {
    pub config_file: Option<PathBuf>,
    pub id_name: Option<String>,
    pub debug: bool,
}

impl Config {
    pub fn to_parts(self) -> (GlobalOptions, CliCommand) {
        let global = GlobalOptions { config_file: self.config_file, id_name: self.id_name, debug: self.debug };
        (global, self.command)
    }
}
