use anyhow::anyhow;
use clap::Parser;
use log::*;
use std::path::PathBuf;
use std::time::Duration;
use strand_cli::config::{CliCommand, Config, GlobalOptions, IdCommand, ScoresCommand, SendCommand, ServeCommand};
use strand_cli::error::CliError;
use strand_cli::id_management::{default_id_path, LocalIdentitySet};
use strand_cli::scores::{format_score, read_scores};
use strand_p2p::feedback::default_snapshot_path;
use strand_p2p::{Host, HostConfig, HostIdentity, MessageHead, Scorer};
use tokio_util::sync::CancellationToken;

/// The message id the `serve` command answers by echoing the payload back.
const ECHO_MSG_ID: i32 = 0;

#[tokio::main]
async fn main() {
    let config: Config = Config::parse();
    init_logging(config.debug);
    let (global_options, command) = config.to_parts();

    let result = match command {
        CliCommand::Id(id_command) => exec_id_command(id_command, global_options),
        CliCommand::Serve(serve_command) => start_server(serve_command, global_options).await,
        CliCommand::Send(send_command) => exec_send_command(send_command, global_options).await,
        CliCommand::Scores(scores_command) => exec_scores_command(scores_command),
    };

    if let Err(err) = result {
        eprintln!("** Error ** \n {err}");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

fn exec_id_command(cmd: IdCommand, config: GlobalOptions) -> Result<(), anyhow::Error> {
    let path = config.config_file.unwrap_or_else(default_id_path);
    match cmd {
        IdCommand::Create { name } => {
            let mut local_identities = load_or_create_identities(&path)?;
            let identity = match name {
                Some(name) => HostIdentity::random_with_name(name),
                None => HostIdentity::random(),
            };
            if local_identities.contains(identity.name()) {
                return Err(anyhow!("Identity with name {} already exists.", identity.name()));
            }
            println!("Identity created: {identity}");
            local_identities.insert(identity);
            println!("Saving identities to {}", path.display());
            local_identities.save(&path)?;
        }
        IdCommand::List => {
            let local_identities = load_or_create_identities(&path)?;
            println!("{} Local identities found.", local_identities.len());
            for id in local_identities.identities.values() {
                println!("{id}");
            }
        }
        IdCommand::Delete { name } => {
            let mut local_identities = load_or_create_identities(&path)?;
            match local_identities.remove(&name) {
                Some(identity) => {
                    println!("Identity deleted: {identity}");
                    local_identities.save(&path)?;
                }
                None => {
                    return Err(anyhow!("Identity with name {name} not found."));
                }
            }
        }
    }
    Ok(())
}

fn load_or_create_identities(path: &PathBuf) -> Result<LocalIdentitySet, anyhow::Error> {
    match LocalIdentitySet::try_load(Some(path)) {
        Ok(local_identities) => Ok(local_identities),
        Err(CliError::IoError(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("No identity file found at {}", path.display());
            Ok(LocalIdentitySet::default())
        }
        Err(CliError::IoError(err)) => Err(anyhow!("Error reading identity file: {err}")),
        Err(err) => Err(anyhow!("Could not load identities: {err}")),
    }
}

fn assign_identity(path: PathBuf, id_name: Option<&str>) -> Result<HostIdentity, anyhow::Error> {
    info!("Loading identities from {}", path.display());
    let local_identities = load_or_create_identities(&path)?;
    if local_identities.is_empty() {
        return Err(anyhow!("No identities found. Use `strand id new` to create one."));
    }
    local_identities
        .select(id_name)
        .cloned()
        .ok_or_else(|| anyhow!("Identity not found: {}", id_name.unwrap_or_default()))
}

async fn start_server(cmd: ServeCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let path = options.config_file.unwrap_or_else(default_id_path);
    let identity = assign_identity(path, options.id_name.as_deref())?;
    let mut config = HostConfig::new(identity)
        .with_listen_addr(cmd.listen_address)
        .with_debug(options.debug)
        .with_idle_timeout(Duration::from_secs(cmd.idle_timeout_secs));
    if let Some(file) = cmd.snapshot_file {
        config = config.with_snapshot_path(file);
    }
    if let Some(max) = cmd.max_connections {
        config = config.with_max_connections(max);
    }
    if let Some(endpoint) = cmd.profile_address {
        config = config.with_profiling_endpoint(endpoint);
    }
    for addr in cmd.announce {
        config = config.with_announce_addr(addr);
    }
    let host = Host::bind(config).await?;
    host.register_handler(ECHO_MSG_ID, |head: MessageHead, payload: Vec<u8>| async move {
        debug!("Echoing {} bytes to {}", payload.len(), head.remote.id);
        Ok::<_, String>(payload)
    });
    println!("Serving as {} on {}", host.identity(), host.local_addr());
    for addr in host.addrs() {
        println!("  reachable at {addr}/p2p/{}", host.peer_id());
    }

    let server = host.clone();
    let accept = tokio::spawn(async move { server.accept().await });
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received. Shutting down.");
    host.shutdown();
    accept.await??;
    host.stopped().await;
    info!("Server has shut down.");
    Ok(())
}

async fn exec_send_command(cmd: SendCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let path = options.config_file.unwrap_or_else(default_id_path);
    let identity = assign_identity(path, options.id_name.as_deref())?;
    let config = HostConfig::new(identity).with_listen_addr(cmd.listen_address).with_debug(options.debug);
    let host = Host::bind(config).await?;
    let cancel = CancellationToken::new();
    let timeout = Duration::from_secs(cmd.timeout_secs);
    let exchange = async {
        let client = host.connect_addr_strings(&cancel, &cmd.peer, &cmd.addrs).await?;
        info!("Connected to {}", client.remote_peer());
        let reply = host.send_msg(&cancel, client.remote_peer(), cmd.msg_id, cmd.payload.clone().into_bytes()).await?;
        Ok::<_, anyhow::Error>(reply)
    };
    let result = tokio::time::timeout(timeout, exchange).await;
    host.shutdown();
    let reply = result.map_err(|_| anyhow!("No reply within {timeout:?}"))??;
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}

fn exec_scores_command(cmd: ScoresCommand) -> Result<(), anyhow::Error> {
    let path = cmd.file.unwrap_or_else(default_snapshot_path);
    let peers = read_scores(&path, &Scorer::default())?;
    println!("{} peers in {}", peers.len(), path.display());
    println!("{:<54} {:>8} {:>8} {:>8} {:>8} {:>8}  score", "peer", "ok", "failed", ">300ms", ">1s", ">3s");
    for peer in peers {
        let c = peer.record.counters.as_array();
        println!(
            "{:<54} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
            peer.record.peer.to_base58(),
            c[0],
            c[1],
            c[2],
            c[3],
            c[4],
            format_score(&peer.score)
        );
    }
    Ok(())
}
