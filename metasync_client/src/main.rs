//! Metasync client and cluster control utility.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use metasync::{
    logger_init, pf_error, ClusterConfig, FileMetaData, MetaClient,
    MetasyncError, ReplicaId, RpcStub, Version,
};
use tokio::runtime::Builder;
use tokio::time::Duration;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Cluster configuration TOML file.
    #[arg(short = 'f', long)]
    cluster: PathBuf,

    /// Per-call timeout in millisecs.
    #[arg(short, long, default_value_t = 10000)]
    timeout_ms: u64,

    #[command(subcommand)]
    cmd: CliCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    /// Make given node the leader of a new term.
    SetLeader { id: ReplicaId },

    /// Have given leader run one replication round.
    Heartbeat { id: ReplicaId },

    /// Put given node into simulated-crash mode.
    Crash { id: ReplicaId },

    /// Bring given node back as a follower.
    Restore { id: ReplicaId },

    /// Make given node drop calls from the listed peers; none clears.
    Unreachable {
        id: ReplicaId,
        #[arg(long, value_delimiter = ',')]
        from: Vec<ReplicaId>,
    },

    /// Dump given node's internal state.
    State { id: ReplicaId },

    /// Update a file's metadata through the leader.
    Update {
        filename: String,
        version: Version,
        #[arg(long, value_delimiter = ',')]
        blocks: Vec<String>,
    },

    /// List all file metadata.
    List,

    /// Show which block store holds each given block hash.
    BlockMap { hashes: Vec<String> },

    /// List block store addresses.
    BlockAddrs,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(cluster)` on success
    /// or `Err(MetasyncError)` on any error.
    fn sanitize(&self) -> Result<ClusterConfig, MetasyncError> {
        if self.timeout_ms == 0 {
            return Err(MetasyncError::msg("invalid timeout_ms 0"));
        }
        let cluster = ClusterConfig::load(&self.cluster)?;
        let id = match self.cmd {
            CliCommand::SetLeader { id }
            | CliCommand::Heartbeat { id }
            | CliCommand::Crash { id }
            | CliCommand::Restore { id }
            | CliCommand::Unreachable { id, .. }
            | CliCommand::State { id } => Some(id),
            _ => None,
        };
        if let Some(id) = id {
            if id >= cluster.population() {
                return Err(MetasyncError::msg(format!(
                    "invalid node ID {} for {} nodes",
                    id,
                    cluster.population()
                )));
            }
        }
        Ok(cluster)
    }
}

/// Runs one command against the cluster.
async fn run_command(
    cluster: &ClusterConfig,
    cmd: CliCommand,
    timeout: Duration,
) -> Result<(), MetasyncError> {
    let addrs = cluster.socket_addrs()?;
    let stub = |id: ReplicaId| RpcStub::new(addrs[id as usize], timeout);

    match cmd {
        CliCommand::SetLeader { id } => {
            println!("{}", stub(id).set_leader().await?);
        }
        CliCommand::Heartbeat { id } => {
            println!("{}", stub(id).send_heartbeat().await?);
        }
        CliCommand::Crash { id } => {
            println!("{}", stub(id).crash().await?);
        }
        CliCommand::Restore { id } => {
            println!("{}", stub(id).restore().await?);
        }
        CliCommand::Unreachable { id, from } => {
            println!("{}", stub(id).make_server_unreachable_from(from).await?);
        }
        CliCommand::State { id } => {
            let state = stub(id).get_internal_state().await?;
            println!(
                "role {} term {} commit {}",
                state.role, state.term, state.commit_index
            );
            for (index, entry) in state.log.iter().enumerate() {
                match &entry.operation {
                    Some(meta) => println!(
                        "  [{}] t{} {} v{}",
                        index, entry.term, meta.filename, meta.version
                    ),
                    None => println!("  [{}] t{} no-op", index, entry.term),
                }
            }
        }

        CliCommand::Update {
            filename,
            version,
            blocks,
        } => {
            let mut client = MetaClient::new(&addrs, timeout)?;
            let meta = FileMetaData::new(filename, version, blocks);
            println!("{}", client.update_file(&meta).await?);
        }
        CliCommand::List => {
            let mut client = MetaClient::new(&addrs, timeout)?;
            let mut files: Vec<_> =
                client.get_file_info_map().await?.into_values().collect();
            files.sort_by(|a, b| a.filename.cmp(&b.filename));
            for meta in files {
                println!(
                    "{} v{} {}",
                    meta.filename,
                    meta.version,
                    meta.block_hash_list.join(",")
                );
            }
        }
        CliCommand::BlockMap { hashes } => {
            let mut client = MetaClient::new(&addrs, timeout)?;
            for (server, owned) in client.get_block_store_map(&hashes).await? {
                println!("{} {}", server, owned.join(","));
            }
        }
        CliCommand::BlockAddrs => {
            let mut client = MetaClient::new(&addrs, timeout)?;
            for addr in client.get_block_store_addrs().await? {
                println!("{}", addr);
            }
        }
    }
    Ok(())
}

/// Actual main function of the Metasync client utility.
fn client_main() -> Result<(), MetasyncError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let cluster = args.sanitize()?;
    let timeout = Duration::from_millis(args.timeout_ms);

    let runtime = Builder::new_current_thread()
        .enable_all()
        .thread_name("tokio-worker-client")
        .build()?;
    runtime.block_on(run_command(&cluster, args.cmd, timeout))
}

/// Main function of the Metasync client utility.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
