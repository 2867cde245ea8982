//! Metasync metadata server node executable.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use metasync::{
    logger_init, pf_error, pf_info, ClusterConfig, MetasyncError, RaftServer,
    ReplicaId, ME,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Cluster configuration TOML file.
    #[arg(short = 'f', long)]
    cluster: PathBuf,

    /// My replica ID, i.e., my index into the cluster's `raft_addrs`.
    #[arg(short, long)]
    id: ReplicaId,

    /// Consensus configuration parameters TOML string, e.g.,
    /// 'round_timeout_ms = 3000'.
    #[arg(short, long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(cluster)` on success
    /// or `Err(MetasyncError)` on any error.
    fn sanitize(&self) -> Result<ClusterConfig, MetasyncError> {
        if self.threads < 2 {
            return Err(MetasyncError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        let cluster = ClusterConfig::load(&self.cluster)?;
        if self.id >= cluster.population() {
            return Err(MetasyncError::msg(format!(
                "invalid replica ID {} for {} nodes",
                self.id,
                cluster.population()
            )));
        }
        Ok(cluster)
    }
}

/// Actual main function of a Metasync server.
fn server_main() -> Result<(), MetasyncError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let cluster = args.sanitize()?;
    let id = args.id;
    let _ = ME.set(format!("{}", id));
    let config_str = if args.config.is_empty() {
        None
    } else {
        Some(args.config.clone())
    };

    if !cluster.base_dir.is_empty() {
        fs::create_dir_all(&cluster.base_dir)?;
    }

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(|e| MetasyncError::msg(format!("ctrlc: {}", e)))?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-server")
            .build()?;

        // enter tokio runtime, set up the server, and serve until terminated
        runtime.block_on(async move {
            let server =
                RaftServer::new_and_setup(id, &cluster, config_str.as_deref())
                    .await?;
            pf_info!(
                "server {} of {} up, {} block stores",
                id,
                cluster.population(),
                cluster.block_addrs.len()
            );

            server.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), MetasyncError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a Metasync server.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
