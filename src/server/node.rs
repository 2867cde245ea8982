//! Consensus node: role, replicated log, leader bookkeeping, and the handlers
//! for consensus and client-facing requests.

use std::cmp;
use std::collections::HashMap;

use crate::server::{
    AppendEntriesArgs, AppendEntriesReply, BlockStoreMap, FileInfoMap,
    FileMetaData, LogEntry, LogIndex, MetaStore, RaftLog, RaftTransport,
    ReplicaId, Role, Term, Version,
};
use crate::utils::{MetasyncError, ReplicaMap};

use serde::{Deserialize, Serialize};

use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfigRaft {
    /// Timeout of a single AppendEntries call in millisecs.
    pub rpc_timeout_ms: u64,

    /// Deadline of a whole replication round in millisecs; a leader that
    /// cannot reach a majority within it steps down.
    pub round_timeout_ms: u64,

    /// Base pause between replication attempts in millisecs; a random jitter
    /// of up to the same amount is added.
    pub retry_interval_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigRaft {
    fn default() -> Self {
        ReplicaConfigRaft {
            rpc_timeout_ms: 1000,
            round_timeout_ms: 5000,
            retry_interval_ms: 20,
        }
    }
}

impl ReplicaConfigRaft {
    /// Parses config from an optional TOML string over the defaults.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, MetasyncError> {
        let config = parsed_config!(config_str => ReplicaConfigRaft;
                                    rpc_timeout_ms, round_timeout_ms,
                                    retry_interval_ms)?;
        if config.rpc_timeout_ms == 0 || config.round_timeout_ms == 0 {
            return logged_err!(
                "invalid config.rpc_timeout_ms '{}' or round_timeout_ms '{}'",
                config.rpc_timeout_ms,
                config.round_timeout_ms
            );
        }
        Ok(config)
    }

    #[inline]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// A client update waiting for its log entry to be applied.
pub(crate) struct PendingSlot {
    /// Term the entry was appended in.
    pub(crate) term: Term,

    /// Where to deliver the apply result.
    pub(crate) tx: oneshot::Sender<Result<Version, MetasyncError>>,
}

/// Mutable node state, guarded by one mutex.
pub(crate) struct RaftState {
    /// Replicated log with term, commit, and applied indices.
    pub(crate) log: RaftLog,

    /// Leader only: per-peer index of the next entry to send.
    pub(crate) next_index: Vec<LogIndex>,

    /// Leader only: per-peer highest index known replicated.
    pub(crate) match_index: Vec<LogIndex>,

    /// Leader I have accepted AppendEntries from in the current term.
    pub(crate) leader_of_term: Option<ReplicaId>,

    /// Map from log index -> client waiting on its apply result.
    pub(crate) pending: HashMap<LogIndex, PendingSlot>,

    /// Peers whose inbound calls I currently drop.
    pub(crate) unreachable_from: ReplicaMap,

    /// Metadata store committed entries are applied to.
    pub(crate) store: Box<dyn MetaStore>,
}

impl RaftState {
    /// Resets leader bookkeeping upon accession: every peer is assumed to
    /// hold everything up to `log_len` until proven otherwise.
    fn reset_leader_state(&mut self, log_len: LogIndex) {
        self.next_index.fill(log_len);
        self.match_index.fill(-1);
    }
}

/// Checks a role against a request's requirement.
pub(crate) fn check_role(
    role: Role,
    require_leader: bool,
) -> Result<(), MetasyncError> {
    match role {
        Role::Crashed => Err(MetasyncError::ServerCrashed),
        Role::Follower if require_leader => Err(MetasyncError::NotLeader),
        _ => Ok(()),
    }
}

/// A Raft node with leadership assigned externally (no elections).
///
/// Lock order is always `role` before `state`; neither is held across a call
/// to a peer.
pub struct RaftNode {
    /// My replica ID.
    pub(crate) id: ReplicaId,

    /// Total number of nodes in cluster.
    pub(crate) population: u8,

    /// Number of nodes (counting myself) forming a majority.
    pub(crate) quorum_cnt: u8,

    /// Configuration parameters struct.
    pub(crate) config: ReplicaConfigRaft,

    /// Current role.
    pub(crate) role: RwLock<Role>,

    /// Everything else mutable.
    pub(crate) state: Mutex<RaftState>,

    /// Outbound AppendEntries transport.
    pub(crate) transport: Box<dyn RaftTransport>,
}

impl RaftNode {
    /// Creates a fresh follower at term 0 with an empty log.
    pub fn new(
        id: ReplicaId,
        population: u8,
        config: ReplicaConfigRaft,
        store: Box<dyn MetaStore>,
        transport: Box<dyn RaftTransport>,
    ) -> Result<Self, MetasyncError> {
        if population == 0 || id >= population {
            return logged_err!(
                "invalid replica ID {} / population {}",
                id,
                population
            );
        }

        let state = RaftState {
            log: RaftLog::new(),
            next_index: vec![0; population as usize],
            match_index: vec![-1; population as usize],
            leader_of_term: None,
            pending: HashMap::new(),
            unreachable_from: ReplicaMap::new(population, false)?,
            store,
        };

        Ok(RaftNode {
            id,
            population,
            quorum_cnt: (population / 2) + 1,
            config,
            role: RwLock::new(Role::Follower),
            state: Mutex::new(state),
            transport,
        })
    }

    #[inline]
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    #[inline]
    pub fn population(&self) -> u8 {
        self.population
    }

    pub async fn role(&self) -> Role {
        *self.role.read().await
    }

    /// Fails with `ServerCrashed` if crashed, or with `NotLeader` if
    /// leadership is required but not held.
    pub async fn check_status(
        &self,
        require_leader: bool,
    ) -> Result<(), MetasyncError> {
        check_role(*self.role.read().await, require_leader)
    }

    /// Gives up leadership of `from_term`, adopting `seen_term` if higher.
    /// Does nothing if the node has already moved past `from_term`. Every
    /// waiting client is failed with `NotLeader`.
    pub(crate) async fn step_down(&self, from_term: Term, seen_term: Term) {
        let mut role = self.role.write().await;
        let mut state = self.state.lock().await;
        if state.log.curr_term() != from_term {
            return;
        }

        if seen_term > from_term {
            state.log.set_term(seen_term);
            state.leader_of_term = None;
        }
        if *role == Role::Leader {
            *role = Role::Follower;
            pf_info!(
                "stepped down from leader of term {} (now term {})",
                from_term,
                state.log.curr_term()
            );
        }
        state.fail_pending();
    }

    /// Handler of AppendEntries from a (claimed) leader.
    pub async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, MetasyncError> {
        let mut role = self.role.write().await;
        let mut state = self.state.lock().await;

        // reachability overrides come before anything else
        if state.unreachable_from.get(args.leader_id) {
            pf_trace!("dropped AppendEntries from {}", args.leader_id);
            return Err(MetasyncError::Unreachable(format!(
                "{} drops calls from {}",
                self.id, args.leader_id
            )));
        }
        if *role == Role::Crashed {
            return Err(MetasyncError::ServerCrashed);
        }

        let my_term = state.log.curr_term();
        let reject = |term| AppendEntriesReply {
            term,
            success: false,
            matched_index: -1,
        };

        if args.term < my_term {
            pf_debug!(
                "rejected stale AppendEntries from {} term {} < {}",
                args.leader_id,
                args.term,
                my_term
            );
            return Ok(reject(my_term));
        }
        if args.term > my_term {
            state.log.set_term(args.term);
            state.leader_of_term = Some(args.leader_id);
            if *role == Role::Leader {
                *role = Role::Follower;
                state.fail_pending();
                pf_info!(
                    "demoted by {} at term {} -> {}",
                    args.leader_id,
                    my_term,
                    args.term
                );
            }
        } else {
            match state.leader_of_term {
                Some(leader) if leader != args.leader_id => {
                    pf_warn!(
                        "rejected rival leader {} in term {} (leader {})",
                        args.leader_id,
                        args.term,
                        leader
                    );
                    return Ok(reject(my_term));
                }
                Some(_) => {}
                None => state.leader_of_term = Some(args.leader_id),
            }
        }
        let term = state.log.curr_term();

        if !state.log.matches(args.prev_log_index, args.prev_log_term) {
            pf_trace!(
                "log mismatch at prev {} term {}",
                args.prev_log_index,
                args.prev_log_term
            );
            return Ok(reject(term));
        }

        let matched = match state.log.merge(args.prev_log_index, args.entries)
        {
            Ok(matched) => matched,
            Err(e) => {
                pf_warn!("refused entries from {}: {}", args.leader_id, e);
                return Ok(reject(term));
            }
        };

        // only what is known to match the leader may be committed
        state
            .log
            .commit_to(cmp::min(args.leader_commit, matched));
        state.execute_state_machine();

        Ok(AppendEntriesReply {
            term,
            success: true,
            matched_index: matched,
        })
    }

    /// Forces this node to become leader of a new term, then replicates a
    /// no-op entry of that term. Fails with `NotLeader` if no majority
    /// acknowledged it in time.
    pub async fn set_leader(&self) -> Result<(), MetasyncError> {
        {
            let mut role = self.role.write().await;
            check_role(*role, false)?;
            let mut state = self.state.lock().await;

            let term = state.log.curr_term() + 1;
            state.log.set_term(term);
            state.leader_of_term = Some(self.id);
            let log_len = state.log.len();
            state.reset_leader_state(log_len);
            state.log.append(LogEntry::noop(term));
            *role = Role::Leader;
            pf_info!("became leader of term {} (log len {})", term, log_len);
        }

        self.replicate_round().await
    }

    /// Runs one replication round carrying whatever the log holds.
    pub async fn send_heartbeat(&self) -> Result<(), MetasyncError> {
        self.check_status(true).await?;
        self.replicate_round().await
    }

    /// Appends a file update to the log, replicates it, and returns the
    /// version the metadata store reports once it is applied.
    pub async fn update_file(
        &self,
        meta: FileMetaData,
    ) -> Result<Version, MetasyncError> {
        let (index, mut rx_result) = {
            let role = self.role.read().await;
            check_role(*role, true)?;
            let mut state = self.state.lock().await;

            let term = state.log.curr_term();
            let index = state.log.append(LogEntry {
                term,
                operation: Some(meta),
            });
            let (tx, rx) = oneshot::channel();
            state.pending.insert(index, PendingSlot { term, tx });
            (index, rx)
        };
        pf_trace!("appended update at index {}", index);

        let round = self.replicate_round().await;
        match rx_result.try_recv() {
            Ok(result) => result,
            Err(_) => {
                round?;
                logged_err!("no apply result for index {} after round", index)
            }
        }
    }

    /// Snapshot of all file metadata, served after a confirming round.
    pub async fn get_file_info_map(
        &self,
    ) -> Result<FileInfoMap, MetasyncError> {
        self.check_status(true).await?;
        self.replicate_round().await?;
        Ok(self.state.lock().await.store.file_info_map())
    }

    /// Responsible block store for each given hash, served after a
    /// confirming round.
    pub async fn get_block_store_map(
        &self,
        hashes: &[String],
    ) -> Result<BlockStoreMap, MetasyncError> {
        self.check_status(true).await?;
        self.replicate_round().await?;
        Ok(self.state.lock().await.store.block_store_map(hashes))
    }

    /// Configured block store addresses, served after a confirming round.
    pub async fn get_block_store_addrs(
        &self,
    ) -> Result<Vec<String>, MetasyncError> {
        self.check_status(true).await?;
        self.replicate_round().await?;
        Ok(self.state.lock().await.store.block_store_addrs())
    }
}
