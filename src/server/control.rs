//! Fault-injection controls and the observation-only state snapshot.

use crate::server::{InternalState, RaftNode, ReplicaId, Role};
use crate::utils::MetasyncError;

impl RaftNode {
    /// Enters simulated-crash mode: every subsequent request except
    /// `restore` and `internal_state` fails with `ServerCrashed`. Log and
    /// store are kept. Waiting clients are failed with `NotLeader`.
    pub async fn crash(&self) {
        let mut role = self.role.write().await;
        let mut state = self.state.lock().await;
        if *role != Role::Crashed {
            pf_warn!(
                "crashing (was {} of term {})",
                *role,
                state.log.curr_term()
            );
        }
        *role = Role::Crashed;
        state.fail_pending();
    }

    /// Leaves crash mode as a follower and clears reachability overrides.
    /// Idempotent.
    pub async fn restore(&self) {
        let mut role = self.role.write().await;
        let mut state = self.state.lock().await;
        pf_warn!("restored as follower (was {})", *role);
        *role = Role::Follower;
        state.unreachable_from.clear();
        state.fail_pending();
    }

    /// Drops inbound calls from the given peers, in addition to those
    /// already dropped. An empty list clears all overrides.
    pub async fn make_unreachable_from(
        &self,
        server_ids: &[ReplicaId],
    ) -> Result<(), MetasyncError> {
        let mut state = self.state.lock().await;
        if server_ids.is_empty() {
            state.unreachable_from.clear();
            pf_warn!("reachable from everyone");
            return Ok(());
        }

        for &id in server_ids {
            if id >= self.population {
                return logged_err!("invalid server ID {} to drop", id);
            }
        }
        for &id in server_ids {
            state.unreachable_from.set(id, true)?;
        }
        pf_warn!(
            "unreachable from {:?}",
            state.unreachable_from.ones()
        );
        Ok(())
    }

    /// Peers whose inbound calls are currently dropped.
    pub async fn unreachable_from(&self) -> Vec<ReplicaId> {
        self.state.lock().await.unreachable_from.ones()
    }

    /// Snapshot of role, term, commit index, log, and applied metadata.
    /// Served regardless of role.
    pub async fn internal_state(&self) -> InternalState {
        let role = self.role.read().await;
        let state = self.state.lock().await;
        InternalState {
            role: *role,
            term: state.log.curr_term(),
            commit_index: state.log.commit_index(),
            log: state.log.entries().to_vec(),
            meta_map: state.store.file_info_map(),
        }
    }
}
