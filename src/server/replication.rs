//! Replication coordinator: drives rounds of AppendEntries until a majority
//! holds the leader's log tail, backing off per peer on mismatches.

use std::cmp;

use crate::server::node::check_role;
use crate::server::{
    AppendEntriesArgs, LogIndex, RaftNode, ReplicaId, Role, Term,
};
use crate::utils::{MetasyncError, ReplicaMap};

use futures::future::join_all;

use rand::prelude::*;

use tokio::time::{self, Duration, Instant};

/// What one attempt learned about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerOutcome {
    /// Peer answered in this attempt and its log matches mine up to the
    /// given index.
    Matched(LogIndex),

    /// Peer did not answer usefully this time.
    NoResponse,

    /// Peer knows a newer term.
    HigherTerm(Term),
}

impl RaftNode {
    /// Runs one replication round targeting the log's last index as of the
    /// round's start. Every attempt concurrently contacts the peers that have
    /// not acknowledged yet. Returns `Ok` once a majority (counting myself)
    /// acknowledged the target within this round, after committing and
    /// applying up to it. Matches remembered from earlier rounds do not
    /// count. Fails with `NotLeader` if leadership is lost or no majority is
    /// reached before the round's deadline; the node is demoted in the
    /// latter case.
    pub(crate) async fn replicate_round(&self) -> Result<(), MetasyncError> {
        let (term, target) = {
            let role = self.role.read().await;
            check_role(*role, true).map_err(|_| MetasyncError::NotLeader)?;
            let state = self.state.lock().await;
            (state.log.curr_term(), state.log.last_index())
        };
        let deadline = Instant::now()
            + Duration::from_millis(self.config.round_timeout_ms);
        let mut acked = ReplicaMap::new(self.population, false)?;
        acked.set(self.id, true)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let pending: Vec<ReplicaId> = (0..self.population)
                .filter(|&p| !acked.get(p))
                .collect();
            let outcomes = join_all(
                pending
                    .iter()
                    .map(|&peer| self.replicate_to_peer(peer, term, deadline)),
            )
            .await;

            let mut seen_term = None;
            for (&peer, outcome) in pending.iter().zip(&outcomes) {
                match *outcome {
                    PeerOutcome::Matched(matched) if matched >= target => {
                        acked.set(peer, true)?;
                    }
                    PeerOutcome::HigherTerm(t) => {
                        seen_term = cmp::max(seen_term, Some(t));
                    }
                    _ => {}
                }
            }
            if let Some(seen_term) = seen_term {
                self.step_down(term, seen_term).await;
                return Err(MetasyncError::NotLeader);
            }

            {
                let role = self.role.read().await;
                let mut state = self.state.lock().await;
                if *role != Role::Leader || state.log.curr_term() != term {
                    return Err(MetasyncError::NotLeader);
                }

                let acks = acked.count();
                if acks >= self.quorum_cnt {
                    if state.log.commit_to(target) {
                        pf_debug!(
                            "committed up to {} in term {} (attempt {})",
                            target,
                            term,
                            attempt
                        );
                    }
                    state.execute_state_machine();
                    return Ok(());
                }
                pf_trace!(
                    "attempt {} for {} got {}/{} acks {:?}",
                    attempt,
                    target,
                    acks,
                    self.quorum_cnt,
                    acked
                );
            }

            if Instant::now() >= deadline {
                pf_warn!(
                    "no majority for index {} in term {} after {} attempts",
                    target,
                    term,
                    attempt
                );
                self.step_down(term, term).await;
                return Err(MetasyncError::NotLeader);
            }

            let jitter =
                thread_rng().gen_range(0..=self.config.retry_interval_ms);
            time::sleep(Duration::from_millis(
                self.config.retry_interval_ms + jitter,
            ))
            .await;
        }
    }

    /// Sends AppendEntries to one peer, stepping its next index back one at
    /// a time on mismatch and retrying right away, until the peer matches,
    /// stops answering, or backing off runs past the log start. Gives up as
    /// soon as I am no longer leader of `term`.
    async fn replicate_to_peer(
        &self,
        peer: ReplicaId,
        term: Term,
        deadline: Instant,
    ) -> PeerOutcome {
        let p = peer as usize;
        loop {
            let args = {
                let role = self.role.read().await;
                let state = self.state.lock().await;
                if *role != Role::Leader || state.log.curr_term() != term {
                    return PeerOutcome::NoResponse;
                }
                let next = cmp::min(state.next_index[p], state.log.len());
                let prev_log_index = next - 1;
                let Some(prev_log_term) = state.log.term_at(prev_log_index)
                else {
                    return PeerOutcome::NoResponse;
                };
                AppendEntriesArgs {
                    term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    entries: state.log.entries_from(next),
                    leader_commit: state.log.commit_index(),
                }
            };
            let sent_prev = args.prev_log_index;

            let reply = match self.transport.append_entries(peer, args).await {
                Ok(reply) => reply,
                Err(_) => return PeerOutcome::NoResponse,
            };
            if reply.term > term {
                return PeerOutcome::HigherTerm(reply.term);
            }

            let role = self.role.read().await;
            let mut state = self.state.lock().await;
            if *role != Role::Leader || state.log.curr_term() != term {
                return PeerOutcome::NoResponse;
            }
            if reply.success {
                state.match_index[p] =
                    cmp::max(state.match_index[p], reply.matched_index);
                state.next_index[p] = reply.matched_index + 1;
                return PeerOutcome::Matched(reply.matched_index);
            }

            if sent_prev < 0 || Instant::now() >= deadline {
                return PeerOutcome::NoResponse;
            }
            state.next_index[p] = sent_prev;
            pf_trace!("peer {} mismatched at {}, backing off", peer, sent_prev);
        }
    }
}

#[cfg(test)]
mod replication_tests {
    use super::*;
    use crate::client::RpcStub;
    use crate::server::test_helpers::{TestCluster, TEST_CONFIG};
    use crate::server::{
        AppendEntriesReply, FileMetaData, InternalState, LogEntry,
        MemMetaStore, RaftTransport, ReplicaConfigRaft,
    };

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    /// Transport whose peers answer slowly and never match.
    struct RejectingTransport {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RaftTransport for RejectingTransport {
        async fn append_entries(
            &self,
            _peer: ReplicaId,
            args: AppendEntriesArgs,
        ) -> Result<AppendEntriesReply, MetasyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            time::sleep(Duration::from_millis(50)).await;
            Ok(AppendEntriesReply {
                term: args.term,
                success: false,
                matched_index: -1,
            })
        }
    }

    fn stubs(cluster: &TestCluster) -> Vec<RpcStub> {
        cluster
            .addrs
            .iter()
            .map(|&addr| RpcStub::new(addr, Duration::from_secs(10)))
            .collect()
    }

    async fn states(
        stubs: &mut [RpcStub],
    ) -> Result<Vec<InternalState>, MetasyncError> {
        let mut states = vec![];
        for stub in stubs.iter_mut() {
            states.push(stub.get_internal_state().await?);
        }
        Ok(states)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn leader_accession() -> Result<(), MetasyncError> {
        let cluster = TestCluster::launch(52100, 3, Some(TEST_CONFIG)).await?;
        let mut stubs = stubs(&cluster);
        assert!(stubs[0].set_leader().await?);
        assert!(stubs[0].send_heartbeat().await?);
        for (id, state) in states(&mut stubs).await?.into_iter().enumerate() {
            assert_eq!(
                state.role,
                if id == 0 { Role::Leader } else { Role::Follower }
            );
            assert_eq!(state.term, 1);
            assert_eq!(state.commit_index, 0);
            assert_eq!(state.log, vec![LogEntry::noop(1)]);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn committed_update() -> Result<(), MetasyncError> {
        let cluster = TestCluster::launch(52110, 3, Some(TEST_CONFIG)).await?;
        let mut stubs = stubs(&cluster);
        assert!(stubs[0].set_leader().await?);
        let meta = FileMetaData::new("f1", 1, vec!["h1".into(), "h2".into()]);
        assert_eq!(stubs[0].update_file(meta.clone()).await?, 1);
        assert_eq!(
            stubs[1].update_file(FileMetaData::new("f1", 2, vec![])).await,
            Err(MetasyncError::NotLeader)
        );
        assert!(stubs[0].send_heartbeat().await?);
        for state in states(&mut stubs).await? {
            assert_eq!(state.commit_index, 1);
            assert_eq!(state.meta_map.get("f1"), Some(&meta));
        }
        assert_eq!(stubs[0].get_file_info_map().await?["f1"], meta);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn divergent_tail_overwritten() -> Result<(), MetasyncError> {
        let cluster = TestCluster::launch(52120, 3, Some(TEST_CONFIG)).await?;
        let mut stubs = stubs(&cluster);
        assert!(stubs[0].set_leader().await?);

        // cut the leader off; its update stays uncommitted in its own log
        for stub in &mut stubs[1..] {
            assert!(stub.make_server_unreachable_from(vec![0]).await?);
        }
        assert_eq!(
            stubs[0].update_file(FileMetaData::new("f1", 1, vec![])).await,
            Err(MetasyncError::NotLeader)
        );
        let old = stubs[0].get_internal_state().await?;
        assert_eq!(old.role, Role::Follower);
        assert_eq!(old.log.len(), 2);

        assert!(stubs[0].crash().await?);
        for stub in &mut stubs[1..] {
            assert!(stub.make_server_unreachable_from(vec![]).await?);
        }
        assert!(stubs[1].set_leader().await?);
        assert!(stubs[1].send_heartbeat().await?);
        assert!(stubs[0].restore().await?);
        assert!(stubs[1].send_heartbeat().await?);

        let expected = vec![LogEntry::noop(1), LogEntry::noop(2)];
        for state in states(&mut stubs).await? {
            assert_eq!(state.term, 2);
            assert_eq!(state.log, expected);
            assert_eq!(state.commit_index, 1);
            assert!(state.meta_map.is_empty());
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn partitioned_leader() -> Result<(), MetasyncError> {
        let cluster = TestCluster::launch(52130, 5, Some(TEST_CONFIG)).await?;
        let mut stubs = stubs(&cluster);
        assert!(stubs[0].set_leader().await?);

        // 2 of 4 followers unreachable: self + 2 is still a majority
        for stub in &mut stubs[1..3] {
            assert!(stub.make_server_unreachable_from(vec![0]).await?);
        }
        assert!(stubs[0].send_heartbeat().await?);

        // 3 of 4: not anymore
        assert!(stubs[3].make_server_unreachable_from(vec![0]).await?);
        assert_eq!(
            stubs[0].send_heartbeat().await,
            Err(MetasyncError::NotLeader)
        );
        assert_eq!(
            stubs[0].get_internal_state().await?.role,
            Role::Follower
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn majority_gate() -> Result<(), MetasyncError> {
        let cluster = TestCluster::launch(52140, 5, Some(TEST_CONFIG)).await?;
        let mut stubs = stubs(&cluster);
        assert!(stubs[0].set_leader().await?);

        assert!(stubs[3].crash().await?);
        assert!(stubs[4].crash().await?);
        assert_eq!(
            stubs[0].update_file(FileMetaData::new("f", 1, vec![])).await?,
            1
        );

        assert!(stubs[2].crash().await?);
        assert_eq!(
            stubs[0].update_file(FileMetaData::new("f", 2, vec![])).await,
            Err(MetasyncError::NotLeader)
        );
        let state = stubs[0].get_internal_state().await?;
        assert_eq!(state.commit_index, 1);
        assert_eq!(state.meta_map["f"].version, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn heartbeat_needs_live_majority() -> Result<(), MetasyncError> {
        let cluster = TestCluster::launch(52170, 5, Some(TEST_CONFIG)).await?;
        let mut stubs = stubs(&cluster);
        assert!(stubs[0].set_leader().await?);
        assert!(stubs[0].send_heartbeat().await?);

        // every follower already matched the tail in earlier rounds
        for stub in &mut stubs[2..] {
            assert!(stub.crash().await?);
        }
        assert_eq!(
            stubs[0].send_heartbeat().await,
            Err(MetasyncError::NotLeader)
        );
        assert_eq!(
            stubs[0].get_internal_state().await?.role,
            Role::Follower
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn isolated_leader_refuses_reads() -> Result<(), MetasyncError> {
        let cluster = TestCluster::launch(52180, 3, Some(TEST_CONFIG)).await?;
        let mut stubs = stubs(&cluster);
        assert!(stubs[0].set_leader().await?);

        // cut node 0 off in both directions
        assert!(stubs[0].make_server_unreachable_from(vec![1, 2]).await?);
        for stub in &mut stubs[1..] {
            assert!(stub.make_server_unreachable_from(vec![0]).await?);
        }
        assert!(stubs[1].set_leader().await?);
        assert_eq!(
            stubs[1].update_file(FileMetaData::new("f1", 1, vec![])).await?,
            1
        );

        assert_eq!(
            stubs[0].send_heartbeat().await,
            Err(MetasyncError::NotLeader)
        );
        assert_eq!(
            stubs[0].get_file_info_map().await,
            Err(MetasyncError::NotLeader)
        );
        let state = stubs[0].get_internal_state().await?;
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.term, 1);
        assert!(state.meta_map.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn higher_term_demotes_leader() -> Result<(), MetasyncError> {
        let cluster = TestCluster::launch(52190, 3, Some(TEST_CONFIG)).await?;
        let mut stubs = stubs(&cluster);
        assert!(stubs[0].set_leader().await?);

        // node 0 misses node 1 taking over term 2
        assert!(stubs[0].make_server_unreachable_from(vec![1]).await?);
        assert!(stubs[1].set_leader().await?);

        assert_eq!(
            stubs[0].update_file(FileMetaData::new("f1", 1, vec![])).await,
            Err(MetasyncError::NotLeader)
        );
        let state = stubs[0].get_internal_state().await?;
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.term, 2);
        assert_eq!(state.commit_index, 0);
        assert!(state.meta_map.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crash_stops_backoff() -> Result<(), MetasyncError> {
        let calls = Arc::new(AtomicUsize::new(0));
        let node = Arc::new(RaftNode::new(
            0,
            2,
            ReplicaConfigRaft {
                rpc_timeout_ms: 100,
                round_timeout_ms: 3000,
                retry_interval_ms: 5,
            },
            Box::new(MemMetaStore::new(vec!["127.0.0.1:9090".into()])),
            Box::new(RejectingTransport {
                calls: calls.clone(),
            }),
        )?);

        // a long log to back off over, received as a follower
        let reply = node
            .append_entries(AppendEntriesArgs {
                term: 1,
                leader_id: 1,
                prev_log_index: -1,
                prev_log_term: 0,
                entries: vec![LogEntry::noop(1); 30],
                leader_commit: -1,
            })
            .await?;
        assert!(reply.success);

        let leader = node.clone();
        let round = tokio::spawn(async move { leader.set_leader().await });
        time::sleep(Duration::from_millis(120)).await;
        node.crash().await;

        assert!(round.await.unwrap().is_err());
        // at most the call in flight when crashing completes after it
        assert!(calls.load(Ordering::SeqCst) <= 4);
        assert_eq!(node.role().await, Role::Crashed);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn logs_agree_across_leaders() -> Result<(), MetasyncError> {
        let cluster = TestCluster::launch(52150, 3, Some(TEST_CONFIG)).await?;
        let mut stubs = stubs(&cluster);

        let mut version = 0;
        for leader in [0, 1, 2, 0] {
            assert!(stubs[leader].set_leader().await?);
            for _ in 0..2 {
                version += 1;
                let meta = FileMetaData::new("doc", version, vec![]);
                assert_eq!(stubs[leader].update_file(meta).await?, version);
            }
            // the new leader holds every committed update
            let state = stubs[leader].get_internal_state().await?;
            assert_eq!(state.meta_map["doc"].version, version);
        }
        assert!(stubs[0].send_heartbeat().await?);

        let states = states(&mut stubs).await?;
        for state in &states[1..] {
            assert_eq!(state.log, states[0].log);
            assert_eq!(state.commit_index, states[0].commit_index);
            assert_eq!(state.meta_map, states[0].meta_map);
        }
        // 4 no-ops and 8 updates
        assert_eq!(states[0].log.len(), 12);
        assert_eq!(states[0].term, 4);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates() -> Result<(), MetasyncError> {
        let cluster = TestCluster::launch(52160, 3, Some(TEST_CONFIG)).await?;
        let mut stubs = stubs(&cluster);
        assert!(stubs[0].set_leader().await?);

        let leader = cluster.nodes[0].clone();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let leader = leader.clone();
                tokio::spawn(async move {
                    let meta = FileMetaData::new(format!("f{}", i), 1, vec![]);
                    leader.update_file(meta).await
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap()?, 1);
        }
        assert_eq!(stubs[0].get_file_info_map().await?.len(), 8);
        Ok(())
    }
}
