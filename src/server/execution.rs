//! Apply engine: feeds committed entries to the metadata store in log order
//! and resolves the clients waiting on them.

use crate::server::node::RaftState;
use crate::utils::MetasyncError;

impl RaftState {
    /// Applies every committed but not yet applied entry, in order, exactly
    /// once each. A waiting client gets the store's result only if the entry
    /// at its index is still the one it appended (same term); otherwise it
    /// gets `NotLeader`.
    pub(crate) fn execute_state_machine(&mut self) {
        while self.log.last_applied() < self.log.commit_index() {
            let index = match self.log.advance_applied() {
                Ok(index) => index,
                Err(e) => {
                    pf_error!("apply engine stuck: {}", e);
                    return;
                }
            };
            let Some(entry) = self.log.entry(index) else {
                pf_error!("committed index {} missing from log", index);
                return;
            };
            let term = entry.term;

            let result = match &entry.operation {
                Some(meta) => {
                    let result = self.store.update_file(meta);
                    pf_trace!("applied index {}: {:?}", index, result);
                    Some(result)
                }
                None => None, // no-op
            };

            if let Some(slot) = self.pending.remove(&index) {
                let reply = match result {
                    Some(result) if slot.term == term => result,
                    _ => Err(MetasyncError::NotLeader),
                };
                // client may have given up already
                let _ = slot.tx.send(reply);
            }
        }
    }

    /// Fails every waiting client with `NotLeader`.
    pub(crate) fn fail_pending(&mut self) {
        if !self.pending.is_empty() {
            pf_debug!("failing {} pending updates", self.pending.len());
        }
        for (_, slot) in self.pending.drain() {
            let _ = slot.tx.send(Err(MetasyncError::NotLeader));
        }
    }
}
