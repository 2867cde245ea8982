//! Replicated log store: entries plus term, commit, and applied indices.

use std::cmp;

use crate::server::{LogEntry, LogIndex, Term};
use crate::utils::MetasyncError;

/// Per-node replicated log. Invariant:
/// `last_applied <= commit_index < len()` (all start at -1 / empty).
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    /// Log entries, index 0 being the first real entry.
    entries: Vec<LogEntry>,

    /// Latest term this node has seen.
    curr_term: Term,

    /// Highest index known committed.
    commit_index: LogIndex,

    /// Highest index applied to the metadata store.
    last_applied: LogIndex,
}

impl RaftLog {
    /// Creates an empty log at term 0.
    pub fn new() -> Self {
        RaftLog {
            entries: vec![],
            curr_term: 0,
            commit_index: -1,
            last_applied: -1,
        }
    }

    #[inline]
    pub fn curr_term(&self) -> Term {
        self.curr_term
    }

    /// Sets current term. Terms never go backward.
    #[inline]
    pub fn set_term(&mut self, term: Term) {
        debug_assert!(term >= self.curr_term);
        self.curr_term = cmp::max(self.curr_term, term);
    }

    #[inline]
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    #[inline]
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Number of entries, as a log index type.
    #[inline]
    pub fn len(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry, -1 if the log is empty.
    #[inline]
    pub fn last_index(&self) -> LogIndex {
        self.len() - 1
    }

    /// Entry at given index, if present.
    #[inline]
    pub fn entry(&self, idx: LogIndex) -> Option<&LogEntry> {
        usize::try_from(idx).ok().and_then(|i| self.entries.get(i))
    }

    /// Term of the entry at given index. Index -1 has term 0.
    #[inline]
    pub fn term_at(&self, idx: LogIndex) -> Option<Term> {
        if idx == -1 {
            Some(0)
        } else {
            self.entry(idx).map(|e| e.term)
        }
    }

    /// All entries in order.
    #[inline]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Clones all entries starting at `start` through the log end.
    pub fn entries_from(&self, start: LogIndex) -> Vec<LogEntry> {
        let start = usize::try_from(cmp::max(start, 0)).unwrap_or(0);
        if start >= self.entries.len() {
            vec![]
        } else {
            self.entries[start..].to_vec()
        }
    }

    /// Appends an entry at the log end, returning its index.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.last_index()
    }

    /// Does the log contain an entry at `prev_index` whose term is
    /// `prev_term`? The empty prefix (`prev_index == -1`) always matches.
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        prev_index == -1 || self.term_at(prev_index) == Some(prev_term)
    }

    /// Merges `incoming` entries that follow `prev_index`. An existing entry
    /// whose term differs from the incoming one at the same index is removed
    /// together with everything after it; entries already present with the
    /// same term are kept untouched. Returns the index of the last incoming
    /// entry. Caller must have checked `matches()` first.
    pub fn merge(
        &mut self,
        prev_index: LogIndex,
        incoming: Vec<LogEntry>,
    ) -> Result<LogIndex, MetasyncError> {
        if prev_index < -1 || prev_index > self.last_index() {
            return Err(MetasyncError::LogMismatch);
        }
        let matched = prev_index + incoming.len() as LogIndex;

        let mut first_new = incoming.len();
        for (offset, entry) in incoming.iter().enumerate() {
            let idx = prev_index + 1 + offset as LogIndex;
            match self.term_at(idx) {
                None => {
                    first_new = offset;
                    break;
                }
                Some(term) if term != entry.term => {
                    if idx <= self.commit_index {
                        return Err(MetasyncError::msg(format!(
                            "conflict at committed index {} (commit {})",
                            idx, self.commit_index
                        )));
                    }
                    #[allow(clippy::cast_sign_loss)]
                    self.entries.truncate(idx as usize);
                    first_new = offset;
                    break;
                }
                Some(_) => {} // already have it
            }
        }

        self.entries.extend(incoming.into_iter().skip(first_new));
        Ok(matched)
    }

    /// Advances commit index to `min(idx, last_index())` if that is larger
    /// than the current one. Returns true if advanced.
    pub fn commit_to(&mut self, idx: LogIndex) -> bool {
        let new_commit = cmp::min(idx, self.last_index());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            true
        } else {
            false
        }
    }

    /// Marks the entry right after `last_applied` as applied.
    pub fn advance_applied(&mut self) -> Result<LogIndex, MetasyncError> {
        if self.last_applied >= self.commit_index {
            return Err(MetasyncError::msg(format!(
                "nothing to apply: applied {} commit {}",
                self.last_applied, self.commit_index
            )));
        }
        self.last_applied += 1;
        Ok(self.last_applied)
    }
}

#[cfg(test)]
mod raftlog_tests {
    use super::*;
    use crate::server::FileMetaData;

    fn op(term: Term, name: &str, version: i32) -> LogEntry {
        LogEntry {
            term,
            operation: Some(FileMetaData::new(name, version, vec![])),
        }
    }

    #[test]
    fn empty_log() {
        let log = RaftLog::new();
        assert_eq!(log.len(), 0);
        assert_eq!(log.last_index(), -1);
        assert_eq!(log.commit_index(), -1);
        assert_eq!(log.last_applied(), -1);
        assert!(log.matches(-1, 0));
        assert!(!log.matches(0, 1));
        assert!(log.entries_from(0).is_empty());
    }

    #[test]
    fn match_prev_entry() {
        let mut log = RaftLog::new();
        log.append(LogEntry::noop(1));
        log.append(op(1, "a", 1));
        log.append(op(2, "b", 1));
        assert!(log.matches(1, 1));
        assert!(log.matches(2, 2));
        assert!(!log.matches(2, 1));
        assert!(!log.matches(3, 2)); // beyond log end
        assert_eq!(log.entries_from(1).len(), 2);
    }

    #[test]
    fn merge_append_new() -> Result<(), MetasyncError> {
        let mut log = RaftLog::new();
        let matched = log.merge(-1, vec![LogEntry::noop(1), op(1, "a", 1)])?;
        assert_eq!(matched, 1);
        assert_eq!(log.len(), 2);
        // heartbeat with no entries matches prev only
        assert_eq!(log.merge(1, vec![])?, 1);
        assert_eq!(log.len(), 2);
        Ok(())
    }

    #[test]
    fn merge_duplicate_keeps_tail() -> Result<(), MetasyncError> {
        let mut log = RaftLog::new();
        log.merge(-1, vec![LogEntry::noop(1), op(1, "a", 1), op(1, "b", 1)])?;
        // a delayed, shorter AppendEntries must not chop off the tail
        let matched = log.merge(-1, vec![LogEntry::noop(1)])?;
        assert_eq!(matched, 0);
        assert_eq!(log.len(), 3);
        Ok(())
    }

    #[test]
    fn merge_conflict_truncates() -> Result<(), MetasyncError> {
        let mut log = RaftLog::new();
        log.merge(-1, vec![LogEntry::noop(1), op(1, "a", 1), op(1, "b", 1)])?;
        log.commit_to(0);
        let matched = log.merge(0, vec![LogEntry::noop(2)])?;
        assert_eq!(matched, 1);
        assert_eq!(log.len(), 2);
        assert_eq!(log.entry(1), Some(&LogEntry::noop(2)));
        Ok(())
    }

    #[test]
    fn merge_refuses_committed_conflict() -> Result<(), MetasyncError> {
        let mut log = RaftLog::new();
        log.merge(-1, vec![LogEntry::noop(1), op(1, "a", 1)])?;
        log.commit_to(1);
        assert!(log.merge(0, vec![LogEntry::noop(2)]).is_err());
        assert_eq!(log.len(), 2);
        Ok(())
    }

    #[test]
    fn commit_and_apply() -> Result<(), MetasyncError> {
        let mut log = RaftLog::new();
        log.append(LogEntry::noop(1));
        log.append(op(1, "a", 1));
        assert!(log.commit_to(5)); // clamped to last index
        assert_eq!(log.commit_index(), 1);
        assert!(!log.commit_to(0)); // never goes backward
        assert_eq!(log.advance_applied()?, 0);
        assert_eq!(log.advance_applied()?, 1);
        assert!(log.advance_applied().is_err());
        Ok(())
    }

    #[test]
    fn set_term_forward() {
        let mut log = RaftLog::new();
        log.set_term(3);
        log.set_term(3);
        assert_eq!(log.curr_term(), 3);
    }
}
