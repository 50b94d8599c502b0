//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via raft-storage
//! what: LogEntry struct, Log container with a sentinel at index 0, conflict lookups

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// The replicated log.
///
/// Position 0 always holds a sentinel entry with term 0, so `prev_log_index = 0`
/// is matched by every log and real entries start at index 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// create an empty log holding only the sentinel
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry::new(0, 0, Vec::new())],
        }
    }

    /// rebuild a log from persisted entries (without sentinel)
    ///
    /// entries are re-indexed by position so a hand-edited file can't break
    /// the `entries[i].index == i` invariant.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        let mut log = Self::new();
        for (offset, mut entry) in entries.into_iter().enumerate() {
            entry.index = offset as u64 + 1;
            log.entries.push(entry);
        }
        log
    }

    /// index of the last entry, 0 for an empty log
    pub fn last_index(&self) -> u64 {
        (self.entries.len() - 1) as u64
    }

    /// term of the last entry, 0 for an empty log
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// number of real entries
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// entry at `index`; the sentinel is not returned
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    /// term at `index`; index 0 has term 0
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entries.get(index as usize).map(|e| e.term)
    }

    /// clone of every entry from `index` (inclusive) to the end
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let start = index.max(1) as usize;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].to_vec()
    }

    /// entries in `(after, through]`
    pub fn slice(&self, after: u64, through: u64) -> Vec<LogEntry> {
        let start = (after + 1) as usize;
        let end = (through as usize + 1).min(self.entries.len());
        if start >= end {
            return Vec::new();
        }
        self.entries[start..end].to_vec()
    }

    /// append a command in `term`, returning its index
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry::new(term, index, command));
        index
    }

    /// drop every entry with index >= `index`; the sentinel is never dropped
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.max(1) as usize;
        self.entries.truncate(keep);
    }

    /// merge a leader's batch that starts right after `prev_log_index`.
    ///
    /// entries already present with the same term are kept; the log is only
    /// truncated at the first index whose term differs. returns true if the
    /// log changed.
    pub fn merge(&mut self, prev_log_index: u64, batch: &[LogEntry]) -> bool {
        let mut changed = false;
        for (offset, entry) in batch.iter().enumerate() {
            let index = prev_log_index + 1 + offset as u64;
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(index);
                    changed = true;
                }
                None => {}
            }
            self.entries.push(LogEntry::new(entry.term, index, entry.command.clone()));
            changed = true;
        }
        changed
    }

    /// first index holding `term`, scanning back from `from`
    pub fn first_index_of_term(&self, term: u64, from: u64) -> u64 {
        let mut index = from.min(self.last_index());
        while index > 1 && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    /// last index holding `term`, if any
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .take_while(|e| e.term >= term)
            .find(|e| e.term == term && e.index > 0)
            .map(|e| e.index)
    }

    /// real entries, sentinel excluded
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries[1..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[u64]) -> Log {
        let mut log = Log::new();
        for &t in terms {
            log.append(t, vec![t as u8]);
        }
        log
    }

    #[test]
    fn empty_log_has_sentinel_only() {
        let log = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert!(log.get(0).is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn from_entries_reindexes() {
        let log = Log::from_entries(vec![
            LogEntry::new(1, 7, vec![]),
            LogEntry::new(2, 9, vec![]),
        ]);
        assert_eq!(log.get(1).unwrap().index, 1);
        assert_eq!(log.get(2).unwrap().index, 2);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn merge_keeps_matching_prefix() {
        let mut log = log_with_terms(&[1, 1, 2]);
        // a stale, shorter batch must not truncate index 3
        let changed = log.merge(
            0,
            &[LogEntry::new(1, 1, vec![1]), LogEntry::new(1, 2, vec![1])],
        );
        assert!(!changed);
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn merge_truncates_at_conflict() {
        let mut log = log_with_terms(&[1, 1, 1, 1]);
        let changed = log.merge(
            1,
            &[LogEntry::new(1, 2, vec![1]), LogEntry::new(3, 3, vec![9])],
        );
        assert!(changed);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(3));
        assert_eq!(log.get(3).unwrap().command, vec![9]);
    }

    #[test]
    fn conflict_lookups() {
        let log = log_with_terms(&[1, 2, 2, 2, 3]);
        assert_eq!(log.first_index_of_term(2, 4), 2);
        assert_eq!(log.first_index_of_term(3, 5), 5);
        assert_eq!(log.last_index_of_term(2), Some(4));
        assert_eq!(log.last_index_of_term(5), None);
    }

    #[test]
    fn slice_bounds() {
        let log = log_with_terms(&[1, 1, 1]);
        assert_eq!(log.slice(0, 2).len(), 2);
        assert_eq!(log.slice(1, 10).len(), 2);
        assert!(log.slice(3, 3).is_empty());
    }
}
