use super::{Member, NodeID, Term};
use crate::encoding::{self, bincode, Key as _, Value as _};
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A client session ID. Sessions are identified by the index of the log entry
/// that opened them, which is unique and allocated atomically with the log.
pub type SessionID = u64;

/// A per-session command sequence number, allocated by the client proxy.
/// Commands are applied in strict sequence order, exactly once.
pub type Sequence = u64;

/// The read consistency level of a session's queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Queries are served from the leader's last-applied state without a
    /// quorum round-trip, and may return slightly stale results.
    Sequential,
    /// Queries are committed to the log as Query entries, and their result is
    /// only released once the entry commits. They reflect all commands
    /// committed before the query was issued.
    Linearizable,
    /// Like Linearizable, but the quorum round-trip is skipped while the
    /// leader holds a lease (a quorum has confirmed it within the election
    /// timeout window, so no other leader can exist yet).
    LinearizableLease,
}

/// A state machine command, carried in a log entry. Commands are created by
/// the leader, replicated, committed, and applied in index order on every
/// node. Session and membership operations are ordinary commands and flow
/// through the same commit pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// An empty marker appended by a new leader at the start of its term.
    /// Committing it commits all entries from previous terms, see section
    /// 5.4.2 in the Raft paper.
    Initialize,
    /// A client mutation, dispatched to a service operation.
    Command { session: SessionID, sequence: Sequence, operation: String, payload: Vec<u8> },
    /// A logged read-only query. The sequence number is the session's current
    /// command sequence: the query is only executed once all commands up to
    /// it have been applied, and doesn't advance the sequence itself.
    Query { session: SessionID, sequence: Sequence, operation: String, payload: Vec<u8> },
    /// Opens a client session against a named service instance.
    OpenSession {
        /// An identifier for the opening client, e.g. a UUID.
        client: String,
        /// The service instance name.
        service: String,
        /// The service type, resolved against the registry.
        service_type: String,
        /// The session's read consistency level.
        consistency: Consistency,
        /// The session timeout in milliseconds.
        timeout: u64,
    },
    /// Renews a session, and acknowledges responses the client has received.
    KeepAlive {
        session: SessionID,
        /// The highest command sequence the client has a response for. The
        /// dedup cache can release results at or below it.
        command_sequence: Sequence,
        /// The highest event index the client has received. Retained for
        /// session event delivery.
        event_ack: Index,
    },
    /// Closes a session, releasing all its state. Expired is true when the
    /// leader closed the session because its timeout lapsed.
    CloseSession { session: SessionID, expired: bool },
    /// Replaces the cluster configuration, once committed.
    Configuration { members: Vec<Member> },
    /// A logged metadata read, acting as a commit barrier: the response is
    /// built when the entry applies, and reflects all prior committed
    /// configuration changes.
    Metadata,
}

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The leader's wall clock time when the entry was appended, in
    /// milliseconds since the Unix epoch. Used to evaluate session timeouts
    /// deterministically on every node.
    pub timestamp: u64,
    /// The state machine command.
    pub command: Command,
}

impl encoding::Value for Entry {}

/// A point-in-time snapshot of the service state at an applied index. It
/// subsumes and replaces the log prefix up to and including its index, and is
/// used both for log compaction and to fast-forward lagging followers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The last log index the snapshot includes.
    pub index: Index,
    /// The term of the entry at the snapshot index.
    pub term: Term,
    /// The cluster configuration as of the snapshot index. Needed since the
    /// Configuration entries themselves may have been compacted away.
    pub members: Vec<Member>,
    /// The serialized service executor state (services and sessions).
    pub data: Vec<u8>,
}

impl encoding::Value for Snapshot {}

/// A log storage key.
#[derive(Debug, Deserialize, Serialize)]
pub enum Key {
    /// A log entry, keyed by index.
    Entry(Index),
    /// Stores the current term and vote (if any).
    TermVote,
    /// Stores the current commit index (if any).
    CommitIndex,
    /// Stores the current snapshot (if any).
    Snapshot,
}

impl encoding::Key<'_> for Key {}

/// Returns the current wall clock time in milliseconds since the Unix epoch.
pub(super) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|t| t.as_millis() as u64)
        .expect("system clock before Unix epoch")
}

/// The Raft log stores the replicated sequence of state machine commands,
/// along with a few metadata keys (term/vote, commit index, snapshot). It
/// is persisted in a key/value storage engine, keyed by index.
///
/// In the steady state the log is append-only: the leader appends commands
/// (via [`Log::append`]) and replicates them to followers, who append them to
/// their own logs (via [`Log::splice`]). Once replicated to a quorum an index
/// is committed (via [`Log::commit`]), making the log immutable up to that
/// index. Uncommitted entries may still be replaced if a new leader writes
/// different commands to the same indexes.
///
/// Entries below a snapshot are compacted away (via [`Log::compact`]), and
/// the whole log can be replaced by a snapshot received from the leader when
/// this node has fallen behind the leader's compaction point (via
/// [`Log::reset`]).
///
/// The Raft log has the following invariants:
///
/// * Entry indexes are contiguous starting at 1 (no index gaps).
/// * Entry terms never decrease from the previous entry.
/// * Entry terms are at or below the current term.
/// * Appended entries are durable (flushed to disk).
/// * Appended entries use the current term.
/// * Committed entries are never changed or removed.
/// * Committed entries will eventually be replicated to all nodes.
/// * Entries with the same index/term contain the same command.
/// * If two logs contain a matching index/term, all previous entries
///   are identical (see section 5.3 in the Raft paper).
pub struct Log {
    /// The underlying storage engine. Uses a trait object instead of
    /// generics, to allow runtime selection of the engine and avoid
    /// propagating the generic type parameters throughout Raft.
    pub(super) engine: Box<dyn crate::storage::Engine>,
    /// The current term.
    term: Term,
    /// Our leader vote in the current term, if any.
    vote: Option<NodeID>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
    /// The index and term of the current snapshot, if any. Entries at or
    /// below it have been compacted away.
    snapshot: Option<(Index, Term)>,
}

impl Log {
    /// Initializes a log using the given storage engine.
    pub fn new(mut engine: Box<dyn crate::storage::Engine>) -> Result<Self> {
        use std::ops::Bound::Included;
        let (term, vote) = engine
            .get(&Key::TermVote.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        let snapshot = engine
            .get(&Key::Snapshot.encode())?
            .map(|v| Snapshot::decode(&v))
            .transpose()?
            .map(|s| (s.index, s.term));
        let (last_index, last_term) = engine
            .scan_dyn((Included(Key::Entry(0).encode()), Included(Key::Entry(u64::MAX).encode())))
            .last()
            .transpose()?
            .map(|(_, v)| Entry::decode(&v))
            .transpose()?
            .map(|e| (e.index, e.term))
            .unwrap_or(snapshot.unwrap_or((0, 0)));
        let (commit_index, commit_term) = engine
            .get(&Key::CommitIndex.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or(snapshot.unwrap_or((0, 0)));
        Ok(Self { engine, term, vote, last_index, last_term, commit_index, commit_term, snapshot })
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote)
    }

    /// Returns the first index still present in the log. Entries below it
    /// have been compacted into the snapshot.
    pub fn first_index(&self) -> Index {
        self.snapshot.map(|(index, _)| index + 1).unwrap_or(1)
    }

    /// Returns the index and term of the current snapshot, if any.
    pub fn snapshot_index(&self) -> Option<(Index, Term)> {
        self.snapshot
    }

    /// Stores the current term and cast vote (if any). Enforces that the term
    /// does not regress, and that we only vote for one node in a term.
    /// append() will use this term, and splice() can't write entries beyond
    /// it.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.engine.set(&Key::TermVote.encode(), bincode::serialize(&(term, vote)))?;
        self.engine.flush()?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends a command to the log at the current term, stamping it with the
    /// local wall clock, and flushes it to disk, returning its index.
    pub fn append(&mut self, command: Command) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = Entry {
            index: self.last_index + 1,
            term: self.term,
            timestamp: now_millis(),
            command,
        };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        self.engine.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        let term = match self.get(index)? {
            Some(e) if e.index < self.commit_index => {
                panic!("commit index regression {} → {}", self.commit_index, e.index);
            }
            Some(e) if e.index == self.commit_index => return Ok(index),
            Some(e) => e.term,
            None => panic!("commit index {index} does not exist"),
        };
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, term)))?;
        // NB: the commit index doesn't need to be fsynced, since the entries
        // are fsynced and the commit index can be recovered from a log quorum.
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist or has
    /// been compacted away.
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        self.engine.get(&Key::Entry(index).encode())?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Checks if the log contains an entry with the given index and term.
    /// Compacted entries are covered by the snapshot: they are committed, so
    /// an index below the snapshot is considered present.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        if index == 0 || index > self.last_index {
            return Ok(false);
        }
        if let Some((snapshot_index, snapshot_term)) = self.snapshot {
            if index < snapshot_index {
                return Ok(true);
            }
            if index == snapshot_index {
                return Ok(term == snapshot_term);
            }
        }
        // Fast path: check against last_index. This is the common case when
        // followers process appends or heartbeats.
        if (index, term) == (self.last_index, self.last_term) {
            return Ok(true);
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Returns an iterator over log entries in the given index range.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Iterator {
        use std::ops::Bound;
        let from = match range.start_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(0).encode()),
        };
        let to = match range.end_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()),
        };
        Iterator::new(self.engine.scan_dyn((from, to)))
    }

    /// Returns an iterator over entries that are ready to apply, starting
    /// after the current applied index up to the commit index. The applied
    /// index must not precede the compaction point: a node whose state lags
    /// the snapshot must install the snapshot first.
    pub fn scan_apply(&mut self, applied_index: Index) -> Iterator {
        // NB: we don't assert that commit_index >= applied_index, because the
        // local commit index is not flushed to durable storage -- if lost on
        // restart, it can be recovered from a quorum of logs.
        if applied_index >= self.commit_index {
            return Iterator::new(Box::new(std::iter::empty()));
        }
        assert!(
            applied_index + 1 >= self.first_index(),
            "applied index {applied_index} precedes compaction point {}",
            self.first_index()
        );
        self.scan(applied_index + 1..=self.commit_index)
    }

    /// Splices a set of entries into the log and flushes it to disk. The
    /// entries must have contiguous indexes and equal/increasing terms, and
    /// the first entry must be in the range [1,last_index+1] with a term at
    /// or above the previous (base) entry's term and at or below the current
    /// term. New indexes will be appended. Overlapping indexes with the same
    /// term must be equal and will be ignored. Overlapping indexes with
    /// different terms will truncate the existing log at the first conflict
    /// and then splice the new entries.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        // Entries at or below the compaction point are already committed and
        // identical by the log matching property, skip them.
        let first_index = self.first_index();
        let entries: Vec<Entry> =
            entries.into_iter().filter(|e| e.index >= first_index).collect();

        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index); // empty input is noop
        };

        // Check that the entries are well-formed.
        if first.index == 0 || first.term == 0 {
            panic!("spliced entry has index or term 0");
        }
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            panic!("spliced entries are not contiguous");
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            panic!("spliced entries have term regression");
        }

        // Check that the entries connect to the existing log (if any), and
        // that the term doesn't regress.
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);
        match self.get(first.index - 1)? {
            Some(base) if first.term < base.term => {
                panic!("splice term regression {} → {}", base.term, first.term)
            }
            Some(_) => {}
            None if first.index == 1 => {}
            None if Some(first.index - 1) == self.snapshot.map(|(i, _)| i) => {
                let (_, snapshot_term) = self.snapshot.expect("no snapshot");
                assert!(
                    first.term >= snapshot_term,
                    "splice term regression {snapshot_term} → {}",
                    first.term
                );
            }
            None => panic!("first index {} must touch existing log", first.index),
        }

        // Skip entries that are already in the log.
        let mut entries = entries.as_slice();
        let mut scan = self.scan(first.index..=last.index);
        while let Some(entry) = scan.next().transpose()? {
            // [0] is ok, because the scan has the same size as entries.
            assert!(entry.index == entries[0].index, "index mismatch at {entry:?}");
            if entry.term != entries[0].term {
                break;
            }
            assert!(entry.command == entries[0].command, "command mismatch at {entry:?}");
            entries = &entries[1..];
        }
        drop(scan);

        // If all entries already exist then we're done.
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Write the entries that weren't already in the log, and remove the
        // tail of the old log if any. We can't write below the commit index,
        // since these entries must be immutable.
        assert!(first.index > self.commit_index, "spliced entries below commit index");

        for entry in entries {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        }
        for index in last.index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;

        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }

    /// Saves a snapshot and compacts away the entries it subsumes. The
    /// snapshot must cover committed (and applied) entries only, and must
    /// not regress behind a previous snapshot.
    pub fn compact(&mut self, snapshot: Snapshot) -> Result<()> {
        assert!(
            snapshot.index <= self.commit_index,
            "snapshot index {} beyond commit index {}",
            snapshot.index,
            self.commit_index
        );
        if let Some((snapshot_index, _)) = self.snapshot {
            assert!(snapshot.index >= snapshot_index, "snapshot regression");
            if snapshot.index == snapshot_index {
                return Ok(());
            }
        }
        // Persist the snapshot before removing the entries it subsumes, so a
        // crash in between leaves a usable log.
        self.engine.set(&Key::Snapshot.encode(), snapshot.encode())?;
        self.engine.flush()?;
        for index in self.first_index()..=snapshot.index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;
        self.snapshot = Some((snapshot.index, snapshot.term));
        Ok(())
    }

    /// Replaces the entire log with a snapshot received from the leader.
    /// Used when this node has fallen behind the leader's compaction point
    /// and can no longer be caught up with individual entries.
    pub fn reset(&mut self, snapshot: Snapshot) -> Result<()> {
        assert!(snapshot.term <= self.term, "snapshot term beyond current term");
        assert!(
            snapshot.index >= self.commit_index,
            "snapshot index {} below commit index {}",
            snapshot.index,
            self.commit_index
        );
        for index in self.first_index()..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.set(&Key::Snapshot.encode(), snapshot.encode())?;
        self.engine.set(
            &Key::CommitIndex.encode(),
            bincode::serialize(&(snapshot.index, snapshot.term)),
        )?;
        self.engine.flush()?;
        self.last_index = snapshot.index;
        self.last_term = snapshot.term;
        self.commit_index = snapshot.index;
        self.commit_term = snapshot.term;
        self.snapshot = Some((snapshot.index, snapshot.term));
        Ok(())
    }

    /// Loads the current snapshot, if any.
    pub fn get_snapshot(&mut self) -> Result<Option<Snapshot>> {
        self.engine.get(&Key::Snapshot.encode())?.map(|v| Snapshot::decode(&v)).transpose()
    }

    /// Returns log engine status.
    pub fn status(&mut self) -> Result<crate::storage::Status> {
        self.engine.status()
    }
}

/// A log entry iterator.
pub struct Iterator<'a> {
    inner: Box<dyn crate::storage::ScanIterator + 'a>,
}

impl<'a> Iterator<'a> {
    fn new(inner: Box<dyn crate::storage::ScanIterator + 'a>) -> Self {
        Self { inner }
    }
}

impl std::iter::Iterator for Iterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;

    use pretty_assertions::assert_eq;

    fn log() -> Log {
        Log::new(Box::new(Memory::new())).expect("log init failed")
    }

    fn entry(index: Index, term: Term) -> Entry {
        Entry { index, term, timestamp: 0, command: Command::Initialize }
    }

    #[test]
    fn append_and_get() -> Result<()> {
        let mut log = log();
        log.set_term(1, Some(1))?;

        assert_eq!(log.append(Command::Initialize)?, 1);
        assert_eq!(log.append(Command::Metadata)?, 2);
        assert_eq!(log.get_last_index(), (2, 1));

        assert_eq!(log.get(1)?.map(|e| e.command), Some(Command::Initialize));
        assert_eq!(log.get(2)?.map(|e| e.command), Some(Command::Metadata));
        assert_eq!(log.get(3)?, None);

        assert!(log.has(1, 1)?);
        assert!(log.has(2, 1)?);
        assert!(!log.has(2, 2)?);
        assert!(!log.has(3, 1)?);
        assert!(!log.has(0, 0)?);
        Ok(())
    }

    #[test]
    fn set_term_and_vote() -> Result<()> {
        let mut log = log();
        assert_eq!(log.get_term(), (0, None));

        log.set_term(1, Some(2))?;
        assert_eq!(log.get_term(), (1, Some(2)));

        // A new term resets the vote.
        log.set_term(2, None)?;
        assert_eq!(log.get_term(), (2, None));
        log.set_term(2, Some(1))?;
        assert_eq!(log.get_term(), (2, Some(1)));
        Ok(())
    }

    #[test]
    fn commit_persists() -> Result<()> {
        let mut log = log();
        log.set_term(1, Some(1))?;
        for _ in 0..3 {
            log.append(Command::Initialize)?;
        }
        assert_eq!(log.commit(2)?, 2);
        assert_eq!(log.get_commit_index(), (2, 1));

        // Reloading the log from the same engine recovers the commit index.
        let engine = std::mem::replace(&mut log.engine, Box::new(Memory::new()));
        let log = Log::new(engine)?;
        assert_eq!(log.get_commit_index(), (2, 1));
        assert_eq!(log.get_last_index(), (3, 1));
        assert_eq!(log.get_term(), (1, Some(1)));
        Ok(())
    }

    #[test]
    fn splice_appends_and_truncates() -> Result<()> {
        let mut log = log();
        log.set_term(2, None)?;

        // Append entries via splice.
        log.splice(vec![entry(1, 1), entry(2, 1), entry(3, 1)])?;
        assert_eq!(log.get_last_index(), (3, 1));

        // Splicing the same entries is a noop.
        log.splice(vec![entry(2, 1), entry(3, 1)])?;
        assert_eq!(log.get_last_index(), (3, 1));

        // A conflicting suffix truncates the old tail.
        log.splice(vec![entry(2, 2)])?;
        assert_eq!(log.get_last_index(), (2, 2));
        assert_eq!(log.get(3)?, None);
        assert_eq!(log.get(2)?.map(|e| e.term), Some(2));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "must touch existing log")]
    fn splice_rejects_gap() {
        let mut log = log();
        log.set_term(1, None).unwrap();
        log.splice(vec![entry(2, 1)]).unwrap();
    }

    #[test]
    fn compact_discards_prefix() -> Result<()> {
        let mut log = log();
        log.set_term(1, Some(1))?;
        for _ in 0..5 {
            log.append(Command::Initialize)?;
        }
        log.commit(4)?;

        log.compact(Snapshot { index: 3, term: 1, members: Vec::new(), data: vec![7] })?;
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.snapshot_index(), Some((3, 1)));
        assert_eq!(log.get(3)?, None);
        assert_eq!(log.get(4)?.map(|e| e.index), Some(4));

        // Compacted entries are still considered present.
        assert!(log.has(2, 1)?);
        assert!(log.has(3, 1)?);
        assert!(!log.has(3, 2)?);

        // The snapshot survives a reload, and seeds last/commit indexes when
        // the whole log has been compacted.
        let snapshot = log.get_snapshot()?.expect("no snapshot");
        assert_eq!((snapshot.index, snapshot.term, snapshot.data), (3, 1, vec![7]));
        Ok(())
    }

    #[test]
    fn reset_replaces_log() -> Result<()> {
        let mut log = log();
        log.set_term(2, None)?;
        log.splice(vec![entry(1, 1), entry(2, 1)])?;

        log.reset(Snapshot { index: 5, term: 2, members: Vec::new(), data: vec![9] })?;
        assert_eq!(log.get_last_index(), (5, 2));
        assert_eq!(log.get_commit_index(), (5, 2));
        assert_eq!(log.first_index(), 6);
        assert_eq!(log.get(1)?, None);

        // Replication resumes from the snapshot index.
        log.splice(vec![entry(6, 2)])?;
        assert_eq!(log.get_last_index(), (6, 2));
        Ok(())
    }
}
