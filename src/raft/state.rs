use super::{Consistency, Entry, Index, SessionID};
use crate::error::Result;

/// A Raft-managed state machine: the seam between the consensus engine and
/// the service executor. Raft applies committed log entries to it strictly in
/// index order, on a single thread, and returns the per-entry results to the
/// waiting clients.
///
/// Application must be deterministic: applying the same log must yield the
/// same state and the same results on every node, or replicas will diverge.
/// Deterministic errors (e.g. an invalid operation argument) are part of the
/// result and are returned to the client; non-deterministic errors (e.g. IO
/// errors) must fail the apply call, which halts the local node.
pub trait State: Send {
    /// Returns the last applied index. This must correspond to the current
    /// state, since it determines which entry to apply next.
    fn applied_index(&self) -> Index;

    /// Applies a committed log entry, advancing the applied index, and
    /// returns the results it produced as (index, result) pairs.
    ///
    /// Most entries produce exactly one result at their own index. An entry
    /// whose session sequence number arrived ahead of order produces none
    /// (it is buffered), and the command that fills the sequence gap also
    /// flushes the buffered entries, producing results for their original
    /// indexes.
    fn apply(&mut self, entry: Entry) -> Result<Vec<(Index, Result<Vec<u8>>)>>;

    /// Executes a read-only query against the applied state, without going
    /// through the log. Only used on the leader, for sequential and
    /// lease-based reads.
    fn query(&self, session: SessionID, operation: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Returns the read consistency level of a session, which determines how
    /// the leader routes its queries. Errors if the session does not exist.
    fn consistency(&self, session: SessionID) -> Result<Consistency>;

    /// Returns the sessions whose timeout has lapsed at the given wall clock
    /// time (milliseconds since the Unix epoch). The leader closes these via
    /// committed CloseSession entries, so expiry is decided by the log.
    fn expired_sessions(&self, now: u64) -> Vec<SessionID>;

    /// Captures the full state (services and sessions) as a snapshot blob,
    /// for log compaction and follower fast-forwarding.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the full state with a snapshot taken at the given index.
    fn install(&mut self, index: Index, data: &[u8]) -> Result<()>;
}
