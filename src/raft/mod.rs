//! Implements a replicated state machine on the Raft distributed consensus
//! protocol.
//!
//! For details, see Diego Ongaro's original writings:
//!
//! * Raft paper: <https://raft.github.io/raft.pdf>
//! * Raft thesis: <https://web.stanford.edu/~ouster/cgi-bin/papers/OngaroPhD.pdf>
//!
//! A cluster of nodes agrees on an ordered log of commands, replicates it to
//! a majority (quorum) of nodes, and applies committed commands sequentially
//! to deterministic service state machines on every node. An elected leader
//! serves client requests and replicates writes; if it fails, a new leader
//! is elected in a higher term. The cluster tolerates the failure of any
//! minority of its voting members.
//!
//! The log carries more than client mutations: client session lifecycle
//! (open, keep-alive, close), linearizable queries, and cluster membership
//! changes are all ordinary log entries, committed and applied through the
//! same pipeline. This gives them the same ordering and durability
//! guarantees as writes:
//!
//! * Sessions provide exactly-once command application. Each command carries
//!   a per-session sequence number; the executor deduplicates retransmitted
//!   sequence numbers against cached results, and applies out-of-order
//!   arrivals in sequence order. Sessions expire deterministically: entry
//!   timestamps (stamped by the leader) drive the timeout, and expiry takes
//!   effect only via a committed CloseSession entry.
//!
//! * Queries are routed per the session's read consistency level:
//!   sequential reads execute directly against the leader's applied state,
//!   linearizable reads are committed to the log as Query entries, and
//!   lease-based reads skip the commit round-trip while a quorum has
//!   confirmed the leader within the election timeout window.
//!
//! * Membership changes replace the configuration wholesale once the
//!   Configuration entry commits. Only one change may be in flight at a
//!   time, which avoids the need for joint consensus. Active members vote
//!   and count towards quorums; passive and promotable members only
//!   replicate. New or lagging members that have fallen behind the log
//!   compaction point are fast-forwarded with a snapshot.
//!
//! Each node runs on a single event loop thread (see `Server`): every log
//! append, term change, commit advancement, and entry application is
//! serialized on it, which eliminates intra-node races without locking.
//! Nodes share nothing; all coordination flows through the replicated log.

mod cluster;
mod log;
mod message;
mod node;
mod server;
mod state;

pub use cluster::{Change, Cluster, Member, MemberRole};
pub use log::{Command, Consistency, Entry, Index, Key, Log, Sequence, SessionID, Snapshot};
pub use message::{Envelope, Message, Metadata, Request, RequestID, Response, Status};
pub use node::{Node, NodeID, Options, Term, Ticks};
pub use server::{ClientReceiver, ClientSender, Server};
pub use state::State;

/// The interval between Raft ticks, the unit of time.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// The interval between leader heartbeats in ticks.
const HEARTBEAT_INTERVAL: Ticks = 4;

/// The default election timeout range in ticks. This is randomized in this
/// interval, to avoid election ties.
const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..20;

/// The maximum number of entries to send in a single append message.
const MAX_APPEND_ENTRIES: usize = 100;

/// The default number of applied entries between snapshots.
const SNAPSHOT_INTERVAL: u64 = 1000;
