use super::{Change, Consistency, Entry, Index, Member, NodeID, Sequence, SessionID, Snapshot, Term};
use crate::encoding;
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;

/// A message envelope, routed between Raft nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The recipient.
    pub to: NodeID,
    /// The sender's current term.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

impl encoding::Value for Envelope {}

/// A message passed between Raft nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Candidates campaign for leadership by soliciting votes from peers.
    Campaign {
        /// The index of the candidate's last stored log entry.
        last_index: Index,
        /// The term of the candidate's last stored log entry.
        last_term: Term,
    },
    /// Followers may grant a single vote per term, on a first-come basis.
    /// Candidates implicitly vote for themselves.
    CampaignResponse {
        /// Whether the vote was granted.
        vote: bool,
    },
    /// Leaders send periodic heartbeats to their followers.
    Heartbeat {
        /// The index of the leader's last committed log entry.
        commit_index: Index,
        /// The term of the leader's last committed log entry.
        commit_term: Term,
    },
    /// Followers confirm loyalty to the leader after heartbeats, reporting
    /// their log position so the leader can repair lost appends.
    HeartbeatResponse {
        /// The index of the follower's last log entry.
        last_index: Index,
        /// The term of the follower's last log entry.
        last_term: Term,
    },
    /// Leaders replicate log entries to followers.
    Append {
        /// The index of the log entry immediately preceding the entries.
        base_index: Index,
        /// The term of the log entry immediately preceding the entries.
        base_term: Term,
        /// Log entries to replicate.
        entries: Vec<Entry>,
    },
    /// Followers accept or reject appends, depending on whether the base
    /// index and term matched their log.
    AppendResponse {
        /// If true, the follower's log did not contain the base index/term
        /// and the leader must probe an earlier index.
        reject: bool,
        /// The index of the follower's last log entry.
        last_index: Index,
        /// The term of the follower's last log entry.
        last_term: Term,
    },
    /// Leaders fast-forward a follower that has fallen behind the log
    /// compaction point by transferring a full snapshot instead of entries.
    /// The follower acknowledges with an AppendResponse at the snapshot
    /// index.
    Install {
        /// The snapshot, replacing the follower's log and service state.
        snapshot: Snapshot,
    },
    /// A client request. This can be submitted to the leader, or to a
    /// follower which will either forward it or redirect the client. If
    /// the leader or term changes, the request is aborted with Error::Abort
    /// and the client must retry.
    ClientRequest {
        /// The request ID, globally unique for the duration of the request.
        id: RequestID,
        /// The request.
        request: Request,
    },
    /// A client response.
    ClientResponse {
        /// The response ID. This matches the ID of the ClientRequest.
        id: RequestID,
        /// The response, or an error.
        response: Result<Response>,
    },
}

/// A client request ID.
pub type RequestID = Vec<u8>;

/// A client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Opens a session against a named service instance.
    OpenSession {
        /// An identifier for the opening client, e.g. a UUID.
        client: String,
        /// The service instance name.
        service: String,
        /// The service type, resolved against the node's service registry.
        service_type: String,
        /// The session's read consistency level.
        consistency: Consistency,
        /// The session timeout in milliseconds.
        timeout: u64,
    },
    /// Invokes a mutating service operation. Applied exactly once per
    /// (session, sequence), even when retried.
    Command { session: SessionID, sequence: Sequence, operation: String, payload: Vec<u8> },
    /// Invokes a read-only service operation. The sequence number is the
    /// session's current command sequence, used for ordering only.
    Query { session: SessionID, sequence: Sequence, operation: String, payload: Vec<u8> },
    /// Renews a session and acknowledges received command responses.
    KeepAlive { session: SessionID, command_sequence: Sequence, event_ack: Index },
    /// Closes a session.
    CloseSession { session: SessionID },
    /// Changes the cluster membership. Blocks until the configuration entry
    /// commits. Only one change may be in flight at a time.
    Reconfigure(Change),
    /// Reads cluster metadata (leader, term, members) as a logged barrier,
    /// reflecting all previously committed configuration changes.
    Metadata,
    /// Reads node status directly from the leader, without logging.
    Status,
}

impl encoding::Value for Request {}

/// A client response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The ID of the opened session.
    OpenSession(SessionID),
    /// The result of a command, as returned by the service operation.
    Command(Vec<u8>),
    /// The result of a query, as returned by the service operation.
    Query(Vec<u8>),
    /// The session was renewed.
    KeepAlive,
    /// The session was closed.
    CloseSession,
    /// The membership change committed, yielding the new member set.
    Reconfigure(Vec<Member>),
    /// Cluster metadata.
    Metadata(Metadata),
    /// Node status.
    Status(Status),
}

impl encoding::Value for Response {}

/// Cluster metadata, as of a committed Metadata entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// The current leader.
    pub leader: NodeID,
    /// The current term.
    pub term: Term,
    /// The current member set.
    pub members: Vec<Member>,
}

/// Raft node status, generated by the current leader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The current Raft leader, which generated this status.
    pub leader: NodeID,
    /// The current Raft term.
    pub term: Term,
    /// The current member set.
    pub members: Vec<Member>,
    /// The match indexes of all members, as tracked by the leader.
    pub match_index: HashMap<NodeID, Index>,
    /// The current commit index.
    pub commit_index: Index,
    /// The current applied index.
    pub applied_index: Index,
    /// The log storage engine status.
    pub storage: crate::storage::Status,
}
