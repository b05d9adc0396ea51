//! In-process Raft cluster tests. Drives real nodes deterministically over
//! channels, with partitionable message delivery, covering elections,
//! replication, sessions, snapshots, and membership changes.

use quorum::error::{Error, Result};
use quorum::raft::{
    Change, Cluster, Consistency, Envelope, Log, Member, MemberRole, Message, Node, NodeID,
    Options, Request, RequestID, Response, SessionID, Status,
};
use quorum::service::{kv, Executor, Registry};
use quorum::storage::Memory;

use crossbeam::channel::Receiver;
use std::collections::{HashMap, HashSet};

/// The deterministic test tuning: heartbeats every 3 ticks, elections after
/// exactly 5 ticks (the randomized range has a single value).
fn test_options(snapshot_interval: u64) -> Options {
    Options { heartbeat_interval: 3, election_timeout: 5..6, snapshot_interval }
}

/// An in-process test cluster. Nodes are driven manually: messages are only
/// delivered when pumped, and time only advances when ticked, so each test
/// controls elections, partitions, and message interleavings exactly.
struct TestCluster {
    ids: Vec<NodeID>,
    nodes: HashMap<NodeID, Node>,
    node_rxs: HashMap<NodeID, Receiver<Envelope>>,
    inboxes: HashMap<NodeID, Vec<Envelope>>,
    responses: HashMap<NodeID, HashMap<RequestID, Result<Response>>>,
    partitions: HashSet<(NodeID, NodeID)>,
    opts: Options,
    next_request_id: u8,
}

impl TestCluster {
    /// Creates a cluster of active voters with the given IDs.
    fn new(ids: &[NodeID]) -> Result<Self> {
        Self::with_opts(ids, test_options(0))
    }

    fn with_opts(ids: &[NodeID], opts: Options) -> Result<Self> {
        let mut cluster = Self {
            ids: Vec::new(),
            nodes: HashMap::new(),
            node_rxs: HashMap::new(),
            inboxes: HashMap::new(),
            responses: HashMap::new(),
            partitions: HashSet::new(),
            opts,
            next_request_id: 0,
        };
        let members: Vec<Member> =
            ids.iter().map(|id| Member::new(*id, format!("node-{id}"), MemberRole::Active)).collect();
        for id in ids {
            cluster.spawn_node(*id, members.clone())?;
        }
        Ok(cluster)
    }

    /// Creates a node and adds it to the cluster harness.
    fn spawn_node(&mut self, id: NodeID, members: Vec<Member>) -> Result<()> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let log = Log::new(Box::new(Memory::new()))?;
        let mut registry = Registry::new();
        registry.register(kv::SERVICE_TYPE, || Box::new(kv::Store::new()));
        let state = Box::new(Executor::new(registry));
        let node = Node::new(id, Cluster::new(members)?, log, state, node_tx, self.opts.clone())?;
        self.ids.push(id);
        self.ids.sort();
        self.nodes.insert(id, node);
        self.node_rxs.insert(id, node_rx);
        self.inboxes.insert(id, Vec::new());
        self.responses.insert(id, HashMap::new());
        Ok(())
    }

    /// Adds a new node to the harness (but not to the Raft configuration;
    /// that requires a Reconfigure request). The node knows the existing
    /// members plus itself in the given role.
    fn add_node(&mut self, id: NodeID, role: MemberRole) -> Result<()> {
        let mut members: Vec<Member> = self
            .ids
            .iter()
            .map(|id| Member::new(*id, format!("node-{id}"), MemberRole::Active))
            .collect();
        members.push(Member::new(id, format!("node-{id}"), role));
        self.spawn_node(id, members)
    }

    /// Partitions the two groups of nodes from each other, dropping all
    /// messages between them in both directions.
    fn partition(&mut self, a: &[NodeID], b: &[NodeID]) {
        for from in a {
            for to in b {
                self.partitions.insert((*from, *to));
                self.partitions.insert((*to, *from));
            }
        }
    }

    /// Heals all partitions.
    fn heal(&mut self) {
        self.partitions.clear();
    }

    fn dropped(&self, from: NodeID, to: NodeID) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Drains outbound node messages into inboxes, dropping partitioned
    /// traffic and recording local client responses.
    fn collect(&mut self) {
        for id in self.ids.clone() {
            while let Ok(env) = self.node_rxs[&id].try_recv() {
                if env.to == id {
                    match env.message {
                        Message::ClientResponse { id: request_id, response } => {
                            self.responses.get_mut(&id).unwrap().insert(request_id, response);
                        }
                        message => panic!("unexpected local message {message:?}"),
                    }
                } else if !self.dropped(env.from, env.to) {
                    self.inboxes.get_mut(&env.to).unwrap().push(env);
                }
            }
        }
    }

    /// Delivers and processes all pending messages until the cluster is
    /// quiescent.
    fn pump(&mut self) -> Result<()> {
        loop {
            self.collect();
            if self.inboxes.values().all(|inbox| inbox.is_empty()) {
                return Ok(());
            }
            for id in self.ids.clone() {
                let inbox = std::mem::take(self.inboxes.get_mut(&id).unwrap());
                for env in inbox {
                    let node = self.nodes.remove(&id).unwrap();
                    self.nodes.insert(id, node.step(env)?);
                }
            }
        }
    }

    /// Ticks a node, without delivering messages.
    fn ticks(&mut self, id: NodeID, n: u32) -> Result<()> {
        for _ in 0..n {
            let node = self.nodes.remove(&id).unwrap();
            self.nodes.insert(id, node.tick()?);
        }
        Ok(())
    }

    /// Makes the given node campaign for leadership and processes the
    /// election to completion.
    fn campaign(&mut self, id: NodeID) -> Result<()> {
        self.ticks(id, 5)?;
        self.pump()
    }

    /// Emits a leader heartbeat round and processes it to completion.
    fn heartbeat(&mut self, id: NodeID) -> Result<()> {
        self.ticks(id, 3)?;
        self.pump()
    }

    /// Submits a client request to the given node and processes the cluster
    /// to quiescence. The response, if any, can be fetched with response().
    fn request(&mut self, id: NodeID, request: Request) -> Result<RequestID> {
        self.next_request_id += 1;
        let request_id = vec![self.next_request_id];
        let env = Envelope {
            from: id,
            to: id,
            term: self.nodes[&id].term(),
            message: Message::ClientRequest { id: request_id.clone(), request },
        };
        let node = self.nodes.remove(&id).unwrap();
        self.nodes.insert(id, node.step(env)?);
        self.pump()?;
        Ok(request_id)
    }

    /// Takes the response to a request, if one has arrived at the node.
    fn response(&mut self, id: NodeID, request_id: &RequestID) -> Option<Result<Response>> {
        self.responses.get_mut(&id).unwrap().remove(request_id)
    }

    /// Returns the IDs of all current leaders.
    fn leaders(&self) -> Vec<NodeID> {
        let mut leaders: Vec<NodeID> = self
            .nodes
            .iter()
            .filter(|(_, node)| matches!(node, Node::Leader(_)))
            .map(|(id, _)| *id)
            .collect();
        leaders.sort();
        leaders
    }

    /// Opens a session via the given node and returns its ID.
    fn open_session(&mut self, id: NodeID, consistency: Consistency) -> Result<SessionID> {
        self.open_session_with_timeout(id, consistency, 60_000)
    }

    fn open_session_with_timeout(
        &mut self,
        id: NodeID,
        consistency: Consistency,
        timeout: u64,
    ) -> Result<SessionID> {
        let request_id = self.request(
            id,
            Request::OpenSession {
                client: "test".to_string(),
                service: "store".to_string(),
                service_type: kv::SERVICE_TYPE.to_string(),
                consistency,
                timeout,
            },
        )?;
        match self.response(id, &request_id) {
            Some(Ok(Response::OpenSession(session))) => Ok(session),
            response => panic!("unexpected open session response {response:?}"),
        }
    }

    /// Submits a put command, asserting it succeeds.
    fn put(
        &mut self,
        id: NodeID,
        session: SessionID,
        sequence: u64,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        let request_id = self.request(
            id,
            Request::Command {
                session,
                sequence,
                operation: "put".to_string(),
                payload: kv::put(key, value),
            },
        )?;
        match self.response(id, &request_id) {
            Some(Ok(Response::Command(_))) => Ok(()),
            response => panic!("unexpected put response {response:?}"),
        }
    }

    /// Submits a get query, returning the value.
    fn get(
        &mut self,
        id: NodeID,
        session: SessionID,
        sequence: u64,
        key: &str,
    ) -> Result<Option<Vec<u8>>> {
        let request_id = self.request(
            id,
            Request::Query {
                session,
                sequence,
                operation: "get".to_string(),
                payload: kv::get(key),
            },
        )?;
        match self.response(id, &request_id) {
            Some(Ok(Response::Query(value))) => kv::decode_get(&value),
            response => panic!("unexpected get response {response:?}"),
        }
    }

    /// Fetches cluster status via the given node.
    fn status(&mut self, id: NodeID) -> Result<Status> {
        let request_id = self.request(id, Request::Status)?;
        match self.response(id, &request_id) {
            Some(Ok(Response::Status(status))) => Ok(status),
            response => panic!("unexpected status response {response:?}"),
        }
    }
}

/// Scenario A: a 3-node cluster replicates a command to all nodes, and a
/// linearizable read after the write's acknowledgment observes it.
#[test]
fn replicates_writes_and_serves_linearizable_reads() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;
    c.campaign(1)?;
    assert_eq!(c.leaders(), vec![1]);

    let session = c.open_session(1, Consistency::Linearizable)?;
    c.put(1, session, 1, "k1", b"v1")?;
    assert_eq!(c.get(1, session, 1, "k1")?, Some(b"v1".to_vec()));

    // Propagate the commit index to the followers, then check that all
    // nodes have applied the same log position.
    c.heartbeat(1)?;
    let status = c.status(1)?;
    assert_eq!(status.leader, 1);
    assert_eq!(status.commit_index, status.applied_index);
    for (_, match_index) in status.match_index {
        assert_eq!(match_index, status.commit_index);
    }

    // Queries submitted via followers are forwarded to the leader and see
    // the same data.
    assert_eq!(c.get(2, session, 1, "k1")?, Some(b"v1".to_vec()));
    assert_eq!(c.get(3, session, 1, "k1")?, Some(b"v1".to_vec()));
    Ok(())
}

/// At most one leader can be elected per term, even with concurrent
/// candidates.
#[test]
fn election_safety_with_concurrent_candidates() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;

    // 2 and 3 campaign concurrently; their messages interleave only once
    // delivery starts.
    c.ticks(2, 5)?;
    c.ticks(3, 5)?;
    c.pump()?;

    let leaders = c.leaders();
    assert_eq!(leaders.len(), 1, "expected exactly one leader, got {leaders:?}");
    Ok(())
}

/// Scenario B: an isolated leader in the minority keeps accepting requests
/// but can't commit them; the majority elects a new leader in a higher term;
/// on healing, the old leader reverts to follower and its uncommitted
/// entries are replaced by the new leader's log.
#[test]
fn isolated_leader_reverts_and_truncates() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;
    c.campaign(1)?;
    let session = c.open_session(1, Consistency::Linearizable)?;
    c.put(1, session, 1, "k1", b"v1")?;
    c.heartbeat(1)?;

    // Isolate the leader. A command submitted to it can't commit, so no
    // response arrives.
    c.partition(&[1], &[2, 3]);
    let stale_put = c.request(
        1,
        Request::Command {
            session,
            sequence: 2,
            operation: "put".to_string(),
            payload: kv::put("k1", b"stale"),
        },
    )?;
    assert_eq!(c.response(1, &stale_put), None);

    // The majority elects a new leader in a higher term.
    c.campaign(2)?;
    assert_eq!(c.leaders(), vec![1, 2], "old leader doesn't know it was deposed yet");
    assert_eq!(c.nodes[&2].term(), 2);

    // The client retries the command against the new leader with the same
    // sequence number.
    c.put(2, session, 2, "k1", b"v2")?;

    // On healing, the old leader discovers the higher term, aborts the stale
    // request, and reverts to follower.
    c.heal();
    c.heartbeat(2)?;
    assert_eq!(c.leaders(), vec![2]);
    assert_eq!(c.response(1, &stale_put), Some(Err(Error::Abort)));

    // The old leader's divergent entry was truncated and replaced: all nodes
    // match the new leader's log.
    c.heartbeat(2)?;
    let status = c.status(2)?;
    for (_, match_index) in status.match_index {
        assert_eq!(match_index, status.commit_index);
    }
    assert_eq!(c.get(2, session, 2, "k1")?, Some(b"v2".to_vec()));
    Ok(())
}

/// Scenario C: a follower that has fallen behind the log compaction point is
/// fast-forwarded with a snapshot instead of replayed entries, then resumes
/// normal replication.
#[test]
fn lagging_follower_receives_snapshot() -> Result<()> {
    let mut c = TestCluster::with_opts(&[1, 2, 3], test_options(3))?;
    c.campaign(1)?;
    let session = c.open_session(1, Consistency::Linearizable)?;
    c.heartbeat(1)?;

    // Cut node 3 off and write enough entries to compact the log past its
    // position.
    c.partition(&[3], &[1, 2]);
    for sequence in 1..=8 {
        c.put(1, session, sequence, &format!("k{sequence}"), b"v")?;
    }

    // On healing, the next heartbeat triggers a snapshot transfer, and
    // replication resumes from the snapshot index.
    c.heal();
    c.heartbeat(1)?;
    c.heartbeat(1)?;
    let status = c.status(1)?;
    assert_eq!(status.match_index[&3], status.commit_index);

    // The restored follower can win an election and serve the data, proving
    // its state machine caught up through the snapshot.
    c.partition(&[1], &[2, 3]);
    c.campaign(3)?;
    assert!(c.leaders().contains(&3));
    assert_eq!(c.get(3, session, 8, "k8")?, Some(b"v".to_vec()));
    Ok(())
}

/// Scenario D: commands arriving out of sequence order are applied in
/// sequence order, never in arrival order.
#[test]
fn out_of_order_commands_apply_in_sequence_order() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;
    c.campaign(1)?;
    let session = c.open_session(1, Consistency::Linearizable)?;

    // Sequence 2 arrives first: it commits, but is held until sequence 1
    // fills the gap, so no response arrives.
    let second = c.request(
        1,
        Request::Command {
            session,
            sequence: 2,
            operation: "put".to_string(),
            payload: kv::put("k1", b"second"),
        },
    )?;
    assert_eq!(c.response(1, &second), None);

    // Sequence 1 arrives: both apply, in sequence order.
    let first = c.request(
        1,
        Request::Command {
            session,
            sequence: 1,
            operation: "put".to_string(),
            payload: kv::put("k1", b"first"),
        },
    )?;
    assert!(matches!(c.response(1, &first), Some(Ok(Response::Command(_)))));
    assert!(matches!(c.response(1, &second), Some(Ok(Response::Command(_)))));

    // The final state reflects sequence order.
    assert_eq!(c.get(1, session, 2, "k1")?, Some(b"second".to_vec()));
    Ok(())
}

/// Re-invoking a command with an already-applied sequence number returns the
/// original result without re-running the handler.
#[test]
fn session_dedup_is_idempotent() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;
    c.campaign(1)?;
    let session = c.open_session(1, Consistency::Linearizable)?;

    c.put(1, session, 1, "k1", b"v1")?;
    // A retransmission of sequence 1 with a different payload is not
    // re-applied.
    c.put(1, session, 1, "k1", b"overwrite")?;
    assert_eq!(c.get(1, session, 1, "k1")?, Some(b"v1".to_vec()));
    Ok(())
}

/// Sessions not renewed within their timeout are expired by the leader via
/// a committed CloseSession entry, and subsequent commands fail.
#[test]
fn sessions_expire_without_keepalive() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;
    c.campaign(1)?;
    let session = c.open_session_with_timeout(1, Consistency::Linearizable, 1)?;

    // Let the wall clock pass the 1ms timeout, then run a heartbeat round,
    // which sweeps expired sessions.
    std::thread::sleep(std::time::Duration::from_millis(10));
    c.heartbeat(1)?;
    c.heartbeat(1)?;

    let request_id = c.request(
        1,
        Request::Command {
            session,
            sequence: 1,
            operation: "put".to_string(),
            payload: kv::put("k1", b"v1"),
        },
    )?;
    assert_eq!(c.response(1, &request_id), Some(Err(Error::SessionExpired)));
    Ok(())
}

/// Leader leases: a leader that has recently heard from a quorum serves
/// lease reads directly; once isolated past the lease window, reads fall
/// back to the logged path and block without a quorum.
#[test]
fn lease_reads_require_fresh_quorum_contact() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;
    c.campaign(1)?;
    let session = c.open_session(1, Consistency::LinearizableLease)?;
    c.put(1, session, 1, "k1", b"v1")?;

    // Immediately after quorum contact the lease is valid, so the read is
    // served directly even though the leader is isolated.
    c.partition(&[1], &[2, 3]);
    assert_eq!(c.get(1, session, 1, "k1")?, Some(b"v1".to_vec()));

    // Once the lease window passes without quorum contact, reads take the
    // logged path and can't complete.
    c.ticks(1, 5)?;
    c.pump()?;
    let blocked = c.request(
        1,
        Request::Query {
            session,
            sequence: 1,
            operation: "get".to_string(),
            payload: kv::get("k1"),
        },
    )?;
    assert_eq!(c.response(1, &blocked), None);
    Ok(())
}

/// Membership changes: a new node joins as promotable, catches up, gets
/// promoted to voter, and can then be elected leader. Concurrent changes
/// conflict.
#[test]
fn membership_change_join_and_promote() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;
    c.campaign(1)?;
    let session = c.open_session(1, Consistency::Linearizable)?;
    c.put(1, session, 1, "k1", b"v1")?;

    // Join node 4 as promotable.
    c.add_node(4, MemberRole::Promotable)?;
    let join = c.request(
        1,
        Request::Reconfigure(Change::Join(Member::new(4, "node-4", MemberRole::Promotable))),
    )?;
    let members = match c.response(1, &join) {
        Some(Ok(Response::Reconfigure(members))) => members,
        response => panic!("unexpected join response {response:?}"),
    };
    assert!(members.iter().any(|m| m.id == 4 && m.role == MemberRole::Promotable));

    // The leader starts replicating to the new member.
    c.heartbeat(1)?;
    c.heartbeat(1)?;
    let status = c.status(1)?;
    assert_eq!(status.match_index[&4], status.commit_index);

    // Promote it to a voter.
    let promote = c.request(1, Request::Reconfigure(Change::Promote(4)))?;
    match c.response(1, &promote) {
        Some(Ok(Response::Reconfigure(members))) => {
            assert!(members.iter().any(|m| m.id == 4 && m.role == MemberRole::Active))
        }
        response => panic!("unexpected promote response {response:?}"),
    }
    c.heartbeat(1)?;

    // The promoted member can now win elections.
    c.partition(&[1], &[2, 3, 4]);
    c.campaign(4)?;
    assert!(c.leaders().contains(&4));
    assert_eq!(c.get(4, session, 1, "k1")?, Some(b"v1".to_vec()));
    Ok(())
}

/// A second reconfiguration while one is uncommitted is rejected.
#[test]
fn concurrent_membership_changes_conflict() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;
    c.campaign(1)?;

    // Cut off the followers so the first change can't commit.
    c.partition(&[1], &[2, 3]);
    c.add_node(4, MemberRole::Promotable)?;
    let first = c.request(
        1,
        Request::Reconfigure(Change::Join(Member::new(4, "node-4", MemberRole::Promotable))),
    )?;
    assert_eq!(c.response(1, &first), None);

    let second = c.request(1, Request::Reconfigure(Change::Leave(3)))?;
    assert_eq!(c.response(1, &second), Some(Err(Error::ConfigConflict)));
    Ok(())
}

/// Metadata reads are logged barriers: they reflect previously committed
/// configuration changes.
#[test]
fn metadata_reflects_committed_configuration() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;
    c.campaign(1)?;

    let request_id = c.request(1, Request::Metadata)?;
    let metadata = match c.response(1, &request_id) {
        Some(Ok(Response::Metadata(metadata))) => metadata,
        response => panic!("unexpected metadata response {response:?}"),
    };
    assert_eq!(metadata.leader, 1);
    assert_eq!(metadata.term, 1);
    assert_eq!(metadata.members.len(), 3);

    // After a committed join, metadata includes the new member.
    c.add_node(4, MemberRole::Passive)?;
    c.request(
        1,
        Request::Reconfigure(Change::Join(Member::new(4, "node-4", MemberRole::Passive))),
    )?;
    let request_id = c.request(1, Request::Metadata)?;
    match c.response(1, &request_id) {
        Some(Ok(Response::Metadata(metadata))) => assert_eq!(metadata.members.len(), 4),
        response => panic!("unexpected metadata response {response:?}"),
    }
    Ok(())
}

/// Commands submitted to a follower are redirected with a leader hint.
#[test]
fn followers_redirect_commands_to_leader() -> Result<()> {
    let mut c = TestCluster::new(&[1, 2, 3])?;
    c.campaign(1)?;
    let session = c.open_session(1, Consistency::Linearizable)?;

    let request_id = c.request(
        2,
        Request::Command {
            session,
            sequence: 1,
            operation: "put".to_string(),
            payload: kv::put("k1", b"v1"),
        },
    )?;
    assert_eq!(
        c.response(2, &request_id),
        Some(Err(Error::NotLeader { leader: Some(1) }))
    );
    Ok(())
}
