use super::log::now_millis;
use super::{
    Cluster, Command, Envelope, Index, Log, Message, Metadata, Request, RequestID, Response,
    SessionID, Snapshot, State, Status,
};
use super::{ELECTION_TIMEOUT_RANGE, HEARTBEAT_INTERVAL, MAX_APPEND_ENTRIES, SNAPSHOT_INTERVAL};
use crate::error::{Error, Result};

use itertools::Itertools as _;
use log::{debug, info};
use rand::Rng as _;
use std::collections::{HashMap, HashSet};

/// A node ID.
pub type NodeID = u8;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// Node tuning options.
#[derive(Clone, Debug)]
pub struct Options {
    /// The interval between leader heartbeats, in ticks. Session expiry is
    /// checked on the same cadence.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts, in ticks. The lower bound
    /// is also the leader lease window: a quorum contacted within it
    /// guarantees no other leader can have been elected.
    pub election_timeout: std::ops::Range<Ticks>,
    /// The number of applied entries between snapshots (and log compactions).
    /// 0 disables snapshots.
    pub snapshot_interval: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout: ELECTION_TIMEOUT_RANGE,
            snapshot_interval: SNAPSHOT_INTERVAL,
        }
    }
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a
/// possibly different role. Outbound messages are sent via the given node_tx
/// channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or leader
    /// if it is the only voter in the cluster.
    pub fn new(
        id: NodeID,
        cluster: Cluster,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let node = RawNode::new(id, cluster, log, state, node_tx, opts)?;
        if node.cluster.quorum_size() == 1 && node.cluster.is_voter(id) {
            // If this is the only voter, become leader immediately.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// Processes a message from a peer or local client.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role: Clone + std::fmt::Debug + PartialEq {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    cluster: Cluster,
    term: Term,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            cluster: self.cluster,
            term: self.term,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            role,
        }
    }

    /// Returns the IDs of all other cluster members, in order.
    fn peers(&self) -> Vec<NodeID> {
        self.cluster.peers(self.id)
    }

    /// Returns the quorum size of the cluster's voters.
    fn quorum_size(&self) -> u8 {
        self.cluster.quorum_size()
    }

    /// Applies any pending, committed entries to the state machine. The
    /// results are discarded, use maybe_apply_with() instead to access them.
    fn maybe_apply(&mut self) -> Result<()> {
        Self::maybe_apply_with(
            &mut self.log,
            &mut self.state,
            &mut self.cluster,
            |_, _, _| Ok(()),
        )?;
        Ok(())
    }

    /// Applies any pending, committed entries to the state machine, calling
    /// the given closure with every produced result. Also applies committed
    /// Configuration entries to the cluster, returning true if the
    /// configuration changed. Not a method, so that the closure can mutate
    /// other node fields.
    fn maybe_apply_with<F>(
        log: &mut Log,
        state: &mut Box<dyn State>,
        cluster: &mut Cluster,
        mut on_apply: F,
    ) -> Result<bool>
    where
        F: FnMut(Index, Result<Vec<u8>>, &Cluster) -> Result<()>,
    {
        let applied_index = state.applied_index();
        let commit_index = log.get_commit_index().0;
        if applied_index >= commit_index {
            return Ok(false);
        }

        let mut config_changed = false;
        let mut scan = log.scan_apply(applied_index);
        while let Some(entry) = scan.next().transpose()? {
            debug!("Applying {entry:?}");
            if let Command::Configuration { members } = &entry.command {
                info!("Applying new cluster configuration with {} members", members.len());
                *cluster = Cluster::new(members.clone())?;
                config_changed = true;
            }
            for (index, result) in state.apply(entry)? {
                on_apply(index, result, cluster)?;
            }
        }
        Ok(config_changed)
    }

    /// Takes a snapshot and compacts the log if enough entries have been
    /// applied since the last snapshot.
    fn maybe_compact(&mut self) -> Result<()> {
        if self.opts.snapshot_interval == 0 {
            return Ok(());
        }
        let applied_index = self.state.applied_index();
        let since = applied_index - self.log.snapshot_index().map(|(i, _)| i).unwrap_or(0);
        if applied_index == 0 || since < self.opts.snapshot_interval {
            return Ok(());
        }
        let Some(entry) = self.log.get(applied_index)? else {
            return Ok(());
        };
        info!("Taking snapshot at {applied_index}@{} and compacting log", entry.term);
        let data = self.state.snapshot()?;
        self.log.compact(Snapshot {
            index: applied_index,
            term: entry.term,
            members: self.cluster.to_vec(),
            data,
        })
    }

    /// Sends a message.
    fn send(&self, to: NodeID, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id, to, term: self.term, message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // peers() is ordered, for test determinism.
        for id in self.peers() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout.clone())
    }

    /// Asserts common node invariants.
    fn assert_node(&mut self) {
        debug_assert_eq!(self.term, self.log.get_term().0, "term does not match log");
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        // Messages must be addressed to the local node. Unknown senders are
        // allowed, since cluster membership changes while messages are in
        // flight.
        assert_eq!(msg.to, self.id, "message to other node");
    }
}

/// A candidate is campaigning to become a leader.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Votes received, including our own. Only voters are counted.
    votes: HashSet<NodeID>,
    /// Ticks elapsed since election start.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
}

impl Candidate {
    /// Creates a new candidate role.
    fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        self.assert_node();

        assert_ne!(self.term, 0, "candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for self");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");

        assert!(
            self.role.election_duration < self.role.election_timeout,
            "election timeout passed"
        );
    }

    /// Transitions the candidate to a follower. We either lost the election
    /// and follow the winner, or we discovered a new term in which case we
    /// step into it as a leaderless follower.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term, "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            let voted_for = Some(self.id); // by definition
            Ok(self.into_role(Follower::new(Some(leader), voted_for, election_timeout)))
        } else {
            // We found a new term, but we don't necessarily know who the
            // leader is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(None, None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let peers = self.peers();
        let (last_index, _) = self.log.get_last_index();
        let mut node = self.into_role(Leader::new(peers, last_index));

        // If the log contains an uncommitted Configuration entry, it is the
        // pending membership change; only one may be in flight at a time.
        let pending_config = {
            let commit_index = node.log.get_commit_index().0;
            let mut found = None;
            let mut scan = node.log.scan(commit_index + 1..);
            while let Some(entry) = scan.next().transpose()? {
                if matches!(entry.command, Command::Configuration { .. }) {
                    found = Some(entry.index);
                }
            }
            found
        };
        node.role.pending_config = pending_config;

        // Propose an empty entry when assuming leadership, to disambiguate
        // previous entries in the log. See section 5.4.2 in the Raft paper.
        //
        // We do this prior to the heartbeat, to avoid a wasted replication
        // roundtrip if the heartbeat response indicates the peer is behind.
        node.propose(Command::Initialize)?;
        node.heartbeat()?;

        // A sole voter commits its own appends immediately.
        node.maybe_commit_and_apply()?;

        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is a Heartbeat
        // or Append from the leader, stepping it will follow the leader.
        if msg.term > self.term {
            return self.into_follower(msg.term, None)?.step(msg);
        }

        match msg.message {
            // Don't grant votes for other candidates who also campaign.
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { vote: false })?
            }

            // If a voter granted us their vote, record it. If the vote gives
            // us quorum, assume leadership.
            Message::CampaignResponse { vote: true } => {
                if self.cluster.is_voter(msg.from) {
                    self.role.votes.insert(msg.from);
                }
                if self.role.votes.len() as u8 >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            // We didn't get a vote. :(
            Message::CampaignResponse { vote: false } => {}

            // If we receive a heartbeat, append, or snapshot in this term, we
            // lost the election and have a new leader. Follow it and step the
            // message.
            Message::Heartbeat { .. } | Message::Append { .. } | Message::Install { .. } => {
                return self.into_follower(msg.term, Some(msg.from))?.step(msg);
            }

            // Abort any inbound client requests while candidate; there is no
            // leader to route them to.
            Message::ClientRequest { ref id, .. } => {
                assert_eq!(msg.from, self.id, "client request from other node");
                self.send(
                    msg.from,
                    Message::ClientResponse {
                        id: id.clone(),
                        response: Err(Error::NotLeader { leader: None }),
                    },
                )?;
            }

            // We're not a leader in this term, nor are we forwarding
            // requests, so we shouldn't see these.
            Message::HeartbeatResponse { .. }
            | Message::AppendResponse { .. }
            | Message::ClientResponse { .. } => panic!("received unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();

        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
        }
        Ok(self.into())
    }

    /// Campaigns for leadership by increasing the term, voting for ourself,
    /// and soliciting votes from all peers.
    fn campaign(&mut self) -> Result<()> {
        let term = self.term + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id); // vote for ourself
        self.term = term;
        self.log.set_term(term, Some(self.id))?;

        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast(Message::Campaign { last_index, last_term })?;
        Ok(())
    }
}

// A follower replicates state from a leader.
#[derive(Clone, Debug, PartialEq)]
pub struct Follower {
    /// The leader, or None if just initialized.
    leader: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election.
    election_timeout: Ticks,
    /// The node we voted for in the current term, if any.
    voted_for: Option<NodeID>,
    /// Local client queries that have been forwarded to the leader. These are
    /// aborted on leader/term changes.
    forwarded: HashSet<RequestID>,
}

impl Follower {
    /// Creates a new follower role.
    fn new(leader: Option<NodeID>, voted_for: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { leader, voted_for, leader_seen: 0, election_timeout, forwarded: HashSet::new() }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower, recovering any persistent
    /// state from the log: the current term and vote, the snapshot (if the
    /// service state lags it), and committed entries that haven't been
    /// applied (including the cluster configuration).
    fn new(
        id: NodeID,
        mut cluster: Cluster,
        mut log: Log,
        mut state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        if let Some(snapshot) = log.get_snapshot()? {
            if snapshot.index > state.applied_index() {
                info!("Restoring snapshot at {}@{}", snapshot.index, snapshot.term);
                state.install(snapshot.index, &snapshot.data)?;
                cluster = Cluster::new(snapshot.members)?;
            }
        }
        let (term, voted_for) = log.get_term();
        let role = Follower::new(None, voted_for, 0);
        let mut node = Self { id, cluster, term, log, state, node_tx, opts, role };
        node.role.election_timeout = node.gen_election_timeout();
        node.maybe_apply()?;
        Ok(node)
    }

    /// Asserts internal invariants.
    fn assert(&mut self) {
        self.assert_node();

        if let Some(leader) = self.role.leader {
            assert_ne!(leader, self.id, "can't follow self");
            assert_ne!(self.term, 0, "followers with leaders can't have term 0");
        } else {
            assert!(self.role.forwarded.is_empty(), "leaderless follower has forwarded requests");
        }

        // NB: We allow voted_for not in the cluster, since this can happen
        // when nodes are removed while votes are in flight, or when we
        // voted for ourselves and lost.
        debug_assert_eq!(self.role.voted_for, self.log.get_term().1, "vote does not match log");
        assert!(self.role.leader_seen < self.role.election_timeout, "election timeout passed");
    }

    /// Transitions the follower into a candidate, by campaigning for
    /// leadership in a new term.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        assert!(self.cluster.is_voter(self.id), "only voters can campaign");

        // Abort any forwarded requests. These must be retried with new leader.
        self.abort_forwarded()?;

        // Apply any pending log entries, so that we're caught up if we win.
        self.maybe_apply()?;

        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions the follower into either a leaderless follower in a new
    /// term (e.g. if someone holds a new election) or a follower of a leader
    /// in the current term once someone wins the election.
    fn into_follower(mut self, leader: Option<NodeID>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);

        // Abort any forwarded requests. These must be retried with new leader.
        self.abort_forwarded()?;

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have leader in term");
            assert_eq!(term, self.term, "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role =
                Follower::new(Some(leader), self.role.voted_for, self.role.election_timeout);
        } else {
            // We found a new term, but we don't necessarily know who the
            // leader is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.log.set_term(term, None)?;
            self.role = Follower::new(None, None, self.gen_election_timeout());
        }
        Ok(self)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is a Heartbeat
        // or Append from the leader, stepping it will follow the leader.
        if msg.term > self.term {
            return self.into_follower(None, msg.term)?.step(msg);
        }

        // Record when we last saw a message from the leader (if any).
        if self.is_leader(msg.from) {
            self.role.leader_seen = 0
        }

        match msg.message {
            // The leader will send periodic heartbeats. If we don't have a
            // leader in this term yet, follow it. If the commit index
            // advances, apply the new entries.
            Message::Heartbeat { commit_index, commit_term } => {
                // Check that the heartbeat is from our leader.
                match self.role.leader {
                    Some(leader) => assert_eq!(msg.from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(Some(msg.from), msg.term)?,
                }

                // Respond to the heartbeat, reporting our log position.
                let (last_index, last_term) = self.log.get_last_index();
                self.send(msg.from, Message::HeartbeatResponse { last_index, last_term })?;

                // Advance commit index and apply entries.
                if commit_index > self.log.get_commit_index().0
                    && self.log.has(commit_index, commit_term)?
                {
                    self.log.commit(commit_index)?;
                    self.maybe_apply()?;
                    self.maybe_compact()?;
                }
            }

            // Replicate entries from the leader. If we don't have a leader in
            // this term yet, follow it.
            Message::Append { base_index, base_term, entries } => {
                // Check that the entries are from our leader.
                let from = msg.from;
                match self.role.leader {
                    Some(leader) => assert_eq!(from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(Some(from), msg.term)?,
                }

                // Append the entries, if possible.
                let reject = base_index > 0 && !self.log.has(base_index, base_term)?;
                if !reject {
                    self.log.splice(entries)?;
                }
                let (last_index, last_term) = self.log.get_last_index();
                self.send(msg.from, Message::AppendResponse { reject, last_index, last_term })?;
            }

            // The leader is fast-forwarding us with a snapshot, because our
            // log is behind its compaction point. Replace the service state
            // and the log wholesale, then resume normal replication.
            Message::Install { snapshot } => {
                match self.role.leader {
                    Some(leader) => assert_eq!(msg.from, leader, "multiple leaders in term"),
                    None => self = self.into_follower(Some(msg.from), msg.term)?,
                }

                if snapshot.index > self.log.get_commit_index().0 {
                    info!("Installing snapshot at {}@{}", snapshot.index, snapshot.term);
                    self.state.install(snapshot.index, &snapshot.data)?;
                    self.cluster = Cluster::new(snapshot.members.clone())?;
                    self.log.reset(snapshot)?;
                }
                let (last_index, last_term) = self.log.get_last_index();
                self.send(
                    msg.from,
                    Message::AppendResponse { reject: false, last_index, last_term },
                )?;
            }

            // A candidate in this term is requesting our vote.
            Message::Campaign { last_index, last_term } => {
                // Don't grant votes to nodes that can't be leaders.
                if !self.cluster.is_voter(msg.from) {
                    self.send(msg.from, Message::CampaignResponse { vote: false })?;
                    return Ok(self.into());
                }

                // Don't vote if we already voted for someone else in this term.
                if let Some(voted_for) = self.role.voted_for {
                    if msg.from != voted_for {
                        self.send(msg.from, Message::CampaignResponse { vote: false })?;
                        return Ok(self.into());
                    }
                }

                // Don't vote if our log is newer than the candidate's log.
                let (log_index, log_term) = self.log.get_last_index();
                if log_term > last_term || log_term == last_term && log_index > last_index {
                    self.send(msg.from, Message::CampaignResponse { vote: false })?;
                    return Ok(self.into());
                }

                // Grant the vote.
                info!("Voting for {} in term {} election", msg.from, self.term);
                self.send(msg.from, Message::CampaignResponse { vote: true })?;
                self.log.set_term(self.term, Some(msg.from))?;
                self.role.voted_for = Some(msg.from);
            }

            // We may receive a vote after we lost an election and followed a
            // different leader. Ignore it.
            Message::CampaignResponse { .. } => {}

            // A local client request. Queries and status requests are
            // forwarded to the leader, to allow spreading client connections
            // across the cluster. Everything else is redirected: the client
            // proxy re-resolves the leader and retries there, reusing the
            // same sequence number so retries are exactly-once.
            Message::ClientRequest { ref id, ref request } => {
                assert_eq!(msg.from, self.id, "client request from other node");

                let id = id.clone();
                match (self.role.leader, request) {
                    (Some(leader), Request::Query { .. } | Request::Status) => {
                        debug!("Forwarding request to leader {leader}: {request:?}");
                        self.role.forwarded.insert(id);
                        self.send(leader, msg.message)?;
                    }
                    (leader, _) => {
                        self.send(
                            msg.from,
                            Message::ClientResponse {
                                id,
                                response: Err(Error::NotLeader { leader }),
                            },
                        )?;
                    }
                }
            }

            // Returns client responses for forwarded requests.
            Message::ClientResponse { id, response } => {
                assert!(self.is_leader(msg.from), "client response from non-leader");

                if self.role.forwarded.remove(&id) {
                    self.send(self.id, Message::ClientResponse { id, response })?;
                }
            }

            // We're not a leader nor candidate in this term, so we shouldn't
            // see these.
            Message::HeartbeatResponse { .. } | Message::AppendResponse { .. } => {
                panic!("received unexpected message {msg:?}")
            }
        };
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();

        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            // Non-voters wait for a leader rather than campaigning.
            if self.cluster.is_voter(self.id) {
                return Ok(self.into_candidate()?.into());
            }
            self.role.leader_seen = 0;
        }
        Ok(self.into())
    }

    /// Aborts all forwarded requests.
    fn abort_forwarded(&mut self) -> Result<()> {
        // Sort the IDs for test determinism.
        for id in std::mem::take(&mut self.role.forwarded).into_iter().sorted() {
            debug!("Aborting forwarded request {id:x?}");
            self.send(self.id, Message::ClientResponse { id, response: Err(Error::Abort) })?;
        }
        Ok(())
    }

    /// Checks if an address is the current leader.
    fn is_leader(&self, from: NodeID) -> bool {
        self.role.leader == Some(from)
    }
}

/// Peer replication progress.
#[derive(Clone, Debug, PartialEq)]
struct Progress {
    /// The next index to replicate to the peer.
    next: Index,
    /// The last index known to be replicated to the peer.
    last: Index,
    /// Ticks since we last heard from the peer. Used for the leader lease.
    seen: Ticks,
}

/// A client-initiated entry pending application, keyed by its log index in
/// Leader::requests. When the entry applies, the result is sent back to the
/// submitting node as a ClientResponse, built per the request kind.
#[derive(Clone, Debug, PartialEq)]
struct PendingRequest {
    /// The node which submitted the request.
    from: NodeID,
    /// The request ID.
    id: RequestID,
    /// The kind of request, determining the response variant.
    kind: PendingKind,
}

/// The kind of a pending client request.
#[derive(Clone, Copy, Debug, PartialEq)]
enum PendingKind {
    OpenSession,
    Command,
    Query,
    KeepAlive,
    CloseSession,
    Reconfigure,
    Metadata,
}

// A leader serves requests and replicates the log to followers.
#[derive(Clone, Debug, PartialEq)]
pub struct Leader {
    /// Peer replication progress.
    progress: HashMap<NodeID, Progress>,
    /// Client-initiated entries pending application, keyed by log index.
    /// When the command is applied the result is returned to the client. If
    /// we lose leadership, all pending requests are aborted with
    /// Error::Abort and the clients retry against the new leader.
    requests: HashMap<Index, PendingRequest>,
    /// The index of an appended but uncommitted Configuration entry, if any.
    /// Only one membership change may be in flight at a time; concurrent
    /// changes fail with Error::ConfigConflict.
    pending_config: Option<Index>,
    /// Sessions with an in-flight expiry CloseSession entry, to avoid
    /// proposing duplicate closes on every sweep.
    closing: HashSet<SessionID>,
    /// Number of ticks since last periodic heartbeat.
    since_heartbeat: Ticks,
    /// True if a committed Configuration entry removed us as a voter; the
    /// leader steps down once the current step completes.
    step_down: bool,
}

impl Leader {
    /// Creates a new leader role.
    fn new(peers: Vec<NodeID>, last_index: Index) -> Self {
        let next = last_index + 1;
        let progress =
            peers.into_iter().map(|p| (p, Progress { next, last: 0, seen: 0 })).collect();
        Self {
            progress,
            requests: HashMap::new(),
            pending_config: None,
            closing: HashSet::new(),
            since_heartbeat: 0,
            step_down: false,
        }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        self.assert_node();

        assert_ne!(self.term, 0, "leaders can't have term 0");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
    }

    /// Transitions the leader into a follower, after discovering a new term.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term, "can only become follower in later term");

        info!("Discovered new term {term}");
        self.abort_requests()?;

        self.term = term;
        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, None, election_timeout)))
    }

    /// Steps down voluntarily in the current term, after a committed
    /// configuration change removed us as a voter.
    fn step_down(mut self) -> Result<RawNode<Follower>> {
        info!("No longer a voter, stepping down as leader in term {}", self.term);
        self.abort_requests()?;

        let election_timeout = self.gen_election_timeout();
        let voted_for = self.log.get_term().1;
        Ok(self.into_role(Follower::new(None, voted_for, election_timeout)))
    }

    /// Aborts all pending client requests, e.g. on leadership loss.
    fn abort_requests(&mut self) -> Result<()> {
        for request in
            std::mem::take(&mut self.role.requests).into_values().sorted_by_key(|r| r.id.clone())
        {
            self.send(
                request.from,
                Message::ClientResponse { id: request.id, response: Err(Error::Abort) },
            )?;
        }
        Ok(())
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message.
        if msg.term > self.term {
            return self.into_follower(msg.term)?.step(msg);
        }

        // Any message from a peer is evidence of contact, for the lease.
        if let Some(progress) = self.role.progress.get_mut(&msg.from) {
            progress.seen = 0;
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::Heartbeat { .. } | Message::Append { .. } | Message::Install { .. } => {
                panic!("saw other leader {} in term {}", msg.from, msg.term);
            }

            // A follower received one of our heartbeats and confirms that we
            // are its leader. If its log is incomplete, append entries.
            Message::HeartbeatResponse { last_index, last_term } => {
                if last_index < self.log.get_last_index().0
                    || !self.log.has(last_index, last_term)?
                {
                    self.send_log(msg.from)?;
                }
            }

            // A follower appended log entries we sent it. Record its progress
            // and attempt to commit new entries.
            Message::AppendResponse { reject: false, last_index, last_term } => {
                assert!(
                    last_index <= self.log.get_last_index().0,
                    "follower accepted entries after last index"
                );
                assert!(
                    last_term <= self.log.get_last_index().1,
                    "follower accepted entries after last term"
                );

                if let Some(progress) = self.role.progress.get_mut(&msg.from) {
                    if last_index > progress.last {
                        progress.last = last_index;
                        progress.next = last_index + 1;
                        self.maybe_commit_and_apply()?;
                    }
                }
            }

            // A follower rejected log entries we sent it, typically because
            // it does not have the base index in its log. Try to replicate
            // from the previous entry.
            //
            // This linear probing, as described in the Raft paper, can be
            // slow with long divergent logs, but we keep it simple.
            Message::AppendResponse { reject: true, last_index: _, last_term: _ } => {
                self.role.progress.entry(msg.from).and_modify(|p| {
                    if p.next > 1 {
                        p.next -= 1
                    }
                });
                self.send_log(msg.from)?;
            }

            // A client request, either from a local client or forwarded by a
            // follower.
            Message::ClientRequest { id, request } => {
                self.client_request(msg.from, id, request)?;
            }

            // Don't grant other votes in this term.
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { vote: false })?
            }

            // Votes can come in after we won the election, ignore them.
            Message::CampaignResponse { .. } => {}

            // Leaders don't forward requests, so we don't expect responses.
            Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }

        // A committed configuration change may have removed us as a voter.
        if self.role.step_down {
            return Ok(self.step_down()?.into());
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();

        for progress in self.role.progress.values_mut() {
            progress.seen = progress.seen.saturating_add(1);
        }

        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
            // Check for expired sessions on the heartbeat cadence. The
            // timeouts are evaluated against the leader's clock, but expiry
            // only takes effect via a committed CloseSession entry, so all
            // nodes agree on session lifetime from the log alone.
            self.expire_sessions()?;
        }

        if self.role.step_down {
            return Ok(self.step_down()?.into());
        }
        Ok(self.into())
    }

    /// Broadcasts a heartbeat to all peers.
    fn heartbeat(&mut self) -> Result<()> {
        let (commit_index, commit_term) = self.log.get_commit_index();
        self.broadcast(Message::Heartbeat { commit_index, commit_term })?;
        // NB: We don't reset self.since_heartbeat here, because we want to
        // send periodic heartbeats regardless of any on-demand heartbeats.
        Ok(())
    }

    /// Proposes a command for consensus by appending it to our log and
    /// replicating it to peers. If successful, it will eventually be
    /// committed and applied to the state machine.
    fn propose(&mut self, command: Command) -> Result<Index> {
        let index = self.log.append(command)?;
        for peer in self.peers() {
            self.send_log(peer)?;
        }
        Ok(index)
    }

    /// Processes a client request.
    fn client_request(&mut self, from: NodeID, id: RequestID, request: Request) -> Result<()> {
        match request {
            Request::Status => {
                let (commit_index, _) = self.log.get_commit_index();
                let status = Status {
                    leader: self.id,
                    term: self.term,
                    members: self.cluster.to_vec(),
                    match_index: self
                        .role
                        .progress
                        .iter()
                        .map(|(id, p)| (*id, p.last))
                        .chain(std::iter::once((self.id, self.log.get_last_index().0)))
                        .collect(),
                    commit_index,
                    applied_index: self.state.applied_index(),
                    storage: self.log.status()?,
                };
                self.send(
                    from,
                    Message::ClientResponse { id, response: Ok(Response::Status(status)) },
                )?;
            }

            Request::Query { session, sequence, operation, payload } => {
                // The session's consistency level determines the read path.
                // Sequential reads (and linearizable reads under a valid
                // leader lease) execute directly against applied state.
                // Linearizable reads without a lease are committed to the
                // log, and only release their result once the entry commits.
                use super::Consistency::*;
                let direct = match self.state.consistency(session) {
                    Ok(Sequential) => true,
                    Ok(LinearizableLease) => self.lease_valid(),
                    Ok(Linearizable) => false,
                    Err(err) => {
                        self.send(from, Message::ClientResponse { id, response: Err(err) })?;
                        return Ok(());
                    }
                };
                if direct {
                    let response =
                        self.state.query(session, &operation, &payload).map(Response::Query);
                    self.send(from, Message::ClientResponse { id, response })?;
                } else {
                    let index =
                        self.propose(Command::Query { session, sequence, operation, payload })?;
                    self.role.requests.insert(
                        index,
                        PendingRequest { from, id, kind: PendingKind::Query },
                    );
                }
            }

            Request::Command { session, sequence, operation, payload } => {
                let index =
                    self.propose(Command::Command { session, sequence, operation, payload })?;
                self.role
                    .requests
                    .insert(index, PendingRequest { from, id, kind: PendingKind::Command });
            }

            Request::OpenSession { client, service, service_type, consistency, timeout } => {
                let index = self.propose(Command::OpenSession {
                    client,
                    service,
                    service_type,
                    consistency,
                    timeout,
                })?;
                self.role
                    .requests
                    .insert(index, PendingRequest { from, id, kind: PendingKind::OpenSession });
            }

            Request::KeepAlive { session, command_sequence, event_ack } => {
                let index =
                    self.propose(Command::KeepAlive { session, command_sequence, event_ack })?;
                self.role
                    .requests
                    .insert(index, PendingRequest { from, id, kind: PendingKind::KeepAlive });
            }

            Request::CloseSession { session } => {
                let index = self.propose(Command::CloseSession { session, expired: false })?;
                self.role
                    .requests
                    .insert(index, PendingRequest { from, id, kind: PendingKind::CloseSession });
            }

            Request::Reconfigure(change) => {
                if self.role.pending_config.is_some() {
                    self.send(
                        from,
                        Message::ClientResponse { id, response: Err(Error::ConfigConflict) },
                    )?;
                    return Ok(());
                }
                match self.cluster.apply(&change) {
                    Err(err) => {
                        self.send(from, Message::ClientResponse { id, response: Err(err) })?;
                        return Ok(());
                    }
                    Ok(members) => {
                        info!("Proposing configuration change {change:?}");
                        let index = self.propose(Command::Configuration { members })?;
                        self.role.pending_config = Some(index);
                        self.role.requests.insert(
                            index,
                            PendingRequest { from, id, kind: PendingKind::Reconfigure },
                        );
                    }
                }
            }

            Request::Metadata => {
                // Logged as a barrier entry: the response is built when the
                // entry applies, reflecting all prior committed changes.
                let index = self.propose(Command::Metadata)?;
                self.role
                    .requests
                    .insert(index, PendingRequest { from, id, kind: PendingKind::Metadata });
            }
        }

        // A sole voter commits its own appends immediately; otherwise this
        // is a noop until a quorum acknowledges them.
        self.maybe_commit_and_apply()?;
        Ok(())
    }

    /// Commits any new log entries that have been replicated to a quorum of
    /// voters, and applies them to the state machine, responding to the
    /// clients whose requests were applied.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        // Determine the new commit index: the quorum match index of the
        // voters. Passive and promotable members don't count.
        let (last_index, _) = self.log.get_last_index();
        let quorum_index = quorum_value(
            self.cluster
                .voters()
                .into_iter()
                .map(|id| {
                    if id == self.id {
                        last_index
                    } else {
                        self.role.progress.get(&id).map(|p| p.last).unwrap_or(0)
                    }
                })
                .collect(),
        );

        // If the commit index doesn't advance, do nothing. We don't assert on
        // this, since the quorum value may regress e.g. following a restart
        // or leader change where followers are initialized with log index 0.
        let mut commit_index = self.log.get_commit_index().0;
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }

        // We can only safely commit an entry from our own term (see figure 8
        // in the Raft paper).
        commit_index = match self.log.get(quorum_index)? {
            Some(entry) if entry.term == self.term => quorum_index,
            Some(_) => return Ok(commit_index),
            None => panic!("commit index {quorum_index} missing"),
        };

        // Commit the new entries.
        self.log.commit(commit_index)?;

        // Apply the entries and respond to the waiting clients. The response
        // variant is determined by the request kind recorded at proposal.
        let leader_id = self.id;
        let term = self.term;
        let config_changed = Self::maybe_apply_with(
            &mut self.log,
            &mut self.state,
            &mut self.cluster,
            |index, result, cluster| {
                if self.role.pending_config == Some(index) {
                    self.role.pending_config = None;
                }
                let Some(request) = self.role.requests.remove(&index) else {
                    return Ok(());
                };
                let response = match request.kind {
                    PendingKind::OpenSession => result
                        .and_then(|value| crate::encoding::bincode::deserialize(&value))
                        .map(Response::OpenSession),
                    PendingKind::Command => result.map(Response::Command),
                    PendingKind::Query => result.map(Response::Query),
                    PendingKind::KeepAlive => result.map(|_| Response::KeepAlive),
                    PendingKind::CloseSession => result.map(|_| Response::CloseSession),
                    PendingKind::Reconfigure => {
                        result.map(|_| Response::Reconfigure(cluster.to_vec()))
                    }
                    PendingKind::Metadata => result.map(|_| {
                        Response::Metadata(Metadata {
                            leader: leader_id,
                            term,
                            members: cluster.to_vec(),
                        })
                    }),
                };
                self.node_tx.send(Envelope {
                    from: leader_id,
                    to: request.from,
                    term,
                    message: Message::ClientResponse { id: request.id, response },
                })?;
                Ok(())
            },
        )?;

        // If the configuration changed, update the replication progress for
        // any added or removed members, and step down if we're no longer a
        // voter (e.g. we were demoted or removed).
        if config_changed {
            self.sync_progress();
            if !self.cluster.is_voter(self.id) {
                self.role.step_down = true;
            }
        }

        self.maybe_compact()?;
        Ok(commit_index)
    }

    /// Synchronizes the replication progress with the cluster configuration,
    /// adding new peers and dropping removed ones.
    fn sync_progress(&mut self) {
        let (last_index, _) = self.log.get_last_index();
        let next = last_index + 1;
        let peers = self.peers();
        for peer in &peers {
            self.role.progress.entry(*peer).or_insert(Progress { next, last: 0, seen: 0 });
        }
        self.role.progress.retain(|id, _| peers.contains(id));
    }

    /// Returns true while the leader lease is valid: a quorum of voters has
    /// been heard from within the election timeout window, so no other
    /// leader can have been elected. Used to serve lease-based reads without
    /// a commit round-trip.
    fn lease_valid(&self) -> bool {
        let window = self.opts.election_timeout.start;
        let fresh = self
            .cluster
            .voters()
            .into_iter()
            .filter(|id| {
                *id == self.id
                    || self.role.progress.get(id).map(|p| p.seen < window).unwrap_or(false)
            })
            .count();
        fresh as u8 >= self.quorum_size()
    }

    /// Closes sessions whose timeout has lapsed, by proposing CloseSession
    /// entries through the ordinary commit pipeline.
    fn expire_sessions(&mut self) -> Result<()> {
        let expired = self.state.expired_sessions(now_millis());
        // Sessions that finished closing no longer show up as expired.
        self.role.closing.retain(|session| expired.contains(session));
        let any = !expired.is_empty();
        for session in expired {
            if self.role.closing.insert(session) {
                info!("Session {session} timed out, closing");
                self.propose(Command::CloseSession { session, expired: true })?;
            }
        }
        if any {
            self.maybe_commit_and_apply()?;
        }
        Ok(())
    }

    /// Sends pending log entries to a peer, or a snapshot if the peer is
    /// behind the log's compaction point.
    fn send_log(&mut self, peer: NodeID) -> Result<()> {
        let Some(progress) = self.role.progress.get(&peer) else {
            debug!("Unknown peer {peer}, skipping replication");
            return Ok(());
        };
        let next = progress.next;

        let (base_index, base_term) = if next == 1 {
            (0, 0)
        } else if let Some(entry) = self.log.get(next - 1)? {
            (entry.index, entry.term)
        } else if let Some((snapshot_index, snapshot_term)) = self.log.snapshot_index() {
            if snapshot_index == next - 1 {
                (snapshot_index, snapshot_term)
            } else if snapshot_index > next - 1 {
                // The entries the peer needs have been compacted away;
                // fast-forward it with a snapshot instead.
                return self.send_install(peer);
            } else {
                panic!("missing base entry {}", next - 1);
            }
        } else {
            panic!("missing base entry {}", next - 1);
        };

        let entries = self
            .log
            .scan(next..)
            .take(MAX_APPEND_ENTRIES)
            .collect::<Result<Vec<_>>>()?;
        debug!("Replicating {} entries at base {base_index} to {peer}", entries.len());
        self.send(peer, Message::Append { base_index, base_term, entries })?;
        Ok(())
    }

    /// Sends the current snapshot to a peer that has fallen behind the
    /// compaction point.
    fn send_install(&mut self, peer: NodeID) -> Result<()> {
        let Some(snapshot) = self.log.get_snapshot()? else {
            panic!("no snapshot to install");
        };
        info!("Fast-forwarding {peer} with snapshot at {}@{}", snapshot.index, snapshot.term);
        self.send(peer, Message::Install { snapshot })?;
        Ok(())
    }
}

/// Returns the quorum (median) value of the given unsorted slice, in
/// descending order. The slice cannot be empty.
fn quorum_value<T: Ord + Copy>(mut values: Vec<T>) -> T {
    assert!(!values.is_empty(), "no values provided");
    let index = values.len() / 2;
    *values.select_nth_unstable_by(index, |a, b: &T| a.cmp(b).reverse()).1
}

#[cfg(test)]
mod tests {
    use super::super::{Change, Consistency, Entry, Log, Member, MemberRole};
    use super::*;
    use crate::service::{kv, Executor, Registry};
    use crate::storage::Memory;

    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;

    #[test]
    fn quorum_values() {
        assert_eq!(quorum_value(vec![1]), 1);
        assert_eq!(quorum_value(vec![1, 3, 2]), 2);
        assert_eq!(quorum_value(vec![4, 1, 3, 2]), 2);
        assert_eq!(quorum_value(vec![1, 1, 1, 2, 2]), 1);
        assert_eq!(quorum_value(vec![1, 1, 2, 2, 2]), 2);
    }

    /// Creates a cluster configuration of active members with the given IDs.
    fn cluster(ids: &[NodeID]) -> Cluster {
        Cluster::new(
            ids.iter().map(|id| Member::new(*id, format!("node-{id}"), MemberRole::Active)).collect(),
        )
        .expect("invalid cluster")
    }

    /// Creates a node with a fresh in-memory log and key/value executor,
    /// using deterministic timeouts.
    fn node(id: NodeID, ids: &[NodeID]) -> (Node, Receiver<Envelope>) {
        node_with_log(id, ids, Log::new(Box::new(Memory::new())).expect("log init failed"))
    }

    fn node_with_log(id: NodeID, ids: &[NodeID], log: Log) -> (Node, Receiver<Envelope>) {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let mut registry = Registry::new();
        registry.register(kv::SERVICE_TYPE, || Box::new(kv::Store::new()));
        let state = Box::new(Executor::new(registry));
        let opts = Options {
            heartbeat_interval: 3,
            election_timeout: 5..6,
            snapshot_interval: 0,
        };
        let node =
            Node::new(id, cluster(ids), log, state, node_tx, opts).expect("node init failed");
        (node, node_rx)
    }

    /// Drains all outbound messages from a node.
    fn drain(rx: &Receiver<Envelope>) -> Vec<Envelope> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    /// Builds a client request envelope addressed to the node itself.
    fn request(node: &Node, id: u8, request: Request) -> Envelope {
        Envelope {
            from: node.id(),
            to: node.id(),
            term: node.term(),
            message: Message::ClientRequest { id: vec![id], request },
        }
    }

    fn open_session_request(node: &Node, id: u8, consistency: Consistency) -> Envelope {
        request(
            node,
            id,
            Request::OpenSession {
                client: "test".to_string(),
                service: "store".to_string(),
                service_type: kv::SERVICE_TYPE.to_string(),
                consistency,
                timeout: 10_000,
            },
        )
    }

    /// Extracts the client responses from a set of envelopes.
    fn responses(messages: &[Envelope]) -> Vec<crate::error::Result<Response>> {
        messages
            .iter()
            .filter_map(|env| match &env.message {
                Message::ClientResponse { response, .. } => Some(response.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn sole_voter_becomes_leader_and_serves() -> Result<()> {
        let (node, rx) = node(1, &[1]);
        assert!(matches!(node, Node::Leader(_)));
        assert_eq!(node.term(), 1);

        // An open session request commits and applies immediately. The
        // Initialize entry is at index 1, so the session ID is 2.
        let env = open_session_request(&node, 1, Consistency::Linearizable);
        let node = node.step(env)?;
        assert_eq!(responses(&drain(&rx)), vec![Ok(Response::OpenSession(2))]);

        // Commands apply and respond.
        let env = request(
            &node,
            2,
            Request::Command {
                session: 2,
                sequence: 1,
                operation: "put".to_string(),
                payload: kv::put("k1", b"v1"),
            },
        );
        let node = node.step(env)?;
        assert_eq!(responses(&drain(&rx)), vec![Ok(Response::Command(Vec::new()))]);

        // Linearizable queries are logged, but still commit immediately on a
        // sole voter.
        let env = request(
            &node,
            3,
            Request::Query {
                session: 2,
                sequence: 1,
                operation: "get".to_string(),
                payload: kv::get("k1"),
            },
        );
        let node = node.step(env)?;
        let responses = responses(&drain(&rx));
        let Ok(Response::Query(value)) = &responses[0] else {
            panic!("unexpected response {responses:?}");
        };
        assert_eq!(kv::decode_get(value)?, Some(b"v1".to_vec()));

        drop(node);
        Ok(())
    }

    #[test]
    fn follower_campaigns_after_election_timeout() -> Result<()> {
        let (mut node, rx) = node(1, &[1, 2, 3]);
        assert!(matches!(node, Node::Follower(_)));

        for _ in 0..5 {
            node = node.tick()?;
        }
        assert!(matches!(node, Node::Candidate(_)));
        assert_eq!(node.term(), 1);

        let messages = drain(&rx);
        assert_eq!(
            messages,
            vec![
                Envelope {
                    from: 1,
                    to: 2,
                    term: 1,
                    message: Message::Campaign { last_index: 0, last_term: 0 }
                },
                Envelope {
                    from: 1,
                    to: 3,
                    term: 1,
                    message: Message::Campaign { last_index: 0, last_term: 0 }
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn candidate_becomes_leader_on_quorum() -> Result<()> {
        let (mut node, rx) = node(1, &[1, 2, 3]);
        for _ in 0..5 {
            node = node.tick()?;
        }
        drain(&rx);

        // A single additional vote gives a quorum of 2.
        node = node.step(Envelope {
            from: 2,
            to: 1,
            term: 1,
            message: Message::CampaignResponse { vote: true },
        })?;
        assert!(matches!(node, Node::Leader(_)));

        // The new leader appends an Initialize entry and replicates it,
        // followed by a heartbeat asserting its leadership.
        let messages = drain(&rx);
        let appends: Vec<_> = messages
            .iter()
            .filter(|env| matches!(env.message, Message::Append { .. }))
            .collect();
        assert_eq!(appends.len(), 2);
        let Message::Append { base_index, base_term, ref entries } = appends[0].message else {
            unreachable!();
        };
        assert_eq!((base_index, base_term), (0, 0));
        assert_eq!(
            entries.iter().map(|e| (&e.command, e.index, e.term)).collect::<Vec<_>>(),
            vec![(&Command::Initialize, 1, 1)]
        );
        assert!(messages.iter().any(|env| matches!(env.message, Message::Heartbeat { .. })));
        Ok(())
    }

    #[test]
    fn follower_grants_one_vote_per_term() -> Result<()> {
        let (node, rx) = node(1, &[1, 2, 3]);

        let node = node.step(Envelope {
            from: 2,
            to: 1,
            term: 1,
            message: Message::Campaign { last_index: 0, last_term: 0 },
        })?;
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: 1,
                to: 2,
                term: 1,
                message: Message::CampaignResponse { vote: true }
            }]
        );

        // A competing candidate in the same term is refused.
        let node = node.step(Envelope {
            from: 3,
            to: 1,
            term: 1,
            message: Message::Campaign { last_index: 0, last_term: 0 },
        })?;
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: 1,
                to: 3,
                term: 1,
                message: Message::CampaignResponse { vote: false }
            }]
        );
        drop(node);
        Ok(())
    }

    #[test]
    fn follower_refuses_outdated_candidate() -> Result<()> {
        // Seed a log with two entries in term 1.
        let mut log = Log::new(Box::new(Memory::new()))?;
        log.set_term(1, None)?;
        log.splice(vec![
            Entry { index: 1, term: 1, timestamp: 0, command: Command::Initialize },
            Entry { index: 2, term: 1, timestamp: 0, command: Command::Metadata },
        ])?;

        let (node, rx) = node_with_log(1, &[1, 2, 3], log);

        // A candidate with a shorter log in the same last term is refused.
        let node = node.step(Envelope {
            from: 2,
            to: 1,
            term: 1,
            message: Message::Campaign { last_index: 1, last_term: 1 },
        })?;
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: 1,
                to: 2,
                term: 1,
                message: Message::CampaignResponse { vote: false }
            }]
        );

        drop(node);
        Ok(())
    }

    #[test]
    fn follower_rejects_append_with_missing_base() -> Result<()> {
        let (node, rx) = node(1, &[1, 2]);

        let node = node.step(Envelope {
            from: 2,
            to: 1,
            term: 1,
            message: Message::Append { base_index: 5, base_term: 1, entries: Vec::new() },
        })?;
        let messages = drain(&rx);
        assert_eq!(
            messages,
            vec![Envelope {
                from: 1,
                to: 2,
                term: 1,
                message: Message::AppendResponse { reject: true, last_index: 0, last_term: 0 }
            }]
        );
        drop(node);
        Ok(())
    }

    #[test]
    fn follower_applies_committed_entries_from_heartbeat() -> Result<()> {
        let (node, rx) = node(1, &[1, 2]);

        let entries = vec![
            Entry { index: 1, term: 1, timestamp: 0, command: Command::Initialize },
            Entry {
                index: 2,
                term: 1,
                timestamp: 1000,
                command: Command::OpenSession {
                    client: "test".to_string(),
                    service: "store".to_string(),
                    service_type: kv::SERVICE_TYPE.to_string(),
                    consistency: Consistency::Linearizable,
                    timeout: 10_000,
                },
            },
        ];
        let node = node.step(Envelope {
            from: 2,
            to: 1,
            term: 1,
            message: Message::Append { base_index: 0, base_term: 0, entries },
        })?;
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: 1,
                to: 2,
                term: 1,
                message: Message::AppendResponse { reject: false, last_index: 2, last_term: 1 }
            }]
        );

        // The heartbeat advances the commit index and applies the entries.
        let node = node.step(Envelope {
            from: 2,
            to: 1,
            term: 1,
            message: Message::Heartbeat { commit_index: 2, commit_term: 1 },
        })?;
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: 1,
                to: 2,
                term: 1,
                message: Message::HeartbeatResponse { last_index: 2, last_term: 1 }
            }]
        );
        drop(node);
        Ok(())
    }

    #[test]
    fn leader_commits_on_quorum_ack() -> Result<()> {
        let (mut node, rx) = node(1, &[1, 2, 3]);
        for _ in 0..5 {
            node = node.tick()?;
        }
        node = node.step(Envelope {
            from: 2,
            to: 1,
            term: 1,
            message: Message::CampaignResponse { vote: true },
        })?;
        drain(&rx);

        // Propose an open session; no response until a quorum acks.
        let env = open_session_request(&node, 1, Consistency::Linearizable);
        node = node.step(env)?;
        assert_eq!(responses(&drain(&rx)), Vec::new());

        // An append ack from node 2 gives a quorum (1, 2), committing and
        // applying the entry, and responding to the client.
        node = node.step(Envelope {
            from: 2,
            to: 1,
            term: 1,
            message: Message::AppendResponse { reject: false, last_index: 2, last_term: 1 },
        })?;
        assert_eq!(responses(&drain(&rx)), vec![Ok(Response::OpenSession(2))]);

        drop(node);
        Ok(())
    }

    #[test]
    fn leader_reverts_on_higher_term() -> Result<()> {
        let (mut node, rx) = node(1, &[1, 2, 3]);
        for _ in 0..5 {
            node = node.tick()?;
        }
        node = node.step(Envelope {
            from: 2,
            to: 1,
            term: 1,
            message: Message::CampaignResponse { vote: true },
        })?;
        assert!(matches!(node, Node::Leader(_)));
        drain(&rx);

        // A heartbeat from a leader in a later term reverts us to follower.
        node = node.step(Envelope {
            from: 3,
            to: 1,
            term: 2,
            message: Message::Heartbeat { commit_index: 0, commit_term: 0 },
        })?;
        assert!(matches!(node, Node::Follower(_)));
        assert_eq!(node.term(), 2);
        Ok(())
    }

    #[test]
    fn concurrent_reconfiguration_conflicts() -> Result<()> {
        let (mut node, rx) = node(1, &[1, 2, 3]);
        for _ in 0..5 {
            node = node.tick()?;
        }
        node = node.step(Envelope {
            from: 2,
            to: 1,
            term: 1,
            message: Message::CampaignResponse { vote: true },
        })?;
        drain(&rx);

        // The first change is accepted and proposed.
        let change = Change::Join(Member::new(4, "node-4", MemberRole::Promotable));
        let env = request(&node, 1, Request::Reconfigure(change));
        node = node.step(env)?;
        assert_eq!(responses(&drain(&rx)), Vec::new());

        // A second change while the first is uncommitted conflicts.
        let change = Change::Leave(3);
        let env = request(&node, 2, Request::Reconfigure(change));
        node = node.step(env)?;
        assert_eq!(responses(&drain(&rx)), vec![Err(Error::ConfigConflict)]);

        drop(node);
        Ok(())
    }

    #[test]
    fn sequential_reads_skip_the_log() -> Result<()> {
        let (node, rx) = node(1, &[1]);

        let env = open_session_request(&node, 1, Consistency::Sequential);
        let node = node.step(env)?;
        let session = match &responses(&drain(&rx))[0] {
            Ok(Response::OpenSession(id)) => *id,
            response => panic!("unexpected response {response:?}"),
        };

        // A sequential read responds immediately without appending to the
        // log.
        let env = request(
            &node,
            2,
            Request::Query {
                session,
                sequence: 0,
                operation: "get".to_string(),
                payload: kv::get("missing"),
            },
        );
        let node = node.step(env)?;
        let responses = responses(&drain(&rx));
        let Ok(Response::Query(value)) = &responses[0] else {
            panic!("unexpected response {responses:?}");
        };
        assert_eq!(kv::decode_get(value)?, None);

        drop(node);
        Ok(())
    }
}
