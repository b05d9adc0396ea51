use crate::encoding::bincode;
use crate::error::{Error, Result};
use crate::raft::{
    Change, Consistency, Member, Metadata, NodeID, Request, Response, SessionID, Status,
};

use log::{debug, error};
use rand::seq::SliceRandom as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The maximum number of attempts per request, across leader changes and
/// network failures.
const MAX_RETRIES: usize = 5;

/// The initial retry backoff. Doubled on every attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// The number of consecutive keep-alive failures after which the session is
/// considered expired.
const KEEPALIVE_FAILURES: u32 = 3;

/// The per-call socket timeout. A call that doesn't complete within it fails
/// with a network error and is retried; deduplication makes the retry safe.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// The client-side routing policy for queries. Commands always go to the
/// leader; queries can be spread across the cluster, since followers forward
/// them and the consistency guarantees are enforced server-side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Always route to the leader.
    Leader,
    /// Prefer non-leader members, to spread read load.
    Followers,
    /// Route to any member.
    Any,
}

/// A connection to a cluster member, speaking length-free Bincode framing
/// over TCP: a Request followed by a Result<Response>, in lockstep.
struct Connection {
    socket: std::net::TcpStream,
}

impl Connection {
    /// Connects to the given address.
    fn connect(addr: &str) -> Result<Self> {
        let socket = std::net::TcpStream::connect(addr)?;
        socket.set_read_timeout(Some(CALL_TIMEOUT))?;
        socket.set_write_timeout(Some(CALL_TIMEOUT))?;
        Ok(Self { socket })
    }

    /// Executes a request over the connection.
    fn call(&mut self, request: &Request) -> Result<Response> {
        bincode::serialize_into(&mut self.socket, request)?;
        bincode::deserialize_from::<_, Result<Response>>(&mut self.socket)?
    }
}

/// Cluster connection state: the known members, the last known leader, and a
/// cached connection. Shared between the client and its keep-alive thread
/// (each has its own copy, since connections are not shareable).
struct Remote {
    /// Seed addresses given at connect time, tried when members are unknown.
    seeds: Vec<String>,
    /// The known cluster members, refreshed from status responses.
    members: Vec<Member>,
    /// The last known leader.
    leader: Option<NodeID>,
    /// A cached connection to the leader.
    conn: Option<Connection>,
}

impl Remote {
    fn new(seeds: Vec<String>) -> Self {
        Self { seeds, members: Vec::new(), leader: None, conn: None }
    }

    /// Executes a request against the leader, retrying with backoff on
    /// network failures, redirects, and aborted requests. Requests carry
    /// their session sequence number, so server-side deduplication makes
    /// retries exactly-once.
    fn call_leader(&mut self, request: &Request) -> Result<Response> {
        let mut backoff = RETRY_BACKOFF;
        let mut last = Error::Network("no cluster members reachable".to_string());
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            match self.try_leader(request) {
                Ok(response) => return Ok(response),
                // The contacted node wasn't the leader; follow the redirect
                // hint if any, otherwise re-resolve from scratch.
                Err(Error::NotLeader { leader }) => {
                    debug!("Not leader, redirecting to {leader:?}");
                    self.conn = None;
                    self.leader = leader;
                    last = Error::NotLeader { leader };
                }
                // The request was aborted by a leader change; retry.
                Err(Error::Abort) => last = Error::Abort,
                Err(err @ Error::Network(_)) => {
                    debug!("Request failed: {err}");
                    self.conn = None;
                    self.leader = None;
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    /// Executes a single request attempt against the best-known leader.
    fn try_leader(&mut self, request: &Request) -> Result<Response> {
        if self.conn.is_none() {
            let addr = self.leader_addr()?;
            self.conn = Some(Connection::connect(&addr)?);
        }
        self.conn.as_mut().expect("no connection").call(request)
    }

    /// Returns the leader's address, resolving it via a status request if
    /// unknown.
    fn leader_addr(&mut self) -> Result<String> {
        if let Some(leader) = self.leader {
            if let Some(member) = self.members.iter().find(|m| m.id == leader) {
                return Ok(member.addr.clone());
            }
        }
        let status = self.fetch_status()?;
        self.leader = Some(status.leader);
        self.members = status.members;
        self.members
            .iter()
            .find(|m| Some(m.id) == self.leader)
            .map(|m| m.addr.clone())
            .ok_or_else(|| Error::Network("leader address unknown".to_string()))
    }

    /// Fetches cluster status from any reachable member. Followers forward
    /// the request to the leader.
    fn fetch_status(&mut self) -> Result<Status> {
        let mut addrs: Vec<String> = self.members.iter().map(|m| m.addr.clone()).collect();
        let extra: Vec<String> = self.seeds.iter().filter(|s| !addrs.contains(s)).cloned().collect();
        addrs.extend(extra);
        let mut last = Error::Network("no cluster members reachable".to_string());
        for addr in addrs {
            match Connection::connect(&addr).and_then(|mut conn| conn.call(&Request::Status)) {
                Ok(Response::Status(status)) => return Ok(status),
                Ok(response) => {
                    return Err(Error::Internal(format!("unexpected response {response:?}")))
                }
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    /// Executes a query against a member chosen by the routing strategy.
    /// Followers forward queries to the leader, so any member will do; this
    /// only spreads connection load.
    fn call_routed(&mut self, strategy: Strategy, request: &Request) -> Result<Response> {
        if strategy == Strategy::Leader || self.members.is_empty() {
            return self.call_leader(request);
        }
        let candidates: Vec<Member> = match strategy {
            Strategy::Leader => unreachable!(),
            Strategy::Followers => {
                let followers: Vec<Member> = self
                    .members
                    .iter()
                    .filter(|m| Some(m.id) != self.leader)
                    .cloned()
                    .collect();
                if followers.is_empty() {
                    self.members.clone()
                } else {
                    followers
                }
            }
            Strategy::Any => self.members.clone(),
        };

        let mut backoff = RETRY_BACKOFF;
        let mut last = Error::Network("no cluster members reachable".to_string());
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            let member = candidates.choose(&mut rand::thread_rng()).expect("no candidates");
            match Connection::connect(&member.addr).and_then(|mut conn| conn.call(request)) {
                Ok(response) => return Ok(response),
                // The member has no leader to forward to yet; retry.
                Err(Error::NotLeader { leader }) => {
                    self.leader = leader;
                    last = Error::NotLeader { leader };
                }
                Err(Error::Abort) => last = Error::Abort,
                Err(err @ Error::Network(_)) => last = err,
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }
}

/// A client session handle, shared with the keep-alive thread.
struct Session {
    /// The server-assigned session ID.
    id: SessionID,
    /// The last allocated command sequence number. Incremented for every
    /// command; queries carry the current value without incrementing it.
    sequence: AtomicU64,
    /// Set when the session has expired, either detected by the keep-alive
    /// thread or reported by the server. All further operations fail with
    /// Error::SessionExpired until a new session is opened.
    expired: AtomicBool,
}

/// A client for a quorum cluster: opens a session against a replicated
/// service and invokes operations on it. Commands are routed to the leader
/// and applied exactly once per sequence number; queries are routed per the
/// communication strategy. A background thread renews the session at a third
/// of its timeout.
pub struct Client {
    remote: Remote,
    strategy: Strategy,
    session: Option<Arc<Session>>,
    keepalive: Option<(crossbeam::channel::Sender<()>, std::thread::JoinHandle<()>)>,
}

impl Client {
    /// Connects to a cluster via the given seed addresses, and resolves the
    /// current leader and member set.
    pub fn connect(seeds: Vec<String>, strategy: Strategy) -> Result<Self> {
        let mut remote = Remote::new(seeds);
        let status = remote.fetch_status()?;
        remote.leader = Some(status.leader);
        remote.members = status.members;
        Ok(Self { remote, strategy, session: None, keepalive: None })
    }

    /// Opens a session against a named service instance, creating it from
    /// the given service type if it doesn't exist. Starts the keep-alive
    /// thread.
    pub fn open_session(
        &mut self,
        service: &str,
        service_type: &str,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<SessionID> {
        if self.session.is_some() {
            return Err(Error::InvalidInput("session already open".to_string()));
        }
        let request = Request::OpenSession {
            client: uuid::Uuid::new_v4().to_string(),
            service: service.to_string(),
            service_type: service_type.to_string(),
            consistency,
            timeout: timeout.as_millis() as u64,
        };
        match self.remote.call_leader(&request)? {
            Response::OpenSession(id) => {
                debug!("Opened session {id}");
                let session = Arc::new(Session {
                    id,
                    sequence: AtomicU64::new(0),
                    expired: AtomicBool::new(false),
                });
                self.session = Some(session.clone());
                self.spawn_keepalive(session, timeout);
                Ok(id)
            }
            response => Err(Error::Internal(format!("unexpected response {response:?}"))),
        }
    }

    /// Invokes a mutating operation on the session's service. Retries use
    /// the same sequence number, so the command applies exactly once.
    pub fn execute(&mut self, operation: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let session = self.session()?;
        let sequence = session.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let request = Request::Command {
            session: session.id,
            sequence,
            operation: operation.to_string(),
            payload,
        };
        let result = self.remote.call_leader(&request);
        if let Err(Error::SessionExpired) = result {
            session.expired.store(true, Ordering::SeqCst);
        }
        match result? {
            Response::Command(result) => Ok(result),
            response => Err(Error::Internal(format!("unexpected response {response:?}"))),
        }
    }

    /// Invokes a read-only operation on the session's service, routed per
    /// the communication strategy. The read consistency level was fixed when
    /// the session was opened.
    pub fn query(&mut self, operation: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let session = self.session()?;
        let request = Request::Query {
            session: session.id,
            sequence: session.sequence.load(Ordering::SeqCst),
            operation: operation.to_string(),
            payload,
        };
        let result = self.remote.call_routed(self.strategy, &request);
        if let Err(Error::SessionExpired) = result {
            session.expired.store(true, Ordering::SeqCst);
        }
        match result? {
            Response::Query(result) => Ok(result),
            response => Err(Error::Internal(format!("unexpected response {response:?}"))),
        }
    }

    /// Closes the current session.
    pub fn close_session(&mut self) -> Result<()> {
        self.stop_keepalive();
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        if session.expired.load(Ordering::SeqCst) {
            return Err(Error::SessionExpired);
        }
        match self.remote.call_leader(&Request::CloseSession { session: session.id })? {
            Response::CloseSession => Ok(()),
            response => Err(Error::Internal(format!("unexpected response {response:?}"))),
        }
    }

    /// Adds a new member to the cluster, blocking until the configuration
    /// change commits.
    pub fn join(&mut self, member: Member) -> Result<Vec<Member>> {
        self.reconfigure(Change::Join(member))
    }

    /// Removes a member from the cluster.
    pub fn leave(&mut self, id: NodeID) -> Result<Vec<Member>> {
        self.reconfigure(Change::Leave(id))
    }

    /// Promotes a member to a voter.
    pub fn promote(&mut self, id: NodeID) -> Result<Vec<Member>> {
        self.reconfigure(Change::Promote(id))
    }

    /// Demotes a voting member to passive.
    pub fn demote(&mut self, id: NodeID) -> Result<Vec<Member>> {
        self.reconfigure(Change::Demote(id))
    }

    fn reconfigure(&mut self, change: Change) -> Result<Vec<Member>> {
        match self.remote.call_leader(&Request::Reconfigure(change))? {
            Response::Reconfigure(members) => {
                self.remote.members = members.clone();
                Ok(members)
            }
            response => Err(Error::Internal(format!("unexpected response {response:?}"))),
        }
    }

    /// Fetches cluster metadata (leader, term, members) as of a committed
    /// log entry, reflecting all prior configuration changes.
    pub fn metadata(&mut self) -> Result<Metadata> {
        match self.remote.call_leader(&Request::Metadata)? {
            Response::Metadata(metadata) => {
                self.remote.leader = Some(metadata.leader);
                self.remote.members = metadata.members.clone();
                Ok(metadata)
            }
            response => Err(Error::Internal(format!("unexpected response {response:?}"))),
        }
    }

    /// Fetches node status from the leader.
    pub fn status(&mut self) -> Result<Status> {
        let status = self.remote.fetch_status()?;
        self.remote.leader = Some(status.leader);
        self.remote.members = status.members.clone();
        Ok(status)
    }

    /// Returns the current session handle, or an error if there is none or
    /// it has expired.
    fn session(&self) -> Result<Arc<Session>> {
        let Some(session) = &self.session else {
            return Err(Error::InvalidInput("no open session".to_string()));
        };
        if session.expired.load(Ordering::SeqCst) {
            return Err(Error::SessionExpired);
        }
        Ok(session.clone())
    }

    /// Spawns the keep-alive thread, renewing the session at a third of its
    /// timeout. Repeated failures mark the session expired.
    fn spawn_keepalive(&mut self, session: Arc<Session>, timeout: Duration) {
        let interval = (timeout / 3).max(Duration::from_millis(10));
        let mut remote = Remote::new(self.remote.seeds.clone());
        remote.members = self.remote.members.clone();
        remote.leader = self.remote.leader;
        let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
        let handle =
            std::thread::spawn(move || Self::keepalive_loop(remote, session, interval, stop_rx));
        self.keepalive = Some((stop_tx, handle));
    }

    /// Runs the keep-alive loop until stopped or the session expires.
    fn keepalive_loop(
        mut remote: Remote,
        session: Arc<Session>,
        interval: Duration,
        stop_rx: crossbeam::channel::Receiver<()>,
    ) {
        let ticker = crossbeam::channel::tick(interval);
        let mut failures = 0;
        loop {
            crossbeam::select! {
                recv(stop_rx) -> _ => return,
                recv(ticker) -> _ => {
                    let request = Request::KeepAlive {
                        session: session.id,
                        command_sequence: session.sequence.load(Ordering::SeqCst),
                        event_ack: 0,
                    };
                    match remote.call_leader(&request) {
                        Ok(_) => failures = 0,
                        Err(Error::SessionExpired) => {
                            error!("Session {} expired", session.id);
                            session.expired.store(true, Ordering::SeqCst);
                            return;
                        }
                        Err(err) => {
                            debug!("Keep-alive failed: {err}");
                            failures += 1;
                            if failures >= KEEPALIVE_FAILURES {
                                error!("Session {} expired after {failures} failed keep-alives", session.id);
                                session.expired.store(true, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stops the keep-alive thread, if running.
    fn stop_keepalive(&mut self) {
        if let Some((stop_tx, handle)) = self.keepalive.take() {
            let _ = stop_tx.send(());
            let _ = handle.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop_keepalive();
    }
}
