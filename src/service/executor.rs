use super::{Kind, Registry, Service};
use crate::encoding::bincode;
use crate::error::{Error, Result};
use crate::raft::{self, Command, Consistency, Entry, Index, Sequence, SessionID};

use log::{debug, info};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A client session. Sessions are created, renewed, and destroyed
/// exclusively by log entries applied in index order, never by direct
/// request handling, so every node derives the same session table from the
/// log alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// The session ID: the index of the OpenSession entry that created it.
    pub id: SessionID,
    /// The opening client's identifier.
    pub client: String,
    /// The service instance the session operates on.
    pub service: String,
    /// The session's read consistency level.
    pub consistency: Consistency,
    /// The session timeout in milliseconds.
    pub timeout: u64,
    /// The timestamp of the last entry that renewed the session. Taken from
    /// entry timestamps, so expiry is evaluated identically on every node.
    pub last_keepalive: u64,
    /// The highest event index the client has acknowledged.
    pub event_ack: Index,
    /// The highest command sequence number applied for this session.
    pub last_sequence: Sequence,
    /// Cached command results by sequence number, for deduplication. A
    /// retransmitted command returns the original result without re-running
    /// the handler. Pruned by keep-alive acknowledgements.
    results: BTreeMap<Sequence, Result<Vec<u8>>>,
    /// Commands that arrived ahead of their sequence order, buffered until
    /// the gap fills. Keyed by sequence, valued by their log position and
    /// operation. Identical on every node, since buffering is a pure
    /// function of the log.
    pending_commands: BTreeMap<Sequence, Buffered>,
    /// Logged queries waiting for the session's command sequence to catch up
    /// to theirs.
    pending_queries: BTreeMap<Sequence, Vec<Buffered>>,
}

/// A buffered command or query, waiting for its sequence turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Buffered {
    /// The log index the entry was committed at.
    index: Index,
    /// The operation name.
    operation: String,
    /// The operation payload.
    payload: Vec<u8>,
}

/// A named service instance.
struct Instance {
    service_type: String,
    service: Box<dyn Service>,
}

/// The serialized executor state, for snapshots.
#[derive(Serialize, Deserialize)]
struct SnapshotData {
    applied_index: Index,
    sessions: Vec<Session>,
    services: Vec<(String, String, Vec<u8>)>,
}

/// The service executor: applies committed log entries to service instances
/// and maintains the session table. Driven by the Raft node on its single
/// apply thread, strictly in index order, so handlers are never invoked
/// concurrently or out of order.
pub struct Executor {
    /// The service type registry.
    registry: Registry,
    /// Service instances by name, created on first session open.
    services: BTreeMap<String, Instance>,
    /// Client sessions by ID.
    sessions: BTreeMap<SessionID, Session>,
    /// The index of the last applied entry.
    applied_index: Index,
}

impl Executor {
    /// Creates a new executor with the given service registry.
    pub fn new(registry: Registry) -> Self {
        Self { registry, services: BTreeMap::new(), sessions: BTreeMap::new(), applied_index: 0 }
    }

    /// Fetches a session, if it exists.
    pub fn session(&self, id: SessionID) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Opens a session, creating the service instance if needed. The session
    /// ID is the open entry's own log index, which is unique and allocated
    /// atomically with the log.
    fn open_session(
        &mut self,
        id: SessionID,
        now: u64,
        client: String,
        service: String,
        service_type: String,
        consistency: Consistency,
        timeout: u64,
    ) -> Result<Vec<u8>> {
        if timeout == 0 {
            return Err(Error::InvalidInput("session timeout must be positive".to_string()));
        }
        match self.services.get(&service) {
            Some(instance) if instance.service_type != service_type => {
                return Err(Error::InvalidInput(format!(
                    "service {service} already exists with type {}",
                    instance.service_type
                )));
            }
            Some(_) => {}
            None => {
                let instance =
                    Instance { service_type: service_type.clone(), service: self.registry.spawn(&service_type)? };
                self.services.insert(service.clone(), instance);
            }
        }
        info!("Opened session {id} for client {client} on service {service}");
        self.sessions.insert(
            id,
            Session {
                id,
                client,
                service,
                consistency,
                timeout,
                last_keepalive: now,
                event_ack: 0,
                last_sequence: 0,
                results: BTreeMap::new(),
                pending_commands: BTreeMap::new(),
                pending_queries: BTreeMap::new(),
            },
        );
        Ok(bincode::serialize(&id))
    }

    /// Renews a session from a keep-alive entry, releasing cached results the
    /// client has acknowledged.
    fn keepalive(
        &mut self,
        id: SessionID,
        now: u64,
        command_sequence: Sequence,
        event_ack: Index,
    ) -> Result<Vec<u8>> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Err(Error::SessionExpired);
        };
        session.last_keepalive = now;
        session.event_ack = session.event_ack.max(event_ack);
        session.results = session.results.split_off(&(command_sequence + 1));
        Ok(Vec::new())
    }

    /// Closes a session, releasing all its state. Closing an already-removed
    /// session is an error for clients, but a noop for leader-driven expiry
    /// (a session may expire just as the client closes it).
    fn close_session(&mut self, id: SessionID, expired: bool) -> Result<Vec<u8>> {
        match self.sessions.remove(&id) {
            Some(session) => {
                info!(
                    "Closed session {id} for client {client}{expired}",
                    client = session.client,
                    expired = if expired { " (expired)" } else { "" }
                );
                Ok(Vec::new())
            }
            None if expired => Ok(Vec::new()),
            None => Err(Error::SessionExpired),
        }
    }

    /// Applies a command entry. In-order commands execute immediately and
    /// then flush any buffered entries whose turn has come; ahead-of-order
    /// commands are buffered; already-seen sequence numbers return the
    /// cached result without re-running the handler.
    fn apply_command(
        &mut self,
        index: Index,
        now: u64,
        session_id: SessionID,
        sequence: Sequence,
        operation: String,
        payload: Vec<u8>,
        results: &mut Vec<(Index, Result<Vec<u8>>)>,
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            results.push((index, Err(Error::SessionExpired)));
            return Ok(());
        };
        session.last_keepalive = now;

        if sequence <= session.last_sequence {
            let result = session.results.get(&sequence).cloned().unwrap_or_else(|| {
                Err(Error::InvalidInput(format!(
                    "result for sequence {sequence} no longer retained"
                )))
            });
            debug!("Session {session_id} sequence {sequence} already applied, using cached result");
            results.push((index, result));
            return Ok(());
        }
        if sequence > session.last_sequence + 1 {
            debug!("Buffering session {session_id} sequence {sequence} ahead of order");
            session.pending_commands.insert(sequence, Buffered { index, operation, payload });
            return Ok(());
        }

        let mut sequence = sequence;
        let mut next = Buffered { index, operation, payload };
        loop {
            // Execute the command and cache its result for deduplication.
            let service = self.sessions[&session_id].service.clone();
            let result =
                Self::dispatch_command(&mut self.services, &service, &next.operation, &next.payload);
            if let Err(err) = &result {
                if !err.is_deterministic() {
                    return Err(err.clone());
                }
            }
            let session = self.sessions.get_mut(&session_id).expect("session vanished");
            session.last_sequence = sequence;
            session.results.insert(sequence, result.clone());
            results.push((next.index, result));

            // Flush any queries that were waiting for this sequence.
            let ready_queries: Vec<Buffered> = {
                let sequences: Vec<Sequence> =
                    session.pending_queries.range(..=sequence).map(|(s, _)| *s).collect();
                sequences
                    .into_iter()
                    .flat_map(|s| session.pending_queries.remove(&s).unwrap_or_default())
                    .collect()
            };
            for query in ready_queries {
                let result =
                    Self::dispatch_query(&self.services, &service, &query.operation, &query.payload);
                if let Err(err) = &result {
                    if !err.is_deterministic() {
                        return Err(err.clone());
                    }
                }
                results.push((query.index, result));
            }

            // Continue with the next buffered command, if its turn has come.
            let session = self.sessions.get_mut(&session_id).expect("session vanished");
            match session.pending_commands.remove(&(sequence + 1)) {
                Some(buffered) => {
                    sequence += 1;
                    next = buffered;
                }
                None => return Ok(()),
            }
        }
    }

    /// Applies a logged query entry. The query executes once the session's
    /// command sequence has caught up with it, and is buffered otherwise.
    /// Queries never advance the sequence and are not deduplicated, since
    /// they are read-only.
    fn apply_query(
        &mut self,
        index: Index,
        now: u64,
        session_id: SessionID,
        sequence: Sequence,
        operation: String,
        payload: Vec<u8>,
        results: &mut Vec<(Index, Result<Vec<u8>>)>,
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            results.push((index, Err(Error::SessionExpired)));
            return Ok(());
        };
        session.last_keepalive = now;

        if sequence > session.last_sequence {
            debug!("Buffering session {session_id} query until sequence {sequence}");
            session.pending_queries.entry(sequence).or_default().push(Buffered {
                index,
                operation,
                payload,
            });
            return Ok(());
        }
        let service = session.service.clone();
        let result = Self::dispatch_query(&self.services, &service, &operation, &payload);
        if let Err(err) = &result {
            if !err.is_deterministic() {
                return Err(err.clone());
            }
        }
        results.push((index, result));
        Ok(())
    }

    /// Dispatches a command to a service instance, enforcing the operation
    /// table: the operation must be registered as a command.
    fn dispatch_command(
        services: &mut BTreeMap<String, Instance>,
        service: &str,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let Some(instance) = services.get_mut(service) else {
            return Err(Error::Internal(format!("service {service} not found")));
        };
        match instance.service.kind(operation) {
            Some(Kind::Command) => instance.service.command(operation, payload),
            Some(Kind::Query) => {
                Err(Error::InvalidInput(format!("operation {operation} is read-only")))
            }
            None => Err(Error::InvalidInput(format!("unknown operation {operation}"))),
        }
    }

    /// Dispatches a query to a service instance, enforcing the operation
    /// table: the operation must be registered as a query.
    fn dispatch_query(
        services: &BTreeMap<String, Instance>,
        service: &str,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let Some(instance) = services.get(service) else {
            return Err(Error::Internal(format!("service {service} not found")));
        };
        match instance.service.kind(operation) {
            Some(Kind::Query) => instance.service.query(operation, payload),
            Some(Kind::Command) => {
                Err(Error::InvalidInput(format!("operation {operation} mutates state")))
            }
            None => Err(Error::InvalidInput(format!("unknown operation {operation}"))),
        }
    }
}

impl raft::State for Executor {
    fn applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, entry: Entry) -> Result<Vec<(Index, Result<Vec<u8>>)>> {
        assert_eq!(entry.index, self.applied_index + 1, "entries must be applied in order");
        let index = entry.index;
        let now = entry.timestamp;
        let mut results = Vec::new();
        match entry.command {
            // Consensus-level entries are no-ops here; the Raft node consumes
            // Configuration entries itself, and Metadata responses are built
            // by the leader when the entry applies.
            Command::Initialize | Command::Configuration { .. } | Command::Metadata => {
                results.push((index, Ok(Vec::new())));
            }
            Command::OpenSession { client, service, service_type, consistency, timeout } => {
                let result = self
                    .open_session(index, now, client, service, service_type, consistency, timeout);
                results.push((index, result));
            }
            Command::KeepAlive { session, command_sequence, event_ack } => {
                results.push((index, self.keepalive(session, now, command_sequence, event_ack)));
            }
            Command::CloseSession { session, expired } => {
                results.push((index, self.close_session(session, expired)));
            }
            Command::Command { session, sequence, operation, payload } => {
                self.apply_command(index, now, session, sequence, operation, payload, &mut results)?;
            }
            Command::Query { session, sequence, operation, payload } => {
                self.apply_query(index, now, session, sequence, operation, payload, &mut results)?;
            }
        }
        self.applied_index = index;
        Ok(results)
    }

    fn query(&self, session: SessionID, operation: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let Some(session) = self.sessions.get(&session) else {
            return Err(Error::SessionExpired);
        };
        Self::dispatch_query(&self.services, &session.service, operation, payload)
    }

    fn consistency(&self, session: SessionID) -> Result<Consistency> {
        self.sessions.get(&session).map(|s| s.consistency).ok_or(Error::SessionExpired)
    }

    fn expired_sessions(&self, now: u64) -> Vec<SessionID> {
        self.sessions
            .values()
            .filter(|s| now.saturating_sub(s.last_keepalive) > s.timeout)
            .map(|s| s.id)
            .collect()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let services = self
            .services
            .iter()
            .map(|(name, instance)| {
                Ok((name.clone(), instance.service_type.clone(), instance.service.snapshot()?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(bincode::serialize(&SnapshotData {
            applied_index: self.applied_index,
            sessions: self.sessions.values().cloned().collect(),
            services,
        }))
    }

    fn install(&mut self, index: Index, data: &[u8]) -> Result<()> {
        let data: SnapshotData = bincode::deserialize(data)?;
        if data.applied_index != index {
            return Err(Error::InvalidData(format!(
                "snapshot applied index {} does not match {index}",
                data.applied_index
            )));
        }
        let mut services = BTreeMap::new();
        for (name, service_type, blob) in data.services {
            let mut service = self.registry.spawn(&service_type)?;
            service.install(&blob)?;
            services.insert(name, Instance { service_type, service });
        }
        self.services = services;
        self.sessions = data.sessions.into_iter().map(|s| (s.id, s)).collect();
        self.applied_index = index;
        info!("Installed snapshot at applied index {index}");
        Ok(())
    }
}
