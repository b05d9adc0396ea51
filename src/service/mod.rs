//! Replicated services. A service is a deterministic state machine that
//! exposes named operations, applied through the Raft log. The executor
//! dispatches committed entries to service instances and manages client
//! sessions (exactly-once commands, ordered application, expiry).

mod executor;
pub mod kv;

pub use executor::Executor;

use crate::error::Result;

use std::collections::HashMap;

/// The kind of a service operation. Commands mutate state and are always
/// replicated through the log; queries are read-only and may be served from
/// applied state without logging, depending on the session's consistency
/// level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Command,
    Query,
}

/// A service's operation table: the closed set of operations it exposes,
/// fixed at startup. Dispatch is a table lookup by operation name followed by
/// a typed decode of the payload.
pub type Operations = &'static [(&'static str, Kind)];

/// A deterministic replicated service. Commands are applied in the same
/// order on every node and must yield the same state and results everywhere;
/// any non-determinism (clocks, randomness, IO) will diverge the replicas.
///
/// Handler errors are part of the deterministic result: they are returned to
/// the invoking client without halting the replication pipeline.
pub trait Service: Send {
    /// Returns the service's operation table.
    fn operations(&self) -> Operations;

    /// Applies a mutating operation, returning its result.
    fn command(&mut self, operation: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Executes a read-only operation. Must not make any state changes.
    fn query(&self, operation: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Captures the full service state as a snapshot blob.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the service state with a snapshot blob.
    fn install(&mut self, data: &[u8]) -> Result<()>;

    /// Looks up the kind of an operation, or None if it isn't registered.
    fn kind(&self, operation: &str) -> Option<Kind> {
        self.operations().iter().find(|(name, _)| *name == operation).map(|(_, kind)| *kind)
    }
}

/// A registry of service types, mapping a type name to a constructor for new
/// instances. Passed explicitly to each executor at construction; there is no
/// process-wide registry.
#[derive(Clone)]
pub struct Registry {
    factories: HashMap<String, fn() -> Box<dyn Service>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    /// Registers a service type.
    pub fn register(&mut self, service_type: &str, factory: fn() -> Box<dyn Service>) {
        self.factories.insert(service_type.to_string(), factory);
    }

    /// Constructs a new instance of a service type. Unknown types are a
    /// deterministic error, since the registry is identical on all nodes.
    pub fn spawn(&self, service_type: &str) -> Result<Box<dyn Service>> {
        match self.factories.get(service_type) {
            Some(factory) => Ok(factory()),
            None => Err(crate::errinput!("unknown service type {service_type}")),
        }
    }
}
