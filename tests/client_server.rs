//! End-to-end client/server tests over TCP, using a single-node cluster
//! (which commits immediately) and the real client proxy with keep-alives.

use quorum::error::{Error, Result};
use quorum::raft::{Cluster, Consistency, Log, Member, MemberRole, Options};
use quorum::service::{kv, Executor, Registry};
use quorum::storage::Memory;
use quorum::{Client, Server, Strategy};

use std::collections::HashMap;
use std::time::Duration;

/// Starts a single-node server on ephemeral ports, returning the client
/// address. The server threads are detached and die with the test process.
fn serve_single_node() -> Result<String> {
    let raft_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let client_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let client_addr = client_listener.local_addr()?.to_string();

    let cluster = Cluster::new(vec![Member::new(1, client_addr.clone(), MemberRole::Active)])?;
    let log = Log::new(Box::new(Memory::new()))?;
    let mut registry = Registry::new();
    registry.register(kv::SERVICE_TYPE, || Box::new(kv::Store::new()));
    let state = Box::new(Executor::new(registry));
    let server = Server::new(1, cluster, HashMap::new(), log, state, Options::default())?;

    std::thread::spawn(move || server.serve(raft_listener, client_listener));
    Ok(client_addr)
}

#[test]
fn session_lifecycle_and_operations() -> Result<()> {
    let addr = serve_single_node()?;
    let mut client = Client::connect(vec![addr], Strategy::Leader)?;

    // Cluster status resolves the leader and members.
    let status = client.status()?;
    assert_eq!(status.leader, 1);
    assert_eq!(status.members.len(), 1);

    // Operations without a session fail.
    assert!(matches!(
        client.execute("put", kv::put("k1", b"v1")),
        Err(Error::InvalidInput(_))
    ));

    // Open a session and read/write through it.
    client.open_session(
        "store",
        kv::SERVICE_TYPE,
        Consistency::Linearizable,
        Duration::from_secs(5),
    )?;
    client.execute("put", kv::put("k1", b"v1"))?;
    assert_eq!(kv::decode_get(&client.query("get", kv::get("k1"))?)?, Some(b"v1".to_vec()));
    assert_eq!(kv::decode_get(&client.query("get", kv::get("missing"))?)?, None);

    // Unknown operations surface as deterministic input errors.
    assert!(matches!(client.execute("nope", Vec::new()), Err(Error::InvalidInput(_))));

    // Metadata reflects the cluster.
    let metadata = client.metadata()?;
    assert_eq!(metadata.leader, 1);
    assert_eq!(metadata.members.len(), 1);

    client.close_session()?;

    // A new session on the same service sees the old data.
    client.open_session(
        "store",
        kv::SERVICE_TYPE,
        Consistency::Linearizable,
        Duration::from_secs(5),
    )?;
    assert_eq!(kv::decode_get(&client.query("get", kv::get("k1"))?)?, Some(b"v1".to_vec()));
    client.close_session()?;
    Ok(())
}

#[test]
fn sequential_reads_with_any_routing() -> Result<()> {
    let addr = serve_single_node()?;
    let mut client = Client::connect(vec![addr], Strategy::Any)?;

    client.open_session(
        "store",
        kv::SERVICE_TYPE,
        Consistency::Sequential,
        Duration::from_secs(5),
    )?;
    client.execute("put", kv::put("k1", b"v1"))?;
    assert_eq!(kv::decode_get(&client.query("get", kv::get("k1"))?)?, Some(b"v1".to_vec()));
    client.close_session()?;
    Ok(())
}
