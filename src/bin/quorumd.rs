//! The quorum server: a replicated state machine node. Loads its
//! configuration, joins up with its peers, and serves client sessions
//! against the registered services.

#![warn(clippy::all)]

use quorum::error::Result;
use quorum::raft::{Cluster, Log, Member, MemberRole, NodeID, Options};
use quorum::service::{kv, Executor, Registry};
use quorum::storage::Memory;

use serde_derive::Deserialize;
use std::collections::HashMap;

fn main() -> Result<()> {
    let opts = clap::App::new("quorumd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A replicated state machine server using Raft consensus.")
        .arg(
            clap::Arg::with_name("config")
                .short("c")
                .long("config")
                .help("Configuration file path")
                .takes_value(true)
                .default_value("/etc/quorumd.yaml"),
        )
        .get_matches();
    let cfg = Config::new(opts.value_of("config").unwrap())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("quorum");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let cluster = Cluster::new(cfg.parse_members()?)?;
    let peers = cfg.parse_peers()?;
    let log = Log::new(Box::new(Memory::new()))?;
    let mut registry = Registry::new();
    registry.register(kv::SERVICE_TYPE, || Box::new(kv::Store::new()));
    let state = Box::new(Executor::new(registry));

    let raft_listener = std::net::TcpListener::bind(&cfg.listen_raft)?;
    let client_listener = std::net::TcpListener::bind(&cfg.listen_client)?;
    let server = quorum::Server::new(cfg.id, cluster, peers, log, state, Options::default())?;
    server.serve(raft_listener, client_listener)
}

#[derive(Debug, Deserialize)]
struct Config {
    /// This node's ID.
    id: NodeID,
    /// The node-to-node Raft transport listen address.
    listen_raft: String,
    /// The client listen address.
    listen_client: String,
    /// The log level.
    log_level: String,
    /// Raft transport addresses of the other nodes, by node ID.
    peers: Option<HashMap<String, String>>,
    /// Client-facing addresses of all cluster members (including this one),
    /// by node ID. Used to bootstrap the initial configuration.
    members: Option<HashMap<String, String>>,
}

impl Config {
    fn new(file: &str) -> std::result::Result<Self, config::ConfigError> {
        let mut c = config::Config::new();
        c.set_default("id", 1i64)?;
        c.set_default("listen_raft", "0.0.0.0:9705")?;
        c.set_default("listen_client", "0.0.0.0:9706")?;
        c.set_default("log_level", "info")?;

        c.merge(config::File::with_name(file))?;
        c.merge(config::Environment::with_prefix("QUORUMD"))?;
        c.try_into()
    }

    /// Parses the bootstrap member set. Defaults to a single-node cluster
    /// listening on the client address.
    fn parse_members(&self) -> Result<Vec<Member>> {
        match &self.members {
            Some(members) => members
                .iter()
                .map(|(id, addr)| {
                    Ok(Member::new(id.parse::<NodeID>()?, addr.clone(), MemberRole::Active))
                })
                .collect(),
            None => Ok(vec![Member::new(self.id, self.listen_client.clone(), MemberRole::Active)]),
        }
    }

    /// Parses the peer transport addresses.
    fn parse_peers(&self) -> Result<HashMap<NodeID, String>> {
        match &self.peers {
            Some(peers) => peers
                .iter()
                .map(|(id, addr)| Ok((id.parse::<NodeID>()?, addr.clone())))
                .collect(),
            None => Ok(HashMap::new()),
        }
    }
}
