use super::{
    Cluster, Envelope, Log, Message, Node, NodeID, Options, Request, Response, State,
    TICK_INTERVAL,
};
use crate::encoding::bincode;
use crate::error::{Error, Result};

use ::log::{debug, error};
use crossbeam::channel::{Receiver, Sender};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// The local client request channel: a request paired with a channel for the
/// response.
pub type ClientSender = Sender<(Request, Sender<Result<Response>>)>;
pub type ClientReceiver = Receiver<(Request, Sender<Result<Response>>)>;

/// A Raft server: the event loop that drives a single node. All Raft state
/// transitions, log writes, and entry application happen on this one thread,
/// which is the node's sequencing context. Network IO and timers run on
/// separate threads and marshal onto it via channels.
pub struct Server {
    node: Node,
    peers: HashMap<NodeID, String>,
    node_rx: Receiver<Envelope>,
}

impl Server {
    /// Creates a new Raft server for the given cluster member. The peers map
    /// holds the transport addresses of the other nodes, which are static
    /// deployment configuration; the client-facing addresses in the Member
    /// set are replicated cluster data.
    pub fn new(
        id: NodeID,
        cluster: Cluster,
        peers: HashMap<NodeID, String>,
        log: Log,
        state: Box<dyn State>,
        opts: Options,
    ) -> Result<Self> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        Ok(Self { node: Node::new(id, cluster, log, state, node_tx, opts)?, peers, node_rx })
    }

    /// Connects to peers and serves Raft and client requests. Blocks until
    /// the event loop fails.
    pub fn serve(
        self,
        raft_listener: std::net::TcpListener,
        client_listener: std::net::TcpListener,
    ) -> Result<()> {
        let Server { node, peers, node_rx } = self;
        std::thread::scope(move |s| {
            let (tcp_in_tx, tcp_in_rx) = crossbeam::channel::unbounded::<Envelope>();
            let (tcp_out_tx, tcp_out_rx) = crossbeam::channel::unbounded::<Envelope>();
            let (client_tx, client_rx) = crossbeam::channel::unbounded();

            s.spawn(move || Self::tcp_receive(raft_listener, tcp_in_tx));
            s.spawn(move || Self::tcp_send(peers, tcp_out_rx));
            s.spawn(move || Self::client_accept(client_listener, client_tx));
            s.spawn(move || {
                Self::eventloop(node, node_rx, client_rx, tcp_in_rx, tcp_out_tx)
                    .expect("event processing failed")
            });
            Ok(())
        })
    }

    /// Runs the event loop: ticks the node, steps inbound peer messages,
    /// submits client requests, and routes outbound messages and responses.
    fn eventloop(
        mut node: Node,
        node_rx: Receiver<Envelope>,
        client_rx: ClientReceiver,
        tcp_rx: Receiver<Envelope>,
        tcp_tx: Sender<Envelope>,
    ) -> Result<()> {
        let ticker = crossbeam::channel::tick(TICK_INTERVAL);
        let mut requests = HashMap::<Vec<u8>, Sender<Result<Response>>>::new();
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => node = node.tick()?,

                recv(tcp_rx) -> msg => node = node.step(msg?)?,

                recv(node_rx) -> msg => {
                    let msg = msg?;
                    if msg.to != node.id() {
                        tcp_tx.send(msg)?;
                        continue;
                    }
                    // Messages to ourselves are responses to local clients.
                    match msg.message {
                        Message::ClientResponse { id, response } => {
                            if let Some(response_tx) = requests.remove(&id) {
                                // The client may have disconnected while the
                                // request was in flight.
                                if let Err(err) = response_tx.send(response) {
                                    debug!("Client disappeared before response: {err}");
                                }
                            }
                        }
                        message => {
                            return Err(Error::Internal(format!(
                                "unexpected local message {message:?}"
                            )))
                        }
                    }
                },

                recv(client_rx) -> r => {
                    let (request, response_tx) = r?;
                    let id = Uuid::new_v4().as_bytes().to_vec();
                    requests.insert(id.clone(), response_tx);
                    let msg = Envelope {
                        from: node.id(),
                        to: node.id(),
                        term: node.term(),
                        message: Message::ClientRequest { id, request },
                    };
                    node = node.step(msg)?;
                },
            }
        }
    }

    /// Receives inbound messages from peers via TCP.
    fn tcp_receive(listener: std::net::TcpListener, in_tx: Sender<Envelope>) {
        std::thread::scope(|s| loop {
            let (socket, peer) = match listener.accept() {
                Ok(r) => r,
                Err(err) => {
                    error!("Peer connection failed: {err}");
                    continue;
                }
            };
            let in_tx = in_tx.clone();
            s.spawn(move || {
                debug!("Raft peer {peer} connected");
                match Self::tcp_receive_peer(socket, in_tx) {
                    Ok(()) => debug!("Raft peer {peer} disconnected"),
                    Err(err) => error!("Raft peer {peer} error: {err}"),
                }
            });
        });
    }

    /// Receives inbound messages from a single peer connection.
    fn tcp_receive_peer(
        mut socket: std::net::TcpStream,
        in_tx: Sender<Envelope>,
    ) -> Result<()> {
        while let Some(msg) = bincode::maybe_deserialize_from(&mut socket)? {
            in_tx.send(msg)?;
        }
        Ok(())
    }

    /// Sends outbound messages to peers via TCP.
    fn tcp_send(peers: HashMap<NodeID, String>, out_rx: Receiver<Envelope>) {
        std::thread::scope(move |s| {
            let mut peer_txs: HashMap<NodeID, Sender<Envelope>> = HashMap::new();

            for (id, addr) in peers.into_iter() {
                let (tx, rx) = crossbeam::channel::bounded::<Envelope>(1000);
                peer_txs.insert(id, tx);
                s.spawn(move || Self::tcp_send_peer(addr, rx));
            }

            while let Ok(msg) = out_rx.recv() {
                match peer_txs.get_mut(&msg.to) {
                    Some(tx) => {
                        if tx.try_send(msg).is_err() {
                            error!("Full send buffer for peer, discarding message")
                        }
                    }
                    None => error!("Received outbound message for unknown peer {}", msg.to),
                }
            }
        });
    }

    /// Sends outbound messages to a peer, continuously reconnecting.
    fn tcp_send_peer(addr: String, rx: Receiver<Envelope>) {
        loop {
            match std::net::TcpStream::connect(&addr) {
                Ok(socket) => {
                    debug!("Connected to Raft peer {addr}");
                    match Self::tcp_send_peer_session(socket, &rx) {
                        Ok(()) => break,
                        Err(err) => error!("Failed sending to Raft peer {addr}: {err}"),
                    }
                }
                Err(err) => error!("Failed connecting to Raft peer {addr}: {err}"),
            }
            std::thread::sleep(Duration::from_millis(1000));
        }
        debug!("Disconnected from Raft peer {addr}");
    }

    /// Sends outbound messages to a peer via an established TCP connection.
    fn tcp_send_peer_session(
        mut socket: std::net::TcpStream,
        rx: &Receiver<Envelope>,
    ) -> Result<()> {
        while let Ok(msg) = rx.recv() {
            bincode::serialize_into(&mut socket, &msg)?;
        }
        Ok(())
    }

    /// Accepts client connections and spawns a session thread for each.
    fn client_accept(listener: std::net::TcpListener, client_tx: ClientSender) {
        std::thread::scope(|s| loop {
            let (socket, peer) = match listener.accept() {
                Ok(r) => r,
                Err(err) => {
                    error!("Client connection failed: {err}");
                    continue;
                }
            };
            let client_tx = client_tx.clone();
            s.spawn(move || {
                debug!("Client {peer} connected");
                match Self::client_session(socket, client_tx) {
                    Ok(()) => debug!("Client {peer} disconnected"),
                    Err(err) => error!("Client {peer} error: {err}"),
                }
            });
        });
    }

    /// Serves a single client connection: reads requests, submits them to
    /// the event loop, and writes back responses.
    fn client_session(mut socket: std::net::TcpStream, client_tx: ClientSender) -> Result<()> {
        while let Some(request) = bincode::maybe_deserialize_from::<_, Request>(&mut socket)? {
            let (response_tx, response_rx) = crossbeam::channel::bounded(1);
            client_tx.send((request, response_tx))?;
            let response: Result<Response> = response_rx.recv()?;
            bincode::serialize_into(&mut socket, &response)?;
        }
        Ok(())
    }
}
