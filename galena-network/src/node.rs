//! The node: listening server, neighbor table and outbound gossip helpers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use galena_core::{Block, Trx};

use crate::addr::Addr;
use crate::connection::{read_framed, write_framed, Connection};
use crate::message::{
    AddTrxData, BlocksData, ConnectionCode, Errno, GetBlocksData, Message, MessageError,
    MinedBlockData, NeighborsFoundData, NeighborsRequestData, NewNeighborData, PacketType, SigPair,
};

/// One accepted connection, good for a single request/reply exchange.
pub struct Peer {
    pub addr: Addr,
    stream: TcpStream,
}

impl Peer {
    fn new(stream: TcpStream, addr: Addr) -> Self {
        Self { addr, stream }
    }

    /// Frame and send a reply; transport failures are logged, never
    /// propagated.
    pub async fn send(&mut self, node: &Node, message: &Message) {
        let wire = message.create_message(&node.addr);
        if let Err(err) = write_framed(&mut self.stream, wire.as_bytes()).await {
            error!(peer = %self.addr.hostname(), %err, "could not send reply");
        }
    }
}

/// Per-message semantics live behind this seam; the node only frames,
/// parses and dispatches.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, peer: &mut Peer, node: &Arc<Node>);
}

/// A neighbor's structured error reply to a gossip message.
#[derive(Debug, Clone)]
pub struct NeighborError {
    pub addr: Addr,
    pub errno: Errno,
    pub data: Value,
}

pub struct Node {
    pub addr: Addr,
    pub max_neighbors: usize,
    neighbors: RwLock<HashMap<String, Addr>>,
    conn: Connection,
    handler: OnceLock<Arc<dyn MessageHandler>>,
}

impl Node {
    pub fn new(addr: Addr, max_neighbors: usize, timeout: Duration) -> Arc<Self> {
        let conn = Connection::new(addr.clone(), timeout);
        Arc::new(Self {
            addr,
            max_neighbors,
            neighbors: RwLock::new(HashMap::new()),
            conn,
            handler: OnceLock::new(),
        })
    }

    /// Wire the message handler; must happen before `listen`.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        let _ = self.handler.set(handler);
    }

    // -- neighbor table ----------------------------------------------------

    pub fn is_my_neighbor(&self, addr: &Addr) -> bool {
        match &addr.pub_key {
            Some(key) => self.neighbors.read().contains_key(key),
            None => false,
        }
    }

    /// Track a new neighbor; address must carry its public key.
    pub fn add_neighbor(&self, addr: Addr) -> bool {
        let Some(key) = addr.pub_key.clone() else {
            debug!(addr = %addr.hostname(), "refusing keyless neighbor");
            return false;
        };
        if self.is_my_neighbor(&addr) || !self.has_capacity() {
            return false;
        }
        info!(addr = %addr.hostname(), "new neighbor");
        self.neighbors.write().insert(key, addr);
        true
    }

    pub fn delete_neighbor(&self, addr: &Addr) -> bool {
        match &addr.pub_key {
            Some(key) => {
                let removed = self.neighbors.write().remove(key).is_some();
                if removed {
                    info!(addr = %addr.hostname(), "neighbor removed");
                }
                removed
            }
            None => false,
        }
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.read().len()
    }

    pub fn has_capacity(&self) -> bool {
        self.neighbor_count() < self.max_neighbors
    }

    pub fn is_full(&self) -> bool {
        self.neighbor_count() >= self.max_neighbors
    }

    /// A snapshot of the neighbor table, shuffled by default so gossip
    /// does not keep favoring the same peers. `exclude` lists hostnames to
    /// skip.
    pub fn iter_neighbors(&self, exclude: &[String], shuffle: bool) -> Vec<Addr> {
        let mut snapshot: Vec<Addr> = self
            .neighbors
            .read()
            .values()
            .filter(|a| !exclude.contains(&a.hostname()))
            .cloned()
            .collect();
        if shuffle {
            snapshot.shuffle(&mut rand::thread_rng());
        }
        snapshot
    }

    pub fn neighbors(&self) -> Vec<Addr> {
        self.iter_neighbors(&[], false)
    }

    // -- server loop -------------------------------------------------------

    /// Bind the configured address and serve forever.
    pub async fn listen(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.addr.ip.as_str(), self.addr.port)).await?;
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener; each connection is one
    /// spawned task that reads one framed message, dispatches and closes.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %self.addr.hostname(), "node is listening");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                node.handle_peer(stream, peer_addr).await;
            });
        }
    }

    async fn handle_peer(self: &Arc<Self>, stream: TcpStream, socket: SocketAddr) {
        let mut peer = Peer::new(stream, Addr::new(socket.ip().to_string(), socket.port()));
        let raw = match read_framed(&mut peer.stream).await {
            Ok(raw) => raw,
            Err(err) => {
                debug!(peer = %peer.addr.hostname(), %err, "dropping unreadable connection");
                return;
            }
        };
        let text = String::from_utf8_lossy(&raw).into_owned();
        debug!(peer = %peer.addr.hostname(), "received: {text}");
        match Message::from_str(&text) {
            Ok(message) => {
                // trust the declared source for replies and bookkeeping
                peer.addr = message.addr.clone();
                if let Some(handler) = self.handler.get() {
                    handler.handle(message, &mut peer, self).await;
                }
            }
            Err(MessageError::UnknownType(_)) => {
                let reply = Message::new(Errno::BadTypeMessage, peer.addr.clone());
                peer.send(self, &reply).await;
            }
            Err(_) => {
                let reply = Message::new(Errno::BadMessage, peer.addr.clone());
                peer.send(self, &reply).await;
            }
        }
    }

    // -- outbound ----------------------------------------------------------

    pub async fn connect_and_send(
        &self,
        dst: &Addr,
        data: &str,
        wait_for_reply: bool,
    ) -> Option<Vec<u8>> {
        self.conn.connect_and_send(dst, data, wait_for_reply).await
    }

    async fn request(&self, dst: &Addr, message: &Message) -> Option<Message> {
        let raw = self
            .connect_and_send(dst, &message.create_message(&self.addr), true)
            .await?;
        match Message::from_str(&String::from_utf8_lossy(&raw)) {
            Ok(reply) => Some(reply),
            Err(err) => {
                debug!(peer = %dst.hostname(), %err, "unparseable reply");
                None
            }
        }
    }

    /// Discovery: ask each seed for neighbor slots, introduce ourselves to
    /// every returned node, and (optionally) download the longest chain
    /// the new neighbors hold. Returns that chain for the caller to adopt.
    pub async fn start_up(&self, seeds: &[String], get_blockchain: bool) -> Vec<Block> {
        let seeds = Addr::parse_list(seeds);
        let mut found: Vec<Addr> = Vec::new();
        for seed in &seeds {
            let request = Message::with_data(
                ConnectionCode::NewNeighborsRequest,
                seed.clone(),
                &NeighborsRequestData {
                    n_connections: self.max_neighbors as u32,
                    p2p_nodes: Vec::new(),
                    passed_nodes: vec![self.addr.hostname()],
                },
            );
            let Some(response) = self.request(seed, &request).await else {
                continue;
            };
            if !response.kind.status() {
                log_error_message(seed, "NEW_NEIGHBORS_REQUEST", &response);
                continue;
            }
            let Ok(data) = response.data_as::<NeighborsFoundData>() else {
                continue;
            };
            found.extend(Addr::parse_list(&data.p2p_nodes));
            if response.kind == PacketType::Conn(ConnectionCode::NewNeighborsFind)
                && data.n_connections == 0
            {
                break;
            }
        }

        let mut best_chain: Vec<Block> = Vec::new();
        for node in found {
            let request = Message::with_data(
                ConnectionCode::NewNeighbor,
                node.clone(),
                &NewNeighborData {
                    new_node: self.addr.hostname(),
                    new_pub_key: self.addr.pub_key.clone().unwrap_or_default(),
                },
            );
            let Some(response) = self.request(&node, &request).await else {
                continue;
            };
            if !response.kind.status() {
                log_error_message(&node, "NEW_NEIGHBOR", &response);
                continue;
            }
            // the reply's source address carries the peer's public key
            self.add_neighbor(response.addr.clone());
            if get_blockchain {
                if let Some(blocks) = self.fetch_blocks(&response.addr, 0).await {
                    if blocks.len() > best_chain.len() {
                        best_chain = blocks;
                    }
                }
            }
        }
        best_chain
    }

    /// GET_BLOCKS from `first_index` on; None when the peer has none or is
    /// unreachable.
    pub async fn fetch_blocks(&self, dst: &Addr, first_index: u64) -> Option<Vec<Block>> {
        let request = Message::with_data(
            ConnectionCode::GetBlocks,
            dst.clone(),
            &GetBlocksData::by_index(first_index),
        );
        let response = self.request(dst, &request).await?;
        if response.kind != PacketType::Conn(ConnectionCode::SendBlocks) {
            log_error_message(dst, "GET_BLOCKS", &response);
            return None;
        }
        response.data_as::<BlocksData>().ok().map(|d| d.blocks)
    }

    /// Announce a freshly mined block to every neighbor; error replies are
    /// collected so the caller can react per §4.12 (self-recheck, catch-up).
    pub async fn send_mined_block(&self, block: &Block) -> Vec<NeighborError> {
        let mut errors = Vec::new();
        for dst in self.iter_neighbors(&[], true) {
            let message = Message::with_data(
                ConnectionCode::MinedBlock,
                dst.clone(),
                &MinedBlockData {
                    block: block.clone(),
                },
            );
            let Some(reply) = self.request(&dst, &message).await else {
                continue;
            };
            if let PacketType::Err(errno) = reply.kind {
                log_error_message(&dst, "MINED_BLOCK", &reply);
                errors.push(NeighborError {
                    addr: dst,
                    errno,
                    data: reply.data,
                });
            }
        }
        errors
    }

    /// Gossip a signed transaction to every neighbor.
    pub async fn send_new_trx(
        &self,
        trx: &Trx,
        signature: &SigPair,
        public_key: &str,
    ) -> Vec<NeighborError> {
        let mut errors = Vec::new();
        for dst in self.iter_neighbors(&[], true) {
            let message = Message::with_data(
                ConnectionCode::AddTrx,
                dst.clone(),
                &AddTrxData {
                    trx: trx.clone(),
                    signature: signature.clone(),
                    public_key: public_key.to_owned(),
                    passed_nodes: vec![self.addr.hostname()],
                },
            );
            let Some(reply) = self.request(&dst, &message).await else {
                continue;
            };
            if let PacketType::Err(errno) = reply.kind {
                log_error_message(&dst, "ADD_TRX", &reply);
                errors.push(NeighborError {
                    addr: dst,
                    errno,
                    data: reply.data,
                });
            }
        }
        errors
    }

    pub async fn send_ping_to(&self, dst: &Addr) -> bool {
        let message = Message::new(ConnectionCode::PingPong, dst.clone());
        match self.request(dst, &message).await {
            Some(reply) => reply.kind.status(),
            None => false,
        }
    }

    /// Drop every neighbor (used on shutdown or when rebuilding the
    /// table).
    pub fn reset(&self) {
        self.neighbors.write().clear();
    }
}

pub(crate) fn log_error_message(peer: &Addr, request: &str, response: &Message) {
    error!(
        peer = %peer.hostname(),
        request,
        response = response.kind.code(),
        "peer replied with an error"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_TIMEOUT;

    /// Echo-style handler covering the cases the node itself exercises.
    struct TestHandler;

    #[async_trait]
    impl MessageHandler for TestHandler {
        async fn handle(&self, message: Message, peer: &mut Peer, node: &Arc<Node>) {
            match message.kind {
                PacketType::Conn(ConnectionCode::PingPong) => {
                    let reply = Message::new(ConnectionCode::PingPong, peer.addr.clone());
                    peer.send(node, &reply).await;
                }
                PacketType::Conn(ConnectionCode::NewNeighbor) => {
                    node.add_neighbor(peer.addr.clone());
                    let reply = Message::new(ConnectionCode::OkMessage, peer.addr.clone());
                    peer.send(node, &reply).await;
                }
                _ => {
                    let reply = Message::new(Errno::BadTypeMessage, peer.addr.clone());
                    peer.send(node, &reply).await;
                }
            }
        }
    }

    async fn spawn_node(key: &str) -> Arc<Node> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = Node::new(
            Addr::with_key("127.0.0.1", port, key),
            crate::MAX_NEIGHBORS,
            DEFAULT_TIMEOUT,
        );
        node.set_handler(Arc::new(TestHandler));
        let serving = Arc::clone(&node);
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });
        node
    }

    #[test]
    fn neighbor_table_capacity() {
        let node = Node::new(Addr::new("127.0.0.1", 1), 2, DEFAULT_TIMEOUT);
        assert!(node.has_capacity());
        assert!(node.add_neighbor(Addr::with_key("1.1.1.1", 1, "a")));
        assert!(node.add_neighbor(Addr::with_key("2.2.2.2", 2, "b")));
        assert!(node.is_full());
        assert!(!node.add_neighbor(Addr::with_key("3.3.3.3", 3, "c")));
        assert!(!node.add_neighbor(Addr::with_key("9.9.9.9", 9, "a")), "same key twice");
        assert!(node.delete_neighbor(&Addr::with_key("1.1.1.1", 1, "a")));
        assert!(node.has_capacity());
    }

    #[test]
    fn keyless_neighbors_are_refused() {
        let node = Node::new(Addr::new("127.0.0.1", 1), 2, DEFAULT_TIMEOUT);
        assert!(!node.add_neighbor(Addr::new("1.1.1.1", 1)));
        assert!(!node.is_my_neighbor(&Addr::new("1.1.1.1", 1)));
    }

    #[test]
    fn iter_neighbors_excludes_hostnames() {
        let node = Node::new(Addr::new("127.0.0.1", 1), 4, DEFAULT_TIMEOUT);
        node.add_neighbor(Addr::with_key("1.1.1.1", 1, "a"));
        node.add_neighbor(Addr::with_key("2.2.2.2", 2, "b"));
        let rest = node.iter_neighbors(&["1.1.1.1:1".to_string()], false);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].hostname(), "2.2.2.2:2");
    }

    #[tokio::test]
    async fn ping_pong_over_loopback() {
        let server = spawn_node("server-key").await;
        let client = Node::new(
            Addr::with_key("127.0.0.1", 0, "client-key"),
            crate::MAX_NEIGHBORS,
            DEFAULT_TIMEOUT,
        );
        assert!(client.send_ping_to(&server.addr).await);
    }

    #[tokio::test]
    async fn malformed_message_gets_bad_message_reply() {
        let server = spawn_node("server-key").await;
        let client = Connection::new(Addr::new("127.0.0.1", 0), DEFAULT_TIMEOUT);
        let raw = client
            .connect_and_send(&server.addr, "this is not json", true)
            .await
            .unwrap();
        let reply = Message::from_str(&String::from_utf8_lossy(&raw)).unwrap();
        assert_eq!(reply.kind, PacketType::Err(Errno::BadMessage));
    }

    #[tokio::test]
    async fn unknown_type_gets_bad_type_reply() {
        let server = spawn_node("server-key").await;
        let client = Connection::new(Addr::new("127.0.0.1", 0), DEFAULT_TIMEOUT);
        let wire = format!(
            r#"{{"status":true,"type":42,"src_addr":"127.0.0.1:1","dst_addr":"{}","pub_key":null,"data":null}}"#,
            server.addr.hostname()
        );
        let raw = client.connect_and_send(&server.addr, &wire, true).await.unwrap();
        let reply = Message::from_str(&String::from_utf8_lossy(&raw)).unwrap();
        assert_eq!(reply.kind, PacketType::Err(Errno::BadTypeMessage));
    }

    #[tokio::test]
    async fn gossip_collects_error_replies() {
        // TestHandler answers MINED_BLOCK with BAD_TYPE_MESSAGE, which the
        // gossip helper must surface rather than swallow
        let server = spawn_node("server-key").await;
        let client = Node::new(
            Addr::with_key("127.0.0.1", 0, "client-key"),
            crate::MAX_NEIGHBORS,
            DEFAULT_TIMEOUT,
        );
        client.add_neighbor(server.addr.clone());
        let block = Block::new(String::new(), 1, Trx::subsidy(1, "miner"));
        let errors = client.send_mined_block(&block).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].errno, Errno::BadTypeMessage);
    }
}
