//! Per-message semantics: what each wire message does to the ledger, the
//! neighbor table and the miner.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use galena_core::ChainCheck;
use galena_storage::BlockStore;
use galena_network::{
    Addr, AddTrxData, BadBlockData, BlocksData, ConnectionCode, Errno, GetBlocksData, Message,
    MessageHandler, MinedBlockData, NeighborsFoundData, NeighborsRequestData, NewNeighborData,
    Node, NotNeighborData, PacketType, Peer,
};

use crate::context::Context;

pub struct ProcessingHandler {
    ctx: Arc<Context>,
}

impl ProcessingHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn reply(&self, peer: &mut Peer, node: &Node, message: Message) {
        peer.send(node, &message).await;
    }

    async fn reply_ok(&self, peer: &mut Peer, node: &Node) {
        let reply = Message::new(ConnectionCode::OkMessage, peer.addr.clone());
        self.reply(peer, node, reply).await;
    }

    async fn reply_err(&self, peer: &mut Peer, node: &Node, errno: Errno) {
        let reply = Message::new(errno, peer.addr.clone());
        self.reply(peer, node, reply).await;
    }

    async fn reply_bad_block(&self, peer: &mut Peer, node: &Node, check: &ChainCheck, blocks: &[galena_core::Block]) {
        let index = check.bad_index.unwrap_or_default();
        let data = BadBlockData {
            block_hash: blocks
                .get(index)
                .map(|b| b.block_hash.clone())
                .unwrap_or_default(),
            block_index: index as u64,
            validation: check.validation.map(|v| v.bits()).unwrap_or_default(),
        };
        let reply = Message::with_data(Errno::BadBlockValidation, peer.addr.clone(), &data);
        self.reply(peer, node, reply).await;
    }

    // -- NEW_NEIGHBOR ------------------------------------------------------

    async fn new_neighbor(&self, message: &Message, peer: &mut Peer, node: &Arc<Node>) {
        let Ok(data) = message.data_as::<NewNeighborData>() else {
            return self.reply_err(peer, node, Errno::BadMessage).await;
        };
        let Ok(mut addr) = Addr::from_hostname(&data.new_node) else {
            return self.reply_err(peer, node, Errno::BadMessage).await;
        };
        addr.pub_key = Some(data.new_pub_key);
        if node.add_neighbor(addr) {
            // our reply's src_addr carries our public key, letting the
            // dialer symmetrize its own table
            self.reply_ok(peer, node).await;
        } else {
            self.reply_err(peer, node, Errno::BadMessage).await;
        }
    }

    // -- NEW_NEIGHBORS_REQUEST ---------------------------------------------

    async fn neighbors_request(&self, message: &Message, peer: &mut Peer, node: &Arc<Node>) {
        let Ok(mut data) = message.data_as::<NeighborsRequestData>() else {
            return self.reply_err(peer, node, Errno::BadMessage).await;
        };
        data.passed_nodes.push(node.addr.hostname());
        if node.has_capacity() {
            data.n_connections = data.n_connections.saturating_sub(1);
            data.p2p_nodes.push(node.addr.hostname());
        }
        // still unfilled: walk our neighbors with the same request
        if data.n_connections > 0 {
            for dst in node.iter_neighbors(&data.passed_nodes, true) {
                let forward = Message::with_data(
                    ConnectionCode::NewNeighborsRequest,
                    dst.clone(),
                    &data,
                );
                let Some(raw) = node
                    .connect_and_send(&dst, &forward.create_message(&node.addr), true)
                    .await
                else {
                    continue;
                };
                let Ok(response) = Message::from_str(&String::from_utf8_lossy(&raw)) else {
                    continue;
                };
                if let Ok(found) = response.data_as::<NeighborsFoundData>() {
                    data.n_connections = found.n_connections;
                    data.p2p_nodes = found.p2p_nodes;
                    data.passed_nodes = found.passed_nodes;
                }
                if data.n_connections == 0 {
                    break;
                }
            }
        }
        // nobody had room: evict one of our own neighbors so the newcomer
        // and the evictee can pair up
        if data.n_connections == node.max_neighbors as u32 && node.is_full() {
            for victim in node.iter_neighbors(&data.passed_nodes, true) {
                let request = Message::with_data(
                    ConnectionCode::NotNeighbor,
                    victim.clone(),
                    &NotNeighborData {
                        node_hostname: node.addr.hostname(),
                        pub_key: node.addr.pub_key.clone().unwrap_or_default(),
                    },
                );
                let Some(raw) = node
                    .connect_and_send(&victim, &request.create_message(&node.addr), true)
                    .await
                else {
                    continue;
                };
                let Ok(response) = Message::from_str(&String::from_utf8_lossy(&raw)) else {
                    continue;
                };
                if response.kind.status() {
                    node.delete_neighbor(&victim);
                    data.p2p_nodes.push(node.addr.hostname());
                    data.p2p_nodes.push(victim.hostname());
                    data.n_connections = data.n_connections.saturating_sub(2);
                    break;
                }
            }
        }
        let found = NeighborsFoundData {
            n_connections: data.n_connections,
            p2p_nodes: data.p2p_nodes,
            passed_nodes: data.passed_nodes,
            for_node: message.addr.hostname(),
        };
        let reply = Message::with_data(ConnectionCode::NewNeighborsFind, peer.addr.clone(), &found);
        self.reply(peer, node, reply).await;
    }

    // -- NOT_NEIGHBOR ------------------------------------------------------

    async fn not_neighbor(&self, message: &Message, peer: &mut Peer, node: &Arc<Node>) {
        let Ok(data) = message.data_as::<NotNeighborData>() else {
            return self.reply_err(peer, node, Errno::BadMessage).await;
        };
        let Ok(mut addr) = Addr::from_hostname(&data.node_hostname) else {
            return self.reply_err(peer, node, Errno::BadMessage).await;
        };
        addr.pub_key = Some(data.pub_key);
        if node.delete_neighbor(&addr) {
            self.reply_ok(peer, node).await;
        } else {
            self.reply_err(peer, node, Errno::BadMessage).await;
        }
    }

    // -- MINED_BLOCK -------------------------------------------------------

    async fn mined_block(&self, message: &Message, peer: &mut Peer, node: &Arc<Node>) {
        let Ok(data) = message.data_as::<MinedBlockData>() else {
            return self.reply_err(peer, node, Errno::BadMessage).await;
        };
        let block = data.block;
        let local_height = self.ctx.chain.read().height();

        if block.height == local_height + 1 {
            self.ctx.flags.pause();
            let validation = {
                let mut chain = self.ctx.chain.write();
                let mut unspent = self.ctx.unspent.write();
                chain.add_new_block(block.clone(), &mut unspent, false, &self.ctx.difficulty)
            };
            self.ctx.flags.resume();
            if validation.is_all() {
                info!(height = block.height, from = %message.addr.hostname(), "accepted gossiped block");
                self.ctx.flags.restart();
                self.strip_mined_transactions(&block);
                self.persist(&block).await;
                self.reply_ok(peer, node).await;
            } else {
                let check = ChainCheck::bad(0, validation);
                self.reply_bad_block(peer, node, &check, std::slice::from_ref(&block))
                    .await;
            }
        } else if block.height > local_height + 1 {
            // we are behind; pull the missing range from the sender
            let Some(blocks) = node.fetch_blocks(&message.addr, local_height).await else {
                return self.reply_err(peer, node, Errno::BadMessage).await;
            };
            let check = self.resolve_blocks(&blocks);
            if check.ok {
                self.reply_ok(peer, node).await;
            } else {
                self.reply_bad_block(peer, node, &check, &blocks).await;
            }
        } else {
            debug!(height = block.height, local_height, "obsolete block gossiped");
            self.reply_err(peer, node, Errno::ObsoleteBlock).await;
        }
    }

    /// Resolve the local chain against received blocks, interrupting the
    /// miner around the mutation.
    fn resolve_blocks(&self, blocks: &[galena_core::Block]) -> ChainCheck {
        self.ctx.flags.pause();
        let check = {
            let mut chain = self.ctx.chain.write();
            let mut unspent = self.ctx.unspent.write();
            chain.resolve(blocks, &mut unspent, &self.ctx.difficulty)
        };
        self.ctx.flags.resume();
        if check.ok {
            self.ctx.flags.restart();
            for block in blocks {
                self.strip_mined_transactions(block);
            }
        }
        check
    }

    /// Transactions that arrived in an accepted block leave the mempool.
    fn strip_mined_transactions(&self, block: &galena_core::Block) {
        let mined: Vec<String> = block
            .transactions
            .iter()
            .filter(|t| !t.is_subsidy)
            .map(|t| t.hash.clone())
            .collect();
        if !mined.is_empty() {
            self.ctx.mempool.write().remove_many(&mined);
        }
    }

    async fn persist(&self, block: &galena_core::Block) {
        if let Some(store) = &self.ctx.store {
            if let Err(err) = store.insert_block(block).await {
                warn!(%err, "could not persist block");
            }
        }
    }

    // -- RESOLVE_BLOCKCHAIN ------------------------------------------------

    async fn resolve_blockchain(&self, message: &Message, peer: &mut Peer, node: &Arc<Node>) {
        let Ok(data) = message.data_as::<BlocksData>() else {
            return self.reply_err(peer, node, Errno::BadMessage).await;
        };
        let check = self.resolve_blocks(&data.blocks);
        if check.ok {
            self.reply_ok(peer, node).await;
        } else {
            self.reply_bad_block(peer, node, &check, &data.blocks).await;
        }
    }

    // -- GET_BLOCKS --------------------------------------------------------

    async fn get_blocks(&self, message: &Message, peer: &mut Peer, node: &Arc<Node>) {
        let Ok(data) = message.data_as::<GetBlocksData>() else {
            return self.reply_err(peer, node, Errno::BadMessage).await;
        };
        let blocks = {
            let chain = self.ctx.chain.read();
            let first_index = match (&data.hash_block, data.first_index) {
                (Some(hash), _) => chain.search(hash),
                (None, Some(index)) => Some(index as usize),
                (None, None) => None,
            };
            match first_index {
                Some(index) if index < chain.blocks.len() => Some(chain.get_data(index, None)),
                _ => None,
            }
        };
        match blocks {
            Some(blocks) => {
                let reply = Message::with_data(
                    ConnectionCode::SendBlocks,
                    peer.addr.clone(),
                    &BlocksData { blocks },
                );
                self.reply(peer, node, reply).await;
            }
            None => {
                let check = ChainCheck::bad(0, galena_core::BlockValidation::empty());
                self.reply_bad_block(peer, node, &check, &[]).await;
            }
        }
    }

    // -- ADD_TRX -----------------------------------------------------------

    async fn add_trx(&self, message: &Message, peer: &mut Peer, node: &Arc<Node>) {
        let Ok(mut data) = message.data_as::<AddTrxData>() else {
            return self.reply_err(peer, node, Errno::BadMessage).await;
        };
        if data.trx.hash != data.trx.calc_hash() {
            debug!("transaction hash does not match its contents");
            return self.reply_err(peer, node, Errno::BadTransaction).await;
        }
        let accepted = {
            let unspent = self.ctx.unspent.read();
            self.ctx.mempool.write().add(
                data.trx.clone(),
                &data.signature,
                &data.public_key,
                &unspent,
            )
        };
        if !accepted {
            return self.reply_err(peer, node, Errno::BadTransaction).await;
        }
        info!(hash = %data.trx.hash, "transaction admitted to mempool");
        // forward to neighbors that have not seen it yet
        data.passed_nodes.push(node.addr.hostname());
        for dst in node.iter_neighbors(&data.passed_nodes, true) {
            let forward = Message::with_data(ConnectionCode::AddTrx, dst.clone(), &data);
            node.connect_and_send(&dst, &forward.create_message(&node.addr), false)
                .await;
        }
        self.reply_ok(peer, node).await;
    }
}

#[async_trait]
impl MessageHandler for ProcessingHandler {
    async fn handle(&self, message: Message, peer: &mut Peer, node: &Arc<Node>) {
        match message.kind {
            PacketType::Conn(ConnectionCode::OkMessage) => {}
            PacketType::Conn(ConnectionCode::NewNeighbor) => {
                self.new_neighbor(&message, peer, node).await
            }
            PacketType::Conn(ConnectionCode::NewNeighborsRequest) => {
                self.neighbors_request(&message, peer, node).await
            }
            PacketType::Conn(ConnectionCode::NewNeighborsFind) => {
                // only valid as a reply inside start_up
                debug!(from = %message.addr.hostname(), "unsolicited NEW_NEIGHBORS_FIND");
            }
            PacketType::Conn(ConnectionCode::NotNeighbor) => {
                self.not_neighbor(&message, peer, node).await
            }
            PacketType::Conn(ConnectionCode::MinedBlock) => {
                self.mined_block(&message, peer, node).await
            }
            PacketType::Conn(ConnectionCode::ResolveBlockchain) => {
                self.resolve_blockchain(&message, peer, node).await
            }
            PacketType::Conn(ConnectionCode::GetBlocks) => {
                self.get_blocks(&message, peer, node).await
            }
            PacketType::Conn(ConnectionCode::SendBlocks) => {
                debug!(from = %message.addr.hostname(), "unsolicited SEND_BLOCKS");
            }
            PacketType::Conn(ConnectionCode::AddTrx) => self.add_trx(&message, peer, node).await,
            PacketType::Conn(ConnectionCode::PingPong) => {
                let reply = Message::new(ConnectionCode::PingPong, peer.addr.clone());
                self.reply(peer, node, reply).await;
            }
            PacketType::Err(errno) => {
                warn!(from = %message.addr.hostname(), ?errno, "peer sent an error message");
            }
        }
    }
}
