//! Node server: answers requests and drives the periodic activities.
//!
//! Three things run concurrently against one [`Node`]:
//!
//! - inbound requests, one task per connection;
//! - the miner, started on every block-time tick while there is pending work;
//! - the synchronizer, on its own interval.
//!
//! All of them mutate through the node, which serializes writers.

use crate::core::block::Block;
use crate::core::node::{BlockAcceptance, MineOutcome, Node, QUERY_LATEST};
use crate::network::message::{MAX_BLOCKS_PER_RESPONSE, Request, Response};
use crate::network::peer::{PeerClient, RequestHandler, notify};
use crate::network::sync::Synchronizer;
use crate::network::tcp_transport::serve;
use crate::types::wrapper_types::BoxFuture;
use crate::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{MissedTickBehavior, interval};

/// Configuration options for the server.
#[derive(Debug, Clone)]
pub struct ServerOps {
    /// Whether this node mines.
    pub mine: bool,
    /// How often a mining attempt starts.
    pub block_time: Duration,
    /// How often every known peer is synced with.
    pub sync_interval: Duration,
}

pub struct Server {
    node: Arc<Node>,
    client: Arc<dyn PeerClient>,
    sync: Synchronizer,
    options: ServerOps,
    mining: AtomicBool,
}

impl Server {
    pub fn new(node: Arc<Node>, client: Arc<dyn PeerClient>, options: ServerOps) -> Arc<Self> {
        Arc::new(Self {
            sync: Synchronizer::new(node.clone(), client.clone()),
            node,
            client,
            options,
            mining: AtomicBool::new(false),
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    /// Answers one request.
    pub async fn handle_request(self: &Arc<Self>, request: Request) -> Response {
        match request {
            Request::Status => Response::Status(self.node.query_status()),

            Request::BlocksByNumber { from, to } => {
                if to != QUERY_LATEST && from > to {
                    return Response::Rejected(format!("bad range: from {from} > to {to}"));
                }
                let to = if from == QUERY_LATEST {
                    to
                } else {
                    to.min(from.saturating_add(MAX_BLOCKS_PER_RESPONSE - 1))
                };
                let blocks = self.node.query_blocks_by_number(from, to);
                Response::Blocks(blocks.iter().map(|b| (**b).clone()).collect())
            }

            Request::SubmitPeer(peer) => {
                self.node.submit_peer(peer);
                Response::Ack
            }

            Request::SubmitTransaction(tx) => match self.node.submit_transaction(tx.clone()) {
                Ok(_) => {
                    self.gossip(Request::ShareTransaction(tx));
                    Response::Ack
                }
                Err(e) => Response::Rejected(e.to_string()),
            },

            Request::ShareTransaction(tx) => match self.node.submit_transaction(tx) {
                Ok(_) => Response::Ack,
                Err(e) => Response::Rejected(e.to_string()),
            },

            Request::ProposeBlock(block) => {
                let number = block.number();
                let node = Arc::clone(&self.node);
                let proposal = block.clone();
                let accepted =
                    tokio::task::spawn_blocking(move || node.accept_block(proposal)).await;
                match accepted {
                    Ok(Ok(BlockAcceptance::Committed)) => {
                        self.gossip(Request::ProposeBlock(block));
                        Response::Ack
                    }
                    Ok(Ok(BlockAcceptance::Known)) => Response::Ack,
                    Ok(Ok(BlockAcceptance::Detached)) => {
                        debug!(
                            "Proposed block #{number} does not extend the tip, leaving it to sync"
                        );
                        Response::Ack
                    }
                    Ok(Err(e)) => {
                        warn!("Rejected proposed block #{number}: {e}");
                        Response::Rejected(e.to_string())
                    }
                    Err(e) => {
                        error!("Block acceptance task failed: {e}");
                        Response::Rejected(format!("block #{number} could not be processed"))
                    }
                }
            }

            Request::QueryAccounts(address) => {
                Response::Accounts(self.node.query_accounts(address))
            }

            Request::QueryMempool => Response::Transactions(self.node.query_mempool()),
        }
    }

    /// Sends `request` to every known peer in the background. Best effort.
    fn gossip(&self, request: Request) {
        for peer in self.node.peers() {
            let client = self.client.clone();
            let request = request.clone();
            tokio::spawn(async move {
                if let Err(e) = notify(&*client, &peer, request).await {
                    debug!("Gossip to {} failed: {e}", peer.host);
                }
            });
        }
    }

    /// One mining attempt off the async runtime. Returns the committed block,
    /// already proposed to peers.
    pub async fn mine_once(self: &Arc<Self>) -> Option<Arc<Block>> {
        if self.mining.swap(true, Ordering::AcqRel) {
            return None;
        }
        let node = self.node.clone();
        let result = tokio::task::spawn_blocking(move || node.mine()).await;
        self.mining.store(false, Ordering::Release);

        match result {
            Ok(Ok(MineOutcome::Mined(block))) => {
                self.gossip(Request::ProposeBlock((*block).clone()));
                Some(block)
            }
            Ok(Ok(MineOutcome::Cancelled)) | Ok(Ok(MineOutcome::Stale)) => {
                debug!("Mining attempt superseded by another block");
                None
            }
            Ok(Ok(MineOutcome::Exhausted)) => {
                warn!("Nonce space exhausted without a solution");
                None
            }
            Ok(Err(e)) => {
                error!("Mining failed: {e}");
                None
            }
            Err(e) => {
                error!("Mining task panicked: {e}");
                None
            }
        }
    }

    /// Serves `listener` and runs the periodic activities until `shutdown`.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: oneshot::Receiver<()>) {
        let (stop_serving, serving) = oneshot::channel();
        let accept = tokio::spawn(serve(listener, self.clone(), serving));

        let mut block_ticker = interval(self.options.block_time);
        block_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sync_ticker = interval(self.options.sync_interval);
        sync_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                _ = block_ticker.tick() => {
                    if self.options.mine && self.node.mempool_len() > 0 {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.mine_once().await;
                        });
                    }
                }
                _ = sync_ticker.tick() => {
                    self.sync.tick().await;
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        self.node.cancel_mining();
        let _ = stop_serving.send(());
        let _ = accept.await;
        info!("Server shut down");
    }
}

impl RequestHandler for Server {
    fn handle(self: Arc<Self>, request: Request) -> BoxFuture<'static, Response> {
        Box::pin(async move { self.handle_request(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::local_transport::LocalNetwork;
    use crate::network::peer::Peer;
    use crate::utils::test_utils::utils::{
        key, mine_blocks, test_genesis, test_node_at, test_server_ops, transfer,
    };
    use tokio::time::sleep;

    fn server(net: &LocalNetwork, host: &str, miner: u8) -> Arc<Server> {
        let genesis = test_genesis(&[(key(1).address(), 1000)]);
        let node = test_node_at(genesis, key(miner).address(), host);
        let server = Server::new(node, Arc::new(net.clone()), test_server_ops());
        net.register(host, server.clone());
        server
    }

    #[tokio::test]
    async fn bad_range_is_rejected() {
        let net = LocalNetwork::new();
        let a = server(&net, "a", 7);
        assert!(matches!(
            a.handle_request(Request::BlocksByNumber { from: 3, to: 1 }).await,
            Response::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn block_range_is_clipped() {
        let net = LocalNetwork::new();
        let a = server(&net, "a", 7);
        mine_blocks(a.node(), 3);

        let Response::Blocks(latest) = a
            .handle_request(Request::BlocksByNumber { from: QUERY_LATEST, to: QUERY_LATEST })
            .await
        else {
            panic!("expected blocks");
        };
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].number(), 3);

        let Response::Blocks(all) = a
            .handle_request(Request::BlocksByNumber { from: 0, to: 1000 })
            .await
        else {
            panic!("expected blocks");
        };
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn submitted_transaction_is_gossiped() {
        let net = LocalNetwork::new();
        let a = server(&net, "a", 7);
        let b = server(&net, "b", 8);
        a.node().submit_peer(Peer::new("b"));

        let tx = transfer(&key(1), key(2).address(), 0, 10, 1);
        assert_eq!(a.handle_request(Request::SubmitTransaction(tx.clone())).await, Response::Ack);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(b.node().query_mempool(), vec![tx.clone()]);

        assert!(matches!(
            a.handle_request(Request::SubmitTransaction(tx)).await,
            Response::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn mined_block_is_proposed_to_peers() {
        let net = LocalNetwork::new();
        let a = server(&net, "a", 7);
        let b = server(&net, "b", 8);
        a.node().submit_peer(Peer::new("b"));
        a.node()
            .submit_transaction(transfer(&key(1), key(2).address(), 0, 250, 10))
            .unwrap();

        let mut block = None;
        while block.is_none() {
            block = a.mine_once().await;
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(b.node().tip_hash(), a.node().tip_hash());
        assert_eq!(b.node().query_accounts(Some(key(2).address()))[0].balance, 250);
    }

    #[tokio::test]
    async fn valid_proposal_is_committed_and_regossiped() {
        let net = LocalNetwork::new();
        let a = server(&net, "a", 7);
        let b = server(&net, "b", 8);
        let c = server(&net, "c", 9);
        b.node().submit_peer(Peer::new("c"));
        let block = (*mine_blocks(a.node(), 1)[0]).clone();

        assert_eq!(b.handle_request(Request::ProposeBlock(block.clone())).await, Response::Ack);
        assert_eq!(b.node().tip_hash(), block.hash());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(c.node().tip_hash(), block.hash());

        assert_eq!(b.handle_request(Request::ProposeBlock(block)).await, Response::Ack);
        assert_eq!(b.node().height(), 1);
    }

    #[tokio::test]
    async fn invalid_proposal_is_rejected() {
        let net = LocalNetwork::new();
        let a = server(&net, "a", 7);
        let b = server(&net, "b", 8);
        let mut block = (*mine_blocks(a.node(), 1)[0]).clone();
        block.header.state_root = crate::types::hash::Hash::zero();

        assert!(matches!(
            b.handle_request(Request::ProposeBlock(block)).await,
            Response::Rejected(_)
        ));
        assert_eq!(b.node().height(), 0);
    }

    #[tokio::test]
    async fn run_serves_tcp_until_shutdown() {
        use crate::network::peer::fetch_status;
        use crate::network::tcp_transport::TcpPeerClient;

        let node = test_node_at(test_genesis(&[]), key(7).address(), "tcp");
        let client = Arc::new(TcpPeerClient::new(Duration::from_secs(2)));
        let server = Server::new(node, client.clone(), test_server_ops());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = Peer::new(listener.local_addr().unwrap().to_string());
        let (stop, shutdown) = oneshot::channel();
        let running = tokio::spawn(server.clone().run(listener, shutdown));

        let status = fetch_status(&*client, &peer).await.unwrap();
        assert_eq!(status.latest_block_number, 0);

        let _ = stop.send(());
        running.await.unwrap();
    }
}
