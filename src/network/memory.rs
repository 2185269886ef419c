use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use super::{Inbound, Transport};
use crate::common::error::TransportError;
use crate::consensus::message::NetMessage;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// In-process transport: every registered peer owns a bounded inbound queue.
pub struct MemoryNetwork {
    peers: DashMap<String, mpsc::Sender<Inbound>>,
    response_timeout: Duration,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_TIMEOUT)
    }
}

impl MemoryNetwork {
    pub fn new(response_timeout: Duration) -> Self {
        MemoryNetwork {
            peers: DashMap::new(),
            response_timeout,
        }
    }

    pub fn register(&self, peer_addr: impl Into<String>, capacity: usize) -> mpsc::Receiver<Inbound> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.peers.insert(peer_addr.into(), tx);
        rx
    }

    /// Removes a peer; later sends to it fail with `UnknownPeer`.
    pub fn unregister(&self, peer_addr: &str) {
        self.peers.remove(peer_addr);
    }

    fn sender(&self, peer_addr: &str) -> Result<mpsc::Sender<Inbound>, TransportError> {
        self.peers
            .get(peer_addr)
            .map(|tx| tx.clone())
            .ok_or_else(|| TransportError::UnknownPeer(peer_addr.to_string()))
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn send_message(&self, msg: NetMessage, peers: &[String]) -> Result<(), TransportError> {
        let mut first_err = None;
        for peer in peers {
            let result = match self.sender(peer) {
                Ok(tx) => tx
                    .send(Inbound::new(msg.clone()))
                    .await
                    .map_err(|_| TransportError::PeerClosed(peer.clone())),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => trace!(peer = %peer, logid = %msg.header.logid, "message delivered"),
                Err(err) => {
                    debug!(peer = %peer, %err, "message not delivered");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send_message_with_response(
        &self,
        msg: NetMessage,
        peers: &[String],
        min_response_percentage: f32,
    ) -> Result<Vec<NetMessage>, TransportError> {
        let ratio = min_response_percentage.clamp(0.0, 1.0);
        let want = (peers.len() as f32 * ratio).ceil() as usize;

        let mut pending = JoinSet::new();
        for peer in peers {
            let Ok(tx) = self.sender(peer) else {
                debug!(peer = %peer, "skip unknown peer");
                continue;
            };
            let (respond_to, response) = oneshot::channel();
            let inbound = Inbound {
                msg: msg.clone(),
                respond_to: Some(respond_to),
            };
            if tx.send(inbound).await.is_err() {
                debug!(peer = %peer, "peer queue closed");
                continue;
            }
            pending.spawn(response);
        }

        let mut responses = Vec::new();
        let collect = async {
            while responses.len() < want {
                match pending.join_next().await {
                    Some(Ok(Ok(resp))) => responses.push(resp),
                    Some(_) => continue,
                    None => break,
                }
            }
        };
        let _ = tokio::time::timeout(self.response_timeout, collect).await;
        pending.abort_all();

        if responses.len() < want {
            return Err(TransportError::NotEnoughResponses {
                got: responses.len(),
                want,
            });
        }
        Ok(responses)
    }
}
