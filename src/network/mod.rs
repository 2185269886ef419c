pub mod memory;

pub use memory::*;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::common::error::TransportError;
use crate::consensus::message::NetMessage;

/*
    Links are point-to-point and authenticated by the signatures inside the
    messages, not by the transport. A send only means the message left this
    node: nothing is retried, and a lost message is healed by the next view.
*/

/// One message delivered to a node, with a reply slot for request/response.
#[derive(Debug)]
pub struct Inbound {
    pub msg: NetMessage,
    pub respond_to: Option<oneshot::Sender<NetMessage>>,
}

impl Inbound {
    pub fn new(msg: NetMessage) -> Self {
        Inbound {
            msg,
            respond_to: None,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `msg` to each peer address.
    async fn send_message(&self, msg: NetMessage, peers: &[String]) -> Result<(), TransportError>;

    /// Sends `msg` and waits until `min_response_percentage` of the peers have
    /// answered, or the transport's response timeout passes.
    async fn send_message_with_response(
        &self,
        msg: NetMessage,
        peers: &[String],
        min_response_percentage: f32,
    ) -> Result<Vec<NetMessage>, TransportError>;
}
