use serde::{Deserialize, Serialize};

pub const DEFAULT_NET_MSG_CHAN_SIZE: usize = 1000;
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 64;
pub const DEFAULT_PROTOCOL_VERSION: &str = "1.0.0";

/// Who receives a leader's proposal.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPolicy {
    /// Every other validator.
    #[default]
    Full,
    /// Only the peers listed in `SmrConfig::core_peers`.
    Core,
}

/// Tunables of one chained-bft instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SmrConfig {
    /// Capacity of the bounded inbound message queue.
    pub net_msg_chan_size: usize,
    /// Upper bound on handlers running at the same time.
    pub max_concurrent_handlers: usize,
    /// Overrides the 2f+1 quorum when set.
    pub quorum_threshold: Option<usize>,
    /// Views after a validator change during which the previous set still
    /// counts for NEW_VIEW membership.
    pub effective_delay: i64,
    pub broadcast_policy: BroadcastPolicy,
    pub core_peers: Vec<String>,
    pub protocol_version: String,
}

impl Default for SmrConfig {
    fn default() -> Self {
        SmrConfig {
            net_msg_chan_size: DEFAULT_NET_MSG_CHAN_SIZE,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            quorum_threshold: None,
            effective_delay: 0,
            broadcast_policy: BroadcastPolicy::Full,
            core_peers: Vec::new(),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

impl SmrConfig {
    /// Quorum for a validator set of size `n`. A configured threshold is
    /// clamped to `n` so a small set can still make progress.
    pub fn quorum_for(&self, n: usize) -> usize {
        match self.quorum_threshold {
            Some(threshold) => threshold.clamp(1, n.max(1)),
            None => crate::consensus::qc::quorum_size(n),
        }
    }
}
