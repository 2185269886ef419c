use serde::{Deserialize, Serialize};

/// A validator entry. `peer_addr` is what the transport routes to.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CandidateInfo {
    pub address: String,
    pub peer_addr: String,
    pub stake: u64,
}

impl CandidateInfo {
    pub fn new(address: impl Into<String>, peer_addr: impl Into<String>) -> Self {
        CandidateInfo {
            address: address.into(),
            peer_addr: peer_addr.into(),
            stake: 1,
        }
    }

    pub fn with_stake(mut self, stake: u64) -> Self {
        self.stake = stake;
        self
    }
}

/// Ordered validator set. Order matters for round-robin proposer checks.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub members: Vec<CandidateInfo>,
}

impl ValidatorSet {
    pub fn new(members: Vec<CandidateInfo>) -> Self {
        ValidatorSet { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_member(&self, address: &str) -> bool {
        self.members.iter().any(|m| m.address == address)
    }

    pub fn get(&self, address: &str) -> Option<&CandidateInfo> {
        self.members.iter().find(|m| m.address == address)
    }

    pub fn peer_addr(&self, address: &str) -> Option<&str> {
        self.get(address).map(|m| m.peer_addr.as_str())
    }

    /// Peer addresses of every member except `local`.
    pub fn peer_addrs_except(&self, local: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.address != local)
            .map(|m| m.peer_addr.clone())
            .collect()
    }

    pub fn total_stake(&self) -> u64 {
        self.members.iter().map(|m| m.stake).sum()
    }
}
