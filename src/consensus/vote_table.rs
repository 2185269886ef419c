use std::sync::Arc;

use dashmap::DashMap;

use super::message::ChainedBftPhaseMessage;
use super::qc::{ProposalId, SignInfo};
use super::validators::ValidatorSet;
use crate::common::error::QcError;

#[derive(Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    Accepted { count: usize },
    Duplicate,
    AlreadyFinalized,
    /// Returned to exactly one caller per proposal.
    QuorumReached(Vec<SignInfo>),
}

struct VoteEntry {
    view_number: i64,
    /// Validator set captured when the first vote arrived.
    validators: Arc<ValidatorSet>,
    quorum: usize,
    sign_infos: Vec<SignInfo>,
    finalized: bool,
}

/// Votes per proposal id, collected by the proposer.
#[derive(Default)]
pub struct VoteTable {
    entries: DashMap<ProposalId, VoteEntry>,
}

impl VoteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a verified vote. `snapshot` is only consulted for the first vote
    /// of a proposal; later votes are judged against that same snapshot.
    pub fn add_vote<F>(
        &self,
        proposal_id: &[u8],
        view_number: i64,
        sign: SignInfo,
        snapshot: F,
    ) -> Result<VoteOutcome, QcError>
    where
        F: FnOnce() -> (Arc<ValidatorSet>, usize),
    {
        sign.verify_vote(proposal_id)?;

        let mut entry = self.entries.entry(proposal_id.to_vec()).or_insert_with(|| {
            let (validators, quorum) = snapshot();
            VoteEntry {
                view_number,
                validators,
                quorum,
                sign_infos: Vec::new(),
                finalized: false,
            }
        });
        if entry.finalized {
            return Ok(VoteOutcome::AlreadyFinalized);
        }
        if !entry.validators.is_member(&sign.address) {
            return Err(QcError::UnknownSigner(sign.address));
        }
        if entry.sign_infos.iter().any(|s| s.address == sign.address) {
            return Ok(VoteOutcome::Duplicate);
        }
        entry.sign_infos.push(sign);
        if entry.sign_infos.len() >= entry.quorum {
            entry.finalized = true;
            return Ok(VoteOutcome::QuorumReached(entry.sign_infos.clone()));
        }
        Ok(VoteOutcome::Accepted {
            count: entry.sign_infos.len(),
        })
    }

    pub fn count(&self, proposal_id: &[u8]) -> usize {
        self.entries.get(proposal_id).map_or(0, |e| e.sign_infos.len())
    }

    pub fn remove(&self, proposal_id: &[u8]) {
        self.entries.remove(proposal_id);
    }

    /// Drops every entry for a view at or below `view`.
    pub fn prune_through(&self, view: i64) {
        self.entries.retain(|_, entry| entry.view_number > view);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum NewViewOutcome {
    Buffered { count: usize },
    Duplicate,
    AlreadyReached,
    QuorumReached(Vec<ChainedBftPhaseMessage>),
}

#[derive(Default)]
struct NewViewSet {
    msgs: Vec<ChainedBftPhaseMessage>,
    reached: bool,
}

/// NEW_VIEW messages buffered by view number on the incoming leader.
#[derive(Default)]
pub struct NewViewTable {
    views: DashMap<i64, NewViewSet>,
}

impl NewViewTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a signed NEW_VIEW. The caller has already verified it.
    pub fn add(&self, msg: ChainedBftPhaseMessage, quorum: usize) -> NewViewOutcome {
        let Some(sender) = msg.sender().map(str::to_string) else {
            return NewViewOutcome::Duplicate;
        };
        let mut set = self.views.entry(msg.view_number).or_default();
        if set.msgs.iter().any(|m| m.sender() == Some(sender.as_str())) {
            return NewViewOutcome::Duplicate;
        }
        set.msgs.push(msg);
        if set.reached {
            return NewViewOutcome::AlreadyReached;
        }
        if set.msgs.len() >= quorum {
            set.reached = true;
            return NewViewOutcome::QuorumReached(set.msgs.clone());
        }
        NewViewOutcome::Buffered {
            count: set.msgs.len(),
        }
    }

    pub fn count(&self, view: i64) -> usize {
        self.views.get(&view).map_or(0, |s| s.msgs.len())
    }

    /// Drops everything buffered for views older than `view`.
    pub fn prune_below(&self, view: i64) {
        self.views.retain(|v, _| *v >= view);
    }
}
