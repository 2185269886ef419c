use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::qc::{ProposalId, QuorumCert};
use super::store::{Block, Ledger};
use super::validators::ValidatorSet;
use crate::common::crypto::sha256;
use crate::common::error::BridgeError;

/// How the engine reaches into the host chain. All calls may block on the
/// ledger and must be cheap enough to run inside message handlers.
pub trait ExternalBridge: Send + Sync {
    /// The certificate embedded in the proposal certified by `qc`.
    fn call_pre_qc(&self, qc: &QuorumCert) -> Result<Option<QuorumCert>, BridgeError>;

    fn call_pre_proposal_msg(&self, proposal_msg: &[u8]) -> Result<Vec<u8>, BridgeError>;

    fn call_pre_pre_proposal_msg(&self, proposal_msg: &[u8]) -> Result<Vec<u8>, BridgeError>;

    /// Whether the proposal carried by `qc` is acceptable to the host chain.
    /// `false` means do not vote.
    fn call_verify_qc(&self, qc: &QuorumCert) -> Result<bool, BridgeError>;

    fn call_proposal_msg_with_proposal_id(&self, proposal_id: &[u8]) -> Result<Vec<u8>, BridgeError>;

    fn is_first_proposal(&self, qc: &QuorumCert) -> bool;

    fn proposal_id_of(&self, proposal_msg: &[u8]) -> Result<ProposalId, BridgeError>;
}

/// Proposer-match predicate of one leader election algorithm.
pub trait LeaderSchedule: Send + Sync {
    fn name(&self) -> &'static str;

    fn expected_proposer(&self, height: i64) -> Option<String>;

    fn check_proposer(&self, block: &Block) -> bool {
        self.expected_proposer(block.height).as_deref() == Some(block.proposer.as_str())
    }
}

/// Proposer rotates through the validator set by height.
pub struct RoundRobinSchedule {
    validators: RwLock<ValidatorSet>,
}

impl RoundRobinSchedule {
    pub fn new(validators: ValidatorSet) -> Self {
        RoundRobinSchedule {
            validators: RwLock::new(validators),
        }
    }

    pub fn update(&self, validators: ValidatorSet) {
        *self.validators.write() = validators;
    }
}

impl LeaderSchedule for RoundRobinSchedule {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn expected_proposer(&self, height: i64) -> Option<String> {
        let validators = self.validators.read();
        if validators.is_empty() {
            return None;
        }
        let idx = height.rem_euclid(validators.len() as i64) as usize;
        Some(validators.members[idx].address.clone())
    }
}

/// Proposer drawn with probability proportional to stake, seeded by height.
pub struct StakeWeightedSchedule {
    validators: RwLock<ValidatorSet>,
}

impl StakeWeightedSchedule {
    pub fn new(validators: ValidatorSet) -> Self {
        StakeWeightedSchedule {
            validators: RwLock::new(validators),
        }
    }

    pub fn update(&self, validators: ValidatorSet) {
        *self.validators.write() = validators;
    }
}

impl LeaderSchedule for StakeWeightedSchedule {
    fn name(&self) -> &'static str {
        "stake_weighted"
    }

    fn expected_proposer(&self, height: i64) -> Option<String> {
        let validators = self.validators.read();
        let total = validators.total_stake();
        if total == 0 {
            return None;
        }
        let seed = sha256(&height.to_be_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&seed[..8]);
        let mut ticket = u64::from_be_bytes(word) % total;
        for member in &validators.members {
            if ticket < member.stake {
                return Some(member.address.clone());
            }
            ticket -= member.stake;
        }
        None
    }
}

/// A fixed committee where each member proposes `term_len` blocks in a row.
pub struct CommitteeSchedule {
    committee: RwLock<Vec<String>>,
    term_len: i64,
}

impl CommitteeSchedule {
    pub fn new(committee: Vec<String>, term_len: i64) -> Self {
        CommitteeSchedule {
            committee: RwLock::new(committee),
            term_len: term_len.max(1),
        }
    }

    pub fn update(&self, committee: Vec<String>) {
        *self.committee.write() = committee;
    }
}

impl LeaderSchedule for CommitteeSchedule {
    fn name(&self) -> &'static str {
        "committee"
    }

    fn expected_proposer(&self, height: i64) -> Option<String> {
        let committee = self.committee.read();
        if committee.is_empty() {
            return None;
        }
        let term = height.div_euclid(self.term_len);
        let idx = term.rem_euclid(committee.len() as i64) as usize;
        Some(committee[idx].clone())
    }
}

/// Bridge backed by a `Ledger` whose proposals are bincode encoded `Block`s.
pub struct LedgerBridge<S: LeaderSchedule> {
    ledger: Arc<dyn Ledger>,
    schedule: Arc<S>,
    start_view: i64,
}

impl<S: LeaderSchedule> LedgerBridge<S> {
    pub fn new(ledger: Arc<dyn Ledger>, schedule: Arc<S>, start_view: i64) -> Self {
        LedgerBridge {
            ledger,
            schedule,
            start_view,
        }
    }

    pub fn schedule(&self) -> &Arc<S> {
        &self.schedule
    }

    fn block_of(&self, qc: &QuorumCert) -> Result<Block, BridgeError> {
        if !qc.proposal_msg.is_empty() {
            return Ok(Block::decode(&qc.proposal_msg)?);
        }
        if qc.proposal_id.is_empty() {
            return Err(BridgeError::InvalidParams("qc carries neither proposal nor id"));
        }
        Ok(self.ledger.query_block(&qc.proposal_id)?)
    }

    fn parent_of(&self, proposal_msg: &[u8]) -> Result<Block, BridgeError> {
        if proposal_msg.is_empty() {
            return Err(BridgeError::InvalidParams("empty proposal msg"));
        }
        let block = Block::decode(proposal_msg)?;
        Ok(self.ledger.query_block(&block.pre_hash)?)
    }
}

impl<S: LeaderSchedule> ExternalBridge for LedgerBridge<S> {
    fn call_pre_qc(&self, qc: &QuorumCert) -> Result<Option<QuorumCert>, BridgeError> {
        Ok(self.block_of(qc)?.justify)
    }

    fn call_pre_proposal_msg(&self, proposal_msg: &[u8]) -> Result<Vec<u8>, BridgeError> {
        Ok(self.parent_of(proposal_msg)?.encode()?)
    }

    fn call_pre_pre_proposal_msg(&self, proposal_msg: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let parent = self.parent_of(proposal_msg)?;
        Ok(self.ledger.query_block(&parent.pre_hash)?.encode()?)
    }

    fn call_verify_qc(&self, qc: &QuorumCert) -> Result<bool, BridgeError> {
        let block = self.block_of(qc)?;
        if block.id != qc.proposal_id || block.height != qc.view_number {
            warn!(
                height = block.height,
                view = qc.view_number,
                "proposal does not match its certificate"
            );
            return Err(BridgeError::IncompleteBlock);
        }
        let ok = self.schedule.check_proposer(&block);
        if !ok {
            debug!(
                schedule = self.schedule.name(),
                height = block.height,
                proposer = %block.proposer,
                "proposer mismatch"
            );
        }
        Ok(ok)
    }

    fn call_proposal_msg_with_proposal_id(&self, proposal_id: &[u8]) -> Result<Vec<u8>, BridgeError> {
        if proposal_id.is_empty() {
            return Err(BridgeError::InvalidParams("empty proposal id"));
        }
        Ok(self.ledger.query_block(proposal_id)?.encode()?)
    }

    fn is_first_proposal(&self, qc: &QuorumCert) -> bool {
        qc.view_number == self.start_view
    }

    fn proposal_id_of(&self, proposal_msg: &[u8]) -> Result<ProposalId, BridgeError> {
        Ok(Block::decode(proposal_msg)?.id)
    }
}
