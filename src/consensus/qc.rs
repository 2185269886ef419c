use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::validators::ValidatorSet;
use crate::common::crypto::{sha256, verify_with_address, Keypair};
use crate::common::error::{CryptoError, QcError};

/*
    A quorum certificate binds a proposal id to a view and to the votes of
    a quorum of validators. A replica votes by signing sha256(proposal_id),
    so a QC stays valid no matter which phase label it currently carries in
    the three-deep pipeline.
*/

pub type ProposalId = Vec<u8>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Phase {
    NewView,
    Prepare,
    PreCommit,
    Commit,
}

impl AsRef<[u8]> for Phase {
    fn as_ref(&self) -> &[u8] {
        match self {
            Phase::NewView => b"NEW_VIEW",
            Phase::Prepare => b"PREPARE",
            Phase::PreCommit => b"PRE_COMMIT",
            Phase::Commit => b"COMMIT",
        }
    }
}

/// One validator's vote evidence.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SignInfo {
    pub address: String,
    /// JSON encoded public key, see `Pubkey::to_json`.
    pub public_key: String,
    pub signature: Vec<u8>,
}

impl SignInfo {
    pub fn sign_vote(keypair: &Keypair, proposal_id: &[u8]) -> Self {
        SignInfo {
            address: keypair.address(),
            public_key: keypair.public_key_json(),
            signature: keypair.sign(&sha256(proposal_id)),
        }
    }

    pub fn verify_vote(&self, proposal_id: &[u8]) -> Result<(), CryptoError> {
        verify_with_address(
            &self.address,
            &self.public_key,
            &self.signature,
            &sha256(proposal_id),
        )
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct QuorumCert {
    pub proposal_id: ProposalId,
    /// Serialized proposal, stripped when the QC is embedded elsewhere.
    pub proposal_msg: Vec<u8>,
    pub view_number: i64,
    pub phase: Phase,
    pub sign_infos: Vec<SignInfo>,
}

/// 2f+1 out of n = 3f+1.
pub fn quorum_size(n: usize) -> usize {
    if n == 0 {
        return 1;
    }
    n - (n - 1) / 3
}

impl QuorumCert {
    pub fn new(proposal_id: ProposalId, proposal_msg: Vec<u8>, view_number: i64, phase: Phase) -> Self {
        QuorumCert {
            proposal_id,
            proposal_msg,
            view_number,
            phase,
            sign_infos: Vec::new(),
        }
    }

    pub fn genesis() -> Self {
        QuorumCert::new(Vec::new(), Vec::new(), 0, Phase::Prepare)
    }

    pub fn is_genesis(&self) -> bool {
        self.view_number == 0 && self.proposal_id.is_empty()
    }

    pub fn signers(&self) -> impl Iterator<Item = &str> {
        self.sign_infos.iter().map(|s| s.address.as_str())
    }

    /// Appends a vote. Duplicates and unverifiable signatures are refused
    /// and leave the certificate unchanged.
    pub fn add_signature(&mut self, sign: SignInfo) -> Result<(), QcError> {
        if self.signers().any(|addr| addr == sign.address) {
            return Err(QcError::DuplicateSigner(sign.address));
        }
        sign.verify_vote(&self.proposal_id)?;
        self.sign_infos.push(sign);
        Ok(())
    }

    /// True once distinct, verified signers from `validators` reach `quorum`.
    pub fn is_validated(&self, validators: &ValidatorSet, quorum: usize) -> bool {
        let mut seen = HashSet::new();
        for sign in &self.sign_infos {
            if !validators.is_member(&sign.address) {
                debug!(address = %sign.address, "qc signer is not a validator");
                continue;
            }
            if let Err(err) = sign.verify_vote(&self.proposal_id) {
                debug!(address = %sign.address, %err, "qc signature rejected");
                continue;
            }
            seen.insert(sign.address.as_str());
        }
        seen.len() >= quorum
    }

    /// Copy without the proposal payload, as embedded in blocks and messages.
    pub fn without_payload(&self) -> Self {
        QuorumCert {
            proposal_msg: Vec::new(),
            ..self.clone()
        }
    }

    pub fn short_id(&self) -> String {
        hex::encode(&self.proposal_id[..self.proposal_id.len().min(8)])
    }
}
