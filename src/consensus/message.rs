use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::qc::{Phase, ProposalId, QuorumCert, SignInfo};
use crate::common::crypto::{double_sha256, sha256, verify_with_address, Digest, Keypair};
use crate::common::error::{CodecError, SmrError};

/*
    Every message is stamped with the sender's view. A PREPARE message
    carries the leader's fresh proposal in `proposal_qc` and the best
    certified QC the leader knows in `justify_qc`. A NEW_VIEW message only
    carries `justify_qc`, and only when the sender led the previous view.
    Votes travel separately, unicast to the proposer.
*/

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ChainedBftPhaseMessage {
    pub phase: Phase,
    pub view_number: i64,
    pub proposal_qc: Option<QuorumCert>,
    pub justify_qc: Option<QuorumCert>,
    pub signature: Option<SignInfo>,
}

impl ChainedBftPhaseMessage {
    pub fn new(phase: Phase, view_number: i64) -> Self {
        ChainedBftPhaseMessage {
            phase,
            view_number,
            proposal_qc: None,
            justify_qc: None,
            signature: None,
        }
    }

    pub fn with_proposal(mut self, qc: QuorumCert) -> Self {
        self.proposal_qc = Some(qc);
        self
    }

    pub fn with_justify(mut self, qc: QuorumCert) -> Self {
        self.justify_qc = Some(qc);
        self
    }

    /// Digest over everything but the signature.
    pub fn digest(&self) -> Result<Digest, CodecError> {
        let body = bincode::serialize(&(
            self.phase,
            self.view_number,
            &self.proposal_qc,
            &self.justify_qc,
        ))?;
        Ok(double_sha256(&body))
    }

    pub fn sign(mut self, keypair: &Keypair) -> Result<Self, CodecError> {
        let digest = self.digest()?;
        self.signature = Some(SignInfo {
            address: keypair.address(),
            public_key: keypair.public_key_json(),
            signature: keypair.sign(&digest),
        });
        Ok(self)
    }

    /// Checks the signature and returns the signer.
    pub fn verify(&self) -> Result<&SignInfo, SmrError> {
        let sign = self.signature.as_ref().ok_or(SmrError::MissingSignature)?;
        let digest = self.digest()?;
        verify_with_address(&sign.address, &sign.public_key, &sign.signature, &digest)?;
        Ok(sign)
    }

    pub fn sender(&self) -> Option<&str> {
        self.signature.as_ref().map(|s| s.address.as_str())
    }
}

/// A replica's vote for a proposal.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ChainedBftVoteMessage {
    pub proposal_id: ProposalId,
    pub signature: SignInfo,
}

impl ChainedBftVoteMessage {
    pub fn new(keypair: &Keypair, proposal_id: ProposalId) -> Self {
        let signature = SignInfo::sign_vote(keypair, &proposal_id);
        ChainedBftVoteMessage {
            proposal_id,
            signature,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum MessageType {
    NewView,
    NewProposal,
    Vote,
    QcSyncRequest,
    QcSyncResponse,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MessageHeader {
    pub protocol_version: String,
    pub logid: String,
    pub chain_name: String,
    pub message_type: MessageType,
    pub data_checksum: u32,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NetMessage {
    pub header: MessageHeader,
    pub data: Vec<u8>,
}

pub fn checksum(data: &[u8]) -> u32 {
    let digest = sha256(data);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

pub fn new_logid() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl NetMessage {
    pub fn new<T: Serialize>(
        protocol_version: &str,
        chain_name: &str,
        message_type: MessageType,
        logid: String,
        body: &T,
    ) -> Result<Self, CodecError> {
        let data = bincode::serialize(body)?;
        Ok(NetMessage {
            header: MessageHeader {
                protocol_version: protocol_version.to_string(),
                logid,
                chain_name: chain_name.to_string(),
                message_type,
                data_checksum: checksum(&data),
            },
            data,
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn verify_checksum(&self) -> bool {
        checksum(&self.data) == self.header.data_checksum
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        if !self.verify_checksum() {
            return Err(CodecError::ChecksumMismatch);
        }
        Ok(bincode::deserialize(&self.data)?)
    }
}
