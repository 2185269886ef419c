use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha256};
use tracing::{debug, info};

use super::qc::QuorumCert;
use crate::common::crypto::{Digest, Hashable};
use crate::common::error::{CodecError, LedgerError};

/// The unit being agreed on. Its bincode encoding is a QC's `proposal_msg`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub id: Vec<u8>,
    pub pre_hash: Vec<u8>,
    pub height: i64,
    pub proposer: String,
    pub timestamp: i64,
    /// Certificate of the parent, payload stripped.
    pub justify: Option<QuorumCert>,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn new(
        pre_hash: Vec<u8>,
        height: i64,
        proposer: impl Into<String>,
        timestamp: i64,
        justify: Option<QuorumCert>,
        payload: Vec<u8>,
    ) -> Self {
        let mut block = Block {
            id: Vec::new(),
            pre_hash,
            height,
            proposer: proposer.into(),
            timestamp,
            justify: justify.map(|qc| qc.without_payload()),
            payload,
        };
        block.id = block.hash().to_vec();
        block
    }

    pub fn genesis() -> Self {
        Block::new(Vec::new(), 0, "", 0, None, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(raw)?)
    }
}

impl Hashable for Block {
    fn hash(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_be_bytes());
        hasher.update(&self.pre_hash);
        hasher.update(self.proposer.as_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        if let Some(justify) = &self.justify {
            hasher.update(&justify.proposal_id);
            hasher.update(justify.view_number.to_be_bytes());
        }
        hasher.update(&self.payload);
        hasher.finalize().into()
    }
}

/// What consensus needs from the block store.
pub trait Ledger: Send + Sync {
    fn tip_id(&self) -> Vec<u8>;
    fn query_block(&self, id: &[u8]) -> Result<Block, LedgerError>;
    fn rollback_to(&self, id: &[u8]) -> Result<(), LedgerError>;
    fn confirm_block(&self, id: &[u8]) -> Result<(), LedgerError>;
}

struct LedgerInner {
    blocks: HashMap<Vec<u8>, Block>,
    tip: Vec<u8>,
    confirmed: Vec<u8>,
    confirmed_height: i64,
}

/// Single-branch block store kept in memory.
pub struct MemoryLedger {
    inner: RwLock<LedgerInner>,
}

impl MemoryLedger {
    pub fn new(genesis: Block) -> Self {
        let id = genesis.id.clone();
        let mut blocks = HashMap::new();
        blocks.insert(id.clone(), genesis);
        MemoryLedger {
            inner: RwLock::new(LedgerInner {
                blocks,
                tip: id.clone(),
                confirmed: id,
                confirmed_height: 0,
            }),
        }
    }

    /// Appends a child of a known block and moves the tip to it.
    pub fn append(&self, block: Block) -> Result<(), LedgerError> {
        let mut inner = self.inner.write();
        if !inner.blocks.contains_key(&block.pre_hash) {
            return Err(LedgerError::MissingParent(hex::encode(&block.pre_hash)));
        }
        debug!(height = block.height, id = %hex::encode(&block.id), "append block");
        inner.tip = block.id.clone();
        inner.blocks.insert(block.id.clone(), block);
        Ok(())
    }

    pub fn tip(&self) -> Option<Block> {
        let inner = self.inner.read();
        inner.blocks.get(&inner.tip).cloned()
    }

    pub fn confirmed_id(&self) -> Vec<u8> {
        self.inner.read().confirmed.clone()
    }

    pub fn confirmed_height(&self) -> i64 {
        self.inner.read().confirmed_height
    }
}

impl Ledger for MemoryLedger {
    fn tip_id(&self) -> Vec<u8> {
        self.inner.read().tip.clone()
    }

    fn query_block(&self, id: &[u8]) -> Result<Block, LedgerError> {
        self.inner
            .read()
            .blocks
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::BlockNotFound(hex::encode(id)))
    }

    fn rollback_to(&self, id: &[u8]) -> Result<(), LedgerError> {
        let mut inner = self.inner.write();
        let height = inner
            .blocks
            .get(id)
            .map(|b| b.height)
            .ok_or_else(|| LedgerError::BlockNotFound(hex::encode(id)))?;
        if height < inner.confirmed_height {
            return Err(LedgerError::RollbackRejected(hex::encode(id)));
        }
        inner.blocks.retain(|_, b| b.height <= height);
        inner.tip = id.to_vec();
        info!(height, id = %hex::encode(id), "ledger rolled back");
        Ok(())
    }

    fn confirm_block(&self, id: &[u8]) -> Result<(), LedgerError> {
        let mut inner = self.inner.write();
        let height = inner
            .blocks
            .get(id)
            .map(|b| b.height)
            .ok_or_else(|| LedgerError::BlockNotFound(hex::encode(id)))?;
        if height > inner.confirmed_height {
            inner.confirmed_height = height;
            inner.confirmed = id.to_vec();
            info!(height, id = %hex::encode(id), "block confirmed");
        }
        Ok(())
    }
}
