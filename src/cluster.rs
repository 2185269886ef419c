//! An in-process validator cluster over `MemoryNetwork`.
//!
//! Every node owns its ledger, SMR and pacemaker. The harness plays the
//! host chain: it picks the round-robin proposer, gossips each new block to
//! every ledger and triggers the view changes.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use crate::common::config::SmrConfig;
use crate::common::crypto::Keypair;
use crate::common::error::{LedgerError, PacemakerError, SmrError};
use crate::consensus::bridge::{LeaderSchedule, LedgerBridge, RoundRobinSchedule};
use crate::consensus::pacemaker::{DefaultPaceMaker, PaceMaker};
use crate::consensus::smr::{InitQcs, Smr};
use crate::consensus::store::{Block, Ledger, MemoryLedger};
use crate::consensus::validators::{CandidateInfo, ValidatorSet};
use crate::network::{Inbound, MemoryNetwork};

pub const START_VIEW: i64 = 1;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("timed out waiting for {stage} at view {view}")]
    Timeout { view: i64, stage: &'static str },

    #[error(transparent)]
    Smr(#[from] SmrError),

    #[error(transparent)]
    Pacemaker(#[from] PacemakerError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct LocalNode {
    pub address: String,
    pub peer_addr: String,
    pub smr: Arc<Smr>,
    pub pacemaker: Arc<DefaultPaceMaker>,
    pub ledger: Arc<MemoryLedger>,
    pub schedule: Arc<RoundRobinSchedule>,
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
}

impl LocalNode {
    /// Hands out the node's inbound queue, once.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.inbound.lock().take()
    }
}

pub struct LocalCluster {
    pub chain_name: String,
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<LocalNode>,
}

pub fn peer_addr_of(address: &str) -> String {
    format!("/memory/{address}")
}

impl LocalCluster {
    pub fn new(size: usize, config: SmrConfig) -> Result<Self, ClusterError> {
        let chain_name = "xuper".to_string();
        let network = Arc::new(MemoryNetwork::default());
        let keypairs: Vec<Keypair> = (0..size)
            .map(|i| Keypair::from_seed(&[i as u8 + 1; 32]))
            .collect();
        let validators = ValidatorSet::new(
            keypairs
                .iter()
                .map(|k| CandidateInfo::new(k.address(), peer_addr_of(&k.address())))
                .collect(),
        );
        let genesis = Block::genesis();

        let mut nodes = Vec::with_capacity(size);
        for keypair in keypairs {
            let address = keypair.address();
            let peer_addr = peer_addr_of(&address);
            let inbound = network.register(peer_addr.clone(), config.net_msg_chan_size);
            let ledger = Arc::new(MemoryLedger::new(genesis.clone()));
            let schedule = Arc::new(RoundRobinSchedule::new(validators.clone()));
            let bridge = Arc::new(LedgerBridge::new(ledger.clone(), schedule.clone(), START_VIEW));
            let init = InitQcs::from_ledger(ledger.as_ref())?;
            let smr = Arc::new(Smr::new(
                config.clone(),
                chain_name.clone(),
                keypair,
                validators.clone(),
                bridge,
                network.clone(),
                init,
            )?);
            let pacemaker = Arc::new(DefaultPaceMaker::new(START_VIEW, 0, smr.clone(), ledger.clone()));
            nodes.push(LocalNode {
                address,
                peer_addr,
                smr,
                pacemaker,
                ledger,
                schedule,
                inbound: Mutex::new(Some(inbound)),
            });
        }

        Ok(LocalCluster {
            chain_name,
            network,
            nodes,
        })
    }

    /// Starts the dispatch loop of every node whose queue was not taken.
    pub fn start(&self) {
        for node in &self.nodes {
            if let Some(inbound) = node.take_inbound() {
                node.pacemaker.start(inbound);
            }
        }
    }

    pub async fn stop(&self) {
        for node in &self.nodes {
            node.pacemaker.stop().await;
        }
    }

    pub fn leader_of(&self, view: i64) -> Option<&LocalNode> {
        let address = self.nodes.first()?.schedule.expected_proposer(view)?;
        self.nodes.iter().find(|n| n.address == address)
    }

    /// One full view: NEW_VIEW round, proposal, and the leader's QC.
    pub async fn run_view(&self, view: i64) -> Result<Block, ClusterError> {
        let leader = self.leader_of(view).ok_or(ClusterError::Timeout { view, stage: "leader" })?;
        let previous = self
            .leader_of(view - 1)
            .map(|n| n.address.clone())
            .unwrap_or_default();

        for node in &self.nodes {
            node.pacemaker.next_new_view(view, &leader.address, &previous)?;
        }
        // the previous leader's NEW_VIEW carries the QC of view - 1
        self.wait_for(view, "new view quorum", || {
            leader.smr.new_view_justify(view).is_some()
                && (view == START_VIEW || leader.smr.generate_qc().view_number >= view - 1)
        })
        .await?;

        if !leader.pacemaker.is_last_view_confirmed()? {
            info!(view, "leader tip rolled back");
        }
        let parent = leader.ledger.query_block(&leader.ledger.tip_id())?;
        let justify = leader.pacemaker.current_qc_high();
        let justify = (!justify.is_genesis()).then_some(justify);
        let block = Block::new(
            parent.id.clone(),
            view,
            leader.address.clone(),
            view,
            justify,
            format!("txs@{view}").into_bytes(),
        );
        for node in &self.nodes {
            if node.ledger.query_block(&block.pre_hash).is_ok() {
                node.ledger.append(block.clone())?;
            }
        }

        leader.pacemaker.next_new_proposal(&block.id, &block)?;
        self.wait_for(view, "quorum cert", || leader.smr.generate_qc().proposal_id == block.id)
            .await?;
        Ok(block)
    }

    async fn wait_for<F>(&self, view: i64, stage: &'static str, mut done: F) -> Result<(), ClusterError>
    where
        F: FnMut() -> bool,
    {
        let wait = async {
            while !done() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(STEP_TIMEOUT, wait)
            .await
            .map_err(|_| ClusterError::Timeout { view, stage })
    }
}
