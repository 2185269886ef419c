use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::qc::QuorumCert;
use super::smr::Smr;
use super::store::{Block, Ledger};
use super::validators::ValidatorSet;
use crate::common::error::PacemakerError;
use crate::network::Inbound;

pub const VALIDATOR_EVENT_CHANNEL_SIZE: usize = 16;

/// Published whenever the pacemaker installs a new validator set.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ValidatorSetChanged {
    pub view: i64,
    pub validators: ValidatorSet,
}

/// Drives view changes and proposals on top of the SMR. There is no local
/// timeout: the host chain decides when the next view starts.
#[async_trait]
pub trait PaceMaker: Send + Sync {
    fn current_view(&self) -> i64;

    fn next_new_view(&self, view: i64, proposer: &str, previous_proposer: &str) -> Result<(), PacemakerError>;

    fn next_new_proposal(&self, proposal_id: &[u8], block: &Block) -> Result<QuorumCert, PacemakerError>;

    fn current_qc_high(&self) -> QuorumCert;

    fn update_validator_set(&self, validators: ValidatorSet) -> Result<(), PacemakerError>;

    fn is_first_proposal(&self, qc: &QuorumCert) -> bool;

    /// Whether the ledger tip is the proposal of the newest certified QC.
    /// Rolls the tip back one block when it is not.
    fn is_last_view_confirmed(&self) -> Result<bool, PacemakerError>;

    fn update_smr_state(&self, generate_qc: &QuorumCert);

    fn start(&self, inbound: mpsc::Receiver<Inbound>);

    async fn stop(&self);
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct DefaultPaceMaker {
    start_view: i64,
    current_view: Mutex<i64>,
    smr: Arc<Smr>,
    ledger: Arc<dyn Ledger>,
    validator_events: broadcast::Sender<ValidatorSetChanged>,
    running: Mutex<Option<Running>>,
}

impl DefaultPaceMaker {
    pub fn new(start_view: i64, current_view: i64, smr: Arc<Smr>, ledger: Arc<dyn Ledger>) -> Self {
        let (validator_events, _) = broadcast::channel(VALIDATOR_EVENT_CHANNEL_SIZE);
        DefaultPaceMaker {
            start_view,
            current_view: Mutex::new(current_view),
            smr,
            ledger,
            validator_events,
            running: Mutex::new(None),
        }
    }

    pub fn smr(&self) -> &Arc<Smr> {
        &self.smr
    }

    pub fn subscribe_validator_changes(&self) -> broadcast::Receiver<ValidatorSetChanged> {
        self.validator_events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

#[async_trait]
impl PaceMaker for DefaultPaceMaker {
    fn current_view(&self) -> i64 {
        *self.current_view.lock()
    }

    fn next_new_view(&self, view: i64, proposer: &str, previous_proposer: &str) -> Result<(), PacemakerError> {
        let mut current = self.current_view.lock();
        if view < *current {
            return Err(PacemakerError::ViewRegression {
                next: view,
                current: *current,
            });
        }
        self.smr.process_new_view(view, proposer, previous_proposer)?;
        *current = view;
        debug!(view, proposer, "entered new view");
        Ok(())
    }

    fn next_new_proposal(&self, proposal_id: &[u8], block: &Block) -> Result<QuorumCert, PacemakerError> {
        let mut current = self.current_view.lock();
        if block.height < *current {
            return Err(PacemakerError::ProposalTooOld {
                height: block.height,
                current: *current,
            });
        }
        let qc = self
            .smr
            .process_proposal(block.height, proposal_id.to_vec(), block.encode()?)?;
        *current = block.height;
        Ok(qc)
    }

    fn current_qc_high(&self) -> QuorumCert {
        self.smr.generate_qc()
    }

    fn update_validator_set(&self, validators: ValidatorSet) -> Result<(), PacemakerError> {
        self.smr.update_validator_set(validators.clone())?;
        let view = self.current_view();
        // no subscribers is fine
        let _ = self.validator_events.send(ValidatorSetChanged { view, validators });
        Ok(())
    }

    fn is_first_proposal(&self, qc: &QuorumCert) -> bool {
        qc.view_number == self.start_view
    }

    fn is_last_view_confirmed(&self) -> Result<bool, PacemakerError> {
        let tip = self.ledger.query_block(&self.ledger.tip_id())?;
        let generate_qc = self.smr.generate_qc();
        if generate_qc.proposal_id == tip.id || (tip.height == 0 && generate_qc.is_genesis()) {
            return Ok(true);
        }
        warn!(
            tip_height = tip.height,
            tip = %hex::encode(&tip.id),
            generate_view = generate_qc.view_number,
            generate = %generate_qc.short_id(),
            "last view not confirmed, rolling back tip"
        );
        self.ledger.rollback_to(&tip.pre_hash)?;
        Ok(false)
    }

    fn update_smr_state(&self, generate_qc: &QuorumCert) {
        self.smr.update_smr_state(generate_qc);
    }

    fn start(&self, inbound: mpsc::Receiver<Inbound>) {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("pacemaker already started");
            return;
        }
        let cancel = CancellationToken::new();
        let dispatch = tokio::spawn(Arc::clone(&self.smr).run(inbound, cancel.child_token()));

        let mut commits = self.smr.subscribe_commits();
        let ledger = Arc::clone(&self.ledger);
        let follower_cancel = cancel.child_token();
        let follower = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = follower_cancel.cancelled() => break,
                    event = commits.recv() => match event {
                        Ok(committed) => {
                            if let Err(err) = ledger.confirm_block(&committed.proposal_id) {
                                warn!(%err, view = committed.view_number, "confirm committed block failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "commit follower lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        info!(start_view = self.start_view, "pacemaker started");
        *running = Some(Running {
            cancel,
            tasks: vec![dispatch, follower],
        });
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(err) = task.await {
                warn!(%err, "pacemaker task failed");
            }
        }
        info!("pacemaker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::common::config::SmrConfig;
    use crate::common::error::SmrError;
    use crate::consensus::qc::Phase;

    #[tokio::test]
    async fn test_view_only_moves_forward() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let node = &cluster.nodes[0];
        let leader = cluster.nodes[1].address.clone();

        node.pacemaker.next_new_view(3, &leader, "").unwrap();
        assert_eq!(node.pacemaker.current_view(), 3);
        assert!(matches!(
            node.pacemaker.next_new_view(2, &leader, ""),
            Err(PacemakerError::ViewRegression { next: 2, current: 3 })
        ));

        let block = Block::new(Block::genesis().id, 2, leader.clone(), 2, None, Vec::new());
        assert!(matches!(
            node.pacemaker.next_new_proposal(&block.id, &block),
            Err(PacemakerError::ProposalTooOld { height: 2, current: 3 })
        ));
        assert_eq!(node.pacemaker.current_view(), 3);
    }

    #[tokio::test]
    async fn test_failed_new_view_keeps_cached_view() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let node = &cluster.nodes[0];

        let block = Block::new(Block::genesis().id, 4, node.address.clone(), 4, None, Vec::new());
        node.pacemaker.next_new_proposal(&block.id, &block).unwrap();
        assert_eq!(node.pacemaker.current_view(), 4);

        let result = node.pacemaker.next_new_view(5, "unknown-leader", "");
        assert!(matches!(result, Err(PacemakerError::Smr(SmrError::NotValidator(_)))));
        assert_eq!(node.pacemaker.current_view(), 4);
    }

    #[tokio::test]
    async fn test_first_proposal_and_qc_high() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let pacemaker = &cluster.nodes[0].pacemaker;

        assert!(pacemaker.is_first_proposal(&QuorumCert::new(b"b1".to_vec(), Vec::new(), 1, Phase::Prepare)));
        assert!(!pacemaker.is_first_proposal(&QuorumCert::new(b"b2".to_vec(), Vec::new(), 2, Phase::Prepare)));
        assert!(pacemaker.current_qc_high().is_genesis());
    }

    #[tokio::test]
    async fn test_unconfirmed_tip_is_rolled_back() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let node = &cluster.nodes[0];
        let genesis = Block::genesis();

        assert!(node.pacemaker.is_last_view_confirmed().unwrap());

        let orphan = Block::new(genesis.id.clone(), 1, node.address.clone(), 1, None, Vec::new());
        node.ledger.append(orphan.clone()).unwrap();
        assert_eq!(node.ledger.tip_id(), orphan.id);

        assert!(!node.pacemaker.is_last_view_confirmed().unwrap());
        assert_eq!(node.ledger.tip_id(), genesis.id);
        assert!(node.pacemaker.is_last_view_confirmed().unwrap());
    }

    #[tokio::test]
    async fn test_validator_change_is_published() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let node = &cluster.nodes[0];
        let mut events = node.pacemaker.subscribe_validator_changes();

        let reduced = ValidatorSet::new(node.smr.validators().members[..3].to_vec());
        node.pacemaker.update_validator_set(reduced.clone()).unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.validators, reduced);
        assert_eq!(node.smr.validators().len(), 3);

        assert!(node.pacemaker.update_validator_set(ValidatorSet::default()).is_err());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let cluster = LocalCluster::new(1, SmrConfig::default()).unwrap();
        let node = &cluster.nodes[0];
        let inbound = node.take_inbound().unwrap();

        node.pacemaker.start(inbound);
        assert!(node.pacemaker.is_running());

        node.pacemaker.stop().await;
        assert!(!node.pacemaker.is_running());
        // stopping twice is a no-op
        node.pacemaker.stop().await;
    }
}
