use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::bridge::ExternalBridge;
use super::message::{
    new_logid, ChainedBftPhaseMessage, ChainedBftVoteMessage, MessageType, NetMessage,
};
use super::qc::{Phase, ProposalId, QuorumCert, SignInfo};
use super::safety::safe_proposal;
use super::store::Ledger;
use super::validators::ValidatorSet;
use super::vote_table::{NewViewOutcome, NewViewTable, VoteOutcome, VoteTable};
use crate::common::config::{BroadcastPolicy, SmrConfig};
use crate::common::crypto::Keypair;
use crate::common::error::{CodecError, LedgerError, SmrError};
use crate::network::{Inbound, Transport};

/*
    The engine keeps a three-deep pipeline of certificates:

        locked_qc  <-  generate_qc  <-  proposal_qc

    proposal_qc is the newest proposal seen, generate_qc the newest one that
    gathered a quorum, locked_qc the one below it. A replica only votes for a
    proposal that extends locked_qc or whose justification is newer. When a
    certificate falls out of locked_qc, three consecutive QCs sit on top of
    it and its proposal is committed.
*/

pub const COMMIT_CHANNEL_SIZE: usize = 256;

/// Emitted once per proposal that reached the commit rule.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommittedProposal {
    pub proposal_id: ProposalId,
    pub view_number: i64,
}

/// Snapshot of the pipeline.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct QcStatus {
    pub proposal_qc: QuorumCert,
    pub generate_qc: QuorumCert,
    pub locked_qc: QuorumCert,
    pub voted_view: i64,
}

/// The pipeline an instance starts from.
#[derive(Clone, Debug)]
pub struct InitQcs {
    pub proposal_qc: QuorumCert,
    pub generate_qc: QuorumCert,
    pub locked_qc: QuorumCert,
}

impl InitQcs {
    pub fn genesis() -> Self {
        InitQcs {
            proposal_qc: QuorumCert::genesis(),
            generate_qc: QuorumCert::genesis(),
            locked_qc: QuorumCert::genesis(),
        }
    }

    /// Seeds the pipeline from the certificates embedded in the three most
    /// recent blocks: tip, its parent and its grandparent.
    pub fn from_ledger(ledger: &dyn Ledger) -> Result<Self, LedgerError> {
        let mut qcs = [QuorumCert::genesis(), QuorumCert::genesis(), QuorumCert::genesis()];
        let mut block = ledger.query_block(&ledger.tip_id())?;
        for slot in qcs.iter_mut() {
            if let Some(justify) = &block.justify {
                *slot = justify.clone();
            }
            if block.height == 0 {
                break;
            }
            block = ledger.query_block(&block.pre_hash)?;
        }
        let [proposal_qc, generate_qc, locked_qc] = qcs;
        Ok(InitQcs {
            proposal_qc,
            generate_qc,
            locked_qc,
        })
    }

    fn check(&self) -> Result<(), SmrError> {
        let (locked, generate, proposal) = (
            self.locked_qc.view_number,
            self.generate_qc.view_number,
            self.proposal_qc.view_number,
        );
        if locked > generate || generate > proposal {
            return Err(SmrError::InvalidInitialState(format!(
                "pipeline out of order: locked {locked}, generate {generate}, proposal {proposal}"
            )));
        }
        Ok(())
    }
}

struct QcState {
    proposal_qc: QuorumCert,
    generate_qc: QuorumCert,
    locked_qc: QuorumCert,
    voted_view: i64,
    committed_view: i64,
}

struct ValidatorState {
    current: Arc<ValidatorSet>,
    previous: Arc<ValidatorSet>,
    /// Voted view at the time of the last change.
    vsc_view: i64,
}

pub struct Smr {
    config: SmrConfig,
    chain_name: String,
    keypair: Keypair,
    address: String,
    validators: RwLock<ValidatorState>,
    bridge: Arc<dyn ExternalBridge>,
    transport: Arc<dyn Transport>,
    state: Mutex<QcState>,
    /// Proposals this node made and still collects votes for.
    local_proposals: DashMap<ProposalId, QuorumCert>,
    qc_votes: VoteTable,
    new_view_msgs: NewViewTable,
    /// Highest QC reported by a NEW_VIEW quorum, by view.
    view_justify: DashMap<i64, QuorumCert>,
    commits: broadcast::Sender<CommittedProposal>,
}

fn with_phase(mut qc: QuorumCert, phase: Phase) -> QuorumCert {
    qc.phase = phase;
    qc
}

impl Smr {
    pub fn new(
        config: SmrConfig,
        chain_name: impl Into<String>,
        keypair: Keypair,
        validators: ValidatorSet,
        bridge: Arc<dyn ExternalBridge>,
        transport: Arc<dyn Transport>,
        init: InitQcs,
    ) -> Result<Self, SmrError> {
        if validators.is_empty() {
            return Err(SmrError::InvalidInitialState("validator set is empty".into()));
        }
        init.check()?;

        let address = keypair.address();
        let voted_view = init.proposal_qc.view_number;
        let validators = Arc::new(validators);
        let (commits, _) = broadcast::channel(COMMIT_CHANNEL_SIZE);
        let chain_name = chain_name.into();
        info!(
            chain = %chain_name,
            address = %address,
            voted_view,
            validators = validators.len(),
            "chained-bft smr created"
        );

        Ok(Smr {
            config,
            chain_name,
            keypair,
            address,
            validators: RwLock::new(ValidatorState {
                previous: validators.clone(),
                current: validators,
                vsc_view: voted_view,
            }),
            bridge,
            transport,
            state: Mutex::new(QcState {
                committed_view: init.locked_qc.view_number,
                proposal_qc: init.proposal_qc,
                generate_qc: init.generate_qc,
                locked_qc: init.locked_qc,
                voted_view,
            }),
            local_proposals: DashMap::new(),
            qc_votes: VoteTable::new(),
            new_view_msgs: NewViewTable::new(),
            view_justify: DashMap::new(),
            commits,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn chain_name(&self) -> &str {
        &self.chain_name
    }

    pub fn config(&self) -> &SmrConfig {
        &self.config
    }

    pub fn voted_view(&self) -> i64 {
        self.state.lock().voted_view
    }

    pub fn qc_status(&self) -> QcStatus {
        let state = self.state.lock();
        QcStatus {
            proposal_qc: state.proposal_qc.clone(),
            generate_qc: state.generate_qc.clone(),
            locked_qc: state.locked_qc.clone(),
            voted_view: state.voted_view,
        }
    }

    /// The newest certified QC, without its proposal payload.
    pub fn generate_qc(&self) -> QuorumCert {
        self.state.lock().generate_qc.without_payload()
    }

    pub fn validators(&self) -> Arc<ValidatorSet> {
        self.validators.read().current.clone()
    }

    /// Justification the NEW_VIEW quorum produced for `view`, if reached.
    pub fn new_view_justify(&self, view: i64) -> Option<QuorumCert> {
        self.view_justify.get(&view).map(|qc| qc.value().clone())
    }

    pub fn subscribe_commits(&self) -> broadcast::Receiver<CommittedProposal> {
        self.commits.subscribe()
    }

    pub fn pending_votes(&self) -> usize {
        self.qc_votes.len()
    }

    pub fn pending_proposals(&self) -> usize {
        self.local_proposals.len()
    }

    /// Replaces the validator set. Votes already being aggregated keep the
    /// set captured when they started.
    pub fn update_validator_set(&self, validators: ValidatorSet) -> Result<(), SmrError> {
        if validators.is_empty() {
            return Err(SmrError::EmptyValidatorSet);
        }
        let voted_view = self.voted_view();
        let mut state = self.validators.write();
        state.vsc_view = voted_view;
        state.previous = std::mem::replace(&mut state.current, Arc::new(validators));
        info!(
            vsc_view = voted_view,
            validators = state.current.len(),
            "validator set updated"
        );
        Ok(())
    }

    /// Set used to judge NEW_VIEW membership for `view`.
    fn validators_for_view(&self, view: i64) -> Arc<ValidatorSet> {
        let state = self.validators.read();
        let delay = self.config.effective_delay;
        if delay > 0 && view > state.vsc_view && view <= state.vsc_view + delay {
            return state.previous.clone();
        }
        state.current.clone()
    }

    fn quorum(&self, validators: &ValidatorSet) -> usize {
        self.config.quorum_for(validators.len())
    }

    /// Genesis is the only certificate accepted without a quorum of its own.
    pub fn is_quorum_cert_validate(&self, qc: &QuorumCert) -> bool {
        if qc.is_genesis() {
            return true;
        }
        let validators = self.validators();
        qc.is_validated(&validators, self.quorum(&validators))
    }

    /// Enters `view`. The previous leader hands over its newest certificate.
    pub fn process_new_view(
        &self,
        view: i64,
        leader: &str,
        previous_leader: &str,
    ) -> Result<(), SmrError> {
        let voted_view = self.voted_view();
        if view < voted_view {
            warn!(view, voted_view, "new view is behind voted view");
            return Err(SmrError::StaleView { view, voted_view });
        }

        let mut msg = ChainedBftPhaseMessage::new(Phase::NewView, view);
        if previous_leader == self.address {
            msg = msg.with_justify(self.generate_qc());
        }
        let msg = msg.sign(&self.keypair)?;

        if leader == self.address {
            return self.handle_received_new_view(msg);
        }

        let peer = self
            .validators_for_view(view)
            .peer_addr(leader)
            .map(str::to_string)
            .or_else(|| self.validators().peer_addr(leader).map(str::to_string))
            .ok_or_else(|| SmrError::NotValidator(leader.to_string()))?;
        let net = NetMessage::new(
            &self.config.protocol_version,
            &self.chain_name,
            MessageType::NewView,
            new_logid(),
            &msg,
        )?;
        debug!(view, leader, "send new view");
        self.send(net, vec![peer]);
        Ok(())
    }

    /// Starts a proposal at `view`. The leader's own vote is counted locally.
    ///
    /// Leadership is not checked here: replicas refuse a proposal from the
    /// wrong proposer through `ExternalBridge::call_verify_qc`.
    pub fn process_proposal(
        &self,
        view: i64,
        proposal_id: ProposalId,
        proposal_msg: Vec<u8>,
    ) -> Result<QuorumCert, SmrError> {
        let qc = QuorumCert::new(proposal_id, proposal_msg, view, Phase::Prepare);
        // a new proposal carries the newest QC, older ones can no longer win
        self.prune_settled(view - 1);
        self.local_proposals.insert(qc.proposal_id.clone(), qc.clone());
        {
            let mut state = self.state.lock();
            state.voted_view = state.voted_view.max(view);
            if view > state.proposal_qc.view_number {
                state.proposal_qc = qc.clone();
            }
        }

        let msg = ChainedBftPhaseMessage::new(Phase::Prepare, view)
            .with_proposal(qc.clone())
            .with_justify(self.generate_qc())
            .sign(&self.keypair)?;
        let logid = new_logid();
        let net = NetMessage::new(
            &self.config.protocol_version,
            &self.chain_name,
            MessageType::NewProposal,
            logid.clone(),
            &msg,
        )?;
        let validators = self.validators();
        self.send(net, self.broadcast_targets(&validators));
        info!(view, proposal_id = %qc.short_id(), logid = %logid, "proposal broadcast");

        if validators.is_member(&self.address) {
            let own = SignInfo::sign_vote(&self.keypair, &qc.proposal_id);
            if let Err(err) = self.accept_vote(&qc, own) {
                warn!(%err, "leader vote rejected");
            }
        }
        Ok(qc)
    }

    fn broadcast_targets(&self, validators: &ValidatorSet) -> Vec<String> {
        match self.config.broadcast_policy {
            BroadcastPolicy::Full => validators.peer_addrs_except(&self.address),
            BroadcastPolicy::Core => self.config.core_peers.clone(),
        }
    }

    pub fn handle_received_new_view(&self, msg: ChainedBftPhaseMessage) -> Result<(), SmrError> {
        let sender = msg.verify()?.address.clone();
        let view = msg.view_number;
        let voted_view = self.voted_view();
        if view < voted_view {
            return Err(SmrError::StaleView { view, voted_view });
        }
        let validators = self.validators_for_view(view);
        if !validators.is_member(&sender) {
            return Err(SmrError::NotValidator(sender));
        }
        if let Some(justify) = &msg.justify_qc {
            self.adopt_justify(justify);
        }

        match self.new_view_msgs.add(msg, self.quorum(&validators)) {
            NewViewOutcome::QuorumReached(msgs) => {
                let mut highest = self.generate_qc();
                for justify in msgs.iter().filter_map(|m| m.justify_qc.as_ref()) {
                    if justify.view_number > highest.view_number && self.is_quorum_cert_validate(justify) {
                        highest = justify.without_payload();
                    }
                }
                info!(view, justify_view = highest.view_number, "new view quorum reached");
                self.view_justify.insert(view, highest);
                self.view_justify.retain(|v, _| *v >= view);
                self.new_view_msgs.prune_below(view);
            }
            NewViewOutcome::Buffered { count } => debug!(view, count, sender = %sender, "new view buffered"),
            NewViewOutcome::Duplicate => debug!(view, sender = %sender, "duplicate new view"),
            NewViewOutcome::AlreadyReached => trace!(view, sender = %sender, "late new view"),
        }
        Ok(())
    }

    /// Moves the pipeline forward to a validated QC newer than `generate_qc`
    /// that certifies the local proposal or a descendant of `generate_qc`.
    fn adopt_justify(&self, justify: &QuorumCert) {
        let (generate_qc, proposal_id) = {
            let state = self.state.lock();
            (state.generate_qc.clone(), state.proposal_qc.proposal_id.clone())
        };
        if justify.view_number <= generate_qc.view_number {
            return;
        }
        if !self.is_quorum_cert_validate(justify) {
            debug!(view = justify.view_number, "piggybacked qc not validated");
            return;
        }
        if justify.proposal_id != proposal_id && !self.extends(justify, &generate_qc) {
            debug!(
                view = justify.view_number,
                proposal_id = %justify.short_id(),
                generate = %generate_qc.short_id(),
                "piggybacked qc is off the local branch"
            );
            return;
        }
        if self.shift_pipeline(justify.without_payload()) {
            info!(view = justify.view_number, proposal_id = %justify.short_id(), "generate qc fast-forwarded");
        }
    }

    /// Whether `ancestor` certifies a block on the parent chain of the block
    /// certified by `descendant`. Genesis is everyone's ancestor.
    fn extends(&self, descendant: &QuorumCert, ancestor: &QuorumCert) -> bool {
        if ancestor.is_genesis() || descendant.proposal_id == ancestor.proposal_id {
            return true;
        }
        let mut msg = if descendant.proposal_msg.is_empty() {
            match self.bridge.call_proposal_msg_with_proposal_id(&descendant.proposal_id) {
                Ok(msg) => msg,
                Err(err) => {
                    trace!(%err, proposal_id = %descendant.short_id(), "block unavailable");
                    return false;
                }
            }
        } else {
            descendant.proposal_msg.clone()
        };
        // each parent sits at least one view lower
        for _ in 0..descendant.view_number - ancestor.view_number {
            msg = match self.bridge.call_pre_proposal_msg(&msg) {
                Ok(parent) => parent,
                Err(_) => return false,
            };
            match self.bridge.proposal_id_of(&msg) {
                Ok(id) if id == ancestor.proposal_id => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        false
    }

    /// Forgets proposals and vote entries for views at or below `view`.
    fn prune_settled(&self, view: i64) {
        self.local_proposals.retain(|_, qc| qc.view_number > view);
        self.qc_votes.prune_through(view);
    }

    pub fn handle_received_proposal(
        &self,
        msg: ChainedBftPhaseMessage,
        logid: &str,
    ) -> Result<(), SmrError> {
        let proposer = msg.verify()?.address.clone();
        let mut proposal_qc = msg.proposal_qc.clone().ok_or(SmrError::MissingProposal)?;
        let view = proposal_qc.view_number;
        let voted_view = self.voted_view();
        if view <= voted_view {
            return Err(SmrError::AlreadyVoted { view, voted_view });
        }
        if proposal_qc.proposal_msg.is_empty() {
            proposal_qc.proposal_msg = self
                .bridge
                .call_proposal_msg_with_proposal_id(&proposal_qc.proposal_id)?;
        }

        let (mut justify, is_first) = self.call_pre_qc_with_status(&proposal_qc)?;
        if justify.is_none() && !is_first {
            justify = msg.justify_qc.clone();
        }
        match &justify {
            Some(justify) if !self.is_quorum_cert_validate(justify) => {
                return Err(SmrError::JustifySignNotEnough(proposal_qc.short_id()));
            }
            None if !is_first => return Err(SmrError::MissingJustify(proposal_qc.short_id())),
            _ => {}
        }

        let ancestry = self.ancestry(&proposal_qc, justify.as_ref());
        let locked_qc = self.state.lock().locked_qc.clone();
        safe_proposal(&proposal_qc, justify.as_ref(), &locked_qc, &ancestry)?;

        if !self.bridge.call_verify_qc(&proposal_qc)? {
            return Err(SmrError::ProposalRefused(proposal_qc.short_id()));
        }

        {
            let mut state = self.state.lock();
            if view <= state.voted_view {
                return Err(SmrError::AlreadyVoted {
                    view,
                    voted_view: state.voted_view,
                });
            }
            state.voted_view = view;
        }
        self.vote_proposal(&proposal_qc.proposal_id, &proposer, logid)?;
        self.update_pipeline(proposal_qc, justify)
    }

    /// Ids the proposal is known to extend. Gaps are tolerated.
    fn ancestry(&self, proposal_qc: &QuorumCert, justify: Option<&QuorumCert>) -> Vec<ProposalId> {
        let mut ids = Vec::new();
        if let Some(justify) = justify {
            ids.push(justify.proposal_id.clone());
            match self.bridge.call_pre_qc(justify) {
                Ok(Some(pre)) => ids.push(pre.proposal_id),
                Ok(None) => {}
                Err(err) => trace!(%err, "no pre-justify"),
            }
        }
        let ancestors = [
            self.bridge.call_pre_proposal_msg(&proposal_qc.proposal_msg),
            self.bridge.call_pre_pre_proposal_msg(&proposal_qc.proposal_msg),
        ];
        for ancestor in ancestors {
            match ancestor.and_then(|msg| self.bridge.proposal_id_of(&msg)) {
                Ok(id) if !ids.contains(&id) => ids.push(id),
                Ok(_) => {}
                Err(err) => trace!(%err, "ancestor unavailable"),
            }
        }
        ids
    }

    fn vote_proposal(&self, proposal_id: &[u8], proposer: &str, logid: &str) -> Result<(), SmrError> {
        let validators = self.validators();
        let peer = validators
            .peer_addr(proposer)
            .ok_or_else(|| SmrError::NotValidator(proposer.to_string()))?
            .to_string();
        let vote = ChainedBftVoteMessage::new(&self.keypair, proposal_id.to_vec());
        let net = NetMessage::new(
            &self.config.protocol_version,
            &self.chain_name,
            MessageType::Vote,
            logid.to_string(),
            &vote,
        )?;
        debug!(proposal_id = %hex::encode(proposal_id), proposer, "vote sent");
        self.send(net, vec![peer]);
        Ok(())
    }

    /// Certificate embedded in the proposal certified by `qc`, with its
    /// payload restored. The boolean is true when `qc` has no predecessor.
    fn call_pre_qc_with_status(&self, qc: &QuorumCert) -> Result<(Option<QuorumCert>, bool), SmrError> {
        if qc.is_genesis() || self.bridge.is_first_proposal(qc) {
            return Ok((None, true));
        }
        let Some(mut pre) = self.bridge.call_pre_qc(qc)? else {
            return Ok((None, false));
        };
        if pre.proposal_msg.is_empty() && !pre.is_genesis() {
            pre.proposal_msg = self.bridge.call_proposal_msg_with_proposal_id(&pre.proposal_id)?;
        }
        Ok((Some(pre), false))
    }

    fn update_pipeline(&self, proposal_qc: QuorumCert, justify: Option<QuorumCert>) -> Result<(), SmrError> {
        let Some(justify) = justify else {
            self.update_qc_status(proposal_qc, None, None);
            return Ok(());
        };
        if justify.proposal_id == self.state.lock().generate_qc.proposal_id {
            self.update_qc_status(proposal_qc, None, None);
            return Ok(());
        }
        let (pre_justify, _) = self.call_pre_qc_with_status(&justify)?;
        self.update_qc_status(proposal_qc, Some(justify), pre_justify);
        Ok(())
    }

    fn update_qc_status(
        &self,
        proposal_qc: QuorumCert,
        generate_qc: Option<QuorumCert>,
        locked_qc: Option<QuorumCert>,
    ) {
        let mut state = self.state.lock();
        let mut displaced = None;
        if let Some(generate_qc) = generate_qc {
            if generate_qc.view_number > state.generate_qc.view_number {
                if let Some(locked_qc) = locked_qc {
                    if locked_qc.view_number > state.locked_qc.view_number {
                        displaced = Some(std::mem::replace(
                            &mut state.locked_qc,
                            with_phase(locked_qc, Phase::Commit),
                        ));
                    }
                }
                state.voted_view = state.voted_view.max(generate_qc.view_number);
                state.generate_qc = with_phase(generate_qc, Phase::PreCommit);
            }
        }
        if proposal_qc.view_number > state.proposal_qc.view_number {
            state.proposal_qc = proposal_qc;
        }
        debug!(
            proposal = state.proposal_qc.view_number,
            generate = state.generate_qc.view_number,
            locked = state.locked_qc.view_number,
            "qc status updated"
        );
        self.commit_displaced(&mut state, displaced);
        let settled = state.generate_qc.view_number;
        drop(state);
        self.prune_settled(settled);
    }

    /// `locked <- generate <- certified`. Returns false when `certified` is
    /// not newer than the current generate QC.
    fn shift_pipeline(&self, certified: QuorumCert) -> bool {
        let mut state = self.state.lock();
        if certified.view_number <= state.generate_qc.view_number {
            return false;
        }
        let old_generate = std::mem::replace(
            &mut state.generate_qc,
            with_phase(certified, Phase::PreCommit),
        );
        let displaced = std::mem::replace(&mut state.locked_qc, with_phase(old_generate, Phase::Commit));
        if state.proposal_qc.view_number < state.generate_qc.view_number {
            state.proposal_qc = state.generate_qc.clone();
        }
        state.voted_view = state.voted_view.max(state.generate_qc.view_number);
        self.commit_displaced(&mut state, Some(displaced));
        let settled = state.generate_qc.view_number;
        drop(state);
        self.prune_settled(settled);
        true
    }

    /// Commits the QC pushed out of `locked_qc`, but only when
    /// `generate_qc -> locked_qc -> displaced` is one unbroken branch.
    fn commit_displaced(&self, state: &mut QcState, displaced: Option<QuorumCert>) {
        let Some(qc) = displaced else {
            return;
        };
        if qc.is_genesis() || qc.view_number <= state.committed_view {
            return;
        }
        if !self.extends(&state.generate_qc, &state.locked_qc) || !self.extends(&state.locked_qc, &qc) {
            warn!(
                view = qc.view_number,
                proposal_id = %qc.short_id(),
                locked = %state.locked_qc.short_id(),
                generate = %state.generate_qc.short_id(),
                "displaced qc is not extended by the lock, not committing"
            );
            return;
        }
        state.committed_view = qc.view_number;
        info!(view = qc.view_number, proposal_id = %qc.short_id(), "proposal committed");
        let _ = self.commits.send(CommittedProposal {
            proposal_id: qc.proposal_id,
            view_number: qc.view_number,
        });
    }

    pub fn handle_received_vote(&self, vote: ChainedBftVoteMessage) -> Result<(), SmrError> {
        let proposal = self
            .local_proposals
            .get(&vote.proposal_id)
            .map(|qc| qc.value().clone())
            .ok_or_else(|| SmrError::UnknownProposal(hex::encode(&vote.proposal_id)))?;
        self.accept_vote(&proposal, vote.signature)
    }

    fn accept_vote(&self, proposal: &QuorumCert, sign: SignInfo) -> Result<(), SmrError> {
        let voter = sign.address.clone();
        if proposal.view_number <= self.state.lock().generate_qc.view_number {
            trace!(voter = %voter, view = proposal.view_number, "vote for a settled view");
            return Ok(());
        }
        let outcome = self.qc_votes.add_vote(&proposal.proposal_id, proposal.view_number, sign, || {
            let validators = self.validators();
            let quorum = self.quorum(&validators);
            (validators, quorum)
        })?;
        match outcome {
            VoteOutcome::Accepted { count } => {
                debug!(proposal_id = %proposal.short_id(), voter = %voter, count, "vote accepted")
            }
            VoteOutcome::Duplicate => debug!(voter = %voter, "duplicate vote"),
            VoteOutcome::AlreadyFinalized => trace!(voter = %voter, "vote after quorum"),
            VoteOutcome::QuorumReached(sign_infos) => {
                let mut qc = proposal.clone();
                qc.sign_infos = sign_infos;
                self.finalize_qc(qc);
            }
        }
        Ok(())
    }

    fn finalize_qc(&self, qc: QuorumCert) {
        self.local_proposals.remove(&qc.proposal_id);
        self.qc_votes.remove(&qc.proposal_id);
        let (view, id) = (qc.view_number, qc.short_id());
        if self.shift_pipeline(qc) {
            info!(view, proposal_id = %id, "quorum cert generated");
        } else {
            debug!(view, proposal_id = %id, "quorum cert is older than generate qc");
        }
    }

    /// Forward the pipeline after the ledger confirmed the proposal
    /// certified by `generate_qc`.
    pub fn update_smr_state(&self, generate_qc: &QuorumCert) {
        let (generate, proposal_qc) = {
            let state = self.state.lock();
            (state.generate_qc.clone(), state.proposal_qc.clone())
        };
        if generate_qc.view_number != generate.view_number + 1 {
            return;
        }
        let proposal_qc = if proposal_qc.view_number == generate_qc.view_number + 1 {
            proposal_qc
        } else {
            generate_qc.clone()
        };
        self.update_qc_status(proposal_qc, Some(generate_qc.clone()), Some(generate));
    }

    /// Asks peers for their generate QC and adopts the highest validated one.
    pub async fn request_qc_high(
        &self,
        min_response_percentage: f32,
    ) -> Result<Option<QuorumCert>, SmrError> {
        let peers = self.validators().peer_addrs_except(&self.address);
        let request = NetMessage::new(
            &self.config.protocol_version,
            &self.chain_name,
            MessageType::QcSyncRequest,
            new_logid(),
            &(),
        )?;
        let responses = self
            .transport
            .send_message_with_response(request, &peers, min_response_percentage)
            .await?;

        let mut best: Option<QuorumCert> = None;
        for response in responses {
            if response.message_type() != MessageType::QcSyncResponse {
                continue;
            }
            let qc: QuorumCert = match response.decode() {
                Ok(qc) => qc,
                Err(err) => {
                    debug!(%err, "undecodable qc sync response");
                    continue;
                }
            };
            let newer = best.as_ref().map_or(true, |b| qc.view_number > b.view_number);
            if newer && self.is_quorum_cert_validate(&qc) {
                best = Some(qc);
            }
        }
        if let Some(qc) = &best {
            self.adopt_justify(qc);
        }
        Ok(best)
    }

    pub fn handle_received_msg(&self, inbound: Inbound) -> Result<(), SmrError> {
        let Inbound { msg, respond_to } = inbound;
        if !msg.verify_checksum() {
            warn!(logid = %msg.header.logid, "message checksum mismatch");
            return Err(CodecError::ChecksumMismatch.into());
        }
        if msg.header.chain_name != self.chain_name {
            debug!(chain = %msg.header.chain_name, "message for another chain");
            return Ok(());
        }
        let logid = msg.header.logid.clone();
        trace!(logid = %logid, message_type = ?msg.message_type(), "message received");

        match msg.message_type() {
            MessageType::NewView => self.handle_received_new_view(msg.decode()?),
            MessageType::NewProposal => self.handle_received_proposal(msg.decode()?, &logid),
            MessageType::Vote => self.handle_received_vote(msg.decode()?),
            MessageType::QcSyncRequest => {
                let Some(respond_to) = respond_to else {
                    return Ok(());
                };
                let response = NetMessage::new(
                    &self.config.protocol_version,
                    &self.chain_name,
                    MessageType::QcSyncResponse,
                    logid,
                    &self.generate_qc(),
                )?;
                let _ = respond_to.send(response);
                Ok(())
            }
            MessageType::QcSyncResponse => Ok(()),
        }
    }

    /// Dispatch loop. Handlers run on a bounded pool; when the pool is full
    /// the loop stops reading and the inbound queue fills up.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Inbound>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_handlers.max(1)));
        let mut handlers = JoinSet::new();
        info!(chain = %self.chain_name, "chained-bft smr started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(err) = joined {
                        warn!(%err, "message handler panicked");
                    }
                }
                next = inbound.recv() => {
                    let Some(next) = next else { break };
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => break,
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let smr = Arc::clone(&self);
                    handlers.spawn(async move {
                        let _permit = permit;
                        let logid = next.msg.header.logid.clone();
                        if let Err(err) = smr.handle_received_msg(next) {
                            log_handler_error(&err, &logid);
                        }
                    });
                }
            }
        }

        while let Some(joined) = handlers.join_next().await {
            if let Err(err) = joined {
                warn!(%err, "message handler panicked");
            }
        }
        info!(chain = %self.chain_name, "quit chained-bft smr");
    }

    fn send(&self, msg: NetMessage, peers: Vec<String>) {
        if peers.is_empty() {
            trace!(logid = %msg.header.logid, "no peers to send to");
            return;
        }
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(err) = transport.send_message(msg, &peers).await {
                warn!(%err, "send message failed");
            }
        });
    }
}

fn log_handler_error(err: &SmrError, logid: &str) {
    match err {
        SmrError::StaleView { .. }
        | SmrError::AlreadyVoted { .. }
        | SmrError::UnknownProposal(_)
        | SmrError::ProposalRefused(_) => debug!(logid, %err, "message dropped"),
        _ => warn!(logid, %err, "message handling failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{LocalCluster, LocalNode};
    use crate::common::crypto::Keypair;
    use crate::common::error::QcError;
    use crate::consensus::bridge::{LedgerBridge, RoundRobinSchedule};
    use crate::consensus::pacemaker::PaceMaker;
    use crate::consensus::store::{Block, MemoryLedger};
    use crate::consensus::validators::CandidateInfo;
    use crate::network::MemoryNetwork;

    fn keys(n: usize) -> Vec<Keypair> {
        (0..n).map(|i| Keypair::from_seed(&[i as u8 + 1; 32])).collect()
    }

    fn certified(keys: &[Keypair], id: &[u8], view: i64) -> QuorumCert {
        let mut qc = QuorumCert::new(id.to_vec(), Vec::new(), view, Phase::PreCommit);
        for key in keys {
            qc.add_signature(SignInfo::sign_vote(key, id)).unwrap();
        }
        qc
    }

    /// Builds a child of genesis proposed by `proposer` and gossips it.
    fn propose_block(cluster: &LocalCluster, view: i64, proposer: &LocalNode) -> Block {
        let block = Block::new(Block::genesis().id, view, proposer.address.clone(), view, None, b"txs".to_vec());
        for node in &cluster.nodes {
            node.ledger.append(block.clone()).unwrap();
        }
        block
    }

    /// Appends a child of `parent` at `view` to every ledger.
    fn append_child(cluster: &LocalCluster, parent: &Block, view: i64) -> Block {
        let block = Block::new(parent.id.clone(), parent.height + 1, "miner", view, None, Vec::new());
        for node in &cluster.nodes {
            node.ledger.append(block.clone()).unwrap();
        }
        block
    }

    fn handover(keys: &[Keypair], signer: usize, qc: QuorumCert) -> ChainedBftPhaseMessage {
        ChainedBftPhaseMessage::new(Phase::NewView, qc.view_number + 1)
            .with_justify(qc)
            .sign(&keys[signer])
            .unwrap()
    }

    async fn next_of(rx: &mut mpsc::Receiver<Inbound>, kind: MessageType) -> Inbound {
        loop {
            let inbound = rx.recv().await.unwrap();
            if inbound.msg.message_type() == kind {
                return inbound;
            }
        }
    }

    fn standalone(validators: ValidatorSet, init: InitQcs) -> Result<Smr, SmrError> {
        let ledger = Arc::new(MemoryLedger::new(Block::genesis()));
        let schedule = Arc::new(RoundRobinSchedule::new(validators.clone()));
        let bridge = Arc::new(LedgerBridge::new(ledger, schedule, 1));
        Smr::new(
            SmrConfig::default(),
            "xuper",
            Keypair::from_seed(&[1u8; 32]),
            validators,
            bridge,
            Arc::new(MemoryNetwork::default()),
            init,
        )
    }

    #[test]
    fn test_construction_requires_consistent_state() {
        let key = Keypair::from_seed(&[1u8; 32]);
        let validators = ValidatorSet::new(vec![CandidateInfo::new(key.address(), "/memory/a")]);

        assert!(matches!(
            standalone(ValidatorSet::default(), InitQcs::genesis()),
            Err(SmrError::InvalidInitialState(_))
        ));

        let mut init = InitQcs::genesis();
        init.locked_qc = QuorumCert::new(b"b3".to_vec(), Vec::new(), 3, Phase::Commit);
        assert!(matches!(
            standalone(validators.clone(), init),
            Err(SmrError::InvalidInitialState(_))
        ));

        let smr = standalone(validators, InitQcs::genesis()).unwrap();
        assert_eq!(smr.voted_view(), 0);
    }

    #[test]
    fn test_init_from_ledger_walks_three_blocks() {
        let ledger = MemoryLedger::new(Block::genesis());
        let mut parent = Block::genesis();
        let mut justifies = Vec::new();
        for height in 1..=4 {
            let justify = QuorumCert::new(parent.id.clone(), Vec::new(), height - 1, Phase::Prepare);
            let block = Block::new(parent.id.clone(), height, "miner", height, Some(justify.clone()), Vec::new());
            ledger.append(block.clone()).unwrap();
            justifies.push(justify);
            parent = block;
        }

        let init = InitQcs::from_ledger(&ledger).unwrap();
        assert_eq!(init.proposal_qc.view_number, 3);
        assert_eq!(init.generate_qc.view_number, 2);
        assert_eq!(init.locked_qc.view_number, 1);
        assert_eq!(init.locked_qc.proposal_id, justifies[1].proposal_id);

        let fresh = InitQcs::from_ledger(&MemoryLedger::new(Block::genesis())).unwrap();
        assert!(fresh.proposal_qc.is_genesis() && fresh.locked_qc.is_genesis());
    }

    #[tokio::test]
    async fn test_stale_new_view_leaves_state_unchanged() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let node = &cluster.nodes[0];
        node.smr.process_proposal(5, b"b5".to_vec(), Vec::new()).unwrap();
        let before = node.smr.qc_status();

        let result = node.smr.process_new_view(3, &cluster.nodes[1].address, "");
        assert!(matches!(result, Err(SmrError::StaleView { view: 3, voted_view: 5 })));
        assert_eq!(node.smr.qc_status(), before);

        // entering the current view is allowed
        assert!(node.smr.process_new_view(5, &cluster.nodes[1].address, "").is_ok());
    }

    #[tokio::test]
    async fn test_voted_view_never_decreases_on_new_view() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let node = &cluster.nodes[0];
        let leader = cluster.nodes[1].address.clone();
        node.smr.process_proposal(4, b"b4".to_vec(), Vec::new()).unwrap();

        let mut last = node.smr.voted_view();
        for view in [2, 9, 4, 6, 11, 1] {
            let _ = node.smr.process_new_view(view, &leader, "");
            let voted = node.smr.voted_view();
            assert!(voted >= last);
            last = voted;
        }
    }

    #[tokio::test]
    async fn test_replica_votes_once_per_view() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let leader = cluster.leader_of(1).unwrap();
        let replica = cluster.nodes.iter().find(|n| n.address != leader.address).unwrap();
        let mut leader_rx = leader.take_inbound().unwrap();
        let mut replica_rx = replica.take_inbound().unwrap();

        let block = propose_block(&cluster, 1, leader);
        leader.smr.process_proposal(1, block.id.clone(), block.encode().unwrap()).unwrap();

        let proposal = next_of(&mut replica_rx, MessageType::NewProposal).await;
        let phase_msg: ChainedBftPhaseMessage = proposal.msg.decode().unwrap();
        replica.smr.handle_received_msg(proposal).unwrap();
        assert_eq!(replica.smr.voted_view(), 1);
        assert_eq!(replica.smr.qc_status().proposal_qc.proposal_id, block.id);

        let vote = next_of(&mut leader_rx, MessageType::Vote).await;
        let decoded: ChainedBftVoteMessage = vote.msg.decode().unwrap();
        assert_eq!(decoded.proposal_id, block.id);
        assert_eq!(decoded.signature.address, replica.address);
        leader.smr.handle_received_msg(vote).unwrap();

        assert!(matches!(
            replica.smr.handle_received_proposal(phase_msg, "replay"),
            Err(SmrError::AlreadyVoted { view: 1, voted_view: 1 })
        ));
    }

    #[tokio::test]
    async fn test_wrong_proposer_gets_no_vote() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let leader = cluster.leader_of(1).unwrap();
        let impostor = cluster.nodes.iter().find(|n| n.address != leader.address).unwrap();
        let replica = cluster
            .nodes
            .iter()
            .find(|n| n.address != leader.address && n.address != impostor.address)
            .unwrap();
        let mut replica_rx = replica.take_inbound().unwrap();

        let block = propose_block(&cluster, 1, impostor);
        impostor.smr.process_proposal(1, block.id.clone(), block.encode().unwrap()).unwrap();

        let proposal = next_of(&mut replica_rx, MessageType::NewProposal).await;
        assert!(matches!(
            replica.smr.handle_received_msg(proposal),
            Err(SmrError::ProposalRefused(_))
        ));
        assert_eq!(replica.smr.voted_view(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_votes_finalize_once() {
        let cluster = LocalCluster::new(7, SmrConfig::default()).unwrap();
        let keys = Arc::new(keys(7));
        let leader = cluster.leader_of(1).unwrap();
        let smr = leader.smr.clone();
        let block = propose_block(&cluster, 1, leader);
        smr.process_proposal(1, block.id.clone(), block.encode().unwrap()).unwrap();

        let mut tasks = JoinSet::new();
        for i in 0..keys.len() {
            let (smr, keys, id) = (smr.clone(), keys.clone(), block.id.clone());
            tasks.spawn(async move {
                let vote = ChainedBftVoteMessage::new(&keys[i], id);
                let _ = smr.handle_received_vote(vote);
            });
        }
        while tasks.join_next().await.is_some() {}

        let status = smr.qc_status();
        assert_eq!(status.generate_qc.proposal_id, block.id);
        assert_eq!(status.generate_qc.sign_infos.len(), 5);
        assert!(status.locked_qc.is_genesis());
    }

    #[tokio::test]
    async fn test_in_flight_votes_keep_captured_set() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let keys = keys(4);
        let leader = cluster.leader_of(1).unwrap();
        let leader_idx = cluster.nodes.iter().position(|n| n.address == leader.address).unwrap();
        let others: Vec<usize> = (0..4).filter(|i| *i != leader_idx).collect();
        let block = propose_block(&cluster, 1, leader);
        leader.smr.process_proposal(1, block.id.clone(), block.encode().unwrap()).unwrap();

        // drop others[1] from the set while its vote is still in flight
        let reduced: Vec<CandidateInfo> = leader
            .smr
            .validators()
            .members
            .iter()
            .filter(|m| m.address != cluster.nodes[others[1]].address)
            .cloned()
            .collect();
        leader.smr.update_validator_set(ValidatorSet::new(reduced)).unwrap();

        for i in [others[0], others[1]] {
            leader
                .smr
                .handle_received_vote(ChainedBftVoteMessage::new(&keys[i], block.id.clone()))
                .unwrap();
        }
        assert_eq!(leader.smr.generate_qc().proposal_id, block.id);

        // a fresh proposal is judged against the new set
        leader.smr.process_proposal(2, b"b2".to_vec(), Vec::new()).unwrap();
        let removed = ChainedBftVoteMessage::new(&keys[others[1]], b"b2".to_vec());
        assert!(matches!(
            leader.smr.handle_received_vote(removed),
            Err(SmrError::Qc(QcError::UnknownSigner(_)))
        ));
        assert!(matches!(
            leader.smr.update_validator_set(ValidatorSet::default()),
            Err(SmrError::EmptyValidatorSet)
        ));
    }

    #[tokio::test]
    async fn test_new_view_quorum_and_fast_forward() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let keys = keys(4);
        let leader = &cluster.nodes[3];
        let qc = certified(&keys[..3], b"b2", 2);

        let handover = ChainedBftPhaseMessage::new(Phase::NewView, 3)
            .with_justify(qc.clone())
            .sign(&keys[0])
            .unwrap();
        leader.smr.handle_received_new_view(handover).unwrap();
        assert_eq!(leader.smr.generate_qc().proposal_id, b"b2".to_vec());
        assert!(leader.smr.new_view_justify(3).is_none());

        let weak = certified(&keys[..2], b"b9", 9);
        let replica = ChainedBftPhaseMessage::new(Phase::NewView, 3)
            .with_justify(weak)
            .sign(&keys[1])
            .unwrap();
        leader.smr.handle_received_new_view(replica).unwrap();
        assert_eq!(leader.smr.generate_qc().view_number, 2);

        let outsider = Keypair::from_seed(&[42u8; 32]);
        let foreign = ChainedBftPhaseMessage::new(Phase::NewView, 3).sign(&outsider).unwrap();
        assert!(matches!(
            leader.smr.handle_received_new_view(foreign),
            Err(SmrError::NotValidator(_))
        ));

        leader.smr.process_new_view(3, &leader.address, &cluster.nodes[2].address).unwrap();
        let justify = leader.smr.new_view_justify(3).unwrap();
        assert_eq!(justify.proposal_id, qc.proposal_id);
    }

    #[tokio::test]
    async fn test_previous_set_counts_within_effective_delay() {
        let config = SmrConfig {
            effective_delay: 1,
            ..SmrConfig::default()
        };
        let cluster = LocalCluster::new(4, config).unwrap();
        let keys = keys(4);
        let leader = &cluster.nodes[0];
        let reduced = ValidatorSet::new(leader.smr.validators().members[..3].to_vec());
        leader.smr.update_validator_set(reduced).unwrap();

        // view 1 still uses the previous set, view 2 does not
        let late = ChainedBftPhaseMessage::new(Phase::NewView, 1).sign(&keys[3]).unwrap();
        assert!(leader.smr.handle_received_new_view(late).is_ok());
        let after = ChainedBftPhaseMessage::new(Phase::NewView, 2).sign(&keys[3]).unwrap();
        assert!(matches!(
            leader.smr.handle_received_new_view(after),
            Err(SmrError::NotValidator(_))
        ));
    }

    #[tokio::test]
    async fn test_header_checks() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let node = &cluster.nodes[0];
        let keys = keys(4);
        let new_view = ChainedBftPhaseMessage::new(Phase::NewView, 1).sign(&keys[1]).unwrap();

        let mut corrupted =
            NetMessage::new("1.0.0", "xuper", MessageType::NewView, new_logid(), &new_view).unwrap();
        corrupted.data.push(0);
        assert!(matches!(
            node.smr.handle_received_msg(Inbound::new(corrupted)),
            Err(SmrError::Codec(CodecError::ChecksumMismatch))
        ));

        let other_chain =
            NetMessage::new("1.0.0", "other", MessageType::NewView, new_logid(), &new_view).unwrap();
        node.smr.handle_received_msg(Inbound::new(other_chain)).unwrap();
        assert!(node.smr.new_view_justify(1).is_none());
    }

    #[tokio::test]
    async fn test_update_smr_state_moves_one_view() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let keys = keys(4);
        let node = &cluster.nodes[0];
        let handover = ChainedBftPhaseMessage::new(Phase::NewView, 3)
            .with_justify(certified(&keys[..3], b"b2", 2))
            .sign(&keys[1])
            .unwrap();
        node.smr.handle_received_new_view(handover).unwrap();

        node.smr.update_smr_state(&certified(&keys[..3], b"b5", 5));
        assert_eq!(node.smr.generate_qc().view_number, 2);

        node.smr.update_smr_state(&certified(&keys[..3], b"b3", 3));
        let status = node.smr.qc_status();
        assert_eq!(status.generate_qc.proposal_id, b"b3".to_vec());
        assert_eq!(status.locked_qc.proposal_id, b"b2".to_vec());
        assert!(status.proposal_qc.view_number >= 3);
    }

    #[tokio::test]
    async fn test_request_qc_high() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let keys = keys(4);
        let qc = certified(&keys[..3], b"b4", 4);
        let handover = ChainedBftPhaseMessage::new(Phase::NewView, 5)
            .with_justify(qc.clone())
            .sign(&keys[0])
            .unwrap();
        cluster.nodes[2].smr.handle_received_new_view(handover).unwrap();
        cluster.start();

        let best = cluster.nodes[0].smr.request_qc_high(1.0).await.unwrap().unwrap();
        assert_eq!(best.proposal_id, qc.proposal_id);
        assert_eq!(cluster.nodes[0].smr.generate_qc().view_number, 4);

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_fork_is_never_committed() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let keys = keys(4);
        let node = &cluster.nodes[3];
        let mut commits = node.smr.subscribe_commits();

        let b1 = append_child(&cluster, &Block::genesis(), 1);
        let b2 = append_child(&cluster, &b1, 2);
        let b3 = append_child(&cluster, &b2, 3);
        // c4 forks off b2 as a sibling of b3
        let c4 = append_child(&cluster, &b2, 4);
        let c5 = append_child(&cluster, &c4, 5);
        let c6 = append_child(&cluster, &c5, 6);

        for (block, view) in [(&b1, 1), (&b2, 2), (&b3, 3), (&c4, 4), (&c5, 5), (&c6, 6)] {
            let msg = handover(&keys, 0, certified(&keys[..3], &block.id, view));
            node.smr.handle_received_new_view(msg).unwrap();
        }

        let status = node.smr.qc_status();
        assert_eq!(status.generate_qc.proposal_id, b3.id);
        assert_eq!(status.locked_qc.proposal_id, b2.id);
        let committed = commits.try_recv().unwrap();
        assert_eq!((committed.proposal_id, committed.view_number), (b1.id.clone(), 1));
        assert!(commits.try_recv().is_err());

        // a certified sibling pushed in directly moves the lock but commits nothing
        node.smr.update_smr_state(&certified(&keys[..3], &c4.id, 4));
        let status = node.smr.qc_status();
        assert_eq!(status.generate_qc.proposal_id, c4.id);
        assert_eq!(status.locked_qc.proposal_id, b3.id);
        assert!(commits.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsigned_qc_is_not_adopted() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let keys = keys(4);
        let node = &cluster.nodes[2];

        // view 1 is the first proposal, it still needs its own quorum
        let unsigned = QuorumCert::new(b"never-voted".to_vec(), Vec::new(), 1, Phase::PreCommit);
        assert!(!node.smr.is_quorum_cert_validate(&unsigned));
        assert!(node.smr.is_quorum_cert_validate(&QuorumCert::genesis()));

        node.smr.handle_received_new_view(handover(&keys, 0, unsigned)).unwrap();
        assert!(node.smr.generate_qc().is_genesis());
        assert!(node.pacemaker.current_qc_high().is_genesis());
    }

    #[tokio::test]
    async fn test_request_qc_high_skips_weak_answers() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let keys = keys(4);
        // a peer holding a certificate signed by too few validators
        let weak = certified(&keys[..2], b"b1", 1);
        cluster.nodes[2].smr.update_smr_state(&weak);
        assert_eq!(cluster.nodes[2].smr.generate_qc().proposal_id, weak.proposal_id);
        cluster.start();

        let best = cluster.nodes[0].smr.request_qc_high(1.0).await.unwrap();
        assert!(best.map_or(true, |qc| qc.is_genesis()));
        assert!(cluster.nodes[0].smr.generate_qc().is_genesis());

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_unanswered_proposals_are_pruned() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let node = &cluster.nodes[0];

        for view in 1..=200 {
            node.smr
                .process_proposal(view, format!("b{view}").into_bytes(), Vec::new())
                .unwrap();
        }
        assert_eq!(node.smr.pending_proposals(), 1);
        assert_eq!(node.smr.pending_votes(), 1);
    }

    #[tokio::test]
    async fn test_shift_prunes_settled_votes() {
        let cluster = LocalCluster::new(4, SmrConfig::default()).unwrap();
        let keys = keys(4);
        let node = &cluster.nodes[0];
        node.smr.process_proposal(2, b"b2".to_vec(), Vec::new()).unwrap();
        assert_eq!(node.smr.pending_votes(), 1);

        // a QC for view 3 from elsewhere settles view 2
        let msg = handover(&keys, 1, certified(&keys[..3], b"b3", 3));
        node.smr.handle_received_new_view(msg).unwrap();
        assert_eq!(node.smr.generate_qc().view_number, 3);
        assert_eq!(node.smr.pending_proposals(), 0);
        assert_eq!(node.smr.pending_votes(), 0);

        // a late vote for the settled proposal leaves nothing behind
        let late = ChainedBftVoteMessage::new(&keys[1], b"b2".to_vec());
        assert!(node.smr.handle_received_vote(late).is_err());
        assert_eq!(node.smr.pending_votes(), 0);
    }
}
