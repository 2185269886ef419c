//! Error types for the chained-bft core.
//!
//! Handler-level errors are logged where they occur and never cross the
//! dispatch loop. Only `SmrError::InvalidInitialState` is meant to abort a
//! chain start.

use crate::consensus::safety::SafetyViolation;

/// Key, address and signature failures.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("address {0} does not match public key")]
    AddressMismatch(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature verification failed")]
    BadSignature,
}

/// Errors raised while adding evidence to a quorum certificate.
#[derive(Debug, thiserror::Error)]
pub enum QcError {
    #[error("address {0} has already signed")]
    DuplicateSigner(String),

    #[error("address {0} is not a known validator")]
    UnknownSigner(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Wire encoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("data checksum mismatch")]
    ChecksumMismatch,
}

/// Transport failures. Sends are fire-and-forget, so these are only logged.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("inbound queue of peer {0} is closed")]
    PeerClosed(String),

    #[error("only {got} of {want} responses arrived")]
    NotEnoughResponses { got: usize, want: usize },
}

/// Ledger collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("block {0} not found")]
    BlockNotFound(String),

    #[error("parent block {0} not found")]
    MissingParent(String),

    #[error("cannot roll back to {0}: below the last confirmed block")]
    RollbackRejected(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors returned by an external bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid params: {0}")]
    InvalidParams(&'static str),

    #[error("block content is not complete")]
    IncompleteBlock,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors of the state-machine-replication engine.
#[derive(Debug, thiserror::Error)]
pub enum SmrError {
    #[error("view {view} is behind voted view {voted_view}")]
    StaleView { view: i64, voted_view: i64 },

    #[error("already voted at view {voted_view}, proposal is at view {view}")]
    AlreadyVoted { view: i64, voted_view: i64 },

    #[error("check new proposal error: {0}")]
    UnsafeProposal(#[from] SafetyViolation),

    #[error("external consensus refused proposal {0}")]
    ProposalRefused(String),

    #[error("proposal justify sign not enough for {0}")]
    JustifySignNotEnough(String),

    #[error("proposal {0} has no justification")]
    MissingJustify(String),

    #[error("phase message carries no proposal")]
    MissingProposal,

    #[error("message carries no signature")]
    MissingSignature,

    #[error("{0} is not in the validator set")]
    NotValidator(String),

    #[error("no local proposal for {0}")]
    UnknownProposal(String),

    #[error("invalid initial state: {0}")]
    InvalidInitialState(String),

    #[error("validator set is empty")]
    EmptyValidatorSet,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Qc(#[from] QcError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Errors of the pacemaker.
#[derive(Debug, thiserror::Error)]
pub enum PacemakerError {
    #[error("next view {next} cannot be smaller than current view {current}")]
    ViewRegression { next: i64, current: i64 },

    #[error("proposal height {height} is behind current view {current}")]
    ProposalTooOld { height: i64, current: i64 },

    #[error(transparent)]
    Smr(#[from] SmrError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
