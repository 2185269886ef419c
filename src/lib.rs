//! Chained-BFT (HotStuff style) consensus core.
//!
//! `consensus` holds the protocol: certificates, the voting rule, the SMR
//! engine and the pacemaker. `network` is the transport seam, `common` the
//! keys, configuration and errors shared by both.

pub mod cluster;
pub mod common;
pub mod consensus;
pub mod network;

pub use common::{config::SmrConfig, error::SmrError};
pub use consensus::{pacemaker::DefaultPaceMaker, smr::Smr};
