pub mod bridge;
pub mod message;
pub mod pacemaker;
pub mod qc;
pub mod safety;
pub mod smr;
pub mod store;
pub mod validators;
pub mod vote_table;

pub use bridge::*;
pub use message::*;
pub use pacemaker::*;
pub use qc::*;
pub use safety::*;
pub use smr::*;
pub use store::*;
pub use validators::*;
