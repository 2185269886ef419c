//! Voting rule of chained HotStuff.
//!
//! A replica votes for a proposal when its justification is newer than the
//! local lock (liveness) or when the proposal extends the locked block
//! (safety). The proposal must also sit strictly above its justification.

use super::qc::{ProposalId, QuorumCert};

#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum SafetyViolation {
    #[error("proposal view {proposal} does not advance past justify view {justify}")]
    ViewNotAdvancing { proposal: i64, justify: i64 },

    #[error("justify view {justify} is not above locked view {locked} and proposal does not extend the locked block")]
    ConflictsWithLock { justify: i64, locked: i64 },
}

/// `ancestry` lists the ids the proposal is known to extend, nearest first.
pub fn safe_proposal(
    proposal_qc: &QuorumCert,
    justify_qc: Option<&QuorumCert>,
    locked_qc: &QuorumCert,
    ancestry: &[ProposalId],
) -> Result<(), SafetyViolation> {
    let justify_view = justify_qc.map_or(0, |qc| qc.view_number);
    if let Some(justify) = justify_qc {
        if proposal_qc.view_number <= justify.view_number {
            return Err(SafetyViolation::ViewNotAdvancing {
                proposal: proposal_qc.view_number,
                justify: justify.view_number,
            });
        }
    }

    if justify_view > locked_qc.view_number {
        return Ok(());
    }
    if locked_qc.is_genesis() || ancestry.iter().any(|id| *id == locked_qc.proposal_id) {
        return Ok(());
    }
    Err(SafetyViolation::ConflictsWithLock {
        justify: justify_view,
        locked: locked_qc.view_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::qc::Phase;

    fn qc(id: &[u8], view: i64) -> QuorumCert {
        QuorumCert::new(id.to_vec(), Vec::new(), view, Phase::Prepare)
    }

    #[test]
    fn test_newer_justify_passes() {
        let locked = qc(b"b5", 5);
        assert!(safe_proposal(&qc(b"b7", 7), Some(&qc(b"b6", 6)), &locked, &[]).is_ok());
    }

    #[test]
    fn test_conflicting_branch_is_rejected() {
        let locked = qc(b"b5", 5);
        let proposal = qc(b"x6", 6);
        let justify = qc(b"b4", 4);

        assert_eq!(
            safe_proposal(&proposal, Some(&justify), &locked, &[b"b4".to_vec(), b"b3".to_vec()]),
            Err(SafetyViolation::ConflictsWithLock { justify: 4, locked: 5 })
        );
    }

    #[test]
    fn test_extending_locked_block_passes() {
        let locked = qc(b"b5", 5);
        let ancestry = vec![b"b5".to_vec(), b"b4".to_vec()];
        assert!(safe_proposal(&qc(b"b6", 6), Some(&qc(b"b5", 5)), &locked, &ancestry).is_ok());
    }

    #[test]
    fn test_view_must_advance_past_justify() {
        let locked = QuorumCert::genesis();
        assert_eq!(
            safe_proposal(&qc(b"b3", 3), Some(&qc(b"b3", 3)), &locked, &[]),
            Err(SafetyViolation::ViewNotAdvancing { proposal: 3, justify: 3 })
        );
    }

    #[test]
    fn test_genesis_lock_accepts_first_proposal() {
        assert!(safe_proposal(&qc(b"b1", 1), None, &QuorumCert::genesis(), &[]).is_ok());
    }
}
