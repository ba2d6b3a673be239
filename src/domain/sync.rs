use crate::domain::Pledge;
use crate::foundation::PledgeHash;
use std::collections::HashSet;

/// The minimal set of mutations reconciling a verification round against
/// the currently open pledges. Kept as a pure computation so observers
/// downstream see only true additions and removals.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub newly_open: Vec<Pledge>,
    pub newly_invalid: Vec<Pledge>,
}

/// `tested` is everything submitted for verification this round, `verified`
/// what passed. When `checking_all` is false only a single new pledge was
/// checked and nothing may be removed.
///
/// In client mode, server-returned pledges the wallet knows were revoked
/// are dropped, as are metadata-scrubbed copies of pledges we originated
/// (matched by `orig_hash` against the hashes of currently open pledges).
pub fn reconcile(
    current_open: &HashSet<Pledge>,
    tested: &HashSet<Pledge>,
    verified: &HashSet<Pledge>,
    checking_all: bool,
    client_mode: bool,
    was_revoked: &dyn Fn(&Pledge) -> bool,
) -> SyncPlan {
    let local_hashes: HashSet<PledgeHash> = if client_mode { current_open.iter().map(Pledge::hash).collect() } else { HashSet::new() };

    let mut plan = SyncPlan::default();
    for pledge in verified {
        if current_open.contains(pledge) {
            continue;
        }
        if client_mode {
            if was_revoked(pledge) {
                continue;
            }
            if pledge.orig_hash().is_some_and(|orig| local_hashes.contains(&orig)) {
                continue;
            }
        }
        plan.newly_open.push(pledge.clone());
    }

    if checking_all {
        for pledge in tested {
            if !verified.contains(pledge) {
                plan.newly_invalid.push(pledge.clone());
            }
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::ProjectId;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

    fn pledge(byte: u8) -> Pledge {
        use bitcoin::hashes::Hash;
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([byte; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(1_000), script_pubkey: ScriptBuf::new() }],
        };
        Pledge::new(ProjectId::new([7; 32]), vec![], tx, Amount::from_sat(1_000))
    }

    fn set(pledges: &[Pledge]) -> HashSet<Pledge> {
        pledges.iter().cloned().collect()
    }

    #[test]
    fn additions_and_removals_are_minimal() {
        let kept = pledge(1);
        let gone = pledge(2);
        let fresh = pledge(3);
        let current = set(&[kept.clone(), gone.clone()]);
        let tested = set(&[kept.clone(), gone.clone(), fresh.clone()]);
        let verified = set(&[kept.clone(), fresh.clone()]);

        let plan = reconcile(&current, &tested, &verified, true, false, &|_| false);
        assert_eq!(plan.newly_open, vec![fresh]);
        assert_eq!(plan.newly_invalid, vec![gone]);
    }

    #[test]
    fn single_pledge_check_never_removes() {
        let current = set(&[pledge(1)]);
        let fresh = pledge(3);
        let tested = set(&[fresh.clone()]);
        let verified = HashSet::new();

        let plan = reconcile(&current, &tested, &verified, false, false, &|_| false);
        assert!(plan.newly_open.is_empty());
        assert!(plan.newly_invalid.is_empty());
    }

    #[test]
    fn client_mode_drops_revoked() {
        let revoked = pledge(4);
        let tested = set(&[revoked.clone()]);
        let verified = set(&[revoked.clone()]);

        let plan = reconcile(&HashSet::new(), &tested, &verified, true, true, &|p| *p == revoked);
        assert!(plan.newly_open.is_empty());
    }

    #[test]
    fn client_mode_drops_scrubbed_copy_of_local_pledge() {
        let local = pledge(5);
        let scrubbed = pledge(6).with_orig_hash(local.hash());
        let current = set(&[local.clone()]);
        let tested = set(&[scrubbed.clone()]);
        let verified = set(&[scrubbed.clone()]);

        let plan = reconcile(&current, &tested, &verified, true, true, &|_| false);
        assert!(plan.newly_open.is_empty());

        // Same copy is a true addition for a server, which keeps no wallet.
        let plan = reconcile(&current, &tested, &verified, true, false, &|_| false);
        assert_eq!(plan.newly_open, vec![scrubbed]);
    }
}
