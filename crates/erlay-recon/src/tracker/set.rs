use bitcoin::Wtxid;
use erlay_common::ShortIdHasher;
use tracing::debug;

use super::PeerId;
use super::TrackerInner;

impl TrackerInner {
    pub(crate) fn store_txs_to_announce(
        &mut self,
        peer_id: PeerId,
        txs: &[Wtxid],
        hasher: &ShortIdHasher,
        inbounds_nonrcncl_tx_relay: usize,
        outbounds_nonrcncl_tx_relay: usize,
    ) -> Vec<Wtxid> {
        let mut fanout = Vec::new();
        let mut reconcile = Vec::new();

        for &wtxid in txs {
            if self.should_fanout_to(
                &wtxid,
                hasher,
                peer_id,
                inbounds_nonrcncl_tx_relay,
                outbounds_nonrcncl_tx_relay,
            ) {
                fanout.push(wtxid);
            } else {
                reconcile.push(wtxid);
            }
        }

        // For an unregistered peer every transaction took the fanout path
        // above, so there is nothing to park here.
        if let Some(state) = self.states.get_mut(&peer_id) {
            let mut added = 0;
            for wtxid in reconcile {
                if state.wtxids.insert(wtxid) {
                    added += 1;
                }
            }

            debug!(
                "added {added} new transactions to the reconciliation set for peer={peer_id}; \
                 the set now contains {} transactions",
                state.wtxids.len()
            );
        }

        fanout
    }

    pub(crate) fn try_remove_from_set(&mut self, peer_id: PeerId, wtxid: &Wtxid) -> bool {
        let Some(state) = self.states.get_mut(&peer_id) else {
            return false;
        };

        state.wtxids.remove(wtxid)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::Wtxid;
    use erlay_common::ShortIdHasher;

    use crate::tracker::TxReconciliationTracker;

    fn rand_wtxid() -> Wtxid {
        Wtxid::from_byte_array(rand::random())
    }

    fn hasher() -> ShortIdHasher {
        ShortIdHasher::new(0x0706050403020100, 0x0F0E0D0C0B0A0908)
    }

    #[test]
    fn test_store_for_unregistered_peer_floods_everything() {
        let tracker = TxReconciliationTracker::default();
        let txs: Vec<Wtxid> = (0..5).map(|_| rand_wtxid()).collect();

        let flooded = tracker.store_txs_to_announce(0, &txs, &hasher(), 0, 0);
        assert_eq!(flooded, txs);
        assert_eq!(tracker.get_peer_set_size(0), None);
    }

    #[test]
    fn test_store_parks_non_fanout_txs() {
        let tracker = TxReconciliationTracker::default();
        tracker.pre_register_peer(0);
        tracker.register_peer(0, false, 1, 1).unwrap();

        // With the outbound fanout budget spent elsewhere, everything is
        // parked for reconciliation.
        let txs: Vec<Wtxid> = (0..5).map(|_| rand_wtxid()).collect();
        let flooded = tracker.store_txs_to_announce(0, &txs, &hasher(), 0, 1);
        assert!(flooded.is_empty());
        assert_eq!(tracker.get_peer_set_size(0), Some(5));

        // Duplicate insertions are no-ops
        let flooded = tracker.store_txs_to_announce(0, &txs[..2], &hasher(), 0, 1);
        assert!(flooded.is_empty());
        assert_eq!(tracker.get_peer_set_size(0), Some(5));
    }

    #[test]
    fn test_store_splits_between_fanout_and_set() {
        let tracker = TxReconciliationTracker::default();
        for peer in 0..2 {
            tracker.pre_register_peer(peer);
            tracker.register_peer(peer, false, 1, 1).unwrap();
        }

        // Two outbound candidates, one fanout slot: each transaction is
        // flooded to exactly one of them and parked for the other.
        for _ in 0..100 {
            let tx = [rand_wtxid()];
            let flooded: usize = (0..2)
                .map(|peer| tracker.store_txs_to_announce(peer, &tx, &hasher(), 0, 0).len())
                .sum();
            assert_eq!(flooded, 1);
        }

        let parked: usize = (0..2)
            .map(|peer| tracker.get_peer_set_size(peer).unwrap())
            .sum();
        assert_eq!(parked, 100);
    }

    #[test]
    fn test_short_ids_follow_the_set() {
        let tracker = TxReconciliationTracker::default();
        assert!(tracker.get_peer_short_ids(0).is_none());

        tracker.pre_register_peer(0);
        tracker.register_peer(0, false, 1, 1).unwrap();
        assert_eq!(tracker.get_peer_short_ids(0), Some(vec![]));

        let txs: Vec<Wtxid> = (0..4).map(|_| rand_wtxid()).collect();
        tracker.store_txs_to_announce(0, &txs, &hasher(), 0, 1);

        let mut ids = tracker.get_peer_short_ids(0).unwrap();
        assert_eq!(ids.len(), 4);

        // Stable across calls up to set ordering
        let mut again = tracker.get_peer_short_ids(0).unwrap();
        ids.sort_unstable();
        again.sort_unstable();
        assert_eq!(ids, again);
    }

    #[test]
    fn test_try_remove_from_set() {
        let tracker = TxReconciliationTracker::default();
        let wtxid = rand_wtxid();

        assert!(!tracker.try_remove_from_set(0, &wtxid));

        tracker.pre_register_peer(0);
        tracker.register_peer(0, false, 1, 1).unwrap();
        tracker.store_txs_to_announce(0, &[wtxid], &hasher(), 0, 1);
        assert_eq!(tracker.get_peer_set_size(0), Some(1));

        assert!(tracker.try_remove_from_set(0, &wtxid));
        assert!(!tracker.try_remove_from_set(0, &wtxid));
        assert_eq!(tracker.get_peer_set_size(0), Some(0));
    }
}
