use std::collections::hash_map::Entry;
use std::collections::HashSet;

use erlay_common::combine_salts;
use erlay_common::DiffEstimator;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use super::PeerId;
use super::PeerReconState;
use super::ReconciliationOffer;
use super::RegisterError;
use super::TrackerInner;
use super::Q_SMOOTHING_ALPHA;

impl TrackerInner {
    pub(crate) fn suggest_reconciling(
        &mut self,
        peer_id: PeerId,
        is_inbound: bool,
    ) -> Result<ReconciliationOffer, RegisterError> {
        // One salt per peer id for the lifetime of the connection. Getting a
        // second suggestion means the caller reused an id without forgetting
        // the previous peer first.
        if self.local_salts.contains_key(&peer_id) {
            return Err(RegisterError::ProtocolViolation);
        }

        let salt = OsRng.next_u64();
        self.local_salts.insert(peer_id, salt);

        debug!("prepare to announce reconciliation support to peer={peer_id}");

        // Only the outbound side of a connection requests sketches; the
        // inbound side answers them.
        Ok(ReconciliationOffer {
            we_initiate: !is_inbound,
            we_respond: is_inbound,
            version: self.config.recon_version,
            salt,
        })
    }

    pub(crate) fn pre_register_peer(&mut self, peer_id: PeerId) -> u64 {
        match self.local_salts.entry(peer_id) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => *entry.insert(OsRng.next_u64()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register(
        &mut self,
        peer_id: PeerId,
        is_inbound: bool,
        recon_requestor: bool,
        recon_responder: bool,
        recon_version: u32,
        remote_salt: u64,
        outbound_flooders: usize,
    ) -> Result<(), RegisterError> {
        // Salt and version updates are not supported; a second registration
        // attempt keeps the existing state untouched.
        if self.states.contains_key(&peer_id) {
            return Err(RegisterError::AlreadyRegistered);
        }

        let local_salt = *self
            .local_salts
            .get(&peer_id)
            .ok_or(RegisterError::NotFound)?;

        // Downgrade to the lower of the two announced versions. v1 is the
        // lowest that exists, so announcing 0 is a protocol violation.
        let version = recon_version.min(self.config.recon_version);
        if version < 1 {
            return Err(RegisterError::ProtocolViolation);
        }

        // Must mirror the role assignment in suggest_reconciling.
        let we_may_initiate = !is_inbound;
        let we_may_respond = is_inbound;

        let they_initiate = recon_requestor && we_may_respond;
        let we_initiate = we_may_initiate && recon_responder;

        // Roles follow the connection direction on both ends, so a peer that
        // leaves us without any initiator is misbehaving.
        if !they_initiate && !we_initiate {
            return Err(RegisterError::ProtocolViolation);
        }

        // Both ends hash the initiator's salt first.
        let short_ids = if we_initiate {
            combine_salts(local_salt, remote_salt)
        } else {
            combine_salts(remote_salt, local_salt)
        };

        let chosen_for_fanout = self.choose_for_fanout(peer_id, we_initiate, outbound_flooders);

        debug!(
            "registering peer={peer_id} for reconciliation: we_initiate={we_initiate} \
             they_initiate={they_initiate} version={version} chosen_for_fanout={chosen_for_fanout}"
        );

        self.states.insert(
            peer_id,
            PeerReconState {
                short_ids,
                we_initiate,
                is_inbound,
                version,
                chosen_for_fanout,
                wtxids: HashSet::new(),
                last_request_time: None,
                pending_request: false,
                q: DiffEstimator::new(self.config.default_q, Q_SMOOTHING_ALPHA),
            },
        );

        if we_initiate {
            self.queue.push_back(peer_id);
        }

        Ok(())
    }

    pub(crate) fn forget(&mut self, peer_id: PeerId) {
        let salt = self.local_salts.remove(&peer_id);
        let state = self.states.remove(&peer_id);
        self.queue.retain(|&id| id != peer_id);

        if salt.is_some() || state.is_some() {
            debug!("stopped tracking reconciliation state for peer={peer_id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tracker::RegisterError;
    use crate::tracker::TxReconciliationTracker;

    #[test]
    fn test_register_peer() {
        let tracker = TxReconciliationTracker::default();
        let salt = 0;

        tracker.pre_register_peer(0);

        // Invalid version
        assert_eq!(
            tracker.register_peer(0, true, 0, salt),
            Err(RegisterError::ProtocolViolation)
        );

        // Valid registration, inbound and outbound
        assert!(!tracker.is_peer_registered(0));
        assert_eq!(tracker.register_peer(0, true, 1, salt), Ok(()));
        assert!(tracker.is_peer_registered(0));

        assert!(!tracker.is_peer_registered(1));
        tracker.pre_register_peer(1);
        assert_eq!(tracker.register_peer(1, false, 1, salt), Ok(()));
        assert!(tracker.is_peer_registered(1));

        // The peer runs a higher version than ours; we downgrade and accept
        tracker.pre_register_peer(2);
        assert_eq!(tracker.register_peer(2, true, 2, salt), Ok(()));
        assert_eq!(tracker.negotiated_version(2), Some(1));

        // Second registration keeps the state untouched
        assert_eq!(
            tracker.register_peer(1, false, 1, salt),
            Err(RegisterError::AlreadyRegistered)
        );

        // No registration without pre-registration
        assert_eq!(
            tracker.register_peer(100, true, 1, salt),
            Err(RegisterError::NotFound)
        );
        assert!(!tracker.is_peer_registered(100));
    }

    #[test]
    fn test_forget_peer() {
        let tracker = TxReconciliationTracker::default();

        // Forgetting a pre-registered peer erases the salt
        tracker.pre_register_peer(0);
        tracker.forget_peer(0);
        assert_eq!(
            tracker.register_peer(0, true, 1, 1),
            Err(RegisterError::NotFound)
        );

        // Forgetting a registered peer erases everything
        tracker.pre_register_peer(0);
        assert_eq!(tracker.register_peer(0, true, 1, 1), Ok(()));
        assert!(tracker.is_peer_registered(0));
        tracker.forget_peer(0);
        assert!(!tracker.is_peer_registered(0));
        assert_eq!(tracker.get_peer_set_size(0), None);
        assert_eq!(tracker.is_peer_chosen_for_flooding(0), None);

        // Forgetting an unknown peer is a no-op
        tracker.forget_peer(12345);
    }

    #[test]
    fn test_suggest_reconciling() {
        let tracker = TxReconciliationTracker::default();

        let offer = tracker.suggest_reconciling(0, false).unwrap();
        assert!(offer.we_initiate);
        assert!(!offer.we_respond);
        assert_eq!(offer.version, 1);

        let offer = tracker.suggest_reconciling(1, true).unwrap();
        assert!(!offer.we_initiate);
        assert!(offer.we_respond);

        // Suggesting twice for the same peer is a violation
        assert_eq!(
            tracker.suggest_reconciling(0, false),
            Err(RegisterError::ProtocolViolation)
        );
    }

    #[test]
    fn test_enable_reconciliation_support_role_mismatch() {
        let tracker = TxReconciliationTracker::default();

        // An outbound peer that refuses to respond leaves no initiator
        tracker.suggest_reconciling(0, false).unwrap();
        assert_eq!(
            tracker.enable_reconciliation_support(0, false, true, false, 1, 7, 0),
            Err(RegisterError::ProtocolViolation)
        );
        assert!(!tracker.is_peer_registered(0));

        // Same for an inbound peer that does not request
        tracker.suggest_reconciling(1, true).unwrap();
        assert_eq!(
            tracker.enable_reconciliation_support(1, true, false, true, 1, 7, 0),
            Err(RegisterError::ProtocolViolation)
        );

        // The conforming flag choice registers fine
        assert_eq!(
            tracker.enable_reconciliation_support(1, true, true, false, 1, 7, 0),
            Ok(())
        );
        assert_eq!(tracker.is_peer_initiator(1), Some(true));
    }

    #[test]
    fn test_version_negotiation_with_custom_config() {
        let config = crate::tracker::ReconciliationConfig {
            recon_version: 2,
            ..Default::default()
        };
        let tracker = TxReconciliationTracker::new(config);

        // The lower announced version wins in either direction
        tracker.pre_register_peer(0);
        tracker.register_peer(0, true, 1, 1).unwrap();
        assert_eq!(tracker.negotiated_version(0), Some(1));

        tracker.pre_register_peer(1);
        tracker.register_peer(1, true, 3, 1).unwrap();
        assert_eq!(tracker.negotiated_version(1), Some(2));
    }

    #[test]
    fn test_pre_register_is_idempotent() {
        let tracker = TxReconciliationTracker::default();

        let salt = tracker.pre_register_peer(0);
        assert_eq!(tracker.pre_register_peer(0), salt);
    }

    #[test]
    fn test_peer_info_snapshot() {
        let tracker = TxReconciliationTracker::default();
        assert!(tracker.get_peer_info(0).is_none());

        tracker.pre_register_peer(0);
        assert!(tracker.get_peer_info(0).is_none());

        tracker.register_peer(0, false, 1, 42).unwrap();
        let info = tracker.get_peer_info(0).unwrap();
        assert!(info.we_initiate);
        assert!(!info.is_inbound);
        assert_eq!(info.version, 1);
        assert_eq!(info.set_size, 0);
        assert!(!info.pending_request);
        assert!(info.last_request_time.is_none());
    }
}
