use std::time::Duration;

use tracing::debug;

use super::PeerId;
use super::TrackerInner;
use super::Q_PRECISION;

impl TrackerInner {
    pub(crate) fn is_peer_next_to_reconcile_with(&mut self, peer_id: PeerId, now: Duration) -> bool {
        let Some(state) = self.states.get(&peer_id) else {
            return false;
        };
        if !state.we_initiate {
            return false;
        }

        if now < self.next_recon_time {
            return false;
        }

        let Some(&head) = self.queue.front() else {
            return false;
        };
        if head != peer_id {
            return false;
        }

        // The peer still owes us a response; hold its slot for a grace
        // period before the queue moves past it.
        if state.pending_request && now < self.next_recon_time + self.config.response_timeout {
            return false;
        }

        // Grant the slot and rotate. The timer re-arms from the live queue
        // size, so every member is visited about once per interval however
        // many peers come and go.
        self.queue.rotate_left(1);

        let gap = self.config.request_interval / self.queue.len() as u32;
        self.next_recon_time = now + gap;

        if let Some(state) = self.states.get_mut(&peer_id) {
            state.pending_request = false;
            state.last_request_time = Some(now);
        }

        true
    }

    pub(crate) fn initiate_reconciliation_request(&mut self, peer_id: PeerId) -> Option<(u16, u16)> {
        let state = self.states.get_mut(&peer_id)?;
        if !state.we_initiate || state.pending_request {
            return None;
        }

        state.pending_request = true;

        let set_size = u16::try_from(state.wtxids.len()).unwrap_or(u16::MAX);
        let q_formatted = (state.q.q() * Q_PRECISION as f64) as u16;

        Some((set_size, q_formatted))
    }

    pub(crate) fn finalize_reconciliation(
        &mut self,
        peer_id: PeerId,
        remote_set_size: usize,
        local_missing: usize,
        remote_missing: usize,
    ) -> bool {
        let Some(state) = self.states.get_mut(&peer_id) else {
            return false;
        };
        if !state.pending_request {
            return false;
        }

        state.pending_request = false;
        state.q.record_round(
            state.wtxids.len(),
            remote_set_size,
            local_missing,
            remote_missing,
        );

        // This round consumed the set; keeping the entries would re-announce
        // them forever and grow the state without bound.
        state.wtxids.clear();

        debug!(
            "finalized reconciliation with peer={peer_id}, q estimate is now {:.3}",
            state.q.q()
        );

        true
    }
}
