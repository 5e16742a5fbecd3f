use bitcoin::Wtxid;
use erlay_common::ShortIdHasher;

use super::PeerId;
use super::TrackerInner;
use super::INBOUND_FANOUT_DESTINATIONS_FRACTION;
use super::OUTBOUND_FANOUT_DESTINATIONS;

impl TrackerInner {
    /// Decides at registration time whether a reconciling peer permanently
    /// doubles as a flooding destination.
    ///
    /// Outbound slots are capped by a fixed count the caller tracks across
    /// all its connections. Inbound peers win roughly one time in ten, by
    /// keyed hash under the per-process secret so a peer cannot aim for (or
    /// dodge) the choice by grinding its id.
    pub(crate) fn choose_for_fanout(
        &self,
        peer_id: PeerId,
        we_initiate: bool,
        outbound_flooders: usize,
    ) -> bool {
        if we_initiate {
            return outbound_flooders < OUTBOUND_FANOUT_DESTINATIONS;
        }

        let one_in = (1.0 / INBOUND_FANOUT_DESTINATIONS_FRACTION).round() as u64;
        self.fanout_secret.peer_draw(peer_id) % one_in == 0
    }

    pub(crate) fn should_fanout_to(
        &self,
        wtxid: &Wtxid,
        hasher: &ShortIdHasher,
        peer_id: PeerId,
        inbounds_nonrcncl_tx_relay: usize,
        outbounds_nonrcncl_tx_relay: usize,
    ) -> bool {
        let Some(state) = self.states.get(&peer_id) else {
            // Unknown or merely pre-registered peers keep receiving
            // announcements the traditional way.
            return true;
        };

        // Flooding targets are picked per direction, among the registered
        // peers sharing this one's role.
        let candidates: Vec<PeerId> = self
            .states
            .iter()
            .filter(|(_, other)| other.we_initiate == state.we_initiate)
            .map(|(&id, _)| id)
            .collect();

        // Peers that relay without reconciling already provide flooding in
        // this direction; they use up the target budget first.
        let targets = if state.we_initiate {
            OUTBOUND_FANOUT_DESTINATIONS.saturating_sub(outbounds_nonrcncl_tx_relay)
        } else {
            let wanted =
                (candidates.len() as f64 * INBOUND_FANOUT_DESTINATIONS_FRACTION).ceil() as usize;
            wanted.saturating_sub(inbounds_nonrcncl_tx_relay)
        };

        if targets == 0 {
            return false;
        }
        if candidates.len() <= targets {
            return true;
        }

        // Rank every candidate for this transaction; the lowest ranks win.
        // The hash is keyed per transaction, so each transaction elects its
        // own winners and no peer is a winner (or loser) for all of them.
        let mut ranked: Vec<(u64, PeerId)> = candidates
            .into_iter()
            .map(|id| (hasher.rank(wtxid, id), id))
            .collect();
        ranked.sort_unstable();

        ranked.iter().take(targets).any(|&(_, id)| id == peer_id)
    }
}
