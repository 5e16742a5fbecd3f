//! The reconciliation tracker: one object per node keeping every piece of
//! per-peer reconciliation state behind a single lock.
//!
//! The relay loop drives the handshake ([`TxReconciliationTracker::suggest_reconciling`],
//! [`TxReconciliationTracker::enable_reconciliation_support`]) and feeds
//! announcements in ([`TxReconciliationTracker::store_txs_to_announce`]);
//! a scheduler thread polls [`TxReconciliationTracker::is_peer_next_to_reconcile_with`]
//! and, when granted, builds a request with
//! [`TxReconciliationTracker::initiate_reconciliation_request`].

mod error;
mod fanout;
mod handshake;
mod sched;
mod set;

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use bitcoin::Wtxid;
use erlay_common::DiffEstimator;
use erlay_common::ShortIdHasher;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use serde::Serialize;

pub use error::RegisterError;

/// Network-wide identifier of a connected peer.
pub type PeerId = i64;

/// Reconciliation protocol version we support and announce.
pub const TXRECONCILIATION_VERSION: u32 = 1;

/// Scale factor for transmitting the q coefficient as a 15-bit integer.
pub const Q_PRECISION: u16 = 32767;

/// Set-difference density assumed before any reconciliation completed.
pub const DEFAULT_Q: f64 = 0.25;

/// How often we reconcile: every peer in the queue is visited roughly once
/// per interval, however many peers there are.
pub const RECON_REQUEST_INTERVAL: Duration = Duration::from_secs(8);

/// Extra time we grant the current peer to answer an outstanding
/// reconciliation request before the queue moves past it.
pub const RECON_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Fraction of registered inbound reconciling peers that also receive a given
/// transaction by flooding.
pub const INBOUND_FANOUT_DESTINATIONS_FRACTION: f64 = 0.1;

/// Number of outbound reconciling peers that also receive a given transaction
/// by flooding.
pub const OUTBOUND_FANOUT_DESTINATIONS: usize = 1;

/// Weight of the newest observed round in the per-peer q average.
const Q_SMOOTHING_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Tunables for the reconciliation tracker.
///
/// The defaults match the protocol constants and are what deployments run
/// with; anything else only interoperates with peers configured alike.
pub struct ReconciliationConfig {
    /// Highest protocol version we announce. Negotiation picks the minimum of
    /// this and the peer's version.
    pub recon_version: u32,

    /// Target time between two reconciliations with the same peer.
    pub request_interval: Duration,

    /// Grace period for a peer to answer an in-flight request.
    pub response_timeout: Duration,

    /// Difference density assumed for peers with no completed rounds yet.
    pub default_q: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            recon_version: TXRECONCILIATION_VERSION,
            request_interval: RECON_REQUEST_INTERVAL,
            response_timeout: RECON_RESPONSE_TIMEOUT,
            default_q: DEFAULT_Q,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The values we send when inviting a peer to reconcile instead of flooding.
pub struct ReconciliationOffer {
    /// We will request sketches from this peer.
    pub we_initiate: bool,

    /// We will answer this peer's sketch requests.
    pub we_respond: bool,

    /// Protocol version we announce.
    pub version: u32,

    /// Our salt contribution for the short-ID hasher.
    pub salt: u64,
}

#[derive(Debug, Clone, Serialize)]
/// Diagnostic snapshot of one registered peer, as reported over RPC.
pub struct PeerReconInfo {
    pub peer_id: PeerId,
    pub we_initiate: bool,
    pub is_inbound: bool,
    pub version: u32,
    pub set_size: usize,
    pub chosen_for_fanout: bool,
    pub pending_request: bool,
    pub last_request_time: Option<Duration>,
}

#[derive(Debug, Clone)]
/// Everything we keep about one registered peer.
pub(crate) struct PeerReconState {
    /// Hasher both ends derived from the combined salts; maps wtxids to the
    /// short IDs that sketches are computed over.
    pub(crate) short_ids: ShortIdHasher,

    /// Whether we are the requesting side of this connection. Fixed at
    /// registration; one role per peer for the whole connection.
    pub(crate) we_initiate: bool,

    /// Whether the peer connected to us.
    pub(crate) is_inbound: bool,

    /// min(our version, their version).
    pub(crate) version: u32,

    /// Whether this peer additionally receives low-fanout floods.
    pub(crate) chosen_for_fanout: bool,

    /// Transactions we would have announced, parked for the next round.
    pub(crate) wtxids: HashSet<Wtxid>,

    /// When we last began a reconciliation with this peer.
    pub(crate) last_request_time: Option<Duration>,

    /// Set between sending a request and learning its outcome.
    pub(crate) pending_request: bool,

    /// Running estimate of the set-difference density with this peer.
    pub(crate) q: DiffEstimator,
}

/// Tracker state, owned by the facade's mutex.
pub(crate) struct TrackerInner {
    pub(crate) config: ReconciliationConfig,

    /// Our salt for every peer that went through step 0 of the handshake.
    /// Entries stay around after registration so both maps are dropped
    /// together when the peer is forgotten.
    pub(crate) local_salts: HashMap<PeerId, u64>,

    /// Fully registered peers.
    pub(crate) states: HashMap<PeerId, PeerReconState>,

    /// Registered peers we initiate to, in visiting order. Front is next.
    pub(crate) queue: VecDeque<PeerId>,

    /// Earliest instant the queue front may be serviced.
    pub(crate) next_recon_time: Duration,

    /// Per-process secret keying the inbound chosen-for-fanout decision, so
    /// peers cannot position themselves to be (or avoid being) chosen.
    pub(crate) fanout_secret: ShortIdHasher,
}

/// Tracks everything needed to reconcile transaction announcements with our
/// peers, behind a single mutex.
///
/// All methods are atomic with respect to each other and none of them block
/// on I/O, so the facade can be shared freely between the relay workers and
/// the scheduler thread.
pub struct TxReconciliationTracker {
    inner: Mutex<TrackerInner>,
}

impl Default for TxReconciliationTracker {
    fn default() -> Self {
        Self::new(ReconciliationConfig::default())
    }
}

impl TxReconciliationTracker {
    pub fn new(config: ReconciliationConfig) -> Self {
        let fanout_secret = ShortIdHasher::new(OsRng.next_u64(), OsRng.next_u64());

        Self {
            inner: Mutex::new(TrackerInner {
                config,
                local_salts: HashMap::new(),
                states: HashMap::new(),
                queue: VecDeque::new(),
                next_recon_time: Duration::ZERO,
                fanout_secret,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().expect("reconciliation tracker mutex poisoned")
    }

    // === HANDSHAKE AND LIFECYCLE ===

    /// Step 0, our side: produce the parameters announcing reconciliation
    /// support to a new peer.
    ///
    /// Roles follow the connection direction: we initiate to outbound peers
    /// and respond to inbound ones. A fresh random salt is generated and
    /// stored for the peer; suggesting twice without forgetting the peer in
    /// between is a [`RegisterError::ProtocolViolation`].
    pub fn suggest_reconciling(
        &self,
        peer_id: PeerId,
        is_inbound: bool,
    ) -> Result<ReconciliationOffer, RegisterError> {
        self.inner().suggest_reconciling(peer_id, is_inbound)
    }

    /// Step 0, lightweight form: generate and store the salt for a peer
    /// without computing offer values. Returns the salt. Idempotent.
    pub fn pre_register_peer(&self, peer_id: PeerId) -> u64 {
        self.inner().pre_register_peer(peer_id)
    }

    /// Step 0, their side: the peer accepted our offer; build the state
    /// required to reconcile with it.
    ///
    /// Fails with [`RegisterError::NotFound`] without a prior salt,
    /// [`RegisterError::AlreadyRegistered`] on repeat, and
    /// [`RegisterError::ProtocolViolation`] for version 0 or a role choice
    /// inconsistent with the connection direction. On success the peer is
    /// appended to the reconciliation queue if we are the initiator.
    #[allow(clippy::too_many_arguments)]
    pub fn enable_reconciliation_support(
        &self,
        peer_id: PeerId,
        is_inbound: bool,
        recon_requestor: bool,
        recon_responder: bool,
        recon_version: u32,
        remote_salt: u64,
        outbound_flooders: usize,
    ) -> Result<(), RegisterError> {
        let mut inner = self.inner();
        let res = inner.register(
            peer_id,
            is_inbound,
            recon_requestor,
            recon_responder,
            recon_version,
            remote_salt,
            outbound_flooders,
        );

        #[cfg(feature = "metrics")]
        Self::update_peer_metrics(&inner);

        res
    }

    /// [`Self::enable_reconciliation_support`] with the peer's roles derived
    /// from the connection direction, for callers that don't carry the
    /// peer's flags around.
    pub fn register_peer(
        &self,
        peer_id: PeerId,
        is_peer_inbound: bool,
        peer_recon_version: u32,
        remote_salt: u64,
    ) -> Result<(), RegisterError> {
        // An inbound peer requests sketches from us; an outbound peer
        // answers our requests.
        self.enable_reconciliation_support(
            peer_id,
            is_peer_inbound,
            is_peer_inbound,
            !is_peer_inbound,
            peer_recon_version,
            remote_salt,
            0,
        )
    }

    /// Drops every piece of reconciliation state for the peer, including its
    /// queue slot. Idempotent; the peer may be pre-registered again later.
    pub fn forget_peer(&self, peer_id: PeerId) {
        let mut inner = self.inner();
        inner.forget(peer_id);

        #[cfg(feature = "metrics")]
        Self::update_peer_metrics(&inner);
    }

    /// Whether the handshake completed and we track a set for this peer.
    pub fn is_peer_registered(&self, peer_id: PeerId) -> bool {
        self.inner().states.contains_key(&peer_id)
    }

    /// Whether the *peer* is the side requesting sketches. `None` if the
    /// peer is not registered.
    pub fn is_peer_initiator(&self, peer_id: PeerId) -> Option<bool> {
        let inner = self.inner();
        Some(!inner.states.get(&peer_id)?.we_initiate)
    }

    /// Version both ends agreed on. `None` if the peer is not registered.
    pub fn negotiated_version(&self, peer_id: PeerId) -> Option<u32> {
        let inner = self.inner();
        Some(inner.states.get(&peer_id)?.version)
    }

    /// Diagnostic snapshot of the peer's reconciliation state.
    pub fn get_peer_info(&self, peer_id: PeerId) -> Option<PeerReconInfo> {
        let inner = self.inner();
        let state = inner.states.get(&peer_id)?;

        Some(PeerReconInfo {
            peer_id,
            we_initiate: state.we_initiate,
            is_inbound: state.is_inbound,
            version: state.version,
            set_size: state.wtxids.len(),
            chosen_for_fanout: state.chosen_for_fanout,
            pending_request: state.pending_request,
            last_request_time: state.last_request_time,
        })
    }

    // === ANNOUNCEMENTS ===

    /// Step 1: park transactions for the next reconciliation with this peer.
    ///
    /// Each transaction is first run through the fanout selector; the ones
    /// picked for flooding are *returned* for the caller to announce
    /// immediately, the rest join the peer's set. For a peer that is not
    /// registered every transaction is returned, falling back to flooding.
    pub fn store_txs_to_announce(
        &self,
        peer_id: PeerId,
        txs: &[Wtxid],
        hasher: &ShortIdHasher,
        inbounds_nonrcncl_tx_relay: usize,
        outbounds_nonrcncl_tx_relay: usize,
    ) -> Vec<Wtxid> {
        let fanout = self.inner().store_txs_to_announce(
            peer_id,
            txs,
            hasher,
            inbounds_nonrcncl_tx_relay,
            outbounds_nonrcncl_tx_relay,
        );

        #[cfg(feature = "metrics")]
        metrics::get_metrics()
            .fanout_tx_count
            .inc_by(fanout.len() as f64);

        fanout
    }

    /// Drops a transaction from the peer's set, typically because the peer
    /// just announced it to us. Returns whether it was present.
    pub fn try_remove_from_set(&self, peer_id: PeerId, wtxid: &Wtxid) -> bool {
        self.inner().try_remove_from_set(peer_id, wtxid)
    }

    /// Number of transactions parked for this peer. `None` if the peer is
    /// not registered.
    pub fn get_peer_set_size(&self, peer_id: PeerId) -> Option<usize> {
        let inner = self.inner();
        Some(inner.states.get(&peer_id)?.wtxids.len())
    }

    /// The peer's parked transactions as short IDs under the hasher both
    /// ends derived during the handshake. This is what the sketch encoder
    /// computes a sketch over. `None` if the peer is not registered.
    pub fn get_peer_short_ids(&self, peer_id: PeerId) -> Option<Vec<u32>> {
        let inner = self.inner();
        let state = inner.states.get(&peer_id)?;

        Some(
            state
                .wtxids
                .iter()
                .map(|wtxid| state.short_ids.short_txid(wtxid))
                .collect(),
        )
    }

    // === FANOUT ===

    /// Whether this peer is a low-fanout destination for the given
    /// transaction.
    ///
    /// Peers not registered for reconciliation are always flooded to.
    /// Registered peers of the transaction's direction are ranked under
    /// `hasher` and the top few win: [`OUTBOUND_FANOUT_DESTINATIONS`] slots
    /// for outbound peers, [`INBOUND_FANOUT_DESTINATIONS_FRACTION`] of the
    /// inbound ones, both reduced by the respective count of peers already
    /// flooding by other means. Deterministic: every call with the same
    /// inputs, on any host, agrees.
    pub fn should_fanout_to(
        &self,
        wtxid: &Wtxid,
        hasher: &ShortIdHasher,
        peer_id: PeerId,
        inbounds_nonrcncl_tx_relay: usize,
        outbounds_nonrcncl_tx_relay: usize,
    ) -> bool {
        self.inner().should_fanout_to(
            wtxid,
            hasher,
            peer_id,
            inbounds_nonrcncl_tx_relay,
            outbounds_nonrcncl_tx_relay,
        )
    }

    /// The permanent flood-besides-reconciling bit decided at registration.
    /// `None` if the peer is not registered.
    pub fn is_peer_chosen_for_flooding(&self, peer_id: PeerId) -> Option<bool> {
        let inner = self.inner();
        Some(inner.states.get(&peer_id)?.chosen_for_fanout)
    }

    // === SCHEDULING ===

    /// Whether it is time to reconcile with this peer, given the current
    /// wall clock (as a duration since the epoch; the tracker never reads
    /// the clock itself).
    ///
    /// Grants are single-visit tickets: a `true` return rotates the queue
    /// and re-arms the timer as a side effect, so exactly one caller wins
    /// each slot. A peer still waiting on an earlier request blocks its slot
    /// until [`RECON_RESPONSE_TIMEOUT`] past its due time.
    pub fn is_peer_next_to_reconcile_with(&self, peer_id: PeerId, now: Duration) -> bool {
        self.inner().is_peer_next_to_reconcile_with(peer_id, now)
    }

    /// Step 2: build the parameters of a reconciliation request for the
    /// peer: our set size and the q coefficient scaled by [`Q_PRECISION`].
    ///
    /// `None` if the peer is not a registered initiator-role peer or a
    /// request is already in flight. Marks the request pending.
    pub fn initiate_reconciliation_request(&self, peer_id: PeerId) -> Option<(u16, u16)> {
        self.inner().initiate_reconciliation_request(peer_id)
    }

    /// Records the outcome of a finished round: clears the pending flag,
    /// empties the announcement set and feeds the observed difference into
    /// the peer's q estimate. Returns whether a round was actually pending.
    pub fn finalize_reconciliation(
        &self,
        peer_id: PeerId,
        remote_set_size: usize,
        local_missing: usize,
        remote_missing: usize,
    ) -> bool {
        self.inner()
            .finalize_reconciliation(peer_id, remote_set_size, local_missing, remote_missing)
    }

    #[cfg(feature = "metrics")]
    fn update_peer_metrics(inner: &TrackerInner) {
        use metrics::get_metrics;

        let metrics = get_metrics();
        metrics.recon_peer_count.set(inner.states.len() as f64);
        metrics.recon_queue_depth.set(inner.queue.len() as f64);
    }
}
