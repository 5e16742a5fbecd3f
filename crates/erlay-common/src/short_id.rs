use bitcoin::hashes::sha256;
use bitcoin::hashes::siphash24;
use bitcoin::hashes::Hash;
use bitcoin::hashes::HashEngine;
use bitcoin::Wtxid;

/// Static tag mixed into the salt combination, fixed by BIP-330 so that both
/// ends of a connection derive the same short-ID keys.
const RECON_STATIC_SALT: &[u8] = b"Tx Relay Salting";

/// A keyed SipHash-2-4 instance over transaction identifiers.
///
/// Reconciliation sketches are computed over *short IDs* rather than full
/// 256-bit wtxids. Each peer pair agrees on a hasher keyed from their combined
/// salts (see [`combine_salts`]), so both ends map the same transaction to the
/// same short ID while third parties cannot predict collisions.
///
/// The same type doubles as the node-wide deterministic randomizer handed to
/// the fanout selector: there the keys come from a per-process secret instead
/// of per-peer salts, and the hash ranks peers per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortIdHasher {
    k0: u64,
    k1: u64,
}

impl ShortIdHasher {
    pub fn new(k0: u64, k1: u64) -> Self {
        Self { k0, k1 }
    }

    /// Computes the 32-bit short ID of a transaction, as included in sketches.
    pub fn short_txid(&self, wtxid: &Wtxid) -> u32 {
        let hash =
            siphash24::Hash::hash_to_u64_with_keys(self.k0, self.k1, &wtxid.to_byte_array());
        (hash & 0xFFFF_FFFF) as u32
    }

    /// Hashes a bare peer id.
    ///
    /// Used for per-process peer lotteries, e.g. picking which inbound peers
    /// permanently double as flooding destinations.
    pub fn peer_draw(&self, peer_id: i64) -> u64 {
        siphash24::Hash::hash_to_u64_with_keys(self.k0, self.k1, &peer_id.to_le_bytes())
    }

    /// Ranks a (transaction, peer) pair.
    ///
    /// Used to pick low-fanout destinations: for a given transaction, every
    /// candidate peer gets a rank and the lowest ranks win. The result is a
    /// pure function of the keys and both inputs, so independent callers
    /// always agree on the chosen peers.
    pub fn rank(&self, wtxid: &Wtxid, peer_id: i64) -> u64 {
        let mut engine = siphash24::HashEngine::with_keys(self.k0, self.k1);
        engine.input(&wtxid.to_byte_array());
        engine.input(&peer_id.to_le_bytes());
        siphash24::Hash::from_engine_to_u64(engine)
    }
}

/// Combines the two per-connection salts into short-ID hasher keys.
///
/// The initiator's salt is hashed first, then the responder's, so both peers
/// feed the salts in the same order regardless of which side computes the
/// keys. The combination is a tagged SHA-256 of both salts; the first sixteen
/// digest bytes become the two SipHash keys.
pub fn combine_salts(initiator_salt: u64, responder_salt: u64) -> ShortIdHasher {
    let tag = sha256::Hash::hash(RECON_STATIC_SALT);

    let mut engine = sha256::Hash::engine();
    engine.input(tag.as_byte_array());
    engine.input(tag.as_byte_array());
    engine.input(&initiator_salt.to_le_bytes());
    engine.input(&responder_salt.to_le_bytes());

    let digest = sha256::Hash::from_engine(engine).to_byte_array();
    let k0 = u64::from_le_bytes(digest[0..8].try_into().expect("digest has 32 bytes"));
    let k1 = u64::from_le_bytes(digest[8..16].try_into().expect("digest has 32 bytes"));

    ShortIdHasher::new(k0, k1)
}
