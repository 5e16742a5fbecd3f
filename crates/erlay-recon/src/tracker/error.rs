use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
/// Why a peer could not be registered for reconciliation.
///
/// A [`ProtocolViolation`](RegisterError::ProtocolViolation) means the peer
/// sent parameters no honest implementation produces; the caller is expected
/// to disconnect it. The tracker itself never disconnects anyone.
pub enum RegisterError {
    #[error("peer has no pre-registered reconciliation salt")]
    NotFound,

    #[error("peer is already registered for reconciliation")]
    AlreadyRegistered,

    #[error("peer violated the reconciliation protocol")]
    ProtocolViolation,
}
