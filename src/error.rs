use thiserror::Error;

/// Error types for the overlay core
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Key agreement with a remote identity failed
    #[error("identity key agreement failed")]
    KeyAgreement,

    /// The operation needs the identity's private key
    #[error("identity has no private key")]
    MissingPrivateKey,

    /// An identity could not be deserialized
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// A packet was structurally invalid
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Packet authentication failed
    #[error("packet authentication failed")]
    AuthenticationFailed,

    /// The peer registry is at capacity
    #[error("peer limit reached ({0})")]
    PeerLimitReached(usize),
}
