// Meshwire protocol definitions
//
// Wire-visible constants and verbs. All of these are part of the deployed
// protocol; changing one breaks compatibility with existing nodes.

pub mod packet;

/// Protocol revision spoken by this build
pub const PROTO_VERSION: u8 = 8;

/// Product major version advertised in HELLO
pub const VERSION_MAJOR: u8 = 1;

/// Product minor version advertised in HELLO
pub const VERSION_MINOR: u8 = 2;

/// Product revision advertised in HELLO
pub const VERSION_REVISION: u16 = 0;

/// Candidate network paths tracked per peer
pub const MAX_PATHS: usize = 8;

/// Length of the symmetric key agreed between two identities
pub const SECRET_KEY_LENGTH: usize = 32;

/// Length of a short overlay address
pub const ADDRESS_LENGTH: usize = 5;

/// Ping a peer's best path if nothing was received on it for this long (ms)
pub const PING_PERIOD: u64 = 60_000;

/// Forget paths that have been silent for longer than this (ms)
pub const PATH_EXPIRATION: u64 = (PING_PERIOD * 4) + 3_000;

/// A path counts as alive if it received within this window (ms)
pub const PATH_ALIVE_WINDOW: u64 = 45_000;

/// Send a NAT keepalive if nothing was sent on a path for this long (ms)
pub const NAT_KEEPALIVE_DELAY: u64 = 15_000;

/// Minimum interval between unsolicited direct path pushes (ms)
pub const DIRECT_PATH_PUSH_INTERVAL: u64 = 120_000;

/// Lifetime of a multicast subscription on the remote side (ms)
pub const MULTICAST_LIKE_EXPIRE: u64 = 600_000;

/// NAT-predicted addresses pushed per scope and family, at most
pub const PUSH_MAX_PER_SCOPE_AND_FAMILY: usize = 8;

/// Keep PUSH_DIRECT_PATHS packets under this size (bytes)
pub const PUSH_PACKET_SIZE_LIMIT: usize = 1_200;

/// Window for the inbound direct-path-push flood gate (ms)
pub const PUSH_CUTOFF_TIME: u64 = 30_000;

/// Inbound pushes tolerated per cutoff window
pub const PUSH_CUTOFF_LIMIT: u32 = 8;

/// PUSH_DIRECT_PATHS record flag: this record is a cluster redirect
pub const CLUSTER_REDIRECT_BIT: u8 = 0x01;

/// Packet verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verb {
    /// No operation
    Nop = 0x00,

    /// Announce identity and version; sent in the clear
    Hello = 0x01,

    /// Error in response to an earlier packet
    Error = 0x02,

    /// Acknowledgement of an earlier packet
    Ok = 0x03,

    /// Identity lookup request
    Whois = 0x04,

    /// Legacy NAT hole-punching coordination
    Rendezvous = 0x05,

    /// Unicast data frame
    Frame = 0x06,

    /// Unicast data frame with extended header
    ExtFrame = 0x07,

    /// Minimal reachability probe
    Echo = 0x08,

    /// Multicast subscription announcement
    MulticastLike = 0x09,

    /// Multicast data frame
    MulticastFrame = 0x0e,

    /// Unsolicited advertisement of reachable addresses
    PushDirectPaths = 0x10,
}

impl Verb {
    /// Human-readable verb name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Verb::Nop => "NOP",
            Verb::Hello => "HELLO",
            Verb::Error => "ERROR",
            Verb::Ok => "OK",
            Verb::Whois => "WHOIS",
            Verb::Rendezvous => "RENDEZVOUS",
            Verb::Frame => "FRAME",
            Verb::ExtFrame => "EXT_FRAME",
            Verb::Echo => "ECHO",
            Verb::MulticastLike => "MULTICAST_LIKE",
            Verb::MulticastFrame => "MULTICAST_FRAME",
            Verb::PushDirectPaths => "PUSH_DIRECT_PATHS",
        }
    }

    /// Decode a verb from its wire value
    pub fn from_u8(value: u8) -> Option<Verb> {
        match value {
            0x00 => Some(Verb::Nop),
            0x01 => Some(Verb::Hello),
            0x02 => Some(Verb::Error),
            0x03 => Some(Verb::Ok),
            0x04 => Some(Verb::Whois),
            0x05 => Some(Verb::Rendezvous),
            0x06 => Some(Verb::Frame),
            0x07 => Some(Verb::ExtFrame),
            0x08 => Some(Verb::Echo),
            0x09 => Some(Verb::MulticastLike),
            0x0e => Some(Verb::MulticastFrame),
            0x10 => Some(Verb::PushDirectPaths),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_wire_values_roundtrip() {
        let verbs = [
            Verb::Nop,
            Verb::Hello,
            Verb::Error,
            Verb::Ok,
            Verb::Whois,
            Verb::Rendezvous,
            Verb::Frame,
            Verb::ExtFrame,
            Verb::Echo,
            Verb::MulticastLike,
            Verb::MulticastFrame,
            Verb::PushDirectPaths,
        ];

        for verb in verbs {
            assert_eq!(Verb::from_u8(verb as u8), Some(verb));
        }

        assert_eq!(Verb::from_u8(0xff), None);
    }

    #[test]
    fn test_expiration_exceeds_alive_window() {
        // A path must be able to go dead before it is forgotten
        assert!(PATH_EXPIRATION > PATH_ALIVE_WINDOW);
        assert!(PATH_EXPIRATION > PING_PERIOD);
    }
}
