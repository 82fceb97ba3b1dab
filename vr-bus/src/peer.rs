//! The identity of the counterparty on a connection.

/// A connection's peer, discovered from the first valid header it sends.
/// Once a connection moves past `Unknown` its peer is immutable for the
/// rest of its life.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Peer {
    /// No socket is attached to this connection slot.
    #[default]
    None,
    /// A socket is attached but no header has been validated yet.
    Unknown,
    /// An external client, identified by its 128-bit id.
    Client {
        /// The client's self-reported id.
        id: u128,
    },
    /// A cluster replica, identified by its configuration index.
    Replica {
        /// The replica's index into the cluster configuration.
        index: u16,
    },
}

impl Peer {
    /// Whether no socket is attached (`Peer::None`).
    pub fn is_none(&self) -> bool {
        matches!(self, Peer::None)
    }

    /// Whether the peer has a socket but hasn't identified itself yet.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Peer::Unknown)
    }

    /// Whether the peer is a client.
    pub fn is_client(&self) -> bool {
        matches!(self, Peer::Client { .. })
    }

    /// Whether the peer is a replica, and if so, its index.
    pub fn replica_index(&self) -> Option<u16> {
        match self {
            Peer::Replica { index } => Some(*index),
            _ => None,
        }
    }

    /// Whether the peer is the client with this id.
    pub fn is_client_id(&self, id: u128) -> bool {
        matches!(self, Peer::Client { id: this } if *this == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_none() {
        assert_eq!(Peer::default(), Peer::None);
        assert!(Peer::None.is_none());
    }

    #[test]
    fn replica_index_extracts_only_from_replica_variant() {
        assert_eq!(Peer::Replica { index: 3 }.replica_index(), Some(3));
        assert_eq!(Peer::Client { id: 1 }.replica_index(), None);
        assert_eq!(Peer::Unknown.replica_index(), None);
    }

    #[test]
    fn is_client_id_matches_only_the_same_id() {
        let peer = Peer::Client { id: 42 };
        assert!(peer.is_client_id(42));
        assert!(!peer.is_client_id(7));
    }
}
