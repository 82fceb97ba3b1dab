//! Error types. Handled locally wherever possible: per §7 of the bus's
//! error-handling design, connection-level failures never propagate
//! upward through [`crate::replica::ReplicaSink::on_message`] — they
//! surface only as log lines and a shutdown connection.

use std::error::Error;
use std::fmt;

pub use crate::protocol::header::HeaderError;

/// Errors that can occur constructing or validating a [`crate::config::BusConfig`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// `configuration` named no replicas.
    EmptyConfiguration,
    /// `configuration` named more replicas than the cluster size limit.
    TooManyReplicas,
    /// `own_replica` is not a valid index into `configuration`.
    ReplicaIndexOutOfRange,
    /// `sector_size` is not a power of two.
    InvalidSectorSize,
    /// `connection_capacity` does not exceed the replica count.
    ConnectionCapacityTooSmall,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyConfiguration => write!(f, "configuration names no replicas"),
            ConfigError::TooManyReplicas => write!(f, "configuration names too many replicas"),
            ConfigError::ReplicaIndexOutOfRange => {
                write!(f, "own_replica is out of range for configuration")
            }
            ConfigError::InvalidSectorSize => write!(f, "sector_size must be a power of two"),
            ConfigError::ConnectionCapacityTooSmall => write!(
                f,
                "connection_capacity must exceed the number of replicas"
            ),
        }
    }
}

impl Error for ConfigError {}

/// Errors surfaced by connection-level I/O. These never propagate past the
/// connection that raised them: the bus logs and shuts the connection down.
#[derive(Debug)]
pub enum BusError {
    /// The underlying socket operation failed.
    Io(std::io::Error),
    /// A received header failed validation.
    Header(HeaderError),
    /// A received body's checksum did not match the header's.
    InvalidBodyChecksum,
    /// The peer's cluster id did not match ours.
    WrongCluster,
    /// A command arrived that is illegal for the connection's current peer
    /// classification (e.g. a non-`request` command from a client).
    CommandForbiddenForPeer,
    /// An `unknown` peer's first header claimed a replica index that is out
    /// of range for the cluster configuration, or this node's own index.
    InvalidReplicaIndex,
    /// `configuration` or another init-time invariant was violated.
    Config(ConfigError),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Io(e) => write!(f, "I/O error: {e}"),
            BusError::Header(e) => write!(f, "invalid header: {e}"),
            BusError::InvalidBodyChecksum => write!(f, "invalid body checksum"),
            BusError::WrongCluster => write!(f, "peer's cluster id does not match ours"),
            BusError::CommandForbiddenForPeer => {
                write!(f, "command is not valid for this peer's classification")
            }
            BusError::InvalidReplicaIndex => {
                write!(f, "claimed replica index is out of range or refers to this node")
            }
            BusError::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl Error for BusError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BusError::Io(e) => Some(e),
            BusError::Header(e) => Some(e),
            BusError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Io(err)
    }
}

impl From<HeaderError> for BusError {
    fn from(err: HeaderError) -> Self {
        BusError::Header(err)
    }
}

impl From<ConfigError> for BusError {
    fn from(err: ConfigError) -> Self {
        BusError::Config(err)
    }
}

impl PartialEq for BusError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BusError::Io(a), BusError::Io(b)) => a.kind() == b.kind(),
            (BusError::Header(a), BusError::Header(b)) => a == b,
            (BusError::InvalidBodyChecksum, BusError::InvalidBodyChecksum) => true,
            (BusError::WrongCluster, BusError::WrongCluster) => true,
            (BusError::CommandForbiddenForPeer, BusError::CommandForbiddenForPeer) => true,
            (BusError::InvalidReplicaIndex, BusError::InvalidReplicaIndex) => true,
            (BusError::Config(a), BusError::Config(b)) => a == b,
            _ => false,
        }
    }
}
