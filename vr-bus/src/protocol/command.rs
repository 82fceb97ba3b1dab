//! VSR command and state-machine operation tags.

/// VSR command types — the message types replicas and clients exchange.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Command {
    /// Reserved/invalid command (default, zero value).
    #[default]
    Reserved = 0,
    /// Replica-to-replica liveness ping.
    Ping = 1,
    /// Replica-to-replica pong response.
    Pong = 2,
    /// Client-to-replica keepalive ping.
    PingClient = 3,
    /// Replica-to-client pong response.
    PongClient = 4,
    /// Client request message.
    Request = 5,
    /// Primary's prepare message to backups.
    Prepare = 6,
    /// Backup's acknowledgment of a prepare.
    PrepareOk = 7,
    /// Reply to a client request.
    Reply = 8,
    /// Commit notification from the primary.
    Commit = 9,
    /// Initiate a view change.
    StartViewChange = 10,
    /// View change proposal carrying log state.
    DoViewChange = 11,
    /// Request a peer start a new view.
    RequestStartView = 13,
    /// Request headers from a peer.
    RequestHeaders = 14,
    /// Request a specific prepare message.
    RequestPrepare = 15,
    /// Request a specific reply message.
    RequestReply = 16,
    /// Response carrying message headers.
    Headers = 17,
    /// Client eviction notification.
    Eviction = 18,
    /// Request storage blocks from a peer.
    RequestBlocks = 19,
    /// Response carrying a storage block.
    Block = 20,
    /// Announce a new view to the cluster.
    StartView = 24,
}

impl Command {
    /// Whether this command originates from or targets a client (as opposed
    /// to being strictly replica-to-replica).
    pub fn is_client_command(self) -> bool {
        matches!(self, Command::Request | Command::PingClient)
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Reserved),
            1 => Ok(Command::Ping),
            2 => Ok(Command::Pong),
            3 => Ok(Command::PingClient),
            4 => Ok(Command::PongClient),
            5 => Ok(Command::Request),
            6 => Ok(Command::Prepare),
            7 => Ok(Command::PrepareOk),
            8 => Ok(Command::Reply),
            9 => Ok(Command::Commit),
            10 => Ok(Command::StartViewChange),
            11 => Ok(Command::DoViewChange),
            13 => Ok(Command::RequestStartView),
            14 => Ok(Command::RequestHeaders),
            15 => Ok(Command::RequestPrepare),
            16 => Ok(Command::RequestReply),
            17 => Ok(Command::Headers),
            18 => Ok(Command::Eviction),
            19 => Ok(Command::RequestBlocks),
            20 => Ok(Command::Block),
            24 => Ok(Command::StartView),
            _ => Err(value),
        }
    }
}

/// State-machine operation tag carried in the header's `operation` byte.
///
/// Only the VSR-reserved tags are named here; operation values used by the
/// embedded replica's own state machine are opaque to the bus and are passed
/// through as their raw `u8`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Operation {
    /// Reserved/invalid operation (default, zero value).
    #[default]
    Reserved = 0,
    /// Root operation bootstrapping the log.
    Init = 1,
    /// Register a new client session.
    Register = 2,
}

impl TryFrom<u8> for Operation {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Operation::Reserved),
            1 => Ok(Operation::Init),
            2 => Ok(Operation::Register),
            _ => Err(value),
        }
    }
}
