//! The 128-byte message header.
//!
//! The header is the fixed-size prefix of every message on the wire: a
//! length-prefixed, self-validating record carrying two checksums plus the
//! routing and VSR bookkeeping fields every command needs. See the byte
//! layout table below; field order and sizes are load-bearing (the header
//! is read and written as raw bytes, not through a serde encoding).
//!
//! | Offset | Size | Field          |
//! |--------|------|----------------|
//! | 0      | 16   | checksum       |
//! | 16     | 16   | checksum_body  |
//! | 32     | 16   | parent         |
//! | 48     | 16   | client         |
//! | 64     | 16   | context        |
//! | 80     | 4    | request        |
//! | 84     | 4    | cluster        |
//! | 88     | 4    | epoch          |
//! | 92     | 4    | view           |
//! | 96     | 8    | op             |
//! | 104    | 8    | commit         |
//! | 112    | 8    | offset         |
//! | 120    | 4    | size           |
//! | 124    | 1    | replica        |
//! | 125    | 1    | command        |
//! | 126    | 1    | operation      |
//! | 127    | 1    | version        |

use super::checksum;
use super::command::{Command, Operation};
use super::message::MESSAGE_SIZE_MAX;

/// Protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 0;

/// Size of the message header in bytes.
pub const HEADER_SIZE: u32 = 128;

const HEADER_SIZE_USIZE: usize = HEADER_SIZE as usize;

/// Wire-format message header (128 bytes, little-endian, `repr(C)`).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Header {
    /// Checksum over bytes `[16..128)` of this header.
    pub checksum: u128,
    /// Checksum over the message body.
    pub checksum_body: u128,
    /// Hash-chain backpointer to the parent message.
    pub parent: u128,
    /// 128-bit client identifier.
    pub client: u128,
    /// Command-specific cryptographic context.
    pub context: u128,
    /// Monotonic per-client request number.
    pub request: u32,
    /// Cluster identifier.
    pub cluster: u32,
    /// Reconfiguration epoch; must be zero.
    pub epoch: u32,
    /// Sender's current view.
    pub view: u32,
    /// Op number.
    pub op: u64,
    /// Latest committed op.
    pub commit: u64,
    /// Journal offset.
    pub offset: u64,
    /// Header size plus body size.
    pub size: u32,
    /// Authoring replica index.
    pub replica: u8,
    /// VSR command tag.
    pub command: u8,
    /// State-machine operation tag.
    pub operation: u8,
    /// Protocol version.
    pub version: u8,
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE_USIZE);

impl Default for Header {
    fn default() -> Self {
        Self {
            checksum: 0,
            checksum_body: 0,
            parent: 0,
            client: 0,
            context: 0,
            request: 0,
            cluster: 0,
            epoch: 0,
            view: 0,
            op: 0,
            commit: 0,
            offset: 0,
            size: HEADER_SIZE,
            replica: 0,
            command: Command::Reserved as u8,
            operation: Operation::Reserved as u8,
            version: PROTOCOL_VERSION,
        }
    }
}

impl Header {
    /// Create a default header stamped with the given cluster id.
    pub fn new(cluster: u32) -> Self {
        Self {
            cluster,
            ..Default::default()
        }
    }

    /// The command tag, if it names a known VSR command.
    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    /// Set the command tag.
    pub fn set_command(&mut self, command: Command) {
        self.command = command as u8;
    }

    /// The operation tag, if it names a known VSR-reserved operation
    /// (values belonging to the embedded state machine are opaque here).
    pub fn operation(&self) -> Option<Operation> {
        Operation::try_from(self.operation).ok()
    }

    /// Set the operation tag.
    pub fn set_operation(&mut self, operation: Operation) {
        self.operation = operation as u8;
    }

    /// Compute the header checksum (covers bytes `[16..128)`).
    pub fn calculate_checksum(&self) -> u128 {
        checksum::checksum(&self.as_bytes()[16..])
    }

    /// Compute the checksum of `body`.
    pub fn calculate_checksum_body(&self, body: &[u8]) -> u128 {
        checksum::checksum(body)
    }

    /// Set the header checksum. Must be called after `set_checksum_body`,
    /// since the header checksum covers the stored body checksum field.
    pub fn set_checksum(&mut self) {
        self.checksum = self.calculate_checksum();
    }

    /// Set the body checksum.
    pub fn set_checksum_body(&mut self, body: &[u8]) {
        self.checksum_body = self.calculate_checksum_body(body);
    }

    /// Whether the stored header checksum matches the computed one.
    pub fn valid_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// Whether the stored body checksum matches `body`.
    pub fn valid_checksum_body(&self, body: &[u8]) -> bool {
        self.checksum_body == self.calculate_checksum_body(body)
    }

    /// View this header as its 128 raw bytes.
    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE_USIZE] {
        unsafe { &*(self as *const Header as *const [u8; HEADER_SIZE_USIZE]) }
    }

    /// View this header as its 128 raw bytes, mutably.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; HEADER_SIZE_USIZE] {
        unsafe { &mut *(self as *mut Header as *mut [u8; HEADER_SIZE_USIZE]) }
    }

    /// Alias a header over an existing 128-byte buffer.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE_USIZE]) -> &Header {
        unsafe { &*(bytes.as_ptr() as *const Header) }
    }

    /// Alias a mutable header over an existing 128-byte buffer.
    pub fn from_bytes_mut(bytes: &mut [u8; HEADER_SIZE_USIZE]) -> &mut Header {
        unsafe { &mut *(bytes.as_mut_ptr() as *mut Header) }
    }

    /// Validate the header-wide invariants common to every command:
    /// `HEADER_SIZE <= size <= MESSAGE_SIZE_MAX`, `epoch == 0`,
    /// `version == PROTOCOL_VERSION`, and the command tag must be a known
    /// value.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.size < HEADER_SIZE {
            return Err(HeaderError::SizeTooSmall);
        }
        if self.size > MESSAGE_SIZE_MAX {
            return Err(HeaderError::SizeTooLarge);
        }
        if self.epoch != 0 {
            return Err(HeaderError::InvalidEpoch);
        }
        if self.version != PROTOCOL_VERSION {
            return Err(HeaderError::ProtocolMismatch);
        }
        let command = self.command().ok_or(HeaderError::InvalidCommand)?;
        self.validate_command(command)
    }

    /// Per-command field validation, per the wire contract:
    ///
    /// - `reserved`: every field besides `size`/`command`/`version` must be
    ///   zero — it is never a message actually sent on the wire.
    /// - `request`: `client` must be non-zero; `op`, `commit`, `offset`,
    ///   `replica`, and `parent` must be zero. If `operation == register`,
    ///   `context` and `request` must both be zero; for any other
    ///   operation, both must be non-zero.
    /// - `prepare`: `op` must be non-zero (never prepares the root); `view`
    ///   is the view in which it was prepared.
    /// - `prepare_ok`: `op` and `commit` must be consistent
    ///   (`commit <= op`).
    fn validate_command(&self, command: Command) -> Result<(), HeaderError> {
        match command {
            Command::Reserved => {
                if self.parent != 0
                    || self.client != 0
                    || self.context != 0
                    || self.request != 0
                    || self.view != 0
                    || self.op != 0
                    || self.commit != 0
                    || self.offset != 0
                    || self.replica != 0
                {
                    return Err(HeaderError::InvalidField("reserved command carries data"));
                }
                Ok(())
            }
            Command::Request => {
                if self.client == 0 {
                    return Err(HeaderError::InvalidField("request.client must be non-zero"));
                }
                if self.op != 0 || self.commit != 0 || self.offset != 0 || self.replica != 0 {
                    return Err(HeaderError::InvalidField(
                        "request.op/commit/offset/replica must be zero",
                    ));
                }
                if self.parent != 0 {
                    return Err(HeaderError::InvalidField("request.parent must be zero"));
                }
                match self.operation() {
                    Some(Operation::Register) => {
                        if self.context != 0 || self.request != 0 {
                            return Err(HeaderError::InvalidField(
                                "register request.context/request must be zero",
                            ));
                        }
                    }
                    _ => {
                        if self.context == 0 || self.request == 0 {
                            return Err(HeaderError::InvalidField(
                                "non-register request.context/request must be non-zero",
                            ));
                        }
                    }
                }
                Ok(())
            }
            Command::Prepare => {
                if self.op == 0 {
                    return Err(HeaderError::InvalidField("prepare.op must be non-zero"));
                }
                if self.commit > self.op {
                    return Err(HeaderError::InvalidField("prepare.commit must be <= op"));
                }
                Ok(())
            }
            Command::PrepareOk => {
                if self.op == 0 {
                    return Err(HeaderError::InvalidField("prepare_ok.op must be non-zero"));
                }
                if self.commit > self.op {
                    return Err(HeaderError::InvalidField(
                        "prepare_ok.commit must be <= op",
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Header validation errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderError {
    /// `epoch` field is non-zero.
    InvalidEpoch,
    /// `size` is smaller than `HEADER_SIZE`.
    SizeTooSmall,
    /// `size` exceeds `MESSAGE_SIZE_MAX`.
    SizeTooLarge,
    /// `version` does not match `PROTOCOL_VERSION`.
    ProtocolMismatch,
    /// `command` is not a known tag.
    InvalidCommand,
    /// A command-specific field violates the wire contract.
    InvalidField(&'static str),
    /// Stored header checksum does not match the computed one.
    InvalidChecksum,
    /// Stored body checksum does not match the computed one.
    InvalidBodyChecksum,
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::InvalidEpoch => write!(f, "epoch must be zero"),
            HeaderError::SizeTooSmall => write!(f, "size smaller than header size"),
            HeaderError::SizeTooLarge => write!(f, "size exceeds the maximum message size"),
            HeaderError::ProtocolMismatch => write!(f, "protocol version mismatch"),
            HeaderError::InvalidCommand => write!(f, "unknown command tag"),
            HeaderError::InvalidField(msg) => write!(f, "{msg}"),
            HeaderError::InvalidChecksum => write!(f, "invalid header checksum"),
            HeaderError::InvalidBodyChecksum => write!(f, "invalid body checksum"),
        }
    }
}

impl std::error::Error for HeaderError {}
