//! Wire format: header, checksum, command tags and the message buffer.

pub mod checksum;
pub mod command;
pub mod header;
pub mod message;

pub use checksum::checksum;
pub use command::{Command, Operation};
pub use header::{Header, HeaderError, HEADER_SIZE, PROTOCOL_VERSION};
pub use message::{
    Message, MessageError, DEFAULT_SECTOR_SIZE, MESSAGE_BODY_SIZE_MAX, MESSAGE_SIZE_MAX,
};
