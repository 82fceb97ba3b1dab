//! Message buffers: a header-plus-body allocation aligned to the sector
//! size so the same memory could later back unbuffered journal I/O.
//!
//! Reference counting is `Rc<Message>`: a message is created, handed to its
//! first holder as an owned `Rc` (strong count 1), and every additional
//! holder (a send queue slot, an in-flight `on_message` call) is a clone.
//! The buffer is freed when the last `Rc` drops. There is no window where a
//! message exists with zero owners.

use std::alloc::{self, Layout};
use std::rc::Rc;

use super::checksum;
use super::header::{Header, HEADER_SIZE};

/// Maximum message size (1 MiB). `Header::validate` rejects any header
/// whose `size` exceeds this, so it is also the largest receive buffer a
/// connection will ever allocate for an inbound message.
pub const MESSAGE_SIZE_MAX: u32 = 1024 * 1024;

/// Maximum body size.
pub const MESSAGE_BODY_SIZE_MAX: u32 = MESSAGE_SIZE_MAX - HEADER_SIZE;

/// Default sector alignment for message buffers.
pub const DEFAULT_SECTOR_SIZE: usize = 512;

/// A header-plus-body buffer, aligned to `sector_size` and sized to
/// exactly `header.size` bytes. The header is an aliased view over the
/// first 128 bytes of the buffer.
pub struct Message {
    ptr: *mut u8,
    len: usize,
    layout: Layout,
}

impl Message {
    /// Allocate a zeroed, sector-aligned buffer of exactly `size` bytes
    /// with a default header stamped in, and return it already owned by
    /// the caller (strong count 1).
    ///
    /// `size` must be at least `HEADER_SIZE`; `sector_size` must be a
    /// power of two.
    pub fn create(size: u32, sector_size: usize) -> Rc<Message> {
        assert!(size >= HEADER_SIZE, "message size below header size");
        assert!(sector_size.is_power_of_two(), "sector_size must be a power of two");

        let len = size as usize;
        let layout = Layout::from_size_align(len, sector_size)
            .expect("message size/alignment produces a valid layout");
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }

        let mut message = Message { ptr, len, layout };
        *message.header_mut() = Header {
            size,
            ..Header::default()
        };
        Rc::new(message)
    }

    /// Allocate a header-only message (`size == HEADER_SIZE`), copy `header`
    /// in, compute the checksum over the empty body, then the header
    /// checksum, and return it finalized and ready to send.
    pub fn create_header_only(header: Header, sector_size: usize) -> Rc<Message> {
        let mut message = Message::create(HEADER_SIZE, sector_size);
        let msg = Rc::get_mut(&mut message).expect("freshly created message is uniquely owned");
        *msg.header_mut() = header;
        msg.finalize();
        message
    }

    /// The message's header.
    pub fn header(&self) -> &Header {
        unsafe { &*(self.ptr as *const Header) }
    }

    /// The message's header, mutably.
    pub fn header_mut(&mut self) -> &mut Header {
        unsafe { &mut *(self.ptr as *mut Header) }
    }

    /// The message body (everything past the 128-byte header).
    pub fn body(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.add(HEADER_SIZE as usize), self.body_len()) }
    }

    /// The message body, mutably.
    pub fn body_mut(&mut self) -> &mut [u8] {
        let body_len = self.body_len();
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(HEADER_SIZE as usize), body_len) }
    }

    fn body_len(&self) -> usize {
        self.len - HEADER_SIZE as usize
    }

    /// The entire buffer (header plus body) as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// The entire buffer as mutable bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Total message size in bytes (header plus body).
    pub fn len(&self) -> u32 {
        self.len as u32
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.body_len() == 0
    }

    /// Compute and store the body checksum, then the header checksum, in
    /// that order (the header checksum covers the stored body checksum).
    pub fn finalize(&mut self) {
        let body_checksum = checksum::checksum(self.body());
        self.header_mut().checksum_body = body_checksum;
        self.header_mut().set_checksum();
    }

    /// Validate both checksums.
    pub fn validate(&self) -> Result<(), MessageError> {
        if !self.header().valid_checksum() {
            return Err(MessageError::InvalidHeaderChecksum);
        }
        if !self.header().valid_checksum_body(self.body()) {
            return Err(MessageError::InvalidBodyChecksum);
        }
        Ok(())
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("header", self.header())
            .field("body_len", &self.body_len())
            .finish()
    }
}

/// Message validation errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageError {
    /// Stored header checksum does not match the computed one.
    InvalidHeaderChecksum,
    /// Stored body checksum does not match the computed one.
    InvalidBodyChecksum,
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::InvalidHeaderChecksum => write!(f, "invalid header checksum"),
            MessageError::InvalidBodyChecksum => write!(f, "invalid body checksum"),
        }
    }
}

impl std::error::Error for MessageError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::Command;

    #[test]
    fn create_yields_zeroed_body_of_requested_size() {
        let m = Message::create(HEADER_SIZE + 16, DEFAULT_SECTOR_SIZE);
        assert_eq!(m.len(), HEADER_SIZE + 16);
        assert_eq!(m.body().len(), 16);
        assert!(m.body().iter().all(|&b| b == 0));
    }

    #[test]
    fn created_message_is_singly_owned() {
        let m = Message::create(HEADER_SIZE, DEFAULT_SECTOR_SIZE);
        assert_eq!(Rc::strong_count(&m), 1);
        let cloned = Rc::clone(&m);
        assert_eq!(Rc::strong_count(&m), 2);
        drop(cloned);
        assert_eq!(Rc::strong_count(&m), 1);
    }

    #[test]
    fn finalize_then_validate_round_trips() {
        let mut m = Message::create(HEADER_SIZE + 4, DEFAULT_SECTOR_SIZE);
        {
            let msg = Rc::get_mut(&mut m).unwrap();
            msg.header_mut().cluster = 42;
            msg.body_mut().copy_from_slice(&[1, 2, 3, 4]);
            msg.finalize();
        }
        assert!(m.validate().is_ok());
    }

    #[test]
    fn corrupting_body_after_finalize_fails_validation() {
        let mut m = Message::create(HEADER_SIZE + 4, DEFAULT_SECTOR_SIZE);
        {
            let msg = Rc::get_mut(&mut m).unwrap();
            msg.body_mut().copy_from_slice(&[1, 2, 3, 4]);
            msg.finalize();
        }
        {
            let msg = Rc::get_mut(&mut m).unwrap();
            msg.body_mut()[0] ^= 0xFF;
        }
        assert_eq!(m.validate(), Err(MessageError::InvalidBodyChecksum));
    }

    #[test]
    fn header_only_message_is_finalized_and_valid() {
        let mut header = Header::new(7);
        header.set_command(Command::Ping);
        let m = Message::create_header_only(header, DEFAULT_SECTOR_SIZE);
        assert_eq!(m.len(), HEADER_SIZE);
        assert!(m.validate().is_ok());
        assert_eq!(m.header().cluster, 7);
        assert_eq!(m.header().command, Command::Ping as u8);
    }

    #[test]
    fn buffer_is_aligned_to_sector_size() {
        let m = Message::create(HEADER_SIZE + 100, 512);
        assert_eq!(m.as_bytes().as_ptr() as usize % 512, 0);
    }
}
