//! Per-socket state machine: owns at most one connection's file descriptor,
//! drives its peer identification, and runs the receive and send pipelines.
//!
//! Each `Connection` is wrapped by its owner (`MessageBus`) in
//! `Rc<RefCell<Connection>>` and driven by two `tokio_uring::spawn`ed
//! tasks — one per pipeline — rather than by literal completion-slot
//! callbacks. The socket itself lives in its own inner `Rc<RefCell<Option<TcpStream>>>`,
//! separate from the connection's other state (`state`, `peer`, `send_queue`):
//! `recv_header`/`recv_body`/`send_exact` hold a borrow of *that* cell across
//! a single I/O `.await`, which is sound on `tokio_uring`'s single-threaded
//! executor, but never a borrow of the outer `Connection`
//! itself — the recv and send pipelines run concurrently and would
//! otherwise deadlock against each other's long-lived borrow the first time
//! one blocked on I/O while the other touched `state` or `send_queue`.
//! Every task re-checks `state` immediately after each `.await` returns,
//! since other completions may have run while it was suspended.

use std::cell::RefCell;
use std::net::Shutdown;
use std::rc::Rc;

use tokio::sync::Notify;
use tokio_uring::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::error::BusError;
use crate::peer::Peer;
use crate::protocol::{Command, Header, Message, HEADER_SIZE};
use crate::ring_buffer::RingBuffer;

/// Capacity of a connection's outbound send queue.
pub const SEND_QUEUE_CAPACITY: usize = 3;

/// A connection's lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnState {
    /// No socket attached; available for accept or connect.
    Idle,
    /// An accept has been reserved on this slot; waiting for completion.
    Accepting,
    /// An outbound connect is in flight.
    Connecting,
    /// Socket established, pipelines running.
    Connected,
    /// Half-closing; draining in-flight I/O before the fd is released.
    ShuttingDown,
}

/// A single pooled connection slot.
pub struct Connection {
    /// Lifecycle state. Public so integration tests can drive a bare
    /// `Connection` directly without going through a full `MessageBus`.
    pub state: ConnState,
    /// Identity of whatever is on the other end, once known.
    pub peer: Peer,
    stream: Rc<RefCell<Option<TcpStream>>>,
    send_queue: RingBuffer,
    send_notify: Notify,
    sector_size: usize,
    /// Number of pipeline tasks (recv, send) still running against this
    /// connection's current generation. `close()` must not run while this
    /// is nonzero: one of the two tasks may be mid-`.await` holding a
    /// borrow of `stream`.
    pending_pipelines: u8,
}

impl Connection {
    /// Create an idle, unattached connection slot.
    pub fn new(sector_size: usize) -> Self {
        Self {
            state: ConnState::Idle,
            peer: Peer::None,
            stream: Rc::new(RefCell::new(None)),
            send_queue: RingBuffer::new(SEND_QUEUE_CAPACITY),
            send_notify: Notify::new(),
            sector_size,
            pending_pipelines: 0,
        }
    }

    /// Whether this slot has no socket attached.
    pub fn is_idle(&self) -> bool {
        self.state == ConnState::Idle && self.peer.is_none()
    }

    /// Attach a freshly accepted or connected socket and move to `Connected`.
    pub fn attach(&mut self, stream: TcpStream, peer: Peer) {
        let _ = stream.set_nodelay(true);
        *self.stream.borrow_mut() = Some(stream);
        self.peer = peer;
        self.state = ConnState::Connected;
    }

    /// Reserve this idle slot for an outbound connect attempt.
    pub fn begin_connecting(&mut self, peer: Peer) {
        debug_assert!(self.is_idle());
        self.state = ConnState::Connecting;
        self.peer = peer;
    }

    /// Reserve this idle slot for an inbound accept.
    pub fn begin_accepting(&mut self) {
        debug_assert!(self.is_idle());
        self.state = ConnState::Accepting;
    }

    /// A cloned handle to this connection's socket cell, for pipeline tasks
    /// to hold across their own I/O `.await`s without borrowing the rest of
    /// `Connection`.
    pub fn stream_handle(&self) -> Rc<RefCell<Option<TcpStream>>> {
        self.stream.clone()
    }

    /// Mark two pipeline tasks (recv, send) as about to start running
    /// against this connection's current generation.
    pub fn begin_pipelines(&mut self) {
        self.pending_pipelines = 2;
    }

    /// Called by a pipeline task as it returns. Returns `true` exactly once,
    /// for whichever of the two tasks finishes last — only then is it safe
    /// to release the socket and reset the slot.
    pub fn pipeline_exited(&mut self) -> bool {
        self.pending_pipelines = self.pending_pipelines.saturating_sub(1);
        self.pending_pipelines == 0
    }

    /// Whether a recv or send pipeline task is still running against this
    /// connection's current generation.
    pub fn has_pending_pipelines(&self) -> bool {
        self.pending_pipelines != 0
    }

    /// Queue `message` for transmission. Fails (and hands the message back)
    /// if the send queue is already at `SEND_QUEUE_CAPACITY`, or silently
    /// drops it if the connection is shutting down, returning `Ok(())` —
    /// callers treat that the same as a successful enqueue that was lost to
    /// a closing peer.
    pub fn send_message(&mut self, message: Rc<Message>) -> Result<(), Rc<Message>> {
        if self.state == ConnState::ShuttingDown {
            return Ok(());
        }
        let was_empty = self.send_queue.empty();
        self.send_queue.push(message)?;
        if was_empty {
            self.send_notify.notify_one();
        }
        Ok(())
    }

    /// Read exactly `HEADER_SIZE` bytes into a fresh header buffer,
    /// tolerating short reads. Returns `Ok(None)` on orderly close.
    pub async fn recv_header(
        stream: &Rc<RefCell<Option<TcpStream>>>,
    ) -> Result<Option<[u8; HEADER_SIZE as usize]>, BusError> {
        let mut scratch = vec![0u8; HEADER_SIZE as usize];
        let mut progress = 0usize;
        while progress < scratch.len() {
            let buf = std::mem::take(&mut scratch);
            // SAFETY (single-threaded): this borrow of the socket cell lives
            // only across the one `.await` below; no other task polls
            // concurrently on this thread, and no other code ever takes a
            // borrow of `stream` spanning an `.await` except this family of
            // functions, which only ever hold a shared borrow.
            #[allow(clippy::await_holding_refcell_ref)]
            let (result, buf): (std::io::Result<usize>, Vec<u8>) = {
                let guard = stream.borrow();
                let s = guard.as_ref().expect("recv on unattached connection");
                s.read(buf).await
            };
            scratch = buf;
            let n = result?;
            if n == 0 {
                return Ok(None);
            }
            progress += n;
            trace!(progress, total = scratch.len(), "header recv progress");
        }
        let mut header = [0u8; HEADER_SIZE as usize];
        header.copy_from_slice(&scratch);
        Ok(Some(header))
    }

    /// Read exactly `message.body().len()` bytes into `message`'s body,
    /// tolerating short reads. Returns `Ok(false)` on orderly close.
    pub async fn recv_body(
        stream: &Rc<RefCell<Option<TcpStream>>>,
        message: &mut Message,
    ) -> Result<bool, BusError> {
        let body_len = message.body().len();
        let mut progress = 0usize;
        while progress < body_len {
            let remaining = body_len - progress;
            let chunk = vec![0u8; remaining];
            #[allow(clippy::await_holding_refcell_ref)]
            let (result, chunk): (std::io::Result<usize>, Vec<u8>) = {
                let guard = stream.borrow();
                let s = guard.as_ref().expect("recv on unattached connection");
                s.read(chunk).await
            };
            let n = result?;
            if n == 0 {
                return Ok(false);
            }
            message.body_mut()[progress..progress + n].copy_from_slice(&chunk[..n]);
            progress += n;
        }
        Ok(true)
    }

    /// Drive the send queue until the connection starts shutting down,
    /// writing the head message's remaining bytes and popping it once fully
    /// written, then waiting on `send_notify` for the next push.
    pub async fn run_send_pipeline(connection: &Rc<RefCell<Connection>>) {
        let stream = connection.borrow().stream_handle();
        loop {
            let head = {
                let conn = connection.borrow();
                if conn.state == ConnState::ShuttingDown {
                    return;
                }
                conn.send_queue.peek().cloned()
            };

            let Some(message) = head else {
                // Wait until a push happens or we're asked to shut down.
                let notified = connection.borrow().send_notify.notified();
                notified.await;
                if connection.borrow().state == ConnState::ShuttingDown {
                    return;
                }
                continue;
            };

            if let Err(err) = Self::send_exact(&stream, message.as_bytes()).await {
                warn!(%err, "send failed, shutting down connection");
                connection.borrow_mut().initiate_shutdown();
                return;
            }

            connection.borrow_mut().send_queue.pop();
        }
    }

    async fn send_exact(
        stream: &Rc<RefCell<Option<TcpStream>>>,
        bytes: &[u8],
    ) -> Result<(), BusError> {
        let mut progress = 0usize;
        while progress < bytes.len() {
            let chunk = bytes[progress..].to_vec();
            // SAFETY (single-threaded): see `recv_header` above.
            #[allow(clippy::await_holding_refcell_ref)]
            let (result, _buf): (std::io::Result<usize>, Vec<u8>) = {
                let guard = stream.borrow();
                let s = guard.as_ref().expect("send on unattached connection");
                s.write(chunk).submit().await
            };
            let n = result?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            progress += n;
        }
        Ok(())
    }

    /// Begin a half-close: `SHUT_RDWR` on the socket (tolerating
    /// `ENOTCONN`, which can happen if shutdown races an in-flight
    /// connect), transition to `ShuttingDown`, and wake the send pipeline
    /// so it notices and exits.
    pub fn initiate_shutdown(&mut self) {
        if self.state == ConnState::ShuttingDown {
            return;
        }
        if let Some(stream) = self.stream.borrow().as_ref() {
            if let Err(err) = shutdown_both(stream) {
                if err.kind() != std::io::ErrorKind::NotConnected {
                    debug!(%err, "shutdown failed");
                }
            }
        }
        self.state = ConnState::ShuttingDown;
        self.send_queue.clear();
        self.send_notify.notify_one();
    }

    /// Release the socket and reset to the initial idle state. Must only be
    /// called once no pipeline task is running against this connection —
    /// either because none were ever spawned (a connect or accept attempt
    /// failed before a socket existed) or because `pipeline_exited` has
    /// reported both tasks finished.
    pub fn close(&mut self) {
        self.stream.borrow_mut().take();
        self.peer = Peer::None;
        self.state = ConnState::Idle;
        self.send_queue.clear();
        self.pending_pipelines = 0;
    }

    /// The sector size new incoming messages on this connection should be
    /// allocated with.
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }
}

fn shutdown_both(stream: &TcpStream) -> std::io::Result<()> {
    use std::os::unix::io::{AsRawFd, FromRawFd};
    // `tokio_uring::net::TcpStream` has no native shutdown op; borrow the fd
    // just long enough to issue a standard-library shutdown on it.
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(stream.as_raw_fd()) };
    let result = std_stream.shutdown(Shutdown::Both);
    std::mem::forget(std_stream);
    result
}

/// Validate a freshly received header against connection-scoped rules that
/// depend on this peer's classification (not the bus-wide rules in
/// `Header::validate`, which is called first).
///
/// For an `unknown` peer this also rejects headers that would make
/// first-header identification (§4.5 step 6) produce an out-of-range or
/// self-referential replica index — `header.replica` is attacker-controlled
/// (the checksum key is public), so it must be range-checked before it is
/// ever used to index `replicas[]`.
pub fn validate_for_peer(
    header: &Header,
    peer: Peer,
    own_cluster: u32,
    replica_count: u16,
    own_replica: u16,
) -> Result<(), BusError> {
    if peer.is_unknown() {
        if header.cluster != own_cluster {
            return Err(BusError::WrongCluster);
        }
        let command = header.command().ok_or(BusError::CommandForbiddenForPeer)?;
        if command != Command::Request {
            let claimed = header.replica as u16;
            if claimed >= replica_count || claimed == own_replica {
                return Err(BusError::InvalidReplicaIndex);
            }
        }
        return Ok(());
    }
    let command = header.command().ok_or(BusError::CommandForbiddenForPeer)?;
    if peer.is_client() && command != Command::Request {
        return Err(BusError::CommandForbiddenForPeer);
    }
    if peer.replica_index().is_some() && command == Command::Request {
        return Err(BusError::CommandForbiddenForPeer);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, DEFAULT_SECTOR_SIZE};

    #[test]
    fn new_connection_is_idle() {
        let conn = Connection::new(DEFAULT_SECTOR_SIZE);
        assert!(conn.is_idle());
        assert_eq!(conn.peer, Peer::None);
    }

    #[test]
    fn send_message_rejects_past_capacity() {
        let mut conn = Connection::new(DEFAULT_SECTOR_SIZE);
        conn.peer = Peer::Replica { index: 1 };
        conn.state = ConnState::Connected;
        for _ in 0..SEND_QUEUE_CAPACITY {
            let m = Message::create_header_only(Header::default(), DEFAULT_SECTOR_SIZE);
            conn.send_message(m).expect("within capacity");
        }
        let overflow = Message::create_header_only(Header::default(), DEFAULT_SECTOR_SIZE);
        assert!(conn.send_message(overflow).is_err());
    }

    #[test]
    fn send_message_on_shutting_down_connection_is_silently_dropped() {
        let mut conn = Connection::new(DEFAULT_SECTOR_SIZE);
        conn.state = ConnState::ShuttingDown;
        let m = Message::create_header_only(Header::default(), DEFAULT_SECTOR_SIZE);
        assert!(conn.send_message(m).is_ok());
    }

    #[test]
    fn pipeline_exited_reports_true_only_on_the_second_call() {
        let mut conn = Connection::new(DEFAULT_SECTOR_SIZE);
        conn.begin_pipelines();
        assert!(!conn.pipeline_exited());
        assert!(conn.pipeline_exited());
    }

    #[test]
    fn close_is_safe_with_no_pipelines_ever_started() {
        let mut conn = Connection::new(DEFAULT_SECTOR_SIZE);
        conn.state = ConnState::Connecting;
        conn.peer = Peer::Replica { index: 2 };
        conn.close();
        assert!(conn.is_idle());
    }

    #[test]
    fn validate_for_peer_rejects_wrong_cluster_for_unknown_peer() {
        let mut header = Header::new(99);
        header.set_command(Command::Request);
        header.client = 1;
        header.context = 1;
        header.request = 1;
        header.operation = 138;
        assert_eq!(
            validate_for_peer(&header, Peer::Unknown, 1, 3, 0),
            Err(BusError::WrongCluster)
        );
    }

    #[test]
    fn validate_for_peer_rejects_out_of_range_replica_index_for_unknown_peer() {
        let mut header = Header::new(1);
        header.set_command(Command::Ping);
        header.replica = 5;
        assert_eq!(
            validate_for_peer(&header, Peer::Unknown, 1, 3, 0),
            Err(BusError::InvalidReplicaIndex)
        );
    }

    #[test]
    fn validate_for_peer_rejects_self_replica_index_for_unknown_peer() {
        let mut header = Header::new(1);
        header.set_command(Command::Ping);
        header.replica = 0;
        assert_eq!(
            validate_for_peer(&header, Peer::Unknown, 1, 3, 0),
            Err(BusError::InvalidReplicaIndex)
        );
    }

    #[test]
    fn validate_for_peer_accepts_in_range_non_self_replica_index_for_unknown_peer() {
        let mut header = Header::new(1);
        header.set_command(Command::Ping);
        header.replica = 1;
        assert!(validate_for_peer(&header, Peer::Unknown, 1, 3, 0).is_ok());
    }

    #[test]
    fn validate_for_peer_rejects_request_from_replica_peer() {
        let mut header = Header::new(1);
        header.set_command(Command::Request);
        header.client = 1;
        assert_eq!(
            validate_for_peer(&header, Peer::Replica { index: 0 }, 1, 3, 1),
            Err(BusError::CommandForbiddenForPeer)
        );
    }

    #[test]
    fn validate_for_peer_allows_non_request_from_replica_peer() {
        let mut header = Header::new(1);
        header.set_command(Command::PingClient);
        assert!(validate_for_peer(&header, Peer::Replica { index: 0 }, 1, 3, 1).is_ok());
    }

    #[test]
    fn validate_for_peer_rejects_non_request_from_client_peer() {
        let header = {
            let mut h = Header::new(1);
            h.set_command(Command::Prepare);
            h.op = 1;
            h
        };
        assert_eq!(
            validate_for_peer(&header, Peer::Client { id: 1 }, 1, 3, 1),
            Err(BusError::CommandForbiddenForPeer)
        );
    }

    #[test]
    fn validate_for_peer_rejects_ping_client_from_client_peer() {
        let header = {
            let mut h = Header::new(1);
            h.set_command(Command::PingClient);
            h
        };
        assert_eq!(
            validate_for_peer(&header, Peer::Client { id: 1 }, 1, 3, 1),
            Err(BusError::CommandForbiddenForPeer)
        );
    }
}
