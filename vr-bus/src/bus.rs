//! The message bus: owns the listening socket, the fixed-capacity
//! connection pool, the replica-index-to-connection map and the self-send
//! queue. Schedules accepts and outbound connects, and is the single entry
//! point the embedded replica uses to send messages.

use std::cell::RefCell;
use std::rc::Rc;

use tokio_uring::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::connection::{self, ConnState, Connection};
use crate::error::BusError;
use crate::peer::Peer;
use crate::protocol::{Command, Header, Message, HEADER_SIZE};
use crate::replica::ReplicaSink;
use crate::ring_buffer::RingBuffer;

struct Slot {
    connection: Rc<RefCell<Connection>>,
}

struct Inner<S: ReplicaSink> {
    config: BusConfig,
    listener: Option<TcpListener>,
    slots: Vec<Slot>,
    /// `replicas[r]` is the slot index designated for replica `r`, if any.
    replicas: Vec<Option<usize>>,
    /// Slot index currently reserved for an in-flight accept, if any.
    accept_slot: Option<usize>,
    self_send_queue: RingBuffer,
    sink: S,
}

/// Owns the networking side of a Viewstamped Replication node.
///
/// `MessageBus` is `!Send` and must be driven from inside a
/// `tokio_uring::start` runtime on a single thread; it holds no locks
/// because it needs none.
pub struct MessageBus<S: ReplicaSink> {
    inner: Rc<RefCell<Inner<S>>>,
}

impl<S: ReplicaSink + 'static> MessageBus<S> {
    /// Validate `config` and construct a bus with an empty, unbound
    /// connection pool. Call [`MessageBus::init`] before [`MessageBus::tick`].
    pub fn new(config: BusConfig, sink: S) -> Result<Self, BusError> {
        config.validate()?;
        let capacity = config.connection_capacity;
        let replica_count = config.replica_count() as usize;
        let sector_size = config.sector_size;

        let slots = (0..capacity)
            .map(|_| Slot {
                connection: Rc::new(RefCell::new(Connection::new(sector_size))),
            })
            .collect();

        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                config,
                listener: None,
                slots,
                replicas: vec![None; replica_count],
                accept_slot: None,
                self_send_queue: RingBuffer::new(crate::connection::SEND_QUEUE_CAPACITY),
                sink,
            })),
        })
    }

    /// Bind and listen on this replica's configured address.
    pub async fn init(&self) -> Result<(), BusError> {
        let addr = self.inner.borrow().config.own_address()?;
        let listener = TcpListener::bind(addr)?;
        info!(%addr, "message bus listening");
        self.inner.borrow_mut().listener = Some(listener);
        Ok(())
    }

    /// One round of the outer event loop: connect to every higher-indexed
    /// replica not already designated, then accept at most one inbound
    /// connection if a slot is free.
    ///
    /// Only connecting to higher-indexed replicas (never lower) prevents
    /// simultaneous mutual connects between two replicas; the residual
    /// race is resolved by duplicate-connection preemption in the receive
    /// pipeline.
    pub async fn tick(&self) {
        let own = self.inner.borrow().config.own_replica;
        let replica_count = self.inner.borrow().config.replica_count();
        for r in (own + 1)..replica_count {
            self.connect_to_replica(r).await;
        }
        self.maybe_accept().await;
    }

    async fn connect_to_replica(&self, replica: u16) {
        if self.inner.borrow().replicas[replica as usize].is_some() {
            return;
        }

        let idle_slot = {
            let inner = self.inner.borrow();
            inner
                .slots
                .iter()
                .position(|s| s.connection.borrow().is_idle())
        };

        let Some(slot_idx) = idle_slot else {
            if self.has_shutting_down_slot() {
                return;
            }
            self.evict_one().await;
            return;
        };

        let addr = self.inner.borrow().config.configuration[replica as usize];
        self.inner.borrow().slots[slot_idx]
            .connection
            .borrow_mut()
            .begin_connecting(Peer::Replica { index: replica });
        self.inner.borrow_mut().replicas[replica as usize] = Some(slot_idx);

        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let connection = self.inner.borrow().slots[slot_idx].connection.clone();
                connection
                    .borrow_mut()
                    .attach(stream, Peer::Replica { index: replica });
                self.spawn_pipelines(slot_idx);
            }
            Err(err) => {
                warn!(%err, replica, "connect failed");
                let connection = self.inner.borrow().slots[slot_idx].connection.clone();
                // No socket was ever attached and no pipelines were spawned,
                // so there is nothing to drain: close the slot directly
                // rather than parking it in `shutting_down` with no task
                // left to ever drive it back to `idle`.
                connection.borrow_mut().close();
                self.inner.borrow_mut().replicas[replica as usize] = None;
            }
        }
    }

    fn has_shutting_down_slot(&self) -> bool {
        self.inner
            .borrow()
            .slots
            .iter()
            .any(|s| s.connection.borrow().state == ConnState::ShuttingDown)
    }

    /// Free a slot for a waiting outbound connect: evict a client
    /// connection first, then an unidentified one. Replica connections are
    /// never evicted to make room for another replica.
    async fn evict_one(&self) {
        let inner = self.inner.borrow();
        let client_slot = inner
            .slots
            .iter()
            .position(|s| s.connection.borrow().peer.is_client());
        let unknown_slot = inner
            .slots
            .iter()
            .position(|s| s.connection.borrow().peer.is_unknown());
        let victim = client_slot.or(unknown_slot);
        drop(inner);

        if let Some(idx) = victim {
            debug!(slot = idx, "evicting connection to free a slot for a replica connect");
            let connection = self.inner.borrow().slots[idx].connection.clone();
            connection.borrow_mut().initiate_shutdown();
        }
    }

    async fn maybe_accept(&self) {
        if self.inner.borrow().accept_slot.is_some() {
            return;
        }
        if self.inner.borrow().listener.is_none() {
            return;
        }
        let idle_slot = {
            let inner = self.inner.borrow();
            inner
                .slots
                .iter()
                .position(|s| s.connection.borrow().is_idle())
        };
        let Some(slot_idx) = idle_slot else {
            return;
        };

        self.inner.borrow().slots[slot_idx]
            .connection
            .borrow_mut()
            .begin_accepting();
        self.inner.borrow_mut().accept_slot = Some(slot_idx);

        // Borrow only for the duration of this single `.await`; other
        // completions may run while this one is suspended.
        let accept_result = {
            let inner = self.inner.borrow();
            let listener = inner.listener.as_ref().expect("checked above");
            listener.accept().await
        };

        self.inner.borrow_mut().accept_slot = None;

        match accept_result {
            Ok((stream, addr)) => {
                debug!(%addr, slot = slot_idx, "accepted connection");
                let connection = self.inner.borrow().slots[slot_idx].connection.clone();
                connection.borrow_mut().attach(stream, Peer::Unknown);
                self.spawn_pipelines(slot_idx);
            }
            Err(err) => {
                warn!(%err, "accept failed");
                let connection = self.inner.borrow().slots[slot_idx].connection.clone();
                connection.borrow_mut().close();
            }
        }
    }

    fn spawn_pipelines(&self, slot_idx: usize) {
        let connection = self.inner.borrow().slots[slot_idx].connection.clone();
        connection.borrow_mut().begin_pipelines();

        let send_conn = connection.clone();
        let send_bus = self.inner.clone();
        tokio_uring::spawn(async move {
            Connection::run_send_pipeline(&send_conn).await;
            Self::pipeline_finished(&send_bus, slot_idx);
        });

        let bus = self.inner.clone();
        tokio_uring::spawn(async move {
            Self::run_recv_pipeline(bus.clone(), slot_idx).await;
            Self::pipeline_finished(&bus, slot_idx);
        });
    }

    /// Called by each pipeline task (recv, send) as it returns. Only once
    /// both have reported back is it safe to release the socket — one of
    /// them may otherwise still be mid-`.await` holding a borrow of it.
    fn pipeline_finished(bus: &Rc<RefCell<Inner<S>>>, slot_idx: usize) {
        let connection = bus.borrow().slots[slot_idx].connection.clone();
        if connection.borrow_mut().pipeline_exited() {
            Self::maybe_close(bus, slot_idx);
        }
    }

    /// The receive state machine: alternates reading a 128-byte header and
    /// a variable-length body, delivering each validated message to the
    /// sink, until the connection is shut down or the peer closes.
    async fn run_recv_pipeline(bus: Rc<RefCell<Inner<S>>>, slot_idx: usize) {
        let connection = bus.borrow().slots[slot_idx].connection.clone();
        let stream = connection.borrow().stream_handle();

        loop {
            if connection.borrow().state == ConnState::ShuttingDown {
                break;
            }

            let header_bytes = match Connection::recv_header(&stream).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!(slot = slot_idx, "peer closed connection");
                    connection.borrow_mut().initiate_shutdown();
                    break;
                }
                Err(err) => {
                    warn!(%err, slot = slot_idx, "header recv failed");
                    connection.borrow_mut().initiate_shutdown();
                    break;
                }
            };

            let header = *Header::from_bytes(&header_bytes);
            if let Err(err) = header.validate() {
                warn!(%err, slot = slot_idx, "invalid header, shutting down connection");
                connection.borrow_mut().initiate_shutdown();
                break;
            }

            let own_cluster = bus.borrow().config.cluster;
            let replica_count = bus.borrow().config.replica_count();
            let own_replica = bus.borrow().config.own_replica;
            let current_peer = connection.borrow().peer;
            if let Err(err) = connection::validate_for_peer(
                &header,
                current_peer,
                own_cluster,
                replica_count,
                own_replica,
            ) {
                warn!(%err, slot = slot_idx, "header rejected for peer, shutting down connection");
                connection.borrow_mut().initiate_shutdown();
                break;
            }

            if current_peer.is_unknown() {
                let new_peer = if header.command() == Some(Command::Request) {
                    Peer::Client { id: header.client }
                } else {
                    Peer::Replica { index: header.replica as u16 }
                };
                Self::identify_peer(&bus, slot_idx, new_peer);
            }

            let sector_size = connection.borrow().sector_size();
            let mut message = Message::create(header.size, sector_size);
            {
                let msg = Rc::get_mut(&mut message).expect("freshly created, uniquely owned");
                msg.as_bytes_mut()[..HEADER_SIZE as usize].copy_from_slice(&header_bytes);
            }

            let received = {
                let msg = Rc::get_mut(&mut message).expect("uniquely owned before delivery");
                Connection::recv_body(&stream, msg).await
            };
            match received {
                Ok(true) => {}
                Ok(false) => {
                    debug!(slot = slot_idx, "peer closed mid-body");
                    connection.borrow_mut().initiate_shutdown();
                    break;
                }
                Err(err) => {
                    warn!(%err, slot = slot_idx, "body recv failed");
                    connection.borrow_mut().initiate_shutdown();
                    break;
                }
            }

            if let Err(err) = message.validate() {
                warn!(%err, slot = slot_idx, "invalid body checksum, shutting down connection");
                connection.borrow_mut().initiate_shutdown();
                break;
            }

            bus.borrow_mut().sink.on_message(message);
        }
        // The caller (`spawn_pipelines`'s wrapper) calls `pipeline_finished`
        // once this task returns; the socket is only released once the send
        // pipeline has reported back too.
    }

    /// Resolve the first-header identification of a previously `unknown`
    /// peer, including duplicate-replica-connection preemption: if the
    /// replica slot this connection claims is already occupied by another
    /// connection, the newer (this) connection wins and the older one is
    /// shut down.
    ///
    /// Callers must have already run `connection::validate_for_peer`, which
    /// rejects a claimed replica index that is out of range or equal to
    /// this node's own index — both asserted here defensively since this
    /// function indexes `replicas[]` directly with it.
    fn identify_peer(bus: &Rc<RefCell<Inner<S>>>, slot_idx: usize, peer: Peer) {
        let connection = bus.borrow().slots[slot_idx].connection.clone();
        connection.borrow_mut().peer = peer;

        if let Peer::Replica { index } = peer {
            debug_assert!((index as usize) < bus.borrow().replicas.len());
            debug_assert_ne!(index, bus.borrow().config.own_replica);
            let previous = bus.borrow().replicas[index as usize];
            if let Some(previous_idx) = previous {
                if previous_idx != slot_idx {
                    let previous_conn = bus.borrow().slots[previous_idx].connection.clone();
                    if previous_conn.borrow().state != ConnState::ShuttingDown {
                        debug!(
                            replica = index,
                            old_slot = previous_idx,
                            new_slot = slot_idx,
                            "duplicate replica connection, preempting older one"
                        );
                        previous_conn.borrow_mut().initiate_shutdown();
                    }
                }
            }
            bus.borrow_mut().replicas[index as usize] = Some(slot_idx);
        }
    }

    /// Release a slot's socket and clear any stale `replicas[]` entry
    /// pointing at it. Only called from `pipeline_finished` once both the
    /// recv and send pipelines have reported back, so no task can still be
    /// holding a borrow of the socket.
    fn maybe_close(bus: &Rc<RefCell<Inner<S>>>, slot_idx: usize) {
        let connection = bus.borrow().slots[slot_idx].connection.clone();
        let replica_index = connection.borrow().peer.replica_index();
        connection.borrow_mut().close();

        if let Some(index) = replica_index {
            let mut inner = bus.borrow_mut();
            if inner.replicas[index as usize] == Some(slot_idx) {
                inner.replicas[index as usize] = None;
            }
        }
    }

    /// Allocate a sector-aligned, zeroed message of exactly `size` bytes,
    /// owned solely by the caller.
    pub fn create_message(&self, size: u32) -> Rc<Message> {
        Message::create(size, self.inner.borrow().config.sector_size)
    }

    /// Take an additional reference on `message` (a thin `Rc::clone`).
    pub fn ref_message(&self, message: &Rc<Message>) -> Rc<Message> {
        Rc::clone(message)
    }

    /// Release a reference on `message` (a thin drop); the buffer is freed
    /// once the last reference goes away.
    pub fn unref_message(&self, message: Rc<Message>) {
        drop(message);
    }

    /// Build, finalize and send a header-only message to a replica.
    pub fn send_header_to_replica(&self, replica: u16, header: Header) {
        let sector_size = self.inner.borrow().config.sector_size;
        let message = Message::create_header_only(header, sector_size);
        self.send_message_to_replica(replica, message);
    }

    /// Build, finalize and send a header-only message to a client.
    pub fn send_header_to_client(&self, client: u128, header: Header) {
        let sector_size = self.inner.borrow().config.sector_size;
        let message = Message::create_header_only(header, sector_size);
        self.send_message_to_client(client, message);
    }

    /// Send `message` to replica `r`. If `r` is this node's own index, the
    /// message takes the self-send loopback path instead of going out over
    /// a socket. If no connection is currently designated for `r`, the
    /// message is silently dropped (logged at debug).
    pub fn send_message_to_replica(&self, replica: u16, message: Rc<Message>) {
        if replica == self.inner.borrow().config.own_replica {
            let mut inner = self.inner.borrow_mut();
            if let Err(dropped) = inner.self_send_queue.push(message) {
                warn!("self-send queue full, dropping message");
                drop(dropped);
            }
            return;
        }

        let slot_idx = self.inner.borrow().replicas[replica as usize];
        match slot_idx {
            Some(idx) => {
                let connection = self.inner.borrow().slots[idx].connection.clone();
                if let Err(dropped) = connection.borrow_mut().send_message(message) {
                    warn!(replica, "send queue full, dropping message");
                    drop(dropped);
                }
            }
            None => {
                debug!(replica, "no connection for replica, dropping message");
            }
        }
    }

    /// Send `message` to the client with id `cid`, found by a linear scan
    /// over connections. Silently dropped if no client connection matches.
    pub fn send_message_to_client(&self, cid: u128, message: Rc<Message>) {
        let slot_idx = self
            .inner
            .borrow()
            .slots
            .iter()
            .position(|s| s.connection.borrow().peer.is_client_id(cid));

        match slot_idx {
            Some(idx) => {
                let connection = self.inner.borrow().slots[idx].connection.clone();
                if let Err(dropped) = connection.borrow_mut().send_message(message) {
                    warn!(client = %cid, "send queue full, dropping message");
                    drop(dropped);
                }
            }
            None => {
                debug!(client = %cid, "no connection for client, dropping message");
            }
        }
    }

    /// Drain the self-send queue, delivering each message to the sink.
    /// The queue is moved aside first so messages pushed during delivery
    /// are left for the next `flush` rather than looping forever.
    pub fn flush(&self) {
        let mut inner = self.inner.borrow_mut();
        let capacity = inner.self_send_queue.len().max(1);
        let mut snapshot = RingBuffer::new(capacity);
        while let Some(m) = inner.self_send_queue.pop() {
            let _ = snapshot.push(m);
        }
        drop(inner);

        while let Some(message) = snapshot.pop() {
            self.inner.borrow_mut().sink.on_message(message);
        }
    }

    /// Shut down every connection and close the listener. Half-closes each
    /// socket immediately, then gives any still-running pipeline tasks a
    /// chance to observe the shutdown and release their own sockets through
    /// the normal `pipeline_finished` path before reclaiming whatever is
    /// left directly — a connection with no pipelines ever spawned (idle,
    /// or failed before a socket existed) has nothing to wait for.
    pub async fn deinit(&self) {
        let slots: Vec<_> = self
            .inner
            .borrow()
            .slots
            .iter()
            .map(|s| s.connection.clone())
            .collect();
        for connection in &slots {
            connection.borrow_mut().initiate_shutdown();
        }
        for _ in 0..64 {
            if !slots.iter().any(|c| c.borrow().has_pending_pipelines()) {
                break;
            }
            tokio::task::yield_now().await;
        }
        for connection in &slots {
            if !connection.borrow().has_pending_pipelines() {
                connection.borrow_mut().close();
            }
        }
        self.inner.borrow_mut().listener = None;
    }

    /// Number of slots currently holding a non-`none` peer.
    pub fn connections_used(&self) -> usize {
        self.inner
            .borrow()
            .slots
            .iter()
            .filter(|s| !s.connection.borrow().peer.is_none())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    struct RecordingSink {
        received: Rc<StdRefCell<Vec<Rc<Message>>>>,
    }

    impl ReplicaSink for RecordingSink {
        fn replica(&self) -> u16 {
            0
        }
        fn cluster(&self) -> u32 {
            1
        }
        fn on_message(&mut self, message: Rc<Message>) {
            self.received.borrow_mut().push(message);
        }
    }

    fn config() -> BusConfig {
        BusConfig::new(1, 0, vec!["127.0.0.1:4000".parse().unwrap()])
    }

    #[test]
    fn new_bus_has_empty_connection_pool() {
        let received = Rc::new(StdRefCell::new(Vec::new()));
        let sink = RecordingSink { received };
        let bus = MessageBus::new(config(), sink).unwrap();
        assert_eq!(bus.connections_used(), 0);
    }

    #[test]
    fn flush_delivers_self_sent_messages_in_push_order() {
        let received = Rc::new(StdRefCell::new(Vec::new()));
        let sink = RecordingSink {
            received: received.clone(),
        };
        let bus = MessageBus::new(config(), sink).unwrap();

        let a = bus.create_message(HEADER_SIZE);
        let b = bus.create_message(HEADER_SIZE);
        bus.send_message_to_replica(0, Rc::clone(&a));
        bus.send_message_to_replica(0, Rc::clone(&b));

        bus.flush();

        let delivered = received.borrow();
        assert_eq!(delivered.len(), 2);
        assert!(Rc::ptr_eq(&delivered[0], &a));
        assert!(Rc::ptr_eq(&delivered[1], &b));
    }

    #[test]
    fn send_to_unreachable_replica_is_silently_dropped() {
        let received = Rc::new(StdRefCell::new(Vec::new()));
        let sink = RecordingSink { received };
        let bus = MessageBus::new(
            BusConfig::new(
                1,
                0,
                vec![
                    "127.0.0.1:4000".parse().unwrap(),
                    "127.0.0.1:4001".parse().unwrap(),
                ],
            ),
            sink,
        )
        .unwrap();

        let m = bus.create_message(HEADER_SIZE);
        bus.send_message_to_replica(1, m);
        assert_eq!(bus.connections_used(), 0);
    }

    #[test]
    fn send_to_unknown_client_is_silently_dropped() {
        let received = Rc::new(StdRefCell::new(Vec::new()));
        let sink = RecordingSink { received };
        let bus = MessageBus::new(config(), sink).unwrap();

        let m = bus.create_message(HEADER_SIZE);
        bus.send_message_to_client(42, m);
        assert_eq!(bus.connections_used(), 0);
    }
}
