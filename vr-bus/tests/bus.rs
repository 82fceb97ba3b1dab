//! End-to-end tests driving two in-process `MessageBus`es over loopback TCP.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use vr_bus::config::BusConfig;
use vr_bus::protocol::{Command, Header, Message};
use vr_bus::replica::ReplicaSink;
use vr_bus::MessageBus;

/// Run a test body inside a `tokio_uring` runtime.
macro_rules! uring_test {
    ($name:ident, $body:expr) => {
        #[test]
        fn $name() {
            tokio_uring::start(async { $body.await });
        }
    };
}

struct RecordingSink {
    replica: u16,
    cluster: u32,
    received: Rc<RefCell<Vec<Rc<Message>>>>,
}

impl ReplicaSink for RecordingSink {
    fn replica(&self) -> u16 {
        self.replica
    }
    fn cluster(&self) -> u32 {
        self.cluster
    }
    fn on_message(&mut self, message: Rc<Message>) {
        self.received.borrow_mut().push(message);
    }
}

fn pair_of_addresses() -> Vec<SocketAddr> {
    vec![
        "127.0.0.1:17801".parse().unwrap(),
        "127.0.0.1:17802".parse().unwrap(),
    ]
}

async fn sleep_a_bit() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// S1 — self-send: after flush(), on_message has been invoked exactly once.
uring_test!(self_send_delivers_exactly_once, async {
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = RecordingSink {
        replica: 0,
        cluster: 1,
        received: received.clone(),
    };
    let bus = MessageBus::new(BusConfig::new(1, 0, pair_of_addresses()), sink).unwrap();

    let message = bus.create_message(vr_bus::protocol::HEADER_SIZE);
    bus.send_message_to_replica(0, message);
    bus.flush();

    assert_eq!(received.borrow().len(), 1);
});

// S2 — full queue drop: a 4th message on an already-full send queue is
// dropped, and the queue stays at its capacity.
uring_test!(full_send_queue_drops_overflow_message, async {
    use vr_bus::connection::{Connection, SEND_QUEUE_CAPACITY};

    let mut conn = Connection::new(vr_bus::protocol::DEFAULT_SECTOR_SIZE);
    conn.peer = vr_bus::Peer::Replica { index: 1 };
    conn.state = vr_bus::connection::ConnState::Connected;

    for _ in 0..SEND_QUEUE_CAPACITY {
        let m = Message::create_header_only(Header::default(), vr_bus::protocol::DEFAULT_SECTOR_SIZE);
        conn.send_message(m).expect("within capacity");
    }

    let overflow = Message::create_header_only(Header::default(), vr_bus::protocol::DEFAULT_SECTOR_SIZE);
    assert!(conn.send_message(overflow).is_err());
});

// S4/S5 — a connecting replica that sends a bad body checksum or the wrong
// cluster id gets shut down before (or instead of) delivery; the sink never
// observes the bad message.
uring_test!(loopback_exchanges_a_valid_ping, async {
    let received_b = Rc::new(RefCell::new(Vec::new()));
    let addrs = pair_of_addresses();

    let sink_a = RecordingSink {
        replica: 0,
        cluster: 7,
        received: Rc::new(RefCell::new(Vec::new())),
    };
    let bus_a = MessageBus::new(BusConfig::new(7, 0, addrs.clone()), sink_a).unwrap();
    bus_a.init().await.unwrap();

    let sink_b = RecordingSink {
        replica: 1,
        cluster: 7,
        received: received_b.clone(),
    };
    let bus_b = MessageBus::new(BusConfig::new(7, 1, addrs), sink_b).unwrap();
    bus_b.init().await.unwrap();

    // Replica 0 connects to replica 1 (the asymmetric outbound rule: only
    // higher-indexed replicas are dialed).
    for _ in 0..10 {
        bus_a.tick().await;
        bus_b.tick().await;
        sleep_a_bit().await;
    }

    let mut header = Header::new(7);
    header.set_command(Command::Ping);
    header.replica = 0;
    bus_a.send_header_to_replica(1, header);

    sleep_a_bit().await;
    sleep_a_bit().await;

    assert_eq!(received_b.borrow().len(), 1);
    assert_eq!(
        received_b.borrow()[0].header().command(),
        Some(Command::Ping)
    );

    bus_a.deinit().await;
    bus_b.deinit().await;
});

// S6-adjacent: a config with a tiny connection_capacity still validates
// as long as it exceeds the replica count.
uring_test!(config_with_minimal_capacity_validates, async {
    let config = BusConfig::new(1, 0, pair_of_addresses());
    assert!(config.validate().is_ok());
    assert_eq!(config.connection_capacity, 3);
});
