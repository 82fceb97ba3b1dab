//! Message bus for a Viewstamped Replication cluster node.
//!
//! This crate is the networking substrate a VR replica runs on top of: a
//! length-prefixed, checksum-validated wire protocol, a fixed-capacity
//! connection pool with peer-type-aware eviction, a receive/send state
//! machine per connection, reference-counted message buffers, and a
//! self-send loopback path for messages a replica addresses to itself.
//!
//! The replica state machine, the journal, the clock and CLI/configuration
//! parsing are deliberately outside this crate's scope — see
//! [`replica::ReplicaSink`] for the single seam the bus uses to hand
//! delivered messages to whatever is running the VR protocol itself.
//!
//! # Quick start
//!
//! ```ignore
//! use vr_bus::{BusConfig, MessageBus, ReplicaSink};
//! use std::rc::Rc;
//! use vr_bus::protocol::Message;
//!
//! struct Logger;
//! impl ReplicaSink for Logger {
//!     fn replica(&self) -> u16 { 0 }
//!     fn cluster(&self) -> u32 { 1 }
//!     fn on_message(&mut self, message: Rc<Message>) {
//!         println!("received {:?}", message.header().command());
//!     }
//! }
//!
//! tokio_uring::start(async {
//!     let config = BusConfig::new(1, 0, vec!["127.0.0.1:3001".parse().unwrap()]);
//!     let bus = MessageBus::new(config, Logger)?;
//!     bus.init().await?;
//!     loop {
//!         bus.tick().await;
//!         bus.flush();
//!     }
//!     #[allow(unreachable_code)]
//!     Ok::<_, vr_bus::error::BusError>(())
//! });
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod replica;
pub mod ring_buffer;

pub use bus::MessageBus;
pub use config::BusConfig;
pub use error::BusError;
pub use peer::Peer;
pub use replica::ReplicaSink;
