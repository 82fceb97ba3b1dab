//! Standalone process wiring a [`vr_bus::MessageBus`] to a logging
//! [`vr_bus::ReplicaSink`]. Translates `--cluster`/`--replicas`/
//! `--replica-index` into the bus's init arguments; the bus itself never
//! parses CLI flags or environment variables.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use vr_bus::config::BusConfig;
use vr_bus::protocol::Message;
use vr_bus::{MessageBus, ReplicaSink};

/// Run a single node of a Viewstamped Replication message bus.
#[derive(Parser, Debug)]
#[command(name = "vr-bus-node", version, about)]
struct Args {
    /// Cluster id every header is tagged with and validated against.
    #[arg(long)]
    cluster: u32,

    /// Comma-separated list of replica addresses, indexed by position
    /// (e.g. `127.0.0.1:3000,127.0.0.1:3001,127.0.0.1:3002`).
    #[arg(long, value_delimiter = ',')]
    replicas: Vec<SocketAddr>,

    /// This node's index into `--replicas`.
    #[arg(long)]
    replica_index: u16,

    /// Milliseconds between successive `tick()`/`flush()` rounds.
    #[arg(long, default_value_t = 50)]
    tick_interval_ms: u64,
}

/// A sink that only logs what it receives — a stand-in for the real VR
/// replica state machine, which lives outside this crate.
struct LoggingSink {
    replica: u16,
    cluster: u32,
}

impl ReplicaSink for LoggingSink {
    fn replica(&self) -> u16 {
        self.replica
    }

    fn cluster(&self) -> u32 {
        self.cluster
    }

    fn on_message(&mut self, message: Rc<Message>) {
        info!(
            command = ?message.header().command(),
            from_replica = message.header().replica,
            size = message.len(),
            "received message"
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = BusConfig::new(args.cluster, args.replica_index, args.replicas);
    config.validate()?;

    let sink = LoggingSink {
        replica: config.own_replica,
        cluster: config.cluster,
    };

    tokio_uring::start(async move {
        let bus = MessageBus::new(config, sink)?;
        bus.init().await?;

        info!("message bus running, press Ctrl+C to stop");
        let interval = Duration::from_millis(args.tick_interval_ms);
        loop {
            bus.tick().await;
            bus.flush();
            tokio::time::sleep(interval).await;
        }
        #[allow(unreachable_code)]
        {
            bus.deinit().await;
            Ok::<(), Box<dyn std::error::Error>>(())
        }
    })
    .map_err(|err| {
        warn!(%err, "node exited with error");
        err
    })
}
