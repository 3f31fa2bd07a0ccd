//! Test harness for broker tests.
//!
//! Two ways to drive a broker: [`Harness`] keeps it in-process and captures
//! what it would write to each connection, and [`TestBroker`] runs the real
//! TCP server on an ephemeral port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use gearline::config::BrokerConfig;
use gearline::protocol::{Frame, Inbound, Outbound, PacketType};
use gearline::server::{Broker, BrokerServer};
use gearline::store::JobStore;
use gearline::ConnectionId;

/// Broker configuration for tests: ephemeral port, node name `test`.
pub fn test_config() -> BrokerConfig {
    BrokerConfig::new("127.0.0.1:0".parse().unwrap()).with_node_name("test")
}

// =============================================================================
// In-process broker
// =============================================================================

/// A broker whose connections write into channels.
pub struct Harness {
    pub broker: Broker,
    outbound: HashMap<ConnectionId, mpsc::UnboundedReceiver<Outbound>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            broker: Broker::new(&config).unwrap(),
            outbound: HashMap::new(),
        }
    }

    pub fn with_store(config: BrokerConfig, store: Box<dyn JobStore>) -> Self {
        Self {
            broker: Broker::with_store(&config, Some(store)).unwrap(),
            outbound: HashMap::new(),
        }
    }

    pub fn connect(&mut self, conn: ConnectionId) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.connect(conn, format!("127.0.0.1:{}", 40000 + conn), tx);
        self.outbound.insert(conn, rx);
    }

    /// Deliver a REQ frame from `conn`.
    pub fn request<A: AsRef<[u8]>>(&mut self, conn: ConnectionId, packet: PacketType, args: &[A]) {
        let args: Vec<Bytes> = args
            .iter()
            .map(|a| Bytes::copy_from_slice(a.as_ref()))
            .collect();
        self.broker.handle_frame(conn, Frame::request(packet, args));
    }

    /// Deliver a REQ frame with no arguments.
    pub fn bare(&mut self, conn: ConnectionId, packet: PacketType) {
        self.request::<&str>(conn, packet, &[]);
    }

    pub fn admin(&mut self, conn: ConnectionId, line: &str) -> String {
        self.broker
            .handle_inbound(conn, Inbound::Admin(line.to_string()));
        self.drain_outbound(conn)
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Text(text) => Some(text),
                Outbound::Packet(_) => None,
            })
            .collect()
    }

    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.broker.disconnect(conn);
        self.outbound.remove(&conn);
    }

    fn drain_outbound(&mut self, conn: ConnectionId) -> Vec<Outbound> {
        let mut items = Vec::new();
        if let Some(rx) = self.outbound.get_mut(&conn) {
            while let Ok(item) = rx.try_recv() {
                items.push(item);
            }
        }
        items
    }

    /// Every frame queued for `conn` since the last drain.
    pub fn drain(&mut self, conn: ConnectionId) -> Vec<Frame> {
        self.drain_outbound(conn)
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Packet(frame) => Some(frame),
                Outbound::Text(_) => None,
            })
            .collect()
    }

    /// The packet types queued for `conn` since the last drain.
    pub fn drain_types(&mut self, conn: ConnectionId) -> Vec<PacketType> {
        self.drain(conn).iter().map(Frame::packet).collect()
    }

    /// Submit a job from `conn` and return its handle.
    pub fn submit(&mut self, conn: ConnectionId, packet: PacketType, function: &str, payload: &str) -> String {
        self.request(conn, packet, &[function, "", payload]);
        let frames = self.drain(conn);
        let created = frames
            .iter()
            .find(|f| f.packet() == PacketType::JobCreated)
            .unwrap_or_else(|| panic!("no JOB_CREATED in {:?}", frames));
        String::from_utf8(created.args()[0].to_vec()).unwrap()
    }
}

/// Argument `index` of a frame as text.
pub fn arg_text(frame: &Frame, index: usize) -> String {
    String::from_utf8_lossy(&frame.args()[index]).into_owned()
}

// =============================================================================
// TCP broker
// =============================================================================

/// A broker serving TCP on an ephemeral port until dropped.
pub struct TestBroker {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: BrokerConfig) -> Self {
        let server = BrokerServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            server.run(token).await.unwrap();
        });
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_finished()
    }

    /// Send one admin line on a fresh connection and collect the reply.
    /// `status` and `workers` replies are read up to the closing `.`.
    pub async fn admin(&self, line: &str) -> Vec<String> {
        let multi_line = matches!(line.split_whitespace().next(), Some("status" | "workers"));
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let mut reply = Vec::new();
        while let Ok(Ok(Some(line))) =
            tokio::time::timeout(Duration::from_secs(5), lines.next_line()).await
        {
            if multi_line && line == "." {
                break;
            }
            reply.push(line);
            if !multi_line {
                break;
            }
        }
        reply
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

// =============================================================================
// Polling helpers
// =============================================================================

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
