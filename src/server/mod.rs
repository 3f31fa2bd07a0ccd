//! The broker process.
//!
//! One task owns the [`Broker`] and applies events to it one at a time.
//! Each accepted connection gets a reader task that decodes frames and
//! forwards them to that task, and a writer task that drains the
//! connection's outbound queue onto the socket.
//!
//! ```text
//!   socket ──► reader task ──► BrokerEvent ──► broker task ──► Outbound ──► writer task ──► socket
//! ```

pub mod admin;
pub mod broker;
pub mod handlers;

pub use broker::{Broker, BrokerState, Peer};

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::protocol::{Inbound, Outbound, ServerCodec};
use crate::ConnectionId;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events from connection tasks to the broker task.
#[derive(Debug)]
enum BrokerEvent {
    Inbound {
        conn: ConnectionId,
        inbound: Inbound,
    },
    Closed {
        conn: ConnectionId,
    },
}

pub struct BrokerServer {
    config: BrokerConfig,
    broker: Broker,
    listener: TcpListener,
}

impl BrokerServer {
    /// Open the store (if any) and bind the listening socket.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let broker = Broker::new(&config)?;
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            config,
            broker,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled or an admin `shutdown` arrives.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            mut broker,
            listener,
        } = self;
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut next_conn: ConnectionId = 1;

        tracing::info!(addr = %listener.local_addr()?, node = %config.node_name, "Broker listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Broker shutting down");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let conn = next_conn;
                            next_conn += 1;
                            spawn_connection(
                                &mut broker,
                                conn,
                                stream,
                                peer,
                                event_tx.clone(),
                                config.max_frame_len,
                            );
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                    }
                }

                Some(event) = event_rx.recv() => {
                    match event {
                        BrokerEvent::Inbound { conn, inbound } => broker.handle_inbound(conn, inbound),
                        BrokerEvent::Closed { conn } => broker.disconnect(conn),
                    }
                    if broker.shutdown_requested() {
                        shutdown.cancel();
                    }
                }
            }
        }
        Ok(())
    }
}

fn spawn_connection(
    broker: &mut Broker,
    conn: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<BrokerEvent>,
    max_frame_len: usize,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(conn_id = conn, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    broker.connect(conn, peer.to_string(), out_tx);

    tokio::spawn(async move {
        let mut codec = ServerCodec::new(max_frame_len);
        let mut buf = BytesMut::new();
        while let Some(item) = out_rx.recv().await {
            buf.clear();
            if let Err(e) = codec.encode(item, &mut buf) {
                tracing::warn!(conn_id = conn, error = %e, "Failed to encode outbound item");
                break;
            }
            if let Err(e) = write_half.write_all(&buf).await {
                tracing::debug!(conn_id = conn, error = %e, "Write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    tokio::spawn(async move {
        let mut frames = FramedRead::new(read_half, ServerCodec::new(max_frame_len));
        while let Some(item) = frames.next().await {
            match item {
                Ok(inbound) => {
                    if events
                        .send(BrokerEvent::Inbound { conn, inbound })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(conn_id = conn, error = %e, "Framing error, closing connection");
                    break;
                }
            }
        }
        let _ = events.send(BrokerEvent::Closed { conn }).await;
    });
}
