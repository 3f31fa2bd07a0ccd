//! Connection driver shared by clients and workers.
//!
//! A session is one TCP connection served by one background task. Callers
//! talk to the task over a command channel: each request is paired with the
//! handler that will consume its replies, and the task pushes that handler
//! onto the connection's dispatch chain before writing the request.

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::config::ClientOptions;
use crate::dispatch::{DispatchChain, Dispatched, Handler};
use crate::error::{GearlineError, Result};
use crate::protocol::{Frame, PacketCodec};

/// What a client-side handler may do while it runs: queue frames to write
/// and register follow-up handlers. Both are applied after dispatch returns.
#[derive(Default)]
pub struct SessionCtx {
    outbound: Vec<Frame>,
    pending: Vec<Box<dyn Handler<SessionCtx>>>,
}

impl SessionCtx {
    pub fn send(&mut self, frame: Frame) {
        self.outbound.push(frame);
    }

    pub fn push_handler<H>(&mut self, handler: H)
    where
        H: Handler<SessionCtx> + 'static,
    {
        self.pending.push(Box::new(handler));
    }
}

enum SessionCommand {
    /// Register `handler`, then write `frame`.
    Exchange {
        frame: Frame,
        handler: Box<dyn Handler<SessionCtx>>,
    },
    /// Write a frame that gets no reply.
    Send(Frame),
}

/// Handle to a running session. Cheap to clone; the connection stays open
/// while any clone is alive.
#[derive(Clone, Debug)]
pub struct Session {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionCommand::Exchange { frame, handler } => f
                .debug_struct("Exchange")
                .field("packet", &frame.packet())
                .field("handler", &handler.name())
                .finish(),
            SessionCommand::Send(frame) => f.debug_tuple("Send").field(&frame.packet()).finish(),
        }
    }
}

impl Session {
    /// Connect and start the driver task. `handlers` stay registered for the
    /// life of the connection unless they finish themselves.
    pub async fn connect<A>(
        addr: A,
        options: &ClientOptions,
        handlers: Vec<Box<dyn Handler<SessionCtx>>>,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        tracing::debug!(addr = %peer, "Session connected");

        let mut chain = DispatchChain::new();
        for handler in handlers {
            chain.push_boxed(handler);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(stream, rx, chain, options.clone()));
        Ok(Self { commands: tx })
    }

    /// Send a request whose replies `handler` will consume.
    pub fn exchange<H>(&self, frame: Frame, handler: H) -> Result<()>
    where
        H: Handler<SessionCtx> + 'static,
    {
        self.commands
            .send(SessionCommand::Exchange {
                frame,
                handler: Box::new(handler),
            })
            .map_err(|_| GearlineError::NotConnected)
    }

    /// Send a frame that expects no reply.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.commands
            .send(SessionCommand::Send(frame))
            .map_err(|_| GearlineError::NotConnected)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

async fn write_frames(
    writer: &mut OwnedWriteHalf,
    codec: &PacketCodec,
    frames: impl IntoIterator<Item = Frame>,
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    for frame in frames {
        codec.encode_into(&frame, &mut buf);
    }
    if !buf.is_empty() {
        writer.write_all(&buf).await?;
    }
    Ok(())
}

async fn drive(
    stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut chain: DispatchChain<SessionCtx>,
    options: ClientOptions,
) {
    let codec = PacketCodec::new(options.max_frame_len);
    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, codec.clone());

    loop {
        tokio::select! {
            command = commands.recv() => {
                let written = match command {
                    None => break,
                    Some(SessionCommand::Exchange { frame, handler }) => {
                        chain.push_boxed(handler);
                        write_frames(&mut write_half, &codec, [frame]).await
                    }
                    Some(SessionCommand::Send(frame)) => {
                        write_frames(&mut write_half, &codec, [frame]).await
                    }
                };
                if let Err(e) = written {
                    tracing::warn!(error = %e, "Session write failed");
                    break;
                }
            }

            item = frames.next() => {
                let frame = match item {
                    None => {
                        tracing::debug!("Broker closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Framing error, closing session");
                        break;
                    }
                    Some(Ok(frame)) => frame,
                };

                let mut ctx = SessionCtx::default();
                let idle = match chain.dispatch(&frame, &mut ctx) {
                    Ok(Dispatched::Removed { idle }) => idle,
                    Ok(Dispatched::Kept) => false,
                    Err(e) => {
                        tracing::warn!(packet = %frame.packet(), error = %e, "Dropping frame");
                        false
                    }
                };
                for handler in ctx.pending.drain(..) {
                    chain.push_boxed(handler);
                }
                if let Err(e) = write_frames(&mut write_half, &codec, ctx.outbound.drain(..)).await {
                    tracing::warn!(error = %e, "Session write failed");
                    break;
                }
                if idle && chain.is_empty() && options.close_when_idle {
                    tracing::debug!("No exchanges pending, closing session");
                    break;
                }
            }
        }
    }

    // Pending handlers drop their reply channels here, which wakes their
    // callers with `ConnectionClosed`.
    tracing::debug!(pending = ?chain.handler_names(), "Session closed");
    chain.clear();
    let _ = write_half.shutdown().await;
}
