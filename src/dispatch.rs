//! Per-connection dispatch chain.
//!
//! A connection owns an ordered list of handlers. Each decoded frame is
//! offered to the handlers in registration order and the first one that
//! claims it wins. Handlers for a request/response exchange are pushed when
//! the request goes out and remove themselves once the exchange is over, so
//! several exchanges can be in flight on one connection, each filtering for
//! the job handle it cares about.

use crate::error::ProtocolError;
use crate::protocol::Frame;

/// A handler's answer to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Not addressed to this handler; offer it to the next one.
    Unclaimed,
    /// Handled; the handler stays registered.
    Claimed,
    /// Handled, and the handler's exchange is over. It is removed.
    Finished,
}

/// Outcome of dispatching one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Kept,
    /// The claiming handler removed itself. `idle` is set when that left the
    /// chain empty.
    Removed { idle: bool },
}

/// One stateful participant in a connection's exchanges. `C` is whatever
/// the owning side lets handlers touch while they run.
pub trait Handler<C>: Send {
    /// Inspect a frame. An `Err` means the handler claimed the frame but
    /// could not make sense of it; it stays registered.
    fn try_handle(&mut self, frame: &Frame, ctx: &mut C) -> Result<Claim, ProtocolError>;

    fn name(&self) -> &'static str;
}

pub struct DispatchChain<C> {
    handlers: Vec<Box<dyn Handler<C>>>,
}

impl<C> Default for DispatchChain<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for DispatchChain<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}

impl<C> DispatchChain<C> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Append a handler. It is tried after every handler already present.
    pub fn push<H>(&mut self, handler: H)
    where
        H: Handler<C> + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    pub fn push_boxed(&mut self, handler: Box<dyn Handler<C>>) {
        self.handlers.push(handler);
    }

    /// Offer `frame` to each handler in order until one claims it. A frame
    /// nobody claims is a protocol error.
    pub fn dispatch(&mut self, frame: &Frame, ctx: &mut C) -> Result<Dispatched, ProtocolError> {
        for index in 0..self.handlers.len() {
            match self.handlers[index].try_handle(frame, ctx)? {
                Claim::Unclaimed => continue,
                Claim::Claimed => return Ok(Dispatched::Kept),
                Claim::Finished => {
                    let handler = self.handlers.remove(index);
                    tracing::trace!(handler = handler.name(), "Handler finished");
                    return Ok(Dispatched::Removed {
                        idle: self.handlers.is_empty(),
                    });
                }
            }
        }
        Err(ProtocolError::Unclaimed(frame.packet()))
    }

    /// Names of the registered handlers, in dispatch order.
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Drop every pending handler, e.g. when the connection closes.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}
