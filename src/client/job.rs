use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::client::session::Session;
use crate::error::{GearlineError, ProtocolError, Result};
use crate::protocol::{number_arg, Frame, Magic, PacketType};
use crate::scheduler::Priority;

/// A job to submit.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub function: String,
    pub unique_id: String,
    pub payload: Bytes,
    pub priority: Priority,
}

impl SubmitRequest {
    pub fn new(function: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            function: function.into(),
            unique_id: String::new(),
            payload: payload.into(),
            priority: Priority::Normal,
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = unique_id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn to_frame(&self, background: bool) -> Result<Frame> {
        let packet = PacketType::for_submit(self.priority, background);
        if self.function.trim().is_empty() {
            return Err(ProtocolError::InvalidArgument {
                packet,
                detail: "empty function name".to_string(),
            }
            .into());
        }
        if self.function.contains('\0') || self.unique_id.contains('\0') {
            return Err(ProtocolError::InvalidArgument {
                packet,
                detail: "function and unique id must not contain NUL".to_string(),
            }
            .into());
        }
        Ok(Frame::request(
            packet,
            [
                Bytes::from(self.function.clone()),
                Bytes::from(self.unique_id.clone()),
                self.payload.clone(),
            ],
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    Data,
    Warning,
    Complete,
    Fail,
    Exception,
}

/// A worker report relayed to the job's submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Status { numerator: u64, denominator: u64 },
    Data(Bytes),
    Warning(Bytes),
    Complete(Bytes),
    Fail,
    Exception(Bytes),
}

impl JobEvent {
    /// Parse a relayed WORK_* frame. The first argument (the handle) has
    /// already been matched by the caller.
    pub fn from_frame(frame: &Frame) -> std::result::Result<Self, ProtocolError> {
        let packet = frame.packet();
        let args = frame.expect_args()?;
        let event = match packet {
            PacketType::WorkStatus => JobEvent::Status {
                numerator: number_arg(packet, &args[1])?,
                denominator: number_arg(packet, &args[2])?,
            },
            PacketType::WorkData => JobEvent::Data(args[1].clone()),
            PacketType::WorkWarning => JobEvent::Warning(args[1].clone()),
            PacketType::WorkComplete => JobEvent::Complete(args[1].clone()),
            PacketType::WorkFail => JobEvent::Fail,
            PacketType::WorkException => JobEvent::Exception(args[1].clone()),
            other => return Err(ProtocolError::UnexpectedPacket(other)),
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            JobEvent::Status { .. } => EventKind::Status,
            JobEvent::Data(_) => EventKind::Data,
            JobEvent::Warning(_) => EventKind::Warning,
            JobEvent::Complete(_) => EventKind::Complete,
            JobEvent::Fail => EventKind::Fail,
            JobEvent::Exception(_) => EventKind::Exception,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::Complete | EventKind::Fail | EventKind::Exception
        )
    }
}

/// How a foreground job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Complete(Bytes),
    Fail,
    Exception(Bytes),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Complete(_))
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Complete(_) => f.write_str("complete"),
            JobOutcome::Fail => f.write_str("fail"),
            JobOutcome::Exception(_) => f.write_str("exception"),
        }
    }
}

pub type Observer = Box<dyn FnMut(&JobEvent) + Send>;

/// Callbacks keyed by event kind. Each event runs the callbacks registered
/// for its kind in registration order, on the session task.
#[derive(Default)]
pub struct JobObservers {
    by_kind: HashMap<EventKind, Vec<Observer>>,
}

impl fmt::Debug for JobObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self.by_kind.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("JobObservers").field("by_kind", &counts).finish()
    }
}

impl JobObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, kind: EventKind, observer: F) -> Self
    where
        F: FnMut(&JobEvent) + Send + 'static,
    {
        self.by_kind.entry(kind).or_default().push(Box::new(observer));
        self
    }

    pub fn on_complete<F>(self, observer: F) -> Self
    where
        F: FnMut(&JobEvent) + Send + 'static,
    {
        self.on(EventKind::Complete, observer)
    }

    pub fn on_status<F>(self, observer: F) -> Self
    where
        F: FnMut(&JobEvent) + Send + 'static,
    {
        self.on(EventKind::Status, observer)
    }

    pub(crate) fn notify(&mut self, event: &JobEvent) {
        if let Some(observers) = self.by_kind.get_mut(&event.kind()) {
            for observer in observers.iter_mut() {
                observer(event);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.values().all(Vec::is_empty)
    }
}

/// A submitted foreground job. Keeps its connection open until dropped.
#[derive(Debug)]
pub struct ForegroundJob {
    handle: String,
    events: mpsc::UnboundedReceiver<JobEvent>,
    _session: Session,
}

impl ForegroundJob {
    pub(crate) fn new(
        handle: String,
        events: mpsc::UnboundedReceiver<JobEvent>,
        session: Session,
    ) -> Self {
        Self {
            handle,
            events,
            _session: session,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// The next relayed event. `None` once the terminal event has been
    /// returned or the connection is gone.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Skip intermediate events and return the outcome.
    pub async fn wait(mut self) -> Result<JobOutcome> {
        while let Some(event) = self.events.recv().await {
            match event {
                JobEvent::Complete(data) => return Ok(JobOutcome::Complete(data)),
                JobEvent::Fail => return Ok(JobOutcome::Fail),
                JobEvent::Exception(data) => return Ok(JobOutcome::Exception(data)),
                other => {
                    tracing::trace!(handle = %self.handle, event = ?other, "Job event");
                }
            }
        }
        Err(GearlineError::ConnectionClosed)
    }
}

/// A foreground job whose reports go to observers.
///
/// Holds the connection open while it lives, even after every [`Client`]
/// clone is gone; drop it to stop caring about the job.
///
/// [`Client`]: crate::client::Client
#[derive(Debug)]
pub struct ObservedJob {
    handle: String,
    _session: Session,
}

impl ObservedJob {
    pub(crate) fn new(handle: String, session: Session) -> Self {
        Self {
            handle,
            _session: session,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }
}

/// Turn a received ERROR frame into an error for the waiting caller.
pub(crate) fn server_error(frame: &Frame) -> GearlineError {
    debug_assert_eq!(frame.packet(), PacketType::Error);
    let text = |i: usize| {
        frame
            .arg(i)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    };
    GearlineError::Server {
        code: text(0),
        message: text(1),
    }
}

/// Replies to client requests arrive with RES magic; anything else is not
/// for a client-side handler.
pub(crate) fn is_reply(frame: &Frame) -> bool {
    frame.magic() == Magic::Response
}
