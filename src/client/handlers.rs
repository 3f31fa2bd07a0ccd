//! Client-side exchange handlers. Each one serves a single request and
//! removes itself when the exchange is over.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::client::job::{is_reply, server_error, JobEvent, JobObservers};
use crate::client::session::SessionCtx;
use crate::dispatch::{Claim, Handler};
use crate::error::{ProtocolError, Result};
use crate::protocol::{handle_arg, number_arg, text_arg, Frame, PacketType};
use crate::scheduler::JobStatus;

type Reply<T> = Option<oneshot::Sender<Result<T>>>;

fn respond<T>(reply: &mut Reply<T>, value: Result<T>) {
    if let Some(tx) = reply.take() {
        // The caller may have stopped waiting.
        let _ = tx.send(value);
    }
}

enum SubmitState {
    AwaitingCreated,
    Watching(String),
}

/// Follows one submission: claims its JOB_CREATED, then (for foreground
/// jobs) every report carrying its handle until the terminal one.
pub struct SubmitHandler {
    background: bool,
    state: SubmitState,
    created: Reply<String>,
    events: Option<mpsc::UnboundedSender<JobEvent>>,
    observers: JobObservers,
}

impl SubmitHandler {
    pub fn background(created: oneshot::Sender<Result<String>>) -> Self {
        Self {
            background: true,
            state: SubmitState::AwaitingCreated,
            created: Some(created),
            events: None,
            observers: JobObservers::new(),
        }
    }

    pub fn foreground(
        created: oneshot::Sender<Result<String>>,
        events: Option<mpsc::UnboundedSender<JobEvent>>,
        observers: JobObservers,
    ) -> Self {
        Self {
            background: false,
            state: SubmitState::AwaitingCreated,
            created: Some(created),
            events,
            observers,
        }
    }
}

impl Handler<SessionCtx> for SubmitHandler {
    fn try_handle(&mut self, frame: &Frame, _ctx: &mut SessionCtx) -> std::result::Result<Claim, ProtocolError> {
        if !is_reply(frame) {
            return Ok(Claim::Unclaimed);
        }
        let packet = frame.packet();

        if let SubmitState::Watching(handle) = &self.state {
            if !packet.is_work_report() || frame.arg(0).map(|a| a.as_ref()) != Some(handle.as_bytes()) {
                return Ok(Claim::Unclaimed);
            }
            let event = JobEvent::from_frame(frame)?;
            self.observers.notify(&event);
            let terminal = event.is_terminal();
            if let Some(events) = &self.events {
                let _ = events.send(event);
            }
            return Ok(if terminal { Claim::Finished } else { Claim::Claimed });
        }

        match packet {
            PacketType::JobCreated => {
                let args = frame.expect_args()?;
                let handle = handle_arg(packet, &args[0])?;
                tracing::debug!(handle = %handle, background = self.background, "Job created");
                respond(&mut self.created, Ok(handle.clone()));
                if self.background {
                    return Ok(Claim::Finished);
                }
                self.state = SubmitState::Watching(handle);
                Ok(Claim::Claimed)
            }
            PacketType::Error => {
                respond(&mut self.created, Err(server_error(frame)));
                Ok(Claim::Finished)
            }
            _ => Ok(Claim::Unclaimed),
        }
    }

    fn name(&self) -> &'static str {
        "submit"
    }
}

/// Waits for the STATUS_RES for one handle.
pub struct StatusHandler {
    handle: String,
    reply: Reply<JobStatus>,
}

impl StatusHandler {
    pub fn new(handle: impl Into<String>, reply: oneshot::Sender<Result<JobStatus>>) -> Self {
        Self {
            handle: handle.into(),
            reply: Some(reply),
        }
    }
}

fn parse_flag(packet: PacketType, arg: &Bytes) -> std::result::Result<bool, ProtocolError> {
    match arg.as_ref() {
        b"1" => Ok(true),
        b"0" => Ok(false),
        _ => Err(ProtocolError::InvalidArgument {
            packet,
            detail: "status flag must be 0 or 1".to_string(),
        }),
    }
}

impl Handler<SessionCtx> for StatusHandler {
    fn try_handle(&mut self, frame: &Frame, _ctx: &mut SessionCtx) -> std::result::Result<Claim, ProtocolError> {
        if !is_reply(frame) {
            return Ok(Claim::Unclaimed);
        }
        let packet = frame.packet();
        match packet {
            PacketType::StatusRes => {
                if frame.arg(0).map(|a| a.as_ref()) != Some(self.handle.as_bytes()) {
                    return Ok(Claim::Unclaimed);
                }
                let args = frame.expect_args()?;
                let status = JobStatus {
                    known: parse_flag(packet, &args[1])?,
                    running: parse_flag(packet, &args[2])?,
                    numerator: number_arg(packet, &args[3])?,
                    denominator: number_arg(packet, &args[4])?,
                };
                respond(&mut self.reply, Ok(status));
                Ok(Claim::Finished)
            }
            PacketType::Error => {
                respond(&mut self.reply, Err(server_error(frame)));
                Ok(Claim::Finished)
            }
            _ => Ok(Claim::Unclaimed),
        }
    }

    fn name(&self) -> &'static str {
        "status"
    }
}

/// Waits for ECHO_RES.
pub struct EchoHandler {
    reply: Reply<Bytes>,
}

impl EchoHandler {
    pub fn new(reply: oneshot::Sender<Result<Bytes>>) -> Self {
        Self { reply: Some(reply) }
    }
}

impl Handler<SessionCtx> for EchoHandler {
    fn try_handle(&mut self, frame: &Frame, _ctx: &mut SessionCtx) -> std::result::Result<Claim, ProtocolError> {
        if !is_reply(frame) {
            return Ok(Claim::Unclaimed);
        }
        match frame.packet() {
            PacketType::EchoRes => {
                let args = frame.expect_args()?;
                respond(&mut self.reply, Ok(args[0].clone()));
                Ok(Claim::Finished)
            }
            PacketType::Error => {
                respond(&mut self.reply, Err(server_error(frame)));
                Ok(Claim::Finished)
            }
            _ => Ok(Claim::Unclaimed),
        }
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Waits for OPTION_RES naming its option.
pub struct OptionHandler {
    option: String,
    reply: Reply<()>,
}

impl OptionHandler {
    pub fn new(option: impl Into<String>, reply: oneshot::Sender<Result<()>>) -> Self {
        Self {
            option: option.into(),
            reply: Some(reply),
        }
    }
}

impl Handler<SessionCtx> for OptionHandler {
    fn try_handle(&mut self, frame: &Frame, _ctx: &mut SessionCtx) -> std::result::Result<Claim, ProtocolError> {
        if !is_reply(frame) {
            return Ok(Claim::Unclaimed);
        }
        let packet = frame.packet();
        match packet {
            PacketType::OptionRes => {
                let args = frame.expect_args()?;
                if text_arg(packet, &args[0])? != self.option {
                    return Ok(Claim::Unclaimed);
                }
                respond(&mut self.reply, Ok(()));
                Ok(Claim::Finished)
            }
            PacketType::Error => {
                respond(&mut self.reply, Err(server_error(frame)));
                Ok(Claim::Finished)
            }
            _ => Ok(Claim::Unclaimed),
        }
    }

    fn name(&self) -> &'static str {
        "option"
    }
}
