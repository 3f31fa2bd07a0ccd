use bytes::Bytes;
use tokio::net::ToSocketAddrs;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::client::job::{is_reply, server_error};
use crate::client::session::{Session, SessionCtx};
use crate::config::ClientOptions;
use crate::dispatch::{Claim, Handler};
use crate::error::{GearlineError, ProtocolError, Result};
use crate::protocol::{handle_arg, text_arg, Frame, Magic, PacketType};
use crate::worker::execution::{Assignment, JobExecution};

type GrabReply = oneshot::Sender<Result<Option<Assignment>>>;

/// Claims every NOOP for the life of the connection.
///
/// A worker going to sleep parks the reply slot for its next grab here
/// before it sends PRE_SLEEP. The NOOP that wakes it issues that grab
/// straight from the session task.
struct WakeHandler {
    sleepers: mpsc::UnboundedReceiver<GrabReply>,
}

impl Handler<SessionCtx> for WakeHandler {
    fn try_handle(&mut self, frame: &Frame, ctx: &mut SessionCtx) -> std::result::Result<Claim, ProtocolError> {
        if !is_reply(frame) || frame.packet() != PacketType::Noop {
            return Ok(Claim::Unclaimed);
        }
        // Sleepers whose caller gave up are skipped; a job grabbed for them
        // would have nobody to run it.
        while let Ok(reply) = self.sleepers.try_recv() {
            if reply.is_closed() {
                continue;
            }
            tracing::debug!("Woken by broker, grabbing");
            ctx.send(Frame::bare(Magic::Request, PacketType::GrabJobUniq));
            ctx.push_handler(GrabHandler { reply: Some(reply) });
            return Ok(Claim::Claimed);
        }
        tracing::debug!("NOOP with no sleeper waiting");
        Ok(Claim::Claimed)
    }

    fn name(&self) -> &'static str {
        "wake"
    }
}

/// Waits for the answer to one GRAB_JOB or GRAB_JOB_UNIQ.
struct GrabHandler {
    reply: Option<GrabReply>,
}

impl GrabHandler {
    fn finish(&mut self, value: Result<Option<Assignment>>) -> Claim {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(value);
        }
        Claim::Finished
    }
}

impl Handler<SessionCtx> for GrabHandler {
    fn try_handle(&mut self, frame: &Frame, _ctx: &mut SessionCtx) -> std::result::Result<Claim, ProtocolError> {
        if !is_reply(frame) {
            return Ok(Claim::Unclaimed);
        }
        let packet = frame.packet();
        let claim = match packet {
            PacketType::NoJob => self.finish(Ok(None)),
            PacketType::JobAssign => {
                let args = frame.expect_args()?;
                let assignment = Assignment {
                    handle: handle_arg(packet, &args[0])?,
                    function: text_arg(packet, &args[1])?,
                    unique_id: String::new(),
                    payload: args[2].clone(),
                };
                self.finish(Ok(Some(assignment)))
            }
            PacketType::JobAssignUniq => {
                let args = frame.expect_args()?;
                let assignment = Assignment {
                    handle: handle_arg(packet, &args[0])?,
                    function: text_arg(packet, &args[1])?,
                    unique_id: text_arg(packet, &args[2])?,
                    payload: args[3].clone(),
                };
                self.finish(Ok(Some(assignment)))
            }
            PacketType::Error => self.finish(Err(server_error(frame))),
            _ => Claim::Unclaimed,
        };
        Ok(claim)
    }

    fn name(&self) -> &'static str {
        "grab"
    }
}

/// A worker connection.
#[derive(Debug, Clone)]
pub struct Worker {
    session: Session,
    sleepers: mpsc::UnboundedSender<GrabReply>,
    client_id: String,
}

impl Worker {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::connect_with(addr, ClientOptions::default()).await
    }

    /// Connect and label the connection with a random client id.
    pub async fn connect_with<A: ToSocketAddrs>(addr: A, options: ClientOptions) -> Result<Self> {
        let (sleepers, parked) = mpsc::unbounded_channel();
        let waker: Box<dyn Handler<SessionCtx>> = Box::new(WakeHandler { sleepers: parked });
        let session = Session::connect(addr, &options, vec![waker]).await?;
        let client_id = Uuid::new_v4().to_string();
        session.send(Frame::request(
            PacketType::SetClientId,
            [Bytes::from(client_id.clone())],
        ))?;
        tracing::info!(client_id = %client_id, "Worker connected");
        Ok(Self {
            session,
            sleepers,
            client_id,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn function_frame(packet: PacketType, function: &str, extra: Option<Bytes>) -> Result<Frame> {
        if function.trim().is_empty() || function.contains('\0') {
            return Err(ProtocolError::InvalidArgument {
                packet,
                detail: format!("invalid function name {:?}", function),
            }
            .into());
        }
        let mut args = vec![Bytes::from(function.to_string())];
        args.extend(extra);
        Ok(Frame::request(packet, args))
    }

    pub fn can_do(&self, function: &str) -> Result<()> {
        self.session
            .send(Self::function_frame(PacketType::CanDo, function, None)?)
    }

    /// Register a function with an advisory timeout in seconds.
    pub fn can_do_timeout(&self, function: &str, timeout_secs: u32) -> Result<()> {
        let timeout = Bytes::from(timeout_secs.to_string());
        self.session.send(Self::function_frame(
            PacketType::CanDoTimeout,
            function,
            Some(timeout),
        )?)
    }

    pub fn cant_do(&self, function: &str) -> Result<()> {
        self.session
            .send(Self::function_frame(PacketType::CantDo, function, None)?)
    }

    pub fn reset_abilities(&self) -> Result<()> {
        self.session
            .send(Frame::bare(Magic::Request, PacketType::ResetAbilities))
    }

    /// Ask for one job. `None` when nothing matching is queued.
    pub async fn grab_job(&self) -> Result<Option<JobExecution>> {
        let (tx, rx) = oneshot::channel();
        self.session.exchange(
            Frame::bare(Magic::Request, PacketType::GrabJobUniq),
            GrabHandler { reply: Some(tx) },
        )?;
        self.assignment(rx).await
    }

    async fn assignment(
        &self,
        rx: oneshot::Receiver<Result<Option<Assignment>>>,
    ) -> Result<Option<JobExecution>> {
        let assignment = rx.await.map_err(|_| GearlineError::ConnectionClosed)??;
        Ok(assignment.map(|a| {
            tracing::info!(handle = %a.handle, function = %a.function, "Job assigned");
            JobExecution::new(a, self.session.clone())
        }))
    }

    /// Grab, and when there is nothing to do announce sleep and let the
    /// broker's NOOP trigger the next grab.
    ///
    /// Dropping the future while asleep is safe: the wake-up then grabs
    /// nothing on its behalf.
    pub async fn next_assignment(&self) -> Result<JobExecution> {
        let mut job = self.grab_job().await?;
        loop {
            if let Some(job) = job {
                return Ok(job);
            }
            let (tx, rx) = oneshot::channel();
            self.sleepers
                .send(tx)
                .map_err(|_| GearlineError::NotConnected)?;
            self.session
                .send(Frame::bare(Magic::Request, PacketType::PreSleep))?;
            tracing::debug!("No job available, sleeping");
            job = self.assignment(rx).await?;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}
