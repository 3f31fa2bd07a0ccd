//! Client library.
//!
//! A [`Client`] holds one broker connection. Each call pushes a handler for
//! its exchange onto the connection's dispatch chain, so submissions, status
//! queries and echoes can all be outstanding at once on the same socket.
//!
//! ```ignore
//! let client = Client::connect("127.0.0.1:4730").await?;
//! let job = client.submit(SubmitRequest::new("reverse", "test")).await?;
//! assert_eq!(job.wait().await?, JobOutcome::Complete("tset".into()));
//! ```

pub mod handlers;
pub mod job;
pub mod session;

pub use job::{
    EventKind, ForegroundJob, JobEvent, JobObservers, JobOutcome, ObservedJob, SubmitRequest,
};
pub use session::{Session, SessionCtx};

use bytes::Bytes;
use tokio::net::ToSocketAddrs;
use tokio::sync::{mpsc, oneshot};

use crate::config::ClientOptions;
use crate::error::{GearlineError, Result};
use crate::protocol::{Frame, PacketType};
use crate::scheduler::JobStatus;
use handlers::{EchoHandler, OptionHandler, StatusHandler, SubmitHandler};

async fn await_reply<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await.map_err(|_| GearlineError::ConnectionClosed)?
}

#[derive(Debug, Clone)]
pub struct Client {
    session: Session,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::connect_with(addr, ClientOptions::default()).await
    }

    pub async fn connect_with<A: ToSocketAddrs>(addr: A, options: ClientOptions) -> Result<Self> {
        let session = Session::connect(addr, &options, Vec::new()).await?;
        Ok(Self { session })
    }

    /// Submit a foreground job. The returned job streams the worker's
    /// reports and ends with exactly one terminal event.
    pub async fn submit(&self, request: SubmitRequest) -> Result<ForegroundJob> {
        let frame = request.to_frame(false)?;
        let (created_tx, created_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.session.exchange(
            frame,
            SubmitHandler::foreground(created_tx, Some(events_tx), JobObservers::new()),
        )?;
        let handle = await_reply(created_rx).await?;
        Ok(ForegroundJob::new(handle, events_rx, self.session.clone()))
    }

    /// Submit a foreground job whose reports go to `observers` instead of a
    /// stream. Returns once the handle is known; observers keep firing for
    /// as long as the returned job is held.
    pub async fn submit_observed(
        &self,
        request: SubmitRequest,
        observers: JobObservers,
    ) -> Result<ObservedJob> {
        let frame = request.to_frame(false)?;
        let (created_tx, created_rx) = oneshot::channel();
        self.session
            .exchange(frame, SubmitHandler::foreground(created_tx, None, observers))?;
        let handle = await_reply(created_rx).await?;
        Ok(ObservedJob::new(handle, self.session.clone()))
    }

    /// Submit a background job and return its handle. Nothing is relayed
    /// for it; poll with [`Client::get_status`].
    pub async fn submit_background(&self, request: SubmitRequest) -> Result<String> {
        let frame = request.to_frame(true)?;
        let (created_tx, created_rx) = oneshot::channel();
        self.session
            .exchange(frame, SubmitHandler::background(created_tx))?;
        await_reply(created_rx).await
    }

    /// Status of a job by handle. Unknown handles (including finished jobs)
    /// report `known: false`.
    pub async fn get_status(&self, handle: &str) -> Result<JobStatus> {
        let (tx, rx) = oneshot::channel();
        self.session.exchange(
            Frame::request(PacketType::GetStatus, [Bytes::from(handle.to_string())]),
            StatusHandler::new(handle, tx),
        )?;
        await_reply(rx).await
    }

    pub async fn echo(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.session.exchange(
            Frame::request(PacketType::EchoReq, [payload.into()]),
            EchoHandler::new(tx),
        )?;
        await_reply(rx).await
    }

    /// Enable a connection option on the broker. Only `exceptions` is known.
    pub async fn set_option(&self, option: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.session.exchange(
            Frame::request(PacketType::OptionReq, [Bytes::from(option.to_string())]),
            OptionHandler::new(option, tx),
        )?;
        await_reply(rx).await
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}
