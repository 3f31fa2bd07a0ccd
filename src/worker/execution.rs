use bytes::Bytes;

use crate::client::session::Session;
use crate::error::Result;
use crate::protocol::{Frame, PacketType};

/// A job as handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub handle: String,
    pub function: String,
    /// Empty for JOB_ASSIGN.
    pub unique_id: String,
    pub payload: Bytes,
}

/// A job this worker holds. Reports go straight to the broker.
///
/// The terminal reports (`complete`, `fail`, `exception`) take effect once;
/// later calls return `Ok(false)` and write nothing.
#[derive(Debug)]
pub struct JobExecution {
    assignment: Assignment,
    session: Session,
    finished: bool,
}

impl JobExecution {
    pub(crate) fn new(assignment: Assignment, session: Session) -> Self {
        Self {
            assignment,
            session,
            finished: false,
        }
    }

    pub fn handle(&self) -> &str {
        &self.assignment.handle
    }

    pub fn function(&self) -> &str {
        &self.assignment.function
    }

    pub fn unique_id(&self) -> &str {
        &self.assignment.unique_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.assignment.payload
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn handle_arg(&self) -> Bytes {
        Bytes::from(self.assignment.handle.clone())
    }

    fn report<I>(&self, packet: PacketType, data: I) -> Result<()>
    where
        I: IntoIterator<Item = Bytes>,
    {
        if self.finished {
            tracing::debug!(handle = %self.handle(), packet = %packet, "Job already finished, report not sent");
            return Ok(());
        }
        let mut args = vec![self.handle_arg()];
        args.extend(data);
        self.session.send(Frame::request(packet, args))
    }

    fn finish(&mut self, packet: PacketType, data: Option<Bytes>) -> Result<bool> {
        if self.finished {
            tracing::debug!(handle = %self.handle(), packet = %packet, "Ignoring second terminal report");
            return Ok(false);
        }
        self.report(packet, data)?;
        self.finished = true;
        tracing::info!(handle = %self.handle(), outcome = %packet, "Job finished");
        Ok(true)
    }

    pub fn send_status(&self, numerator: u64, denominator: u64) -> Result<()> {
        self.report(
            PacketType::WorkStatus,
            [
                Bytes::from(numerator.to_string()),
                Bytes::from(denominator.to_string()),
            ],
        )
    }

    pub fn send_data(&self, data: impl Into<Bytes>) -> Result<()> {
        self.report(PacketType::WorkData, Some(data.into()))
    }

    pub fn send_warning(&self, data: impl Into<Bytes>) -> Result<()> {
        self.report(PacketType::WorkWarning, Some(data.into()))
    }

    /// Report success with a result. `Ok(false)` if the job had already
    /// finished.
    pub fn complete(&mut self, result: impl Into<Bytes>) -> Result<bool> {
        self.finish(PacketType::WorkComplete, Some(result.into()))
    }

    pub fn fail(&mut self) -> Result<bool> {
        self.finish(PacketType::WorkFail, None)
    }

    pub fn exception(&mut self, data: impl Into<Bytes>) -> Result<bool> {
        self.finish(PacketType::WorkException, Some(data.into()))
    }
}

impl Drop for JobExecution {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(handle = %self.handle(), "Job dropped without a result");
        }
    }
}
