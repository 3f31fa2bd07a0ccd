use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{BrokerConfig, OrphanPolicy};
use crate::dispatch::DispatchChain;
use crate::error::{ProtocolError, Result};
use crate::protocol::{Frame, Inbound, Magic, Outbound, PacketType};
use crate::scheduler::{Job, JobScheduler, JobStatus, Priority, WorkerRegistry};
use crate::server::admin;
use crate::server::handlers::{ClientResponder, ConnectionResponder, WorkerResponder};
use crate::store::{FileStore, JobStore};
use crate::ConnectionId;

/// A connected peer as the broker sees it.
#[derive(Debug)]
pub struct Peer {
    pub addr: String,
    pub client_id: Option<String>,
    /// Set by `OPTION_REQ exceptions`.
    pub exceptions: bool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Everything the broker's request handlers may touch.
///
/// Owned by a single task; every connection's frames are applied to it one
/// at a time, so nothing here needs a lock.
pub struct BrokerState {
    pub scheduler: JobScheduler,
    pub registry: WorkerRegistry,
    peers: BTreeMap<ConnectionId, Peer>,
    store: Option<Box<dyn JobStore>>,
    handle_prefix: String,
    next_handle: u64,
    orphan_policy: OrphanPolicy,
    shutdown_requested: bool,
}

impl BrokerState {
    fn new(config: &BrokerConfig, store: Option<Box<dyn JobStore>>) -> Self {
        Self {
            scheduler: JobScheduler::with_capacity(config.max_jobs),
            registry: WorkerRegistry::new(),
            peers: BTreeMap::new(),
            store,
            handle_prefix: config.handle_prefix(),
            next_handle: 1,
            orphan_policy: config.orphan_policy,
            shutdown_requested: false,
        }
    }

    /// Queue a frame for a connection. Frames for connections that are gone
    /// are dropped; events are fire-and-forget.
    pub fn send(&self, conn: ConnectionId, frame: Frame) {
        self.send_outbound(conn, Outbound::Packet(frame));
    }

    pub fn send_outbound(&self, conn: ConnectionId, item: Outbound) {
        match self.peers.get(&conn) {
            Some(peer) => {
                if peer.outbound.send(item).is_err() {
                    tracing::debug!(conn_id = conn, "Writer gone, dropping outbound item");
                }
            }
            None => tracing::debug!(conn_id = conn, "No such connection, dropping outbound item"),
        }
    }

    pub fn peer(&self, conn: ConnectionId) -> Option<&Peer> {
        self.peers.get(&conn)
    }

    pub fn peer_mut(&mut self, conn: ConnectionId) -> Option<&mut Peer> {
        self.peers.get_mut(&conn)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&ConnectionId, &Peer)> {
        self.peers.iter()
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    fn allocate_handle(&mut self) -> String {
        let handle = format!("{}{}", self.handle_prefix, self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Create a job, answer with its handle, then wake sleeping workers that
    /// can run it.
    pub fn submit(
        &mut self,
        conn: ConnectionId,
        priority: Priority,
        background: bool,
        function: String,
        unique_id: String,
        payload: Bytes,
    ) {
        if self.scheduler.is_full() {
            tracing::warn!(conn_id = conn, function = %function, "Job queue full, rejecting submission");
            self.send(conn, Frame::error("ERR_QUEUE_FULL", "Job queue is full"));
            return;
        }

        let handle = self.allocate_handle();
        let mut job = Job::new(
            handle.clone(),
            function.clone(),
            unique_id,
            payload,
            priority,
            background,
        );
        if !background {
            job = job.with_watcher(conn);
        }
        if background {
            if let Some(store) = self.store.as_mut() {
                if let Err(e) = store.persist(&job) {
                    tracing::warn!(handle = %handle, error = %e, "Failed to persist job");
                }
            }
        }
        self.scheduler.enqueue(job);
        self.send(
            conn,
            Frame::response(PacketType::JobCreated, [Bytes::from(handle.clone())]),
        );
        tracing::info!(
            conn_id = conn,
            handle = %handle,
            function = %function,
            priority = %priority,
            background,
            "Job created"
        );

        for worker in self.registry.wake_function(&function) {
            tracing::debug!(conn_id = worker, function = %function, "Waking worker");
            self.send(worker, Frame::bare(Magic::Response, PacketType::Noop));
        }
    }

    pub fn status(&self, handle: &str) -> JobStatus {
        self.scheduler
            .find_by_handle(handle)
            .map(Job::status)
            .unwrap_or_else(JobStatus::unknown)
    }

    /// Hand the requesting worker its next job, or NO_JOB.
    pub fn grab(&mut self, conn: ConnectionId, unique: bool) {
        let functions = match self.registry.worker_mut(conn) {
            Some(worker) if worker.is_available() => {
                worker.sleeping = false;
                worker.functions()
            }
            _ => {
                self.send(conn, Frame::bare(Magic::Response, PacketType::NoJob));
                return;
            }
        };

        let Some(job) = self.scheduler.dequeue(&functions) else {
            self.send(conn, Frame::bare(Magic::Response, PacketType::NoJob));
            return;
        };
        let handle = job.handle.clone();
        let frame = if unique {
            Frame::response(
                PacketType::JobAssignUniq,
                [
                    Bytes::from(handle.clone()),
                    Bytes::from(job.function.clone()),
                    Bytes::from(job.unique_id.clone()),
                    job.payload.clone(),
                ],
            )
        } else {
            Frame::response(
                PacketType::JobAssign,
                [
                    Bytes::from(handle.clone()),
                    Bytes::from(job.function.clone()),
                    job.payload.clone(),
                ],
            )
        };

        self.scheduler.mark_running(&handle);
        if let Some(worker) = self.registry.worker_mut(conn) {
            worker.current_assignment = Some(handle.clone());
        }
        tracing::info!(conn_id = conn, handle = %handle, "Job assigned");
        self.send(conn, frame);
    }

    /// Mark the worker asleep. If matching work is already queued it is
    /// woken straight away, which covers jobs that arrived between its
    /// NO_JOB and this PRE_SLEEP.
    pub fn pre_sleep(&mut self, conn: ConnectionId) {
        let Some(worker) = self.registry.worker_mut(conn) else {
            tracing::debug!(conn_id = conn, "PRE_SLEEP from a connection with no abilities");
            return;
        };
        worker.sleeping = true;
        let functions = worker.functions();
        if worker.is_available() && self.scheduler.peek_has_job_for(&functions) {
            if let Some(worker) = self.registry.worker_mut(conn) {
                worker.sleeping = false;
            }
            self.send(conn, Frame::bare(Magic::Response, PacketType::Noop));
        }
    }

    /// Apply a worker's progress or result report and relay it to the job's
    /// watchers.
    pub fn work_report(&mut self, conn: ConnectionId, frame: &Frame) -> std::result::Result<(), ProtocolError> {
        let packet = frame.packet();
        let args = frame.expect_args()?;
        let handle = crate::protocol::handle_arg(packet, &args[0])?;
        let progress = if packet == PacketType::WorkStatus {
            Some((
                crate::protocol::number_arg(packet, &args[1])?,
                crate::protocol::number_arg(packet, &args[2])?,
            ))
        } else {
            None
        };

        if self.registry.assignee_of(&handle) != Some(conn) {
            tracing::warn!(
                conn_id = conn,
                handle = %handle,
                packet = %packet,
                "Report for a job this connection does not hold, dropping"
            );
            return Ok(());
        }

        let Some(job) = self.scheduler.find_by_handle_mut(&handle) else {
            tracing::warn!(conn_id = conn, handle = %handle, "Report for unknown job, dropping");
            return Ok(());
        };
        if let Some((numerator, denominator)) = progress {
            job.numerator = numerator;
            job.denominator = denominator;
        }
        let watchers = job.watchers().to_vec();
        let relayed = frame.with_magic(Magic::Response);
        for watcher in watchers {
            self.send(watcher, relayed.clone());
        }

        if packet.is_terminal() {
            if let Some(job) = self.scheduler.remove(&handle) {
                if job.background {
                    if let Some(store) = self.store.as_mut() {
                        if let Err(e) = store.remove(&handle) {
                            tracing::warn!(handle = %handle, error = %e, "Failed to remove persisted job");
                        }
                    }
                }
            }
            if let Some(worker) = self.registry.worker_mut(conn) {
                worker.current_assignment = None;
            }
            tracing::info!(conn_id = conn, handle = %handle, outcome = %packet, "Job finished");
        }
        Ok(())
    }

    /// Remove a queued background job by hand.
    pub fn reap(&mut self, handle: &str) -> bool {
        let Some(job) = self.scheduler.reap(handle) else {
            return false;
        };
        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.remove(&job.handle) {
                tracing::warn!(handle = %handle, error = %e, "Failed to remove persisted job");
            }
        }
        tracing::info!(handle = %handle, "Job reaped");
        true
    }

    fn drop_connection(&mut self, conn: ConnectionId) {
        self.peers.remove(&conn);
        let Some(worker) = self.registry.remove_connection(conn) else {
            return;
        };
        let Some(handle) = worker.current_assignment else {
            return;
        };
        match self.orphan_policy {
            OrphanPolicy::LeaveRunning => {
                tracing::warn!(conn_id = conn, handle = %handle, "Worker left with a job in hand");
            }
            OrphanPolicy::Requeue => {
                if self.scheduler.requeue(&handle) {
                    tracing::info!(conn_id = conn, handle = %handle, "Requeued orphaned job");
                    if let Some(function) = self
                        .scheduler
                        .find_by_handle(&handle)
                        .map(|j| j.function.clone())
                    {
                        for worker in self.registry.wake_function(&function) {
                            self.send(worker, Frame::bare(Magic::Response, PacketType::Noop));
                        }
                    }
                }
            }
        }
    }

    /// Queue stored jobs and move the handle counter past them.
    fn restore(&mut self) -> Result<usize> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };
        let jobs = store.list_all()?;
        let total = jobs.len();
        let mut restored = 0;
        for job in jobs {
            if let Some(n) = job
                .handle
                .strip_prefix(&self.handle_prefix)
                .and_then(|n| n.parse::<u64>().ok())
            {
                self.next_handle = self.next_handle.max(n + 1);
            }
            if !self.scheduler.enqueue(job) {
                tracing::warn!(restored, total, "Job queue full while restoring persisted jobs");
                break;
            }
            restored += 1;
        }
        Ok(restored)
    }
}

/// The broker: shared state plus one dispatch chain per connection.
pub struct Broker {
    state: BrokerState,
    chains: BTreeMap<ConnectionId, DispatchChain<BrokerState>>,
}

impl Broker {
    /// Build a broker, opening the file store if one is configured and
    /// queueing whatever it holds.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let store: Option<Box<dyn JobStore>> = match &config.store_dir {
            Some(dir) => Some(Box::new(FileStore::open(dir)?)),
            None => None,
        };
        Self::with_store(config, store)
    }

    pub fn with_store(config: &BrokerConfig, store: Option<Box<dyn JobStore>>) -> Result<Self> {
        config.validate()?;
        let mut state = BrokerState::new(config, store);
        let restored = state.restore()?;
        if restored > 0 {
            tracing::info!(restored, "Restored persisted jobs");
        }
        Ok(Self {
            state,
            chains: BTreeMap::new(),
        })
    }

    /// Register a new connection and its request handlers.
    pub fn connect(
        &mut self,
        conn: ConnectionId,
        addr: impl Into<String>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) {
        let addr = addr.into();
        tracing::debug!(conn_id = conn, addr = %addr, "Connection opened");
        self.state.peers.insert(
            conn,
            Peer {
                addr,
                client_id: None,
                exceptions: false,
                outbound,
            },
        );
        let mut chain = DispatchChain::new();
        chain.push(ConnectionResponder::new(conn));
        chain.push(ClientResponder::new(conn));
        chain.push(WorkerResponder::new(conn));
        self.chains.insert(conn, chain);
    }

    pub fn handle_inbound(&mut self, conn: ConnectionId, inbound: Inbound) {
        match inbound {
            Inbound::Packet(frame) => self.handle_frame(conn, frame),
            Inbound::Unknown { magic, code } => {
                let e = ProtocolError::UnknownPacketType(code);
                if magic == Magic::Request {
                    tracing::warn!(conn_id = conn, code, "Answering unknown packet type");
                    self.state.send(conn, Frame::error(e.code(), &e.to_string()));
                } else {
                    tracing::warn!(conn_id = conn, error = %e, "Dropping frame");
                }
            }
            Inbound::Admin(line) => {
                let reply = admin::execute(&mut self.state, &line);
                self.state.send_outbound(conn, Outbound::Text(reply));
            }
        }
    }

    /// Run one frame through the connection's chain. Protocol errors are
    /// answered with ERROR when the request expects a reply and logged
    /// otherwise.
    pub fn handle_frame(&mut self, conn: ConnectionId, frame: Frame) {
        let Some(chain) = self.chains.get_mut(&conn) else {
            tracing::warn!(conn_id = conn, packet = %frame.packet(), "Frame for unknown connection");
            return;
        };
        tracing::debug!(conn_id = conn, packet = %frame.packet(), "Frame received");
        if let Err(e) = chain.dispatch(&frame, &mut self.state) {
            if frame.magic() == Magic::Request && frame.packet().expects_response() {
                tracing::debug!(conn_id = conn, error = %e, "Answering protocol error");
                self.state.send(conn, Frame::error(e.code(), &e.to_string()));
            } else {
                tracing::warn!(conn_id = conn, error = %e, "Dropping frame");
            }
        }
    }

    /// Forget a connection: its pending handlers go with it, and any job it
    /// held as a worker is handled per the orphan policy.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.chains.remove(&conn);
        self.state.drop_connection(conn);
        tracing::debug!(conn_id = conn, "Connection closed");
    }

    pub fn state(&self) -> &BrokerState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut BrokerState {
        &mut self.state
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.state.scheduler
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.state.registry
    }

    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested
    }

    pub fn connection_count(&self) -> usize {
        self.chains.len()
    }
}
