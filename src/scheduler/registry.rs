use std::collections::BTreeMap;

use crate::scheduler::job::Job;
use crate::scheduler::queue::function_key;
use crate::ConnectionId;

/// A connection that has registered at least one capability.
#[derive(Debug, Clone)]
pub struct Worker {
    pub conn: ConnectionId,
    /// Function key to advisory timeout in seconds.
    capabilities: BTreeMap<String, Option<u32>>,
    pub sleeping: bool,
    pub current_assignment: Option<String>,
}

impl Worker {
    pub fn new(conn: ConnectionId) -> Self {
        Self {
            conn,
            capabilities: BTreeMap::new(),
            sleeping: false,
            current_assignment: None,
        }
    }

    pub fn can_do(&mut self, function: &str, timeout: Option<u32>) {
        self.capabilities.insert(function_key(function), timeout);
    }

    pub fn cant_do(&mut self, function: &str) {
        self.capabilities.remove(&function_key(function));
    }

    pub fn reset_abilities(&mut self) {
        self.capabilities.clear();
    }

    pub fn can_perform(&self, function: &str) -> bool {
        self.capabilities.contains_key(&function_key(function))
    }

    /// Registered function keys, in name order.
    pub fn functions(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    pub fn timeout_for(&self, function: &str) -> Option<u32> {
        self.capabilities
            .get(&function_key(function))
            .copied()
            .flatten()
    }

    /// Eligible for new work: no outstanding assignment.
    pub fn is_available(&self) -> bool {
        self.current_assignment.is_none()
    }
}

/// Tracks which connections can perform which functions.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<ConnectionId, Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The worker record for a connection, created on first use.
    pub fn get_or_create_worker(&mut self, conn: ConnectionId) -> &mut Worker {
        self.workers.entry(conn).or_insert_with(|| {
            tracing::info!(conn_id = conn, "Worker registered");
            Worker::new(conn)
        })
    }

    pub fn worker(&self, conn: ConnectionId) -> Option<&Worker> {
        self.workers.get(&conn)
    }

    pub fn worker_mut(&mut self, conn: ConnectionId) -> Option<&mut Worker> {
        self.workers.get_mut(&conn)
    }

    /// Forget a connection. The returned record still carries any current
    /// assignment; what happens to that job is the caller's decision.
    pub fn remove_connection(&mut self, conn: ConnectionId) -> Option<Worker> {
        self.workers.remove(&conn)
    }

    /// Clear `sleeping` on every sleeping worker that can perform the job's
    /// function and return their connections, which must be sent a NOOP.
    pub fn wake_all_candidates(&mut self, job: &Job) -> Vec<ConnectionId> {
        self.wake_function(&job.function)
    }

    pub fn wake_function(&mut self, function: &str) -> Vec<ConnectionId> {
        self.workers
            .values_mut()
            .filter(|w| w.sleeping && w.can_perform(function))
            .map(|w| {
                w.sleeping = false;
                w.conn
            })
            .collect()
    }

    pub fn capable_worker_count(&self, function: &str) -> usize {
        self.workers
            .values()
            .filter(|w| w.can_perform(function))
            .count()
    }

    pub fn all_workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    /// The worker holding a given job, if any.
    pub fn assignee_of(&self, handle: &str) -> Option<ConnectionId> {
        self.workers
            .values()
            .find(|w| w.current_assignment.as_deref() == Some(handle))
            .map(|w| w.conn)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
