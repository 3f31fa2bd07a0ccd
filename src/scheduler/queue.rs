use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use chrono::{DateTime, Utc};

use crate::scheduler::job::{Job, Priority};

const DEFAULT_MAX_JOBS: usize = 100_000;

/// Queue key for a function name: trimmed and case-folded.
pub fn function_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Heap entry. The greatest entry is the next job to hand out: highest
/// priority first, then oldest, then first enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    created_at: DateTime<Utc>,
    seq: u64,
    handle: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct FunctionQueue {
    pending: BinaryHeap<QueueEntry>,
    running: usize,
}

/// Holds every live job, partitioned into one priority queue per function.
#[derive(Debug)]
pub struct JobScheduler {
    jobs: HashMap<String, Job>,
    functions: BTreeMap<String, FunctionQueue>,
    next_seq: u64,
    max_jobs: usize,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            functions: BTreeMap::new(),
            next_seq: 0,
            max_jobs,
        }
    }

    /// Queue a job under its function. Returns false if the scheduler is at
    /// capacity.
    pub fn enqueue(&mut self, job: Job) -> bool {
        if self.jobs.len() >= self.max_jobs {
            return false;
        }
        let entry = QueueEntry {
            priority: job.priority,
            created_at: job.created_at,
            seq: self.next_seq,
            handle: job.handle.clone(),
        };
        self.next_seq += 1;
        self.functions
            .entry(function_key(&job.function))
            .or_default()
            .pending
            .push(entry);
        self.jobs.insert(job.handle.clone(), job);
        true
    }

    /// Key of the candidate queue whose head is the best job overall.
    fn best_queue<S: AsRef<str>>(&self, candidates: &[S]) -> Option<String> {
        candidates
            .iter()
            .map(|name| function_key(name.as_ref()))
            .filter_map(|key| {
                let head = self.functions.get(&key)?.pending.peek()?.clone();
                Some((key, head))
            })
            .max_by(|a, b| a.1.cmp(&b.1))
            .map(|(key, _)| key)
    }

    /// Take the highest priority, oldest job across all candidate functions,
    /// as if their queues were one.
    pub fn dequeue<S: AsRef<str>>(&mut self, candidates: &[S]) -> Option<&mut Job> {
        let key = self.best_queue(candidates)?;
        let entry = self.functions.get_mut(&key)?.pending.pop()?;
        self.jobs.get_mut(&entry.handle)
    }

    /// Whether `dequeue` would return a job for these candidates.
    pub fn peek_has_job_for<S: AsRef<str>>(&self, candidates: &[S]) -> bool {
        self.best_queue(candidates).is_some()
    }

    pub fn find_by_handle(&self, handle: &str) -> Option<&Job> {
        self.jobs.get(handle)
    }

    pub fn find_by_handle_mut(&mut self, handle: &str) -> Option<&mut Job> {
        self.jobs.get_mut(handle)
    }

    /// Flag a dequeued job as running. Returns false if the job is unknown or
    /// already running.
    pub fn mark_running(&mut self, handle: &str) -> bool {
        let Some(job) = self.jobs.get_mut(handle) else {
            return false;
        };
        if job.running {
            return false;
        }
        job.running = true;
        self.functions
            .entry(function_key(&job.function))
            .or_default()
            .running += 1;
        true
    }

    /// Clear the running flag and release the function's running count.
    pub fn mark_complete(&mut self, handle: &str) -> bool {
        let Some(job) = self.jobs.get_mut(handle) else {
            return false;
        };
        if !job.running {
            return false;
        }
        job.running = false;
        if let Some(queue) = self.functions.get_mut(&function_key(&job.function)) {
            queue.running = queue.running.saturating_sub(1);
        }
        true
    }

    /// Drop a job from every index. Used once a terminal outcome is delivered.
    pub fn remove(&mut self, handle: &str) -> Option<Job> {
        let job = self.jobs.remove(handle)?;
        if let Some(queue) = self.functions.get_mut(&function_key(&job.function)) {
            if job.running {
                queue.running = queue.running.saturating_sub(1);
            } else {
                queue.pending.retain(|entry| entry.handle != handle);
            }
        }
        Some(job)
    }

    /// Remove a background job that is not running.
    pub fn reap(&mut self, handle: &str) -> Option<Job> {
        match self.jobs.get(handle) {
            Some(job) if job.background && !job.running => self.remove(handle),
            _ => None,
        }
    }

    /// Put a running job back in its queue, keeping its priority and age.
    pub fn requeue(&mut self, handle: &str) -> bool {
        if !self.mark_complete(handle) {
            return false;
        }
        let Some(job) = self.jobs.get(handle) else {
            return false;
        };
        let key = function_key(&job.function);
        let entry = QueueEntry {
            priority: job.priority,
            created_at: job.created_at,
            seq: self.next_seq,
            handle: job.handle.clone(),
        };
        self.next_seq += 1;
        self.functions.entry(key).or_default().pending.push(entry);
        true
    }

    /// Every function name ever queued, including those now empty.
    pub fn function_list(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn count_queued(&self, function: &str) -> usize {
        self.functions
            .get(&function_key(function))
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    pub fn count_running(&self, function: &str) -> usize {
        self.functions
            .get(&function_key(function))
            .map(|q| q.running)
            .unwrap_or(0)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
