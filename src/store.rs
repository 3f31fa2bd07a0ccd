//! Optional durable backing for background jobs.
//!
//! The broker writes a background job through the store when it is created
//! and removes it once it reaches a terminal state. At startup everything
//! the store still holds is queued again.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{GearlineError, Result};
use crate::scheduler::Job;

pub trait JobStore: Send {
    fn persist(&mut self, job: &Job) -> Result<()>;

    /// Removing a handle that was never stored is not an error.
    fn remove(&mut self, handle: &str) -> Result<()>;

    /// Every stored job, oldest first.
    fn list_all(&self) -> Result<Vec<Job>>;
}

/// Store that lives as long as the process. Mostly useful in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: BTreeMap<String, Job>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl JobStore for MemoryStore {
    fn persist(&mut self, job: &Job) -> Result<()> {
        self.jobs.insert(job.handle.clone(), job.clone());
        Ok(())
    }

    fn remove(&mut self, handle: &str) -> Result<()> {
        self.jobs.remove(handle);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

/// One JSON document per job in a directory. File names are the hex
/// encoding of the handle, so any handle maps to a safe name.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, handle: &str) -> PathBuf {
        let name: String = handle.bytes().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl JobStore for FileStore {
    fn persist(&mut self, job: &Job) -> Result<()> {
        let path = self.path_for(&job.handle);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(job)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&mut self, handle: &str) -> Result<()> {
        match fs::remove_file(self.path_for(handle)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_all(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read(&path)?;
            let job: Job = serde_json::from_slice(&raw).map_err(|e| {
                GearlineError::Store(format!("{}: {}", path.display(), e))
            })?;
            jobs.push(job);
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
