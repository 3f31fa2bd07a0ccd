use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{GearlineError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Default broker port.
pub const DEFAULT_PORT: u16 = 4730;

/// What happens to a job whose worker disconnects while holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OrphanPolicy {
    /// Leave the job flagged as running. Nothing reassigns it.
    #[default]
    LeaveRunning,
    /// Put the job back in its queue with its original priority and age.
    Requeue,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    /// Embedded in every job handle: `H:<node_name>:<n>`.
    pub node_name: String,
    /// Largest argument block accepted from a peer.
    pub max_frame_len: usize,
    /// Live jobs the scheduler holds before refusing submissions.
    pub max_jobs: usize,
    /// Directory for persisted background jobs. `None` keeps jobs in memory only.
    pub store_dir: Option<PathBuf>,
    pub orphan_policy: OrphanPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            node_name: default_node_name(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_jobs: 100_000,
            store_dir: None,
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl BrokerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    pub fn with_orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }

    /// Prefix shared by every handle this broker issues.
    pub fn handle_prefix(&self) -> String {
        format!("H:{}:", self.node_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(GearlineError::InvalidConfig(
                "node name must not be empty".to_string(),
            ));
        }
        if self
            .node_name
            .chars()
            .any(|c| c == '\0' || c.is_whitespace())
        {
            return Err(GearlineError::InvalidConfig(format!(
                "node name {:?} must not contain NUL or whitespace",
                self.node_name
            )));
        }
        if self.max_frame_len == 0 {
            return Err(GearlineError::InvalidConfig(
                "max frame length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options for client and worker sessions.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Close the connection as soon as no exchange is pending. Suits
    /// fire-and-forget background submissions.
    pub close_when_idle: bool,
    pub max_frame_len: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            close_when_idle: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ClientOptions {
    pub fn close_when_idle(mut self) -> Self {
        self.close_when_idle = true;
        self
    }
}
