use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

use crate::error::Result;
use crate::utils::constants::{
    DEFAULT_GROUP_ID, DEFAULT_MAX_BACKOFF_MS, DEFAULT_MAX_POLL_RECORDS, DEFAULT_POLL_WAIT_MS,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MS, DEFAULT_STATE_DIR, ENV_PREFIX,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineConfig {
    /// Partition count shared by every topic; one worker runs per partition.
    #[validate(range(min = 1, max = 1024))]
    pub partitions: usize,

    #[validate(range(min = 1, max = 60000))]
    pub poll_wait_ms: u64,

    #[validate(range(min = 1))]
    pub max_poll_records: usize,

    /// Attempts per store or transport operation before the worker fails.
    #[validate(range(min = 1, max = 100))]
    pub retry_attempts: u32,

    pub retry_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Directory for changelogs. `None` keeps state in memory only.
    pub state_dir: Option<PathBuf>,

    #[validate(length(min = 1))]
    pub group_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: num_cpus::get(),
            poll_wait_ms: DEFAULT_POLL_WAIT_MS,
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            state_dir: Some(PathBuf::from(DEFAULT_STATE_DIR)),
            group_id: DEFAULT_GROUP_ID.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Layer defaults, an optional TOML file and `STATION_AGG_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let loaded: PipelineConfig = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_state_dir(mut self, state_dir: Option<PathBuf>) -> Self {
        self.state_dir = state_dir;
        self
    }

    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }
}
