//! Pipeline configuration.

use crate::error::{CopyError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default block size of a single request (64 KiB, the classic aio copy size).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default in-flight request window.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Default inactivity limit before the pipeline degrades gracefully.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bounded sleep between empty polls, keeps cancellation responsive.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for one pipeline invocation, assembled by the caller
/// (typically the CLI layer) and passed in as a plain struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Size in bytes of a single read request.
    pub block_size: usize,

    /// Maximum number of requests in `Submitted` state at any instant.
    pub max_in_flight: usize,

    /// Total number of bytes to move.
    pub total_length: u64,

    /// Inactivity limit: no successful completion for this long triggers
    /// grace degrade (stop admissions, finalize output, drain).
    pub idle_timeout: Duration,

    /// Sleep interval when a loop iteration neither admitted nor completed
    /// anything.
    pub poll_interval: Duration,

    /// Drain-only mode: no destination, read completions are terminal.
    pub drain_only: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            total_length: 0,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_only: false,
        }
    }
}

impl PipelineConfig {
    /// Validate the configuration before the pipeline starts.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(CopyError::Config("block_size must be non-zero".into()));
        }
        if self.max_in_flight == 0 {
            return Err(CopyError::Config(
                "max_in_flight must be at least 1".into(),
            ));
        }
        if self.total_length == 0 {
            return Err(CopyError::Config(
                "total_length must be non-zero (nothing to transfer)".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(CopyError::Config(
                "poll_interval must be non-zero to bound the busy loop".into(),
            ));
        }
        Ok(())
    }
}
