//! Completion-driven copy pipeline.
//!
//! One control loop alternates between admission (submit reads while the
//! in-flight window has room), dispatch (poll completions and run the
//! matching continuation) and supervision (cancellation flag, idle timeout).
//! A completed read turns into the write that drains its buffer; a completed
//! write retires the job and advances the progress counters. The structure
//! mirrors the classic libaio copy state machine, with all shared counters
//! consolidated into [`PipelineState`].

mod state;

pub use state::{Phase, PipelineState};

use crate::config::PipelineConfig;
use crate::context::{AioContext, Completion};
use crate::device::IoFault;
use crate::error::{CopyError, Result};
use crate::job::{JobKind, JobState, TransferJob};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Completion events drained per poll call.
const POLL_BATCH: usize = 64;

/// Bounded number of poll rounds spent retiring in-flight work on the fatal
/// error path before giving up on stragglers.
const FATAL_DRAIN_ROUNDS: usize = 64;

/// Why the pipeline left `Running` before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainReason {
    Cancelled,
    Idle,
}

/// Final status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// All bytes were transferred.
    Completed,
    /// The idle supervisor finalized the transfer early; some bytes may be
    /// missing.
    Degraded,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub status: PipelineStatus,
    pub bytes_transferred: u64,
    pub total_length: u64,
    pub duration_seconds: f64,
    pub bandwidth_mib_per_sec: f64,
    pub jobs_completed: u64,
    pub underflows: u64,
    pub retries: u64,
}

impl PipelineReport {
    /// Whether every requested byte made it to the destination.
    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.total_length
    }

    /// Serialize the report as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// The pipeline driver: owns the context, the configuration and all state.
pub struct Pipeline<C: AioContext> {
    ctx: C,
    config: PipelineConfig,
    state: PipelineState,
    source_streaming: bool,
    dest_streaming: bool,
    dest_finalized: bool,
    drain_reason: Option<DrainReason>,
}

impl<C: AioContext> Pipeline<C> {
    /// Create a pipeline over a context. Validates the configuration.
    pub fn new(ctx: C, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let state = PipelineState::new(config.total_length, config.max_in_flight);
        Ok(Self {
            ctx,
            config,
            state,
            source_streaming: false,
            dest_streaming: false,
            dest_finalized: false,
            drain_reason: None,
        })
    }

    /// Mark the source as a streaming device: reads have no stable offsets,
    /// so the in-flight window is restricted to 1 to keep the data in order.
    pub fn with_streaming_source(mut self, streaming: bool) -> Self {
        self.source_streaming = streaming;
        self
    }

    /// Mark the destination as a streaming device: writes ignore offsets and
    /// the in-flight window is restricted to 1 to keep output ordered.
    pub fn with_streaming_destination(mut self, streaming: bool) -> Self {
        self.dest_streaming = streaming;
        self
    }

    /// Drive the transfer to termination. The cancellation token is checked
    /// once per iteration; on trip the pipeline stops admitting reads and
    /// drains in-flight work before exiting.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<PipelineReport> {
        if self.config.drain_only == self.ctx.has_destination() {
            return Err(CopyError::Config(if self.config.drain_only {
                "drain_only set but a destination is configured".into()
            } else {
                "no destination configured; enable drain_only".into()
            }));
        }
        if self.dest_streaming && !self.config.drain_only && self.config.max_in_flight > 1 {
            return Err(CopyError::Config(
                "a streaming destination is strictly sequential; max_in_flight must be 1".into(),
            ));
        }
        // Concurrent reads against a stream would land under pre-assigned
        // offsets in whatever order they complete.
        if self.source_streaming && self.config.max_in_flight > 1 {
            return Err(CopyError::Config(
                "a streaming source is strictly sequential; max_in_flight must be 1".into(),
            ));
        }

        let started = Instant::now();
        info!(
            total = self.config.total_length,
            block = self.config.block_size,
            window = self.config.max_in_flight,
            drain_only = self.config.drain_only,
            "starting transfer"
        );

        let outcome = 'driver: loop {
            // Admission: fill the in-flight window.
            let mut progressed = false;
            while self.state.can_admit() {
                if let Err(err) = self.admit_read() {
                    break 'driver Err(err);
                }
                progressed = true;
            }

            // Dispatch: route completions to their continuations.
            match self.dispatch().await {
                Ok(events) => progressed |= events > 0,
                Err(err) => break 'driver Err(err),
            }

            // Supervision: cancellation flag and idle timeout.
            if let Err(err) = self.supervise(&cancel).await {
                break 'driver Err(err);
            }

            if self.state.is_complete() {
                break 'driver Ok(());
            }
            if self.state.phase() == Phase::Draining && self.state.in_flight() == 0 {
                break 'driver Ok(());
            }

            // Nothing admitted and nothing completed: bounded sleep so the
            // supervisor stays responsive instead of blocking on the queue.
            if !progressed {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        match outcome {
            Err(err) => Err(self.shutdown_on_error(err).await),
            Ok(()) => {
                if let Err(err) = self.ensure_finalized().await {
                    return Err(self.shutdown_on_error(err).await);
                }
                self.state.terminate();
                self.finish(started)
            }
        }
    }

    fn finish(self, started: Instant) -> Result<PipelineReport> {
        if self.state.is_complete() {
            let report = self.report(PipelineStatus::Completed, started);
            info!(
                bytes = report.bytes_transferred,
                seconds = format!("{:.3}", report.duration_seconds),
                bandwidth_mib_s = format!("{:.2}", report.bandwidth_mib_per_sec),
                underflows = report.underflows,
                retries = report.retries,
                "transfer complete"
            );
            return Ok(report);
        }

        match self.drain_reason {
            Some(DrainReason::Cancelled) => {
                warn!(
                    transferred = self.state.bytes_transferred(),
                    total = self.state.total_length(),
                    "transfer cancelled with partial completion"
                );
                Err(CopyError::Cancelled)
            }
            Some(DrainReason::Idle) | None => {
                let report = self.report(PipelineStatus::Degraded, started);
                warn!(
                    transferred = report.bytes_transferred,
                    total = report.total_length,
                    "transfer degraded: source went idle before completion"
                );
                Ok(report)
            }
        }
    }

    fn report(&self, status: PipelineStatus, started: Instant) -> PipelineReport {
        let duration = started.elapsed();
        let seconds = duration.as_secs_f64();
        let bandwidth = if seconds > 0.0 {
            self.state.bytes_transferred() as f64 / seconds / (1024.0 * 1024.0)
        } else {
            0.0
        };
        PipelineReport {
            status,
            bytes_transferred: self.state.bytes_transferred(),
            total_length: self.state.total_length(),
            duration_seconds: seconds,
            bandwidth_mib_per_sec: bandwidth,
            jobs_completed: self.state.jobs_completed(),
            underflows: self.state.underflows(),
            retries: self.state.retries(),
        }
    }

    /// Admission controller: carve the next region and submit a read for it.
    fn admit_read(&mut self) -> Result<()> {
        let Some(region) = self.state.next_read(self.config.block_size) else {
            debug_assert!(false, "can_admit granted admission with nothing to read");
            return Ok(());
        };
        let id = self.state.allocate_id();
        let job = TransferJob::read(id, region.offset, region.len);
        debug!(job = id, offset = region.offset, len = region.len, "admitting read");
        self.state.track_submitted(id);
        if let Err(err) = self.ctx.submit(job) {
            self.state.release(id);
            return Err(err);
        }
        Ok(())
    }

    /// Completion dispatcher: poll without blocking until the queue is empty,
    /// invoking the continuation for each job's kind.
    async fn dispatch(&mut self) -> Result<usize> {
        let mut processed = 0;
        loop {
            let events = self
                .ctx
                .poll(POLL_BATCH, std::time::Duration::ZERO)
                .await;
            if events.is_empty() {
                break;
            }
            for completion in events {
                processed += 1;
                match completion.job.kind {
                    JobKind::Read => self.on_read_complete(completion)?,
                    JobKind::Write => self.on_write_complete(completion)?,
                }
            }
        }
        Ok(processed)
    }

    /// Read continuation: `Submitted[Read]` → retry, write spawn, or retire.
    fn on_read_complete(&mut self, completion: Completion) -> Result<()> {
        let Completion {
            mut job,
            bytes,
            fault,
        } = completion;

        match fault {
            Some(IoFault::Transient) => return self.retry_or_drop(job),
            Some(IoFault::Fatal(source)) => {
                job.state = JobState::Failed;
                self.state.release(job.id);
                return Err(CopyError::FatalIo {
                    kind: "read",
                    offset: job.file_offset,
                    source,
                });
            }
            None => {}
        }

        // A successful empty read means the streaming source has nothing for
        // us yet; same busy-retry as a would-block fault.
        if bytes == 0 {
            return self.retry_or_drop(job);
        }

        if bytes < job.requested {
            // Underflow is not an error for streaming sources: log, shrink
            // the derived write and hand the shortfall back to admission.
            self.state.note_underflow();
            warn!(
                job = job.id,
                got = bytes,
                want = job.requested,
                offset = job.file_offset,
                "read underflow"
            );
            if self.state.phase() == Phase::Running {
                self.state
                    .push_shortfall(job.file_offset + bytes as u64, job.requested - bytes);
            }
        }

        if !self.ctx.has_destination() {
            // Drain-only mode: the read is the terminal continuation.
            job.state = JobState::Completed;
            self.state.retire(job.id, bytes);
            return Ok(());
        }

        if self.dest_finalized {
            warn!(
                job = job.id,
                bytes, "destination already finalized; dropping read result"
            );
            self.state.release(job.id);
            return Ok(());
        }

        let write_offset = if self.dest_streaming { 0 } else { job.file_offset };
        let write = job.into_write(bytes, write_offset);
        let id = write.id;
        debug!(
            job = id,
            bytes,
            offset = write_offset,
            "read complete, submitting write"
        );
        if let Err(err) = self.ctx.submit(write) {
            // The job is gone; leaving it in the in-flight set would make
            // the shutdown drain wait for a completion that cannot arrive.
            self.state.release(id);
            return Err(err);
        }
        Ok(())
    }

    /// Write continuation: `Submitted[Write]` → retire or fail. The bytes
    /// written must equal the bytes requested; any mismatch is fatal, unlike
    /// the read path.
    fn on_write_complete(&mut self, completion: Completion) -> Result<()> {
        let Completion {
            mut job,
            bytes,
            fault,
        } = completion;

        if self.dest_finalized {
            warn!(
                job = job.id,
                "late write completion after destination finalize; dropping"
            );
            self.state.release(job.id);
            return Ok(());
        }

        match fault {
            Some(IoFault::Transient) => self.retry_or_drop(job),
            Some(IoFault::Fatal(source)) => {
                job.state = JobState::Failed;
                self.state.release(job.id);
                Err(CopyError::FatalIo {
                    kind: "write",
                    offset: job.file_offset,
                    source,
                })
            }
            None => {
                if bytes != job.requested {
                    job.state = JobState::Failed;
                    let err = CopyError::WriteMismatch {
                        offset: job.file_offset,
                        requested: job.requested,
                        completed: bytes,
                    };
                    self.state.release(job.id);
                    return Err(err);
                }
                job.state = JobState::Completed;
                self.state.retire(job.id, bytes);
                debug!(job = job.id, bytes, "write complete");
                Ok(())
            }
        }
    }

    /// Busy-retry a transiently failed request, or destroy it while draining
    /// so shutdown terminates.
    fn retry_or_drop(&mut self, mut job: TransferJob) -> Result<()> {
        if self.state.phase() == Phase::Running {
            self.state.note_retry();
            debug!(
                job = job.id,
                kind = job.kind.as_str(),
                offset = job.file_offset,
                "no data yet, resubmitting"
            );
            job.reset_for_retry();
            let id = job.id;
            if let Err(err) = self.ctx.submit(job) {
                self.state.release(id);
                return Err(err);
            }
            Ok(())
        } else {
            debug!(
                job = job.id,
                kind = job.kind.as_str(),
                "dropping transient request during drain"
            );
            job.state = JobState::Failed;
            self.state.release(job.id);
            Ok(())
        }
    }

    /// Idle/cancellation supervisor, run once per driver iteration.
    async fn supervise(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.state.phase() == Phase::Running && cancel.is_cancelled() {
            warn!(
                in_flight = self.state.in_flight(),
                "cancellation requested; draining in-flight requests"
            );
            self.drain_reason = Some(DrainReason::Cancelled);
            self.state.begin_draining();
            let ids: Vec<u64> = self.state.submitted_ids().collect();
            for id in ids {
                self.ctx.cancel(id);
            }
        }

        if self.state.phase() == Phase::Running
            && self.state.last_completion().elapsed() >= self.config.idle_timeout
        {
            warn!(
                idle = ?self.config.idle_timeout,
                in_flight = self.state.in_flight(),
                "idle timeout exceeded with no completions; degrading gracefully"
            );
            self.drain_reason = Some(DrainReason::Idle);
            self.state.begin_draining();
            // Make already-written data durable before the drain finishes.
            self.ensure_finalized().await?;
        }

        Ok(())
    }

    /// Finalize the destination exactly once, regardless of exit path.
    async fn ensure_finalized(&mut self) -> Result<()> {
        if self.dest_finalized || !self.ctx.has_destination() {
            return Ok(());
        }
        self.dest_finalized = true;
        debug!("finalizing destination");
        self.ctx
            .finalize_destination()
            .await
            .map_err(|source| CopyError::FatalIo {
                kind: "finalize",
                offset: 0,
                source,
            })
    }

    /// Fatal error path: the driver is the single place that releases
    /// resources and picks the exit status. Outstanding requests are
    /// cancelled best-effort and retired within a bounded number of rounds.
    async fn shutdown_on_error(&mut self, err: CopyError) -> CopyError {
        error!(error = %err, in_flight = self.state.in_flight(), "fatal error, shutting down");
        self.state.begin_draining();

        let ids: Vec<u64> = self.state.submitted_ids().collect();
        for id in ids {
            self.ctx.cancel(id);
        }

        for _ in 0..FATAL_DRAIN_ROUNDS {
            if self.state.in_flight() == 0 {
                break;
            }
            let events = self.ctx.poll(POLL_BATCH, self.config.poll_interval).await;
            for completion in events {
                self.state.release(completion.job.id);
            }
        }
        if self.state.in_flight() > 0 {
            warn!(
                in_flight = self.state.in_flight(),
                "requests still outstanding at forced shutdown"
            );
        }

        if let Err(fin_err) = self.ensure_finalized().await {
            warn!(error = %fin_err, "destination finalize failed during shutdown");
        }

        self.state.terminate();
        err
    }
}
