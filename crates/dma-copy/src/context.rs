//! Bounded asynchronous submission/completion context.
//!
//! [`AioContext`] is the seam between the pipeline driver and the kernel-side
//! async I/O facility. [`ChannelAioContext`] implements it by running each
//! request on a tokio task against the [`Source`]/[`Destination`]
//! capabilities and delivering completions over a channel, preserving the
//! submit → poll → completion shape of an io_submit/io_getevents loop.

use crate::device::{Destination, IoFault, Source};
use crate::error::{CopyError, Result};
use crate::job::{JobKind, JobState, TransferJob};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// One completion event: the originating job, the bytes actually moved and
/// the failure class if the operation did not succeed.
#[derive(Debug)]
pub struct Completion {
    pub job: TransferJob,
    pub bytes: usize,
    pub fault: Option<IoFault>,
}

/// Submission/completion facility with a bounded queue depth.
#[async_trait]
pub trait AioContext: Send {
    /// Enqueue one operation. Fails with [`CopyError::ContextSaturated`] when
    /// the queue depth is exceeded, or [`CopyError::Submission`] for
    /// descriptor-level failures.
    fn submit(&mut self, job: TransferJob) -> Result<()>;

    /// Collect up to `max_events` completions, waiting at most `timeout`.
    /// A zero timeout never blocks.
    async fn poll(&mut self, max_events: usize, timeout: Duration) -> Vec<Completion>;

    /// Best-effort cancellation of an in-flight request. A completion may
    /// still arrive for it later and must be tolerated by the caller.
    fn cancel(&mut self, job_id: u64);

    /// Whether a destination is configured (false in drain-only mode).
    fn has_destination(&self) -> bool;

    /// Finalize the destination so already-written data is durable. Must be
    /// safe to skip when no destination is configured.
    async fn finalize_destination(&mut self) -> std::io::Result<()>;
}

/// Tokio-task-backed context over `Source`/`Destination` capabilities.
pub struct ChannelAioContext {
    source: Arc<dyn Source>,
    dest: Option<Arc<dyn Destination>>,
    depth: usize,
    queued: usize,
    cancelled: HashSet<u64>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl ChannelAioContext {
    /// Create a context with the given queue depth. `dest` is `None` in
    /// drain-only mode.
    pub fn new(source: Arc<dyn Source>, dest: Option<Arc<dyn Destination>>, depth: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            source,
            dest,
            depth,
            queued: 0,
            cancelled: HashSet::new(),
            tx,
            rx,
        }
    }

    fn note_received(&mut self, completion: &Completion) {
        self.queued = self.queued.saturating_sub(1);
        if self.cancelled.remove(&completion.job.id) {
            // Cancellation was best-effort; the request completed anyway.
            debug!(job = completion.job.id, "completion arrived after cancel");
        }
    }
}

#[async_trait]
impl AioContext for ChannelAioContext {
    fn submit(&mut self, mut job: TransferJob) -> Result<()> {
        if self.queued >= self.depth {
            return Err(CopyError::ContextSaturated {
                queued: self.queued,
                depth: self.depth,
            });
        }

        job.state = JobState::Submitted;
        let tx = self.tx.clone();

        match job.kind {
            JobKind::Read => {
                let source = Arc::clone(&self.source);
                tokio::spawn(async move {
                    let offset = job.file_offset;
                    let result = source.read_at(&mut job.buffer, offset).await;
                    let completion = match result {
                        Ok(bytes) => Completion {
                            job,
                            bytes,
                            fault: None,
                        },
                        Err(fault) => Completion {
                            job,
                            bytes: 0,
                            fault: Some(fault),
                        },
                    };
                    // The receiver only disappears when the context is gone.
                    let _ = tx.send(completion);
                });
            }
            JobKind::Write => {
                let dest = match &self.dest {
                    Some(dest) => Arc::clone(dest),
                    None => {
                        return Err(CopyError::submission(
                            "write",
                            job.file_offset,
                            "no destination configured",
                        ))
                    }
                };
                tokio::spawn(async move {
                    let offset = job.file_offset;
                    let result = dest.write_at(&job.buffer[..job.requested], offset).await;
                    let completion = match result {
                        Ok(bytes) => Completion {
                            job,
                            bytes,
                            fault: None,
                        },
                        Err(fault) => Completion {
                            job,
                            bytes: 0,
                            fault: Some(fault),
                        },
                    };
                    let _ = tx.send(completion);
                });
            }
        }

        self.queued += 1;
        Ok(())
    }

    async fn poll(&mut self, max_events: usize, timeout: Duration) -> Vec<Completion> {
        let mut events = Vec::new();

        while events.len() < max_events {
            match self.rx.try_recv() {
                Ok(completion) => events.push(completion),
                Err(_) => break,
            }
        }

        // Bounded wait for the first event only; once something arrived we
        // keep the caller responsive instead of filling the whole batch.
        if events.is_empty() && !timeout.is_zero() {
            if let Ok(Some(completion)) = tokio::time::timeout(timeout, self.rx.recv()).await {
                events.push(completion);
                while events.len() < max_events {
                    match self.rx.try_recv() {
                        Ok(c) => events.push(c),
                        Err(_) => break,
                    }
                }
            }
        }

        for completion in &events {
            self.note_received(completion);
        }
        events
    }

    fn cancel(&mut self, job_id: u64) {
        // The task backing the request cannot be interrupted mid-transfer;
        // record the intent and let the late completion be dropped upstream.
        if self.cancelled.insert(job_id) {
            debug!(job = job_id, "cancel requested (best effort)");
        }
    }

    fn has_destination(&self) -> bool {
        self.dest.is_some()
    }

    async fn finalize_destination(&mut self) -> std::io::Result<()> {
        match &self.dest {
            Some(dest) => dest.finalize().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::IoResult;

    struct StaticSource;

    #[async_trait]
    impl Source for StaticSource {
        async fn read_at(&self, buf: &mut [u8], _offset: u64) -> IoResult {
            buf.fill(0xAB);
            Ok(buf.len())
        }
    }

    #[tokio::test]
    async fn submit_then_poll_returns_the_completion() {
        let mut ctx = ChannelAioContext::new(Arc::new(StaticSource), None, 4);
        ctx.submit(TransferJob::read(1, 0, 16)).unwrap();

        let events = ctx.poll(8, Duration::from_secs(1)).await;
        assert_eq!(events.len(), 1);
        let completion = &events[0];
        assert_eq!(completion.job.id, 1);
        assert_eq!(completion.bytes, 16);
        assert!(completion.fault.is_none());
        assert_eq!(completion.job.state, JobState::Submitted);
        assert!(completion.job.buffer.iter().all(|&b| b == 0xAB));
    }

    #[tokio::test]
    async fn saturated_queue_rejects_submission() {
        let mut ctx = ChannelAioContext::new(Arc::new(StaticSource), None, 1);
        ctx.submit(TransferJob::read(1, 0, 8)).unwrap();
        let err = ctx.submit(TransferJob::read(2, 8, 8)).unwrap_err();
        assert!(matches!(err, CopyError::ContextSaturated { queued: 1, depth: 1 }));
    }

    #[tokio::test]
    async fn write_without_destination_is_a_submission_error() {
        let mut ctx = ChannelAioContext::new(Arc::new(StaticSource), None, 4);
        let write = TransferJob::read(1, 0, 8).into_write(8, 0);
        let err = ctx.submit(write).unwrap_err();
        assert!(matches!(err, CopyError::Submission { kind: "write", .. }));
    }

    #[tokio::test]
    async fn cancelled_request_still_completes() {
        let mut ctx = ChannelAioContext::new(Arc::new(StaticSource), None, 4);
        ctx.submit(TransferJob::read(9, 0, 8)).unwrap();
        ctx.cancel(9);

        let events = ctx.poll(8, Duration::from_secs(1)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job.id, 9);
    }
}
