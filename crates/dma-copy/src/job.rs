//! Transfer job descriptors.
//!
//! A [`TransferJob`] describes one pending read or write. The buffer is
//! exclusively owned by exactly one job at any instant: a completed read is
//! consumed by [`TransferJob::into_write`], which moves the buffer into the
//! write job it spawns without copying.

/// Direction of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Read,
    Write,
}

impl JobKind {
    /// Short name for log messages and error contexts.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Read => "read",
            JobKind::Write => "write",
        }
    }
}

/// Lifecycle of a job: `Created → Submitted → {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Submitted,
    Completed,
    Failed,
}

/// One pending read or write request.
#[derive(Debug)]
pub struct TransferJob {
    /// Stable identity, kept across the read → write conversion.
    pub id: u64,

    /// Direction.
    pub kind: JobKind,

    /// Owned byte region. Sized to `requested` for reads; truncated to the
    /// completed byte count when converted into a write.
    pub buffer: Vec<u8>,

    /// Bytes requested for this operation.
    pub requested: usize,

    /// Byte offset for positional transfers; logical 0 for streaming devices.
    pub file_offset: u64,

    /// Lifecycle state.
    pub state: JobState,
}

impl TransferJob {
    /// Create a read job for `len` bytes at `file_offset`.
    pub fn read(id: u64, file_offset: u64, len: usize) -> Self {
        Self {
            id,
            kind: JobKind::Read,
            buffer: vec![0u8; len],
            requested: len,
            file_offset,
            state: JobState::Created,
        }
    }

    /// Turn a completed read into the write that drains its buffer. The
    /// buffer moves; `completed` truncates it on read underflow.
    pub fn into_write(mut self, completed: usize, file_offset: u64) -> Self {
        debug_assert!(completed <= self.buffer.len());
        self.buffer.truncate(completed);
        Self {
            id: self.id,
            kind: JobKind::Write,
            buffer: self.buffer,
            requested: completed,
            file_offset,
            state: JobState::Created,
        }
    }

    /// Reset a job for resubmission after a transient fault. The buffer and
    /// region are unchanged; only the lifecycle restarts.
    pub fn reset_for_retry(&mut self) {
        self.state = JobState::Created;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_job_owns_a_buffer_of_requested_size() {
        let job = TransferJob::read(7, 65536, 4096);
        assert_eq!(job.kind, JobKind::Read);
        assert_eq!(job.buffer.len(), 4096);
        assert_eq!(job.requested, 4096);
        assert_eq!(job.file_offset, 65536);
        assert_eq!(job.state, JobState::Created);
    }

    #[test]
    fn into_write_moves_and_truncates_the_buffer() {
        let mut job = TransferJob::read(3, 0, 4096);
        job.buffer[..5].copy_from_slice(b"hello");
        let write = job.into_write(5, 0);
        assert_eq!(write.id, 3);
        assert_eq!(write.kind, JobKind::Write);
        assert_eq!(write.buffer, b"hello");
        assert_eq!(write.requested, 5);
        assert_eq!(write.state, JobState::Created);
    }

    #[test]
    fn retry_resets_lifecycle_only() {
        let mut job = TransferJob::read(1, 128, 16);
        job.state = JobState::Submitted;
        job.reset_for_retry();
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.requested, 16);
        assert_eq!(job.file_offset, 128);
    }
}
