//! Pipeline bookkeeping, owned exclusively by the driver.
//!
//! All counters the original tools kept as globals (`busy`, running `offset`,
//! remaining `length`) live here and are mutated only on the driver's control
//! loop.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

/// Pipeline-level state machine. `Terminated` is the only terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Terminated,
}

/// A source region waiting to be admitted: either the shortfall left behind
/// by a read underflow, or a region handed back by a drained retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRead {
    pub offset: u64,
    pub len: usize,
}

/// Counters and admission bookkeeping for one pipeline invocation.
#[derive(Debug)]
pub struct PipelineState {
    total_length: u64,
    bytes_remaining: u64,
    bytes_transferred: u64,
    max_in_flight: usize,
    /// Identities of jobs currently in `Submitted` state; the in-flight
    /// count is this set's size by construction.
    submitted: HashSet<u64>,
    /// Admission cursor: next source offset not yet covered by any read.
    read_cursor: u64,
    /// Bytes past the cursor that no read has been submitted for.
    bytes_unsubmitted: u64,
    /// Underflow shortfalls, admitted before fresh regions.
    pending: VecDeque<PendingRead>,
    /// Timestamp of the most recent successful completion.
    last_completion: Instant,
    phase: Phase,
    next_job_id: u64,
    underflows: u64,
    retries: u64,
    jobs_completed: u64,
}

impl PipelineState {
    pub fn new(total_length: u64, max_in_flight: usize) -> Self {
        Self {
            total_length,
            bytes_remaining: total_length,
            bytes_transferred: 0,
            max_in_flight,
            submitted: HashSet::new(),
            read_cursor: 0,
            bytes_unsubmitted: total_length,
            pending: VecDeque::new(),
            last_completion: Instant::now(),
            phase: Phase::Running,
            next_job_id: 0,
            underflows: 0,
            retries: 0,
            jobs_completed: 0,
        }
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn in_flight(&self) -> usize {
        self.submitted.len()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn underflows(&self) -> u64 {
        self.underflows
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed
    }

    pub fn last_completion(&self) -> Instant {
        self.last_completion
    }

    /// The pipeline is done when all bytes retired and nothing is in flight.
    pub fn is_complete(&self) -> bool {
        self.bytes_remaining == 0 && self.submitted.is_empty()
    }

    /// Admission check: a new read may be submitted iff the pipeline is
    /// running, the in-flight window has room and source bytes remain
    /// uncovered.
    pub fn can_admit(&self) -> bool {
        self.phase == Phase::Running
            && self.submitted.len() < self.max_in_flight
            && (self.bytes_unsubmitted > 0 || !self.pending.is_empty())
    }

    /// Carve the next read region: shortfalls first, then a fresh block off
    /// the cursor. `bytes_remaining` is untouched here; it only moves when
    /// completed work retires.
    pub(crate) fn next_read(&mut self, block_size: usize) -> Option<PendingRead> {
        if let Some(region) = self.pending.pop_front() {
            return Some(region);
        }
        if self.bytes_unsubmitted == 0 {
            return None;
        }
        let len = self.bytes_unsubmitted.min(block_size as u64) as usize;
        let region = PendingRead {
            offset: self.read_cursor,
            len,
        };
        self.read_cursor += len as u64;
        self.bytes_unsubmitted -= len as u64;
        Some(region)
    }

    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    pub(crate) fn track_submitted(&mut self, id: u64) {
        self.submitted.insert(id);
        debug_assert!(self.submitted.len() <= self.max_in_flight);
    }

    pub(crate) fn submitted_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.submitted.iter().copied()
    }

    /// Hand a read-underflow shortfall back to the admission controller.
    pub(crate) fn push_shortfall(&mut self, offset: u64, len: usize) {
        debug_assert!(len > 0);
        self.pending.push_back(PendingRead { offset, len });
    }

    /// Retire a job successfully: `bytes` move from remaining to transferred
    /// and the in-flight slot frees up.
    pub(crate) fn retire(&mut self, id: u64, bytes: usize) {
        let was_submitted = self.submitted.remove(&id);
        debug_assert!(was_submitted, "retired a job that was never submitted");
        self.bytes_transferred += bytes as u64;
        self.bytes_remaining = self.bytes_remaining.saturating_sub(bytes as u64);
        self.jobs_completed += 1;
        self.last_completion = Instant::now();
        debug_assert_eq!(
            self.bytes_transferred + self.bytes_remaining,
            self.total_length
        );
    }

    /// Release a job without counting progress (failure or forced-cancel
    /// destruction path).
    pub(crate) fn release(&mut self, id: u64) {
        self.submitted.remove(&id);
    }

    pub(crate) fn note_underflow(&mut self) {
        self.underflows += 1;
    }

    pub(crate) fn note_retry(&mut self) {
        self.retries += 1;
    }

    pub(crate) fn begin_draining(&mut self) {
        if self.phase == Phase::Running {
            self.phase = Phase::Draining;
        }
    }

    pub(crate) fn terminate(&mut self) {
        self.phase = Phase::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_carves_block_sized_regions_then_the_tail() {
        // 150000 bytes in 65536-byte blocks: 65536, 65536, 18928.
        let mut state = PipelineState::new(150_000, 1);
        let a = state.next_read(65536).unwrap();
        let b = state.next_read(65536).unwrap();
        let c = state.next_read(65536).unwrap();
        assert_eq!((a.offset, a.len), (0, 65536));
        assert_eq!((b.offset, b.len), (65536, 65536));
        assert_eq!((c.offset, c.len), (131_072, 18_928));
        assert!(state.next_read(65536).is_none());
    }

    #[test]
    fn shortfalls_are_admitted_before_fresh_regions() {
        let mut state = PipelineState::new(200_000, 4);
        let first = state.next_read(65536).unwrap();
        assert_eq!(first.offset, 0);

        // A read at offset 0 underflowed after 30000 bytes.
        state.push_shortfall(30_000, 35_536);
        let next = state.next_read(65536).unwrap();
        assert_eq!((next.offset, next.len), (30_000, 35_536));

        let fresh = state.next_read(65536).unwrap();
        assert_eq!(fresh.offset, 65_536);
    }

    #[test]
    fn admission_respects_window_and_remaining_bytes() {
        let mut state = PipelineState::new(100, 2);
        assert!(state.can_admit());

        let id0 = state.allocate_id();
        state.track_submitted(id0);
        assert!(state.can_admit());

        let id1 = state.allocate_id();
        state.track_submitted(id1);
        assert!(!state.can_admit(), "window full");

        state.retire(id0, 50);
        // Window has room again but all bytes are covered by reads.
        let _ = state.next_read(100);
        assert!(!state.can_admit());
    }

    #[test]
    fn retire_preserves_the_progress_invariant() {
        let mut state = PipelineState::new(150_000, 1);
        let id = state.allocate_id();
        state.track_submitted(id);
        state.retire(id, 65_536);
        assert_eq!(state.bytes_transferred(), 65_536);
        assert_eq!(state.bytes_remaining(), 84_464);
        assert_eq!(
            state.bytes_transferred() + state.bytes_remaining(),
            state.total_length()
        );
        assert_eq!(state.in_flight(), 0);
        assert_eq!(state.jobs_completed(), 1);
    }

    #[test]
    fn draining_stops_admission_and_terminated_is_terminal() {
        let mut state = PipelineState::new(100, 4);
        state.begin_draining();
        assert_eq!(state.phase(), Phase::Draining);
        assert!(!state.can_admit());

        state.terminate();
        assert_eq!(state.phase(), Phase::Terminated);
        state.begin_draining();
        assert_eq!(state.phase(), Phase::Terminated, "no transition leaves Terminated");
    }
}
