//! Source and destination capability contracts.
//!
//! The pipeline core never opens descriptors itself; it drives these traits.
//! `FileSource`/`FileDestination` implement them over regular files and
//! character devices (XDMA C2H/H2C nodes).

mod file;

pub use file::{FileDestination, FileSource};

use async_trait::async_trait;
use std::io;

/// Failure class for a single device operation.
#[derive(Debug)]
pub enum IoFault {
    /// No data currently available (streaming device). Recovered by an
    /// immediate retry of the same request, never surfaced.
    Transient,
    /// Unrecoverable descriptor error.
    Fatal(io::Error),
}

/// Outcome of one read or write: bytes transferred, or a failure class.
pub type IoResult = std::result::Result<usize, IoFault>;

/// Data source capability.
#[async_trait]
pub trait Source: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Streaming sources ignore the
    /// offset. Fewer bytes than requested is an underflow, not an error.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> IoResult;

    /// Whether the handle is a streaming device without stable offsets.
    fn is_streaming(&self) -> bool {
        false
    }
}

/// Data destination capability.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Write `buf` at `offset`. Streaming destinations ignore the offset.
    async fn write_at(&self, buf: &[u8], offset: u64) -> IoResult;

    /// Whether the handle is a streaming device without stable offsets.
    fn is_streaming(&self) -> bool {
        false
    }

    /// Flush written data so it is durable. Called exactly once by the
    /// pipeline driver, on normal completion or on grace degrade.
    async fn finalize(&self) -> io::Result<()> {
        Ok(())
    }
}
