//! # dma-copy
//!
//! Asynchronous copy pipeline for DMA-capable character devices.
//!
//! The core is a completion-driven state machine: a bounded number of read
//! requests run concurrently against a source descriptor, each completed
//! read turns into a write against a destination descriptor, and the driver
//! loop tracks in-flight work, tolerates transient "no data yet" conditions
//! from streaming devices and shuts down cleanly on cancellation or
//! inactivity.
//!
//! - **Capabilities** ([`device`]): `Source`/`Destination` traits plus
//!   file-backed implementations for regular files and XDMA stream nodes
//! - **Context** ([`context`]): bounded submit/poll/cancel facility in the
//!   shape of an io_submit/io_getevents loop
//! - **Pipeline** ([`pipeline`]): admission control, completion dispatch,
//!   read/write continuations and the idle/cancellation supervisor
//!
//! ## Example
//!
//! ```rust,no_run
//! use dma_copy::{ChannelAioContext, FileDestination, FileSource, Pipeline, PipelineConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> dma_copy::Result<()> {
//! let source = Arc::new(FileSource::open("/dev/xdma0_c2h_0")?);
//! let dest = Arc::new(FileDestination::open("output.dat")?);
//!
//! let config = PipelineConfig {
//!     total_length: 1 << 20,
//!     ..PipelineConfig::default()
//! };
//! let ctx = ChannelAioContext::new(source, Some(dest), config.max_in_flight);
//! let report = Pipeline::new(ctx, config)?.run(CancellationToken::new()).await?;
//! println!("moved {} bytes", report.bytes_transferred);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod job;
pub mod pipeline;

// Re-exports for convenient access
pub use config::PipelineConfig;
pub use context::{AioContext, ChannelAioContext, Completion};
pub use device::{Destination, FileDestination, FileSource, IoFault, Source};
pub use error::{CopyError, Result};
pub use job::{JobKind, JobState, TransferJob};
pub use pipeline::{Phase, Pipeline, PipelineReport, PipelineState, PipelineStatus};
