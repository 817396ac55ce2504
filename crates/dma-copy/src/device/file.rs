//! File-backed source and destination handles.
//!
//! Regular files use positional `pread`/`pwrite`; character devices (XDMA
//! stream nodes, FIFOs) are opened in streaming mode where every transfer is
//! relative to the implicit current position and offsets are ignored.

use super::{Destination, IoFault, IoResult, Source};
use crate::error::{CopyError, Result};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Map an OS error to the pipeline failure taxonomy. Would-block style
/// errors from a streaming driver mean "no data yet", not failure.
fn classify(err: io::Error) -> IoFault {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
            IoFault::Transient
        }
        _ => IoFault::Fatal(err),
    }
}

fn lock_fault<T>(_: T) -> IoFault {
    IoFault::Fatal(io::Error::other("device handle lock poisoned"))
}

fn join_fault(err: tokio::task::JoinError) -> IoFault {
    IoFault::Fatal(io::Error::other(err))
}

fn is_streaming_file(file: &File) -> io::Result<bool> {
    let ft = file.metadata()?.file_type();
    Ok(ft.is_char_device() || ft.is_fifo())
}

/// Readable handle over a regular file or a streaming device node.
///
/// Reads run on the blocking thread pool: a stalled device parks a blocking
/// thread, never a runtime worker, so the driver's supervisor keeps running.
pub struct FileSource {
    file: Arc<Mutex<File>>,
    streaming: bool,
    name: String,
}

impl FileSource {
    /// Open `path` read-only. Character devices and FIFOs are detected and
    /// switched to streaming mode automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| CopyError::setup(e.to_string(), format!("open source {:?}", path)))?;
        let streaming = is_streaming_file(&file)
            .map_err(|e| CopyError::setup(e.to_string(), format!("stat source {:?}", path)))?;
        debug!(path = %path.display(), streaming, "opened source");
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            streaming,
            name: path.display().to_string(),
        })
    }

    /// Wrap an already-open handle, forcing the transfer mode.
    pub fn from_file(file: File, streaming: bool, name: impl Into<String>) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
            streaming,
            name: name.into(),
        }
    }

    /// Byte length of a positional source, for sizing a whole-file copy.
    /// Streaming devices have no length; callers pass an explicit one.
    pub fn len(&self) -> Result<u64> {
        if self.streaming {
            return Err(CopyError::Config(format!(
                "{} is a streaming device; --length is required",
                self.name
            )));
        }
        let file = self
            .file
            .lock()
            .map_err(|_| CopyError::setup("handle lock poisoned", self.name.clone()))?;
        let meta = file
            .metadata()
            .map_err(|e| CopyError::setup(e.to_string(), format!("stat source {}", self.name)))?;
        Ok(meta.len())
    }

    /// Name used in log messages.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Source for FileSource {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> IoResult {
        let file = Arc::clone(&self.file);
        let streaming = self.streaming;
        let len = buf.len();
        // read(2)/pread(2) can park the calling thread until the device has
        // data; keep that off the async workers.
        let filled = tokio::task::spawn_blocking(move || {
            let file = file.lock().map_err(lock_fault)?;
            let mut chunk = vec![0u8; len];
            let n = if streaming {
                (&*file).read(&mut chunk)
            } else {
                file.read_at(&mut chunk, offset)
            }
            .map_err(classify)?;
            chunk.truncate(n);
            Ok(chunk)
        })
        .await
        .map_err(join_fault)??;
        buf[..filled.len()].copy_from_slice(&filled);
        Ok(filled.len())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }
}

/// Writable handle over a regular file or a streaming device node. Writes
/// and the final sync run on the blocking thread pool like reads do.
pub struct FileDestination {
    file: Arc<Mutex<File>>,
    streaming: bool,
    name: String,
}

impl FileDestination {
    /// Open `path` for writing. Regular files are created and truncated;
    /// device nodes are opened as-is and switched to streaming mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        // Probe the node type first so an existing device is never truncated.
        let existing_streaming = match std::fs::metadata(path) {
            Ok(meta) => meta.file_type().is_char_device() || meta.file_type().is_fifo(),
            Err(_) => false,
        };
        let file = if existing_streaming {
            OpenOptions::new().write(true).open(path)
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
        }
        .map_err(|e| CopyError::setup(e.to_string(), format!("open destination {:?}", path)))?;
        debug!(path = %path.display(), streaming = existing_streaming, "opened destination");
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            streaming: existing_streaming,
            name: path.display().to_string(),
        })
    }

    /// Wrap an already-open handle, forcing the transfer mode.
    pub fn from_file(file: File, streaming: bool, name: impl Into<String>) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
            streaming,
            name: name.into(),
        }
    }

    /// Name used in log messages.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Destination for FileDestination {
    async fn write_at(&self, buf: &[u8], offset: u64) -> IoResult {
        let file = Arc::clone(&self.file);
        let streaming = self.streaming;
        let chunk = buf.to_vec();
        tokio::task::spawn_blocking(move || {
            let file = file.lock().map_err(lock_fault)?;
            let res = if streaming {
                (&*file).write(&chunk)
            } else {
                file.write_at(&chunk, offset)
            };
            res.map_err(classify)
        })
        .await
        .map_err(join_fault)?
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    async fn finalize(&self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        let streaming = self.streaming;
        tokio::task::spawn_blocking(move || {
            let file = file
                .lock()
                .map_err(|_| io::Error::other("device handle lock poisoned"))?;
            if streaming {
                // Character devices reject fsync; a flush of the handle suffices.
                (&*file).flush()
            } else {
                file.sync_all()
            }
        })
        .await
        .map_err(io::Error::other)?
    }
}
