//! The manifest input channel.
//!
//! Manifest bytes reach the apply engine through a pipe that is fed by a
//! background task, the same way a redirected stdin would. The channel is a
//! single shared resource: [`InputChannel::redirect`] waits for exclusive
//! ownership and the returned [`InputLease`] gives it back when dropped, on
//! every exit path. The feeder is aborted before the lock is released.

use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

static GLOBAL: Lazy<Arc<InputChannel>> = Lazy::new(|| Arc::new(InputChannel::new()));

/// Mutex-guarded manifest input channel; redirected exactly while the lock is held.
#[derive(Debug, Default)]
pub struct InputChannel {
    lock: Mutex<()>,
}

impl InputChannel {
    pub fn new() -> Self { Self::default() }

    /// The process-wide channel shared by every applier built with [`crate::Applier::new`].
    pub fn global() -> Arc<InputChannel> { GLOBAL.clone() }

    /// Wait for the channel, then start feeding `data` into it.
    pub async fn redirect(&self, data: Vec<u8>) -> InputLease<'_> {
        let guard = self.lock.lock().await;
        let len = data.len();
        let (mut tx, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let feeder = tokio::spawn(async move {
            tx.write_all(&data).await?;
            tx.shutdown().await
        });
        debug!(bytes = len, "input redirected");
        InputLease { _guard: guard, reader, feeder }
    }

    /// True while a lease is held.
    pub fn is_redirected(&self) -> bool { self.lock.try_lock().is_err() }
}

/// Exclusive use of an [`InputChannel`]; restores the channel on drop.
pub struct InputLease<'a> {
    _guard: MutexGuard<'a, ()>,
    reader: DuplexStream,
    feeder: JoinHandle<std::io::Result<()>>,
}

impl InputLease<'_> {
    /// Read everything the feeder writes, until it closes the pipe.
    pub async fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader.read_to_end(&mut buf).await?;
        match (&mut self.feeder).await {
            Ok(res) => res?,
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }
        Ok(buf)
    }
}

impl Drop for InputLease<'_> {
    fn drop(&mut self) {
        self.feeder.abort();
        debug!("input restored");
    }
}
