//! The target-facing byte connector seam.
//!
//! Concrete wire transports live outside the core; delivery code talks to
//! the victim through the [`Connector`] capability. The one concurrent
//! piece of the system is the receive loop: an independent reader that
//! appends whatever the target sends into a bounded ring, dropped-oldest,
//! with non-blocking snapshot reads from the delivery side.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Upper bound on buffered receive entries before the oldest are dropped.
pub const RING_CAPACITY: usize = 500_000;

/// Abstract byte-oriented connection to the target.
pub trait Connector: Send {
    /// Pushes one payload towards the victim.
    fn transmit(&mut self, data: &[u8]) -> Result<(), std::io::Error>;

    /// Snapshot of everything received so far, without blocking on more.
    fn received(&self) -> Vec<Vec<u8>>;
}

/// Bounded drop-oldest buffer shared between the receive loop and readers.
#[derive(Clone)]
pub struct RecvRing {
    inner: Arc<Mutex<VecDeque<Vec<u8>>>>,
    capacity: usize,
}

impl Default for RecvRing {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvRing {
    pub fn new() -> Self {
        Self::with_capacity(RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        RecvRing {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Appends one entry, evicting the oldest when full.
    pub fn push(&self, entry: Vec<u8>) {
        let mut ring = self.inner.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// A point-in-time copy of the buffered entries.
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Spawns the independent receive loop for a reader half, filling `ring`
/// until the stream ends.
pub fn spawn_receive_loop<R>(mut reader: R, ring: RecvRing) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("target receive stream closed");
                    break;
                }
                Ok(n) => ring.push(buf[..n].to_vec()),
                Err(err) => {
                    debug!(%err, "target receive stream failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn ring_drops_oldest_past_capacity() {
        let ring = RecvRing::with_capacity(3);
        for i in 0u8..5 {
            ring.push(vec![i]);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.snapshot(), vec![vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let ring = RecvRing::with_capacity(4);
        ring.push(b"one".to_vec());
        let snap = ring.snapshot();
        ring.push(b"two".to_vec());
        assert_eq!(snap.len(), 1, "snapshot must not see later pushes");
        assert_eq!(ring.len(), 2);
    }

    #[tokio::test]
    async fn receive_loop_buffers_target_output() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let ring = RecvRing::with_capacity(16);
        let handle = spawn_receive_loop(rx, ring.clone());

        tx.write_all(b"banner").await.unwrap();
        tx.flush().await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let got: Vec<u8> = ring.snapshot().concat();
        assert_eq!(got, b"banner");
    }
}
