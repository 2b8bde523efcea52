//! Bounded worker pool and the single connection writer.
//!
//! ```text
//! worker ─┐
//! worker ─┼─> chunk queue (depth N) ─> run_writer ─> connection
//! worker ─┘
//! ```

use crate::error::{Error, Result};
use crate::streaming::channel::ChunkReceiver;
use crate::streaming::protocol::{write_frame, Frame, SESSION_STREAM_ID};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// At most `workers` jobs run at once; `spawn` waits for a free slot.
pub struct WorkerPool<T> {
    slots: Arc<Semaphore>,
    tasks: JoinSet<T>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(workers: usize, cancel: CancellationToken) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(workers.max(1))),
            tasks: JoinSet::new(),
            cancel,
        }
    }

    /// Run `job` once a slot frees up.
    pub async fn spawn<F>(&mut self, job: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| Error::Cancelled)?
            }
        };
        self.tasks.spawn(async move {
            let out = job.await;
            drop(permit);
            out
        });
        Ok(())
    }

    /// Wait for every job. A panicking job is re-raised here.
    pub async fn join(mut self) -> Vec<T> {
        let mut outputs = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(out) => outputs.push(out),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {}
            }
        }
        outputs
    }
}

/// Drain the chunk queue onto the connection until every sender is gone,
/// then write the end-of-exchange marker.
///
/// Cancellation is only observed between frames, so the connection is
/// always left at a frame boundary.
pub async fn run_writer<W>(
    mut rx: ChunkReceiver,
    w: &mut W,
    cancel: CancellationToken,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut frames = 0u64;
    loop {
        let chunk = match rx.try_recv() {
            Ok(chunk) => Some(chunk),
            Err(TryRecvError::Disconnected) => None,
            Err(TryRecvError::Empty) => {
                // Nothing queued: push buffered frames out before waiting
                w.flush().await?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    chunk = rx.recv() => chunk,
                }
            }
        };
        let Some(chunk) = chunk else {
            break;
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        write_frame(w, &chunk.into_frame()).await?;
        frames += 1;
    }

    write_frame(w, &Frame::end_of_exchange()).await?;
    w.flush().await?;
    tracing::debug!(frames, "writer finished");
    Ok(frames)
}

/// Pick the error a session reports: the first one that is not a
/// cancellation echo of another task's failure.
pub(crate) fn primary_error<I>(errors: I) -> Option<Error>
where
    I: IntoIterator<Item = Error>,
{
    let mut fallback = None;
    for err in errors {
        if matches!(err, Error::Cancelled) {
            fallback.get_or_insert(err);
        } else {
            return Some(err);
        }
    }
    fallback
}

/// Best-effort `error` frame telling the peer why the session is aborting.
/// The writer must be at a frame boundary.
pub(crate) async fn notify_peer<W>(w: &mut W, err: &Error)
where
    W: AsyncWrite + Unpin,
{
    if !err.should_notify_peer() {
        return;
    }
    let frame = Frame::error(SESSION_STREAM_ID, err.code(), err.to_string());
    let sent = async {
        write_frame(w, &frame).await?;
        w.flush().await?;
        Ok::<_, Error>(())
    };
    if let Err(e) = sent.await {
        tracing::debug!("Could not report error to peer: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::{chunk_queue, Chunk};
    use crate::streaming::protocol::{read_frame, MessageKind};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(3, CancellationToken::new());

        for i in 0..12usize {
            let running = running.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                i
            })
            .await
            .unwrap();
        }

        let mut outputs = pool.join().await;
        outputs.sort_unstable();
        assert_eq!(outputs, (0..12).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_pool_spawn_observes_cancellation() {
        let cancel = CancellationToken::new();
        let mut pool = WorkerPool::new(1, cancel.clone());
        let gate = CancellationToken::new();
        let held = gate.clone();
        pool.spawn(async move { held.cancelled().await }).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let waiting = pool.spawn(async {});
        let result = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .expect("spawn did not observe cancellation");
        assert!(matches!(result, Err(Error::Cancelled)));

        gate.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_writer_frames_chunks_then_end_of_exchange() {
        let cancel = CancellationToken::new();
        let (tx, rx) = chunk_queue(1, cancel.clone());

        let producer = async move {
            tx.send(Chunk::new(MessageKind::FileData, 0, Bytes::from_static(b"one")))
                .await
                .unwrap();
            tx.send(Chunk::terminator(MessageKind::FileData, 0))
                .await
                .unwrap();
        };
        let mut wire = Vec::new();
        let (frames, _) = tokio::join!(run_writer(rx, &mut wire, cancel), producer);
        assert_eq!(frames.unwrap(), 2);

        let mut reader = &wire[..];
        let first = read_frame(&mut reader).await.unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert!(read_frame(&mut reader).await.unwrap().is_terminator());
        let end = read_frame(&mut reader).await.unwrap();
        assert_eq!(end.kind, MessageKind::EndOfExchange);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_notify_peer_only_for_local_faults() {
        let mut wire = Vec::new();
        notify_peer(&mut wire, &Error::Cancelled).await;
        assert!(wire.is_empty());

        notify_peer(&mut wire, &Error::protocol("bad id")).await;
        let frame = read_frame(&mut &wire[..]).await.unwrap();
        assert_eq!(frame.kind, MessageKind::Error);
        assert_eq!(frame.id, SESSION_STREAM_ID);
    }

    #[test]
    fn test_primary_error_skips_cancellation() {
        let picked = primary_error([Error::Cancelled, Error::protocol("x")]).unwrap();
        assert!(matches!(picked, Error::Protocol(_)));
        assert!(matches!(
            primary_error([Error::Cancelled]),
            Some(Error::Cancelled)
        ));
        assert!(primary_error(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn test_writer_stops_on_cancel_without_end_marker() {
        let cancel = CancellationToken::new();
        let (_tx, rx) = chunk_queue(1, cancel.clone());
        cancel.cancel();

        let mut wire = Vec::new();
        let result = run_writer(rx, &mut wire, cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(wire.is_empty());
    }
}
