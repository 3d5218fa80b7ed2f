//! Async front door for the blocking engine.
//!
//! [`SingleWriter`] runs a small pool of dedicated OS threads. Each bucket is
//! pinned to one thread (`bucket % threads`), so requests for a bucket run in
//! submission order while different buckets proceed in parallel. Requests go
//! over bounded flume channels and answers come back on tokio oneshots, which
//! keeps journal I/O off the async runtime.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle as TaskHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::core::engine::ClientQueuePersistence;
use crate::core::error::{QueueError, QueueResult};
use crate::core::message::{InflightMessage, Publish, Pubrel, QueuedMessage};
use crate::core::policy::DiscardPolicy;
use crate::storage::StorageError;

/// Pending requests per writer thread before `submit` applies backpressure.
const WRITER_QUEUE_CAPACITY: usize = 1024;

type Job = Box<dyn FnOnce(&ClientQueuePersistence) + Send>;

#[derive(Debug)]
pub struct SingleWriter {
    senders: RwLock<Vec<flume::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SingleWriter {
    pub fn start(engine: Arc<ClientQueuePersistence>, threads: usize) -> QueueResult<Self> {
        let threads = threads.max(1);
        let mut senders = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);

        for index in 0..threads {
            let (tx, rx) = flume::bounded::<Job>(WRITER_QUEUE_CAPACITY);
            let engine = Arc::clone(&engine);
            let handle = thread::Builder::new()
                .name(format!("client-queue-writer-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job(&engine);
                    }
                    debug!(writer = index, "writer thread stopped");
                })
                .map_err(StorageError::from)?;
            senders.push(tx);
            workers.push(handle);
        }

        info!(threads, "single writer started");
        Ok(Self {
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
        })
    }

    /// Run `op` on the thread that owns `bucket` and wait for its result.
    pub async fn submit<T, F>(&self, bucket: usize, op: F) -> QueueResult<T>
    where
        F: FnOnce(&ClientQueuePersistence) -> QueueResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = {
            let senders = self.senders.read();
            if senders.is_empty() {
                return Err(QueueError::WriterStopped);
            }
            senders[bucket % senders.len()].clone()
        };

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |engine| {
            let _ = tx.send(op(engine));
        });

        sender
            .send_async(job)
            .await
            .map_err(|_| QueueError::WriterStopped)?;
        rx.await.map_err(|_| QueueError::WriterStopped)?
    }

    /// Close the request channels and hand back the worker threads to join.
    ///
    /// Requests already queued still run.
    pub fn stop(&self) -> Vec<JoinHandle<()>> {
        self.senders.write().clear();
        std::mem::take(&mut *self.workers.lock())
    }
}

/// Async API over [`ClientQueuePersistence`], routing by queue id.
#[derive(Debug)]
pub struct ClientQueueService {
    engine: Arc<ClientQueuePersistence>,
    writer: SingleWriter,
}

impl ClientQueueService {
    pub fn new(engine: Arc<ClientQueuePersistence>) -> QueueResult<Self> {
        let writer = SingleWriter::start(Arc::clone(&engine), engine.config().writer_threads)?;
        Ok(Self { engine, writer })
    }

    pub fn engine(&self) -> &Arc<ClientQueuePersistence> {
        &self.engine
    }

    pub async fn add(
        &self,
        queue_id: &str,
        shared: bool,
        message: impl Into<QueuedMessage>,
        queue_limit: usize,
        policy: DiscardPolicy,
    ) -> QueueResult<()> {
        let bucket = self.engine.bucket_for(queue_id);
        let queue_id = queue_id.to_string();
        let message = message.into();
        self.writer
            .submit(bucket, move |engine| {
                engine.add(&queue_id, shared, message, queue_limit, policy, bucket)
            })
            .await
    }

    pub async fn read_new(
        &self,
        queue_id: &str,
        shared: bool,
        packet_ids: Vec<u16>,
        byte_limit: u64,
    ) -> QueueResult<Vec<Publish>> {
        let bucket = self.engine.bucket_for(queue_id);
        let queue_id = queue_id.to_string();
        self.writer
            .submit(bucket, move |engine| {
                engine.read_new(&queue_id, shared, &packet_ids, byte_limit, bucket)
            })
            .await
    }

    pub async fn read_inflight(
        &self,
        queue_id: &str,
        shared: bool,
        max_count: usize,
        byte_limit: u64,
    ) -> QueueResult<Vec<InflightMessage>> {
        let bucket = self.engine.bucket_for(queue_id);
        let queue_id = queue_id.to_string();
        self.writer
            .submit(bucket, move |engine| {
                engine.read_inflight(&queue_id, shared, max_count, byte_limit, bucket)
            })
            .await
    }

    pub async fn replace(&self, queue_id: &str, pubrel: Pubrel) -> QueueResult<Option<String>> {
        let bucket = self.engine.bucket_for(queue_id);
        let queue_id = queue_id.to_string();
        self.writer
            .submit(bucket, move |engine| engine.replace(&queue_id, pubrel, bucket))
            .await
    }

    pub async fn remove(
        &self,
        queue_id: &str,
        packet_id: u16,
        expected_unique_id: Option<&str>,
    ) -> QueueResult<Option<String>> {
        let bucket = self.engine.bucket_for(queue_id);
        let queue_id = queue_id.to_string();
        let expected = expected_unique_id.map(str::to_owned);
        self.writer
            .submit(bucket, move |engine| {
                engine.remove(&queue_id, packet_id, expected.as_deref(), bucket)
            })
            .await
    }

    pub async fn remove_shared(&self, shared_id: &str, unique_id: &str) -> QueueResult<bool> {
        let bucket = self.engine.bucket_for(shared_id);
        let (shared_id, unique_id) = (shared_id.to_string(), unique_id.to_string());
        self.writer
            .submit(bucket, move |engine| {
                engine.remove_shared(&shared_id, &unique_id, bucket)
            })
            .await
    }

    pub async fn remove_in_flight_marker(
        &self,
        shared_id: &str,
        unique_id: &str,
    ) -> QueueResult<bool> {
        let bucket = self.engine.bucket_for(shared_id);
        let (shared_id, unique_id) = (shared_id.to_string(), unique_id.to_string());
        self.writer
            .submit(bucket, move |engine| {
                engine.remove_in_flight_marker(&shared_id, &unique_id, bucket)
            })
            .await
    }

    pub async fn remove_all_qos0_messages(&self, queue_id: &str, shared: bool) -> QueueResult<()> {
        let bucket = self.engine.bucket_for(queue_id);
        let queue_id = queue_id.to_string();
        self.writer
            .submit(bucket, move |engine| {
                engine.remove_all_qos0_messages(&queue_id, shared, bucket)
            })
            .await
    }

    pub async fn clear(&self, queue_id: &str, shared: bool) -> QueueResult<()> {
        let bucket = self.engine.bucket_for(queue_id);
        let queue_id = queue_id.to_string();
        self.writer
            .submit(bucket, move |engine| engine.clear(&queue_id, shared, bucket))
            .await
    }

    pub async fn size(&self, queue_id: &str, shared: bool) -> QueueResult<usize> {
        let bucket = self.engine.bucket_for(queue_id);
        let queue_id = queue_id.to_string();
        self.writer
            .submit(bucket, move |engine| engine.size(&queue_id, shared, bucket))
            .await
    }

    pub async fn clean_up(&self, bucket: usize) -> QueueResult<HashSet<String>> {
        self.writer
            .submit(bucket, move |engine| engine.clean_up(bucket))
            .await
    }

    /// Sweep every bucket; returns the union of non-empty shared queues.
    pub async fn clean_up_all(&self) -> QueueResult<HashSet<String>> {
        let sweeps = (0..self.engine.bucket_count()).map(|bucket| self.clean_up(bucket));
        let mut shared = HashSet::new();
        for result in futures::future::join_all(sweeps).await {
            shared.extend(result?);
        }
        Ok(shared)
    }

    /// Sweep every bucket on the configured cleanup interval until `shutdown`
    /// turns true or the service closes.
    ///
    /// Sweeps release payload references, so this belongs in the process that
    /// owns the real payload store.
    pub fn spawn_cleanup(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> TaskHandle<()> {
        let service = Arc::clone(self);
        let period = self.engine.config().cleanup_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => match service.clean_up_all().await {
                        Ok(shared) => debug!(active_shared_queues = shared.len(), "cleanup pass done"),
                        Err(QueueError::WriterStopped | QueueError::Storage(StorageError::Closed)) => break,
                        Err(e) => error!("cleanup failed: {e}"),
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("cleanup task stopped");
        })
    }

    /// Drain the writers, then flush and close the engine.
    pub async fn close(&self) -> QueueResult<()> {
        let workers = self.writer.stop();
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || {
            for worker in workers {
                if worker.join().is_err() {
                    warn!("writer thread panicked");
                }
            }
            engine.close()
        })
        .await
        .map_err(|_| QueueError::WriterStopped)?
    }
}
