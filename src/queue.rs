#![forbid(unsafe_code)]

//! Two FIFO lanes (downloads, metadata lookups) with a fixed number of
//! worker slots each.
//!
//! A dispatcher task per lane first takes a slot, then pops the oldest
//! request and hands it to the `RequestHandler` on its own task. The slot
//! is a semaphore permit wrapped in [`SlotGuard`], so it is released when
//! that task ends however it ends.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::FetchError,
    sink::ResponseSink,
    video::{FormatSpec, VideoId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    MetadataLookup,
    Download,
}

impl RequestKind {
    /// Window slots a request of this kind takes in the rate limiter.
    pub fn admission_cost(self) -> usize {
        1
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::MetadataLookup => "metadata",
            Self::Download => "download",
        }
    }

    /// Service time assumed until the lane has measured one.
    fn default_service_time(self) -> Duration {
        match self {
            Self::MetadataLookup => Duration::from_secs(5),
            Self::Download => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug)]
pub struct Request {
    pub id: Uuid,
    pub kind: RequestKind,
    pub video_id: VideoId,
    pub format: FormatSpec,
    pub submitted_at: Instant,
    pub retry_count: u32,
    pub sink: ResponseSink,
}

impl Request {
    pub fn new(
        kind: RequestKind,
        video_id: VideoId,
        format: FormatSpec,
        sink: ResponseSink,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            video_id,
            format,
            submitted_at: Instant::now(),
            retry_count: 0,
            sink,
        }
    }
}

/// What became of a request once its handler returned.
#[derive(Debug)]
pub enum Settled {
    /// The sink was completed one way or another.
    Done,
    /// Transient failure before anything reached the client.
    Retry(Request, FetchError),
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Settled;
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent_downloads: usize,
    pub max_concurrent_metadata: usize,
    pub capacity: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 6,
            max_concurrent_metadata: 10,
            capacity: 1000,
            request_timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// 1-based position in the lane at enqueue time.
    pub position: usize,
    /// A slot was free, so the request will not wait behind others.
    pub starts_immediately: bool,
    pub estimated_wait: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub kind: RequestKind,
    pub queued: usize,
    pub active: usize,
    pub concurrency: usize,
    pub capacity: usize,
    pub completed: u64,
    pub avg_service_ms: u64,
}

struct Lane {
    kind: RequestKind,
    queue: Mutex<VecDeque<Request>>,
    slots: Arc<Semaphore>,
    concurrency: usize,
    capacity: usize,
    notify: Notify,
    active: AtomicUsize,
    completed: AtomicU64,
    // Exponentially weighted, in milliseconds; 0 until the first sample.
    avg_service_ms: AtomicU64,
}

impl Lane {
    fn new(kind: RequestKind, concurrency: usize, capacity: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            kind,
            queue: Mutex::new(VecDeque::new()),
            slots: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            capacity,
            notify: Notify::new(),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            avg_service_ms: AtomicU64::new(0),
        }
    }

    fn service_time(&self) -> Duration {
        match self.avg_service_ms.load(Ordering::Relaxed) {
            0 => self.kind.default_service_time(),
            ms => Duration::from_millis(ms),
        }
    }

    fn record_service(&self, elapsed: Duration) {
        let sample = (elapsed.as_millis() as u64).max(1);
        let _ = self
            .avg_service_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                Some(if old == 0 { sample } else { (old * 4 + sample) / 5 })
            });
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn estimate_wait(&self, position: usize) -> Duration {
        let rounds = position.div_ceil(self.concurrency) as u32;
        self.service_time() * rounds
    }

    fn push_front(&self, request: Request) {
        self.queue.lock().push_front(request);
        self.notify.notify_one();
    }

    fn stats(&self) -> LaneStats {
        LaneStats {
            kind: self.kind,
            queued: self.queue.lock().len(),
            active: self.active.load(Ordering::Relaxed),
            concurrency: self.concurrency,
            capacity: self.capacity,
            completed: self.completed.load(Ordering::Relaxed),
            avg_service_ms: self.service_time().as_millis() as u64,
        }
    }
}

enum Backoff {
    Elapsed,
    Abandoned,
    ShuttingDown,
}

/// Occupied worker slot. Dropping it frees the slot.
struct SlotGuard {
    lane: Arc<Lane>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    fn new(lane: Arc<Lane>, permit: OwnedSemaphorePermit) -> Self {
        lane.active.fetch_add(1, Ordering::Relaxed);
        Self {
            lane,
            _permit: permit,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.lane.active.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Scheduler {
    config: QueueConfig,
    download: Arc<Lane>,
    metadata: Arc<Lane>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            download: Arc::new(Lane::new(
                RequestKind::Download,
                config.max_concurrent_downloads,
                config.capacity,
            )),
            metadata: Arc::new(Lane::new(
                RequestKind::MetadataLookup,
                config.max_concurrent_metadata,
                config.capacity,
            )),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    fn lane(&self, kind: RequestKind) -> &Arc<Lane> {
        match kind {
            RequestKind::Download => &self.download,
            RequestKind::MetadataLookup => &self.metadata,
        }
    }

    /// Spawns one dispatcher per lane.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn RequestHandler>) -> Vec<JoinHandle<()>> {
        [RequestKind::Download, RequestKind::MetadataLookup]
            .into_iter()
            .map(|kind| {
                let scheduler = Arc::clone(self);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { scheduler.dispatch(kind, handler).await })
            })
            .collect()
    }

    async fn dispatch(self: Arc<Self>, kind: RequestKind, handler: Arc<dyn RequestHandler>) {
        let lane = Arc::clone(self.lane(kind));
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&lane.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (request, slot) = loop {
                let notified = lane.notify.notified();
                {
                    let mut queue = lane.queue.lock();
                    if let Some(request) = queue.pop_front() {
                        // Counted as active before the lock is released so
                        // enqueue never sees the request in neither place.
                        break (request, SlotGuard::new(Arc::clone(&lane), permit));
                    }
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = notified => {}
                }
            };

            let scheduler = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let started = Instant::now();
                let request_id = request.id;
                debug!(%request_id, %kind, video_id = %request.video_id, attempt = request.retry_count + 1, "request dispatched");
                let settled = handler.handle(request).await;
                slot.lane.record_service(started.elapsed());
                drop(slot);
                if let Settled::Retry(request, cause) = settled {
                    scheduler.retry(request, cause).await;
                }
            });
        }
        debug!(%kind, "dispatcher stopped");
    }

    /// Puts a transiently failed request back at the head of its lane after
    /// a linear backoff, or fails it once the retry budget is spent.
    async fn retry(&self, mut request: Request, cause: FetchError) {
        if request.retry_count >= self.config.max_retries {
            warn!(request_id = %request.id, video_id = %request.video_id, retries = request.retry_count, %cause, "retry budget exhausted");
            request.sink.fail(FetchError::GenericFailure(format!(
                "gave up after {} attempts: {cause}",
                request.retry_count + 1
            )));
            return;
        }
        request.retry_count += 1;
        let delay = self.config.retry_base_delay * request.retry_count;
        info!(request_id = %request.id, video_id = %request.video_id, attempt = request.retry_count + 1, delay_ms = delay.as_millis() as u64, %cause, "retrying request");

        let backoff = tokio::select! {
            _ = self.shutdown.cancelled() => Backoff::ShuttingDown,
            _ = request.sink.closed() => Backoff::Abandoned,
            _ = sleep(delay) => Backoff::Elapsed,
        };
        match backoff {
            Backoff::Elapsed => self.lane(request.kind).push_front(request),
            Backoff::Abandoned => {
                debug!(request_id = %request.id, "client left during retry backoff");
            }
            Backoff::ShuttingDown => {
                request
                    .sink
                    .fail(FetchError::Overloaded("server is shutting down".into()));
            }
        }
    }

    /// Appends a request to its lane.
    pub fn enqueue(&self, request: Request) -> Result<Enqueued, FetchError> {
        let lane = self.lane(request.kind);
        let mut queue = lane.queue.lock();
        let depth = queue.len();
        if depth >= lane.capacity {
            warn!(kind = %request.kind, depth, "queue full");
            return Err(FetchError::QueueFull { depth });
        }
        let starts_immediately = lane.active.load(Ordering::Relaxed) + depth < lane.concurrency;
        let position = depth + 1;
        let estimated_wait = if starts_immediately {
            Duration::ZERO
        } else {
            lane.estimate_wait(position)
        };
        debug!(request_id = %request.id, kind = %request.kind, video_id = %request.video_id, position, starts_immediately, "request enqueued");
        queue.push_back(request);
        drop(queue);
        lane.notify.notify_one();
        Ok(Enqueued {
            position,
            starts_immediately,
            estimated_wait,
        })
    }

    /// 1-based position of a still-queued request.
    pub fn position(&self, kind: RequestKind, request_id: Uuid) -> Option<usize> {
        self.lane(kind)
            .queue
            .lock()
            .iter()
            .position(|request| request.id == request_id)
            .map(|index| index + 1)
    }

    pub fn estimate_wait(&self, kind: RequestKind, position: usize) -> Duration {
        self.lane(kind).estimate_wait(position)
    }

    pub fn lane_stats(&self, kind: RequestKind) -> LaneStats {
        self.lane(kind).stats()
    }

    pub fn total_queued(&self) -> usize {
        self.download.queue.lock().len() + self.metadata.queue.lock().len()
    }

    /// Fails queued requests that waited longer than the request timeout.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let timeout = self.config.request_timeout;
        let mut expired = Vec::new();
        for lane in [&self.download, &self.metadata] {
            let mut queue = lane.queue.lock();
            let mut kept = VecDeque::with_capacity(queue.len());
            for request in queue.drain(..) {
                if now.duration_since(request.submitted_at) >= timeout {
                    expired.push(request);
                } else {
                    kept.push_back(request);
                }
            }
            *queue = kept;
        }
        let count = expired.len();
        for request in expired {
            debug!(request_id = %request.id, kind = %request.kind, "queued request expired");
            request.sink.fail(FetchError::Timeout);
        }
        if count > 0 {
            info!(expired = count, "swept stale queued requests");
        }
        count
    }

    /// Stops the dispatchers and fails everything still waiting.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for lane in [&self.download, &self.metadata] {
            let drained: Vec<Request> = lane.queue.lock().drain(..).collect();
            for request in drained {
                request
                    .sink
                    .fail(FetchError::Overloaded("server is shutting down".into()));
            }
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
