#![forbid(unsafe_code)]

//! The request handler the scheduler runs inside a worker slot.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    cache::MetadataCache,
    error::FetchError,
    queue::{Request, RequestHandler, RequestKind, Settled},
    relay::relay,
    resolver::ExternalResolver,
    sink::StreamHead,
    stats::GatewayStats,
};

pub struct FetchWorker {
    resolver: ExternalResolver,
    cache: Arc<MetadataCache>,
    stats: Arc<GatewayStats>,
}

impl FetchWorker {
    pub fn new(
        resolver: ExternalResolver,
        cache: Arc<MetadataCache>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            resolver,
            cache,
            stats,
        }
    }

    fn retry(&self, request: Request, cause: FetchError) -> Settled {
        self.stats.record_retry();
        Settled::Retry(request, cause)
    }

    async fn lookup(&self, request: Request) -> Settled {
        // Another lookup may have filled the cache while this one waited.
        if let Some(metadata) = self.cache.get(&request.video_id) {
            let _ = request.sink.deliver_metadata(metadata);
            return Settled::Done;
        }

        match self.resolver.resolve_metadata(&request.video_id).await {
            Ok(metadata) => {
                self.stats.record_metadata(true);
                let metadata = Arc::new(metadata);
                self.cache.put(request.video_id.clone(), Arc::clone(&metadata));
                if request.sink.deliver_metadata(metadata).is_err() {
                    // Detached lookups only exist to warm the cache.
                    debug!(request_id = %request.id, video_id = %request.video_id, "metadata cached for a detached lookup");
                }
                Settled::Done
            }
            Err(err) if err.is_transient() => self.retry(request, err),
            Err(err) => {
                self.stats.record_metadata(false);
                info!(request_id = %request.id, video_id = %request.video_id, %err, "metadata lookup failed");
                request.sink.fail(err);
                Settled::Done
            }
        }
    }

    async fn download(&self, mut request: Request) -> Settled {
        if request.sink.is_closed() {
            debug!(request_id = %request.id, "client left before the download started");
            self.stats
                .record_download(&Err(FetchError::ClientDisconnected));
            return Settled::Done;
        }

        let title = self
            .cache
            .get(&request.video_id)
            .and_then(|metadata| metadata.display_title().map(str::to_string));
        request.sink.prepare_stream(StreamHead {
            content_type: request.format.content_type(),
            filename: request.format.filename(&request.video_id, title.as_deref()),
        });

        let handle = match self.resolver.open_stream(&request.video_id, request.format) {
            Ok(handle) => handle,
            Err(err) if err.is_transient() => return self.retry(request, err),
            Err(err) => {
                self.stats.record_download(&Err(err.clone()));
                request.sink.fail(err);
                return Settled::Done;
            }
        };

        let deadline = Instant::now() + self.resolver.config().download_timeout;
        let outcome = relay(handle, &mut request.sink, deadline).await;
        match outcome {
            Ok(bytes) => {
                self.stats.record_download(&Ok(bytes));
                request.sink.finish();
                Settled::Done
            }
            Err(err) if request.sink.has_started() => {
                // The status line is out; all that is left is to cut the body.
                self.stats.record_partial_bytes(request.sink.bytes_sent());
                self.stats.record_download(&Err(err));
                Settled::Done
            }
            Err(err) if err.is_transient() => {
                warn!(request_id = %request.id, video_id = %request.video_id, %err, "download failed before first byte");
                self.retry(request, err)
            }
            Err(err) => {
                self.stats.record_download(&Err(err.clone()));
                request.sink.fail(err);
                Settled::Done
            }
        }
    }
}

#[async_trait]
impl RequestHandler for FetchWorker {
    async fn handle(&self, request: Request) -> Settled {
        match request.kind {
            RequestKind::MetadataLookup => self.lookup(request).await,
            RequestKind::Download => self.download(request).await,
        }
    }
}
