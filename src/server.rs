#![forbid(unsafe_code)]

//! HTTP surface of the gateway.
//!
//! Handlers stay thin: validate, admit, consult the cache, enqueue, then wait
//! for whatever the worker puts on the request's sink. A download that has to
//! wait behind a full pool is answered with `202 Accepted` and a ticket; the
//! client claims the stream later through `/api/downloads/{ticket}`.

use std::{collections::HashMap, convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path as AxumPath, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    admission::{Admission, AdmissionController, MemoryProbe},
    cache::MetadataCache,
    config::GatewayConfig,
    error::FetchError,
    queue::{Enqueued, Request, RequestKind, Scheduler},
    resolver::{ExternalResolver, FormatSummary, VideoMetadata},
    sink::{DEFAULT_SINK_BUFFER, ResponseHead, ResponseReceiver, StreamHead, response_channel},
    stats::GatewayStats,
    video::{FormatSpec, VideoId, validate},
    worker::FetchWorker,
};

/// Shared handles for every handler. Each component is built once from the
/// config and shared through `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub admission: Arc<AdmissionController>,
    pub scheduler: Arc<Scheduler>,
    pub cache: Arc<MetadataCache>,
    pub stats: Arc<GatewayStats>,
    pub pending: Arc<PendingDownloads>,
}

impl AppState {
    pub fn new(config: GatewayConfig, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            admission: Arc::new(AdmissionController::new(config.admission.clone(), probe)),
            scheduler: Scheduler::new(config.queue.clone()),
            cache: Arc::new(MetadataCache::new(config.cache.clone())),
            stats: Arc::new(GatewayStats::default()),
            pending: Arc::new(PendingDownloads::new(config.ticket_ttl())),
            config: Arc::new(config),
        }
    }

    /// Starts the lane dispatchers and the periodic maintenance task.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let worker = FetchWorker::new(
            ExternalResolver::new(self.config.resolver.clone()),
            Arc::clone(&self.cache),
            Arc::clone(&self.stats),
        );
        let mut tasks = self.scheduler.start(Arc::new(worker));
        tasks.push(spawn_maintenance(self.clone()));
        tasks
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// One maintenance pass over every structure that expires lazily.
    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            expired_requests: self.scheduler.sweep_expired(),
            expired_cache_entries: self.cache.sweep(),
            idle_clients: self.admission.sweep(),
            expired_tickets: self.pending.sweep(),
        };
        if report != SweepReport::default() {
            debug!(?report, "maintenance sweep");
        }
        report
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_requests: usize,
    pub expired_cache_entries: usize,
    pub idle_clients: usize,
    pub expired_tickets: usize,
}

fn spawn_maintenance(state: AppState) -> JoinHandle<()> {
    let token = state.scheduler.shutdown_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    state.sweep();
                }
            }
        }
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/info", get(info_by_query))
        .route("/info/{id}", get(info_by_path))
        .route("/download", get(download_by_query))
        .route("/download/{id}", get(download_by_path))
        .route("/api/downloads/{ticket}", get(claim_download))
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .fallback(not_found)
        .with_state(state)
}

/// Queued downloads whose client was told to come back later.
pub struct PendingDownloads {
    tickets: Mutex<HashMap<Uuid, ParkedDownload>>,
    ttl: Duration,
}

struct ParkedDownload {
    receiver: ResponseReceiver,
    parked_at: Instant,
}

impl PendingDownloads {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn park(&self, ticket: Uuid, receiver: ResponseReceiver) {
        self.tickets.lock().insert(
            ticket,
            ParkedDownload {
                receiver,
                parked_at: Instant::now(),
            },
        );
    }

    pub fn take(&self, ticket: &Uuid) -> Option<ResponseReceiver> {
        self.tickets
            .lock()
            .remove(ticket)
            .map(|parked| parked.receiver)
    }

    pub fn contains(&self, ticket: &Uuid) -> bool {
        self.tickets.lock().contains_key(ticket)
    }

    /// Drops unclaimed tickets. The worker sees the dropped receiver as a
    /// client disconnect.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut tickets = self.tickets.lock();
        let before = tickets.len();
        tickets.retain(|_, parked| now.duration_since(parked.parked_at) < self.ttl);
        before - tickets.len()
    }

    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    hint: Option<&'static str>,
    retry_after: Option<Duration>,
    queue_depth: Option<usize>,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
            hint: None,
            retry_after: None,
            queue_depth: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.into(),
            hint: None,
            retry_after: None,
            queue_depth: None,
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        Self {
            status: err.status(),
            code: err.code(),
            hint: err.hint(),
            retry_after: err.retry_after(),
            queue_depth: match err {
                FetchError::QueueFull { depth } => Some(depth),
                _ => None,
            },
            message: err.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after.map(|delay| whole_seconds(delay).max(1));
        let body = ErrorBody {
            success: false,
            error: self.code,
            message: &self.message,
            hint: self.hint,
            queue_depth: self.queue_depth,
            retry_after,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct InfoQuery {
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub url: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    success: bool,
    video_id: String,
    title: Option<String>,
    duration: Option<u64>,
    formats: Vec<FormatSummary>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    view_count: Option<u64>,
    upload_date: Option<String>,
    cached: bool,
}

impl InfoResponse {
    fn new(video_id: &VideoId, metadata: &VideoMetadata, cached: bool) -> Self {
        Self {
            success: true,
            video_id: video_id.to_string(),
            title: metadata.display_title().map(str::to_string),
            duration: metadata.duration_secs(),
            formats: metadata.format_summary(),
            thumbnail: metadata.thumbnail.clone(),
            uploader: metadata.uploader_name().map(str::to_string),
            view_count: metadata.view_count,
            upload_date: metadata.upload_date.clone(),
            cached,
        }
    }
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    success: bool,
    queued: bool,
    queue_position: usize,
    estimated_wait: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    ticket: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_url: Option<String>,
}

impl QueuedResponse {
    fn new(queue_position: usize, estimated_wait: Duration, ticket: Option<Uuid>) -> Self {
        Self {
            success: false,
            queued: true,
            queue_position,
            estimated_wait: whole_seconds(estimated_wait),
            status_url: ticket.map(|ticket| format!("/api/downloads/{ticket}")),
            ticket,
        }
    }

    fn into_response(self) -> Response {
        (StatusCode::ACCEPTED, Json(self)).into_response()
    }
}

/// First `X-Forwarded-For` hop when present, otherwise the peer address.
pub fn client_id(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

impl AppState {
    fn admit(&self, client: &str, kind: RequestKind) -> ApiResult<()> {
        match self.admission.admit(client, kind.admission_cost()) {
            Admission::Allow => Ok(()),
            Admission::Reject(reason) => {
                let err = FetchError::from(reason);
                self.stats.record_rejection(&err);
                Err(err.into())
            }
        }
    }

    fn enqueue(&self, request: Request) -> ApiResult<Enqueued> {
        self.scheduler.enqueue(request).map_err(|err| {
            self.stats.record_rejection(&err);
            ApiError::from(err)
        })
    }

    async fn info(&self, client: String, input: &str) -> ApiResult<Response> {
        let video_id = validate(input)?;
        self.admit(&client, RequestKind::MetadataLookup)?;
        self.stats.record_request();

        if let Some(metadata) = self.cache.get(&video_id) {
            debug!(%video_id, "metadata served from cache");
            return Ok(Json(InfoResponse::new(&video_id, &metadata, true)).into_response());
        }

        let (sink, receiver) = response_channel(1);
        let request = Request::new(
            RequestKind::MetadataLookup,
            video_id.clone(),
            FormatSpec::default(),
            sink,
        );
        let placed = self.enqueue(request)?;
        if !placed.starts_immediately {
            // The lookup still runs and lands in the cache for the retry.
            info!(%video_id, position = placed.position, "metadata lookup queued");
            let queued = QueuedResponse::new(placed.position, placed.estimated_wait, None);
            return Ok(queued.into_response());
        }

        match receiver.head.await {
            Ok(ResponseHead::Metadata(metadata)) => {
                Ok(Json(InfoResponse::new(&video_id, &metadata, false)).into_response())
            }
            Ok(ResponseHead::Failed(err)) => Err(err.into()),
            Ok(ResponseHead::Stream(_)) => Err(ApiError::internal(
                "unexpected stream for a metadata lookup",
            )),
            Err(_) => Err(ApiError::internal("metadata lookup was abandoned")),
        }
    }

    async fn download(
        &self,
        client: String,
        input: &str,
        query: &DownloadQuery,
    ) -> ApiResult<Response> {
        let video_id = validate(input)?;
        let format = FormatSpec::parse(query.format.as_deref(), query.quality.as_deref())?;
        self.admit(&client, RequestKind::Download)?;
        self.stats.record_request();

        let (sink, receiver) = response_channel(DEFAULT_SINK_BUFFER);
        let request = Request::new(RequestKind::Download, video_id.clone(), format, sink);
        let ticket = request.id;
        let placed = self.enqueue(request)?;
        if placed.starts_immediately {
            return stream_response(receiver).await;
        }

        self.pending.park(ticket, receiver);
        info!(%video_id, %ticket, position = placed.position, "download queued behind a full pool");
        let queued = QueuedResponse::new(placed.position, placed.estimated_wait, Some(ticket));
        Ok(queued.into_response())
    }
}

/// Waits for the worker's verdict and turns it into a response.
async fn stream_response(receiver: ResponseReceiver) -> ApiResult<Response> {
    let ResponseReceiver { head, body } = receiver;
    let head = match head.await {
        Ok(ResponseHead::Stream(head)) => head,
        Ok(ResponseHead::Failed(err)) => return Err(err.into()),
        Ok(ResponseHead::Metadata(_)) => {
            return Err(ApiError::internal("unexpected metadata for a download"));
        }
        Err(_) => return Err(ApiError::internal("download was abandoned")),
    };
    media_response(head, body)
}

fn media_response(head: StreamHead, body: mpsc::Receiver<Bytes>) -> ApiResult<Response> {
    let stream = futures::stream::unfold(body, |mut body| async move {
        body.recv()
            .await
            .map(|chunk| (Ok::<Bytes, Infallible>(chunk), body))
    });
    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(head.content_type));
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", head.filename))
        .map_err(|_| ApiError::internal("invalid download filename"))?;
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

fn missing_url() -> ApiError {
    FetchError::InvalidInput("missing url parameter".into()).into()
}

async fn info_by_query(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<InfoQuery>,
) -> ApiResult<Response> {
    let url = query.url.ok_or_else(missing_url)?;
    state.info(client_id(&headers, peer), &url).await
}

async fn info_by_path(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    state.info(client_id(&headers, peer), &id).await
}

async fn download_by_query(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let url = query.url.clone().ok_or_else(missing_url)?;
    state.download(client_id(&headers, peer), &url, &query).await
}

async fn download_by_path(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    state.download(client_id(&headers, peer), &id, &query).await
}

async fn claim_download(
    State(state): State<AppState>,
    AxumPath(ticket): AxumPath<String>,
) -> ApiResult<Response> {
    let ticket = Uuid::parse_str(&ticket).map_err(|_| ApiError::not_found("unknown ticket"))?;
    if !state.pending.contains(&ticket) {
        return Err(ApiError::not_found("unknown or expired ticket"));
    }
    if let Some(position) = state.scheduler.position(RequestKind::Download, ticket) {
        let wait = state.scheduler.estimate_wait(RequestKind::Download, position);
        return Ok(QueuedResponse::new(position, wait, Some(ticket)).into_response());
    }
    let receiver = state
        .pending
        .take(&ticket)
        .ok_or_else(|| ApiError::not_found("ticket already claimed"))?;
    debug!(%ticket, "download ticket claimed");
    stream_response(receiver).await
}

async fn health(State(state): State<AppState>) -> Response {
    let memory = state.admission.memory();
    let degraded = state.admission.overload_detail();
    let status = if degraded.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    if let Some(detail) = &degraded {
        warn!(%detail, "health check degraded");
    }
    let body = json!({
        "status": if degraded.is_some() { "degraded" } else { "healthy" },
        "detail": degraded,
        "memory_usage": {
            "process_mb": memory.process_mb(),
            "system_percent": memory.system_percent(),
        },
        "queue_stats": {
            "download": state.scheduler.lane_stats(RequestKind::Download),
            "metadata": state.scheduler.lane_stats(RequestKind::MetadataLookup),
        },
    });
    (status, Json(body)).into_response()
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "counters": state.stats.snapshot(),
        "queue": {
            "depth": state.scheduler.total_queued(),
            "download": state.scheduler.lane_stats(RequestKind::Download),
            "metadata": state.scheduler.lane_stats(RequestKind::MetadataLookup),
        },
        "cache": state.cache.stats(),
        "memory": state.admission.memory(),
        "pending_tickets": state.pending.len(),
        "tracked_clients": state.admission.tracked_clients(),
        "generated_at": Utc::now(),
    }))
}

async fn not_found() -> ApiError {
    ApiError::not_found("endpoint not found")
}
