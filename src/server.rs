//! HTTP API 服务器
use crate::audio_merge::AudioMerger;
use crate::config::Config;
use crate::error::ApiError;
use crate::session_files::{
    validate_session_id, MergeRecord, SessionDetail, SessionFileStorage, SessionSummary,
    SketchIndex, StorageError, MERGED_AUDIO_FILE,
};
use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    storage: Arc<SessionFileStorage>,
    merger: Arc<AudioMerger>,
    start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        let storage = SessionFileStorage::with_base_dir(config.storage.upload_root.clone())?;
        Ok(Self {
            storage: Arc::new(storage),
            merger: Arc::new(AudioMerger::new(&config.merge)),
            start_time: std::time::Instant::now(),
        })
    }

    pub fn storage(&self) -> &SessionFileStorage {
        &self.storage
    }
}

/// 构建路由
pub fn build_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/start_session", post(start_session))
        .route("/save_sketch", post(save_sketch))
        .route("/save_audio_chunk", post(save_audio_chunk))
        .route("/save_top3", post(save_top3))
        .route("/end_session", post(end_session))
        .route(
            "/download_sketch/:session_id/:filename",
            get(download_sketch),
        )
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id", get(session_detail))
        // 早期原型的单张画作接口
        .route("/save-drawing", post(save_drawing))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(
    config: Config,
    shutdown: oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = AppState::new(&config)?;
    tracing::info!(
        "[SERVER] 上传目录: {:?}, ffmpeg: {}",
        state.storage.base_dir(),
        if config.merge.ffmpeg_enabled {
            config.merge.ffmpeg_path.display().to_string()
        } else {
            "disabled".to_string()
        }
    );

    let app = build_router(state, config.server.body_limit_bytes());

    let addr: std::net::SocketAddr = config.server.addr().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.await;
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

// ========== 请求 / 响应 ==========

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartSessionRequest {
    condition: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
struct SaveSketchRequest {
    session_id: Option<String>,
    svg_data: Option<String>,
    sketch_index: Option<SketchIndex>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveFileResponse {
    pub success: bool,
    pub filename: String,
}

#[derive(Debug, Deserialize)]
struct SaveTop3Request {
    session_id: Option<String>,
    svg_data_list: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveTop3Response {
    pub success: bool,
    pub filenames: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EndSessionRequest {
    session_id: Option<String>,
}

/// 结束会话的响应
///
/// 合并失败不影响 `success`，只通过 `warning` 告知客户端。
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EndSessionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub chunk_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyDrawingRequest {
    svg: Option<String>,
}

fn parse_json<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e.body_text())))
}

/// 空字符串视同缺失
fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::missing(field))
}

/// 在阻塞线程池中执行存储操作，避免同步文件读写占用异步工作线程
async fn with_storage<T, E, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&SessionFileStorage) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    let storage = Arc::clone(&state.storage);
    tokio::task::spawn_blocking(move || f(&storage))
        .await
        .map_err(|e| ApiError::Internal(format!("存储任务异常终止: {}", e)))?
        .map_err(Into::into)
}

/// 请求体可以为空；非空时必须是合法 JSON
fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

// ========== 会话 ==========

async fn start_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<StartSessionResponse>, ApiError> {
    let request: StartSessionRequest = parse_optional_body(&body)?;
    let condition = request.condition;
    let meta = with_storage(&state, move |storage| storage.create_session(condition)).await?;
    Ok(Json(StartSessionResponse {
        session_id: meta.session_id,
    }))
}

async fn end_session(
    State(state): State<AppState>,
    payload: Result<Json<EndSessionRequest>, JsonRejection>,
) -> Result<Json<EndSessionResponse>, ApiError> {
    let request = parse_json(payload)?;
    let session_id = required(request.session_id, "session_id")?;
    validate_session_id(&session_id)?;

    let mut response = EndSessionResponse {
        success: true,
        ..Default::default()
    };

    let sid = session_id.clone();
    if !with_storage(&state, move |storage| {
        Ok::<_, ApiError>(storage.session_exists(&sid))
    })
    .await?
    {
        tracing::warn!("[SESSION] 结束未知会话: {}", session_id);
        response.warning = Some("session not found; nothing to merge".to_string());
        return Ok(Json(response));
    }

    let mut record = None;
    match state.merger.merge_session(&state.storage, &session_id).await {
        Ok(Some(outcome)) => {
            response.merged_file = Some(MERGED_AUDIO_FILE.to_string());
            response.strategy = Some(outcome.strategy.to_string());
            response.chunk_count = outcome.chunk_count;
            record = Some(MergeRecord {
                strategy: outcome.strategy,
                chunk_count: outcome.chunk_count,
                merged_at: Utc::now().timestamp_millis(),
            });
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!("[AudioMerge] 会话 {} 音频合并失败: {}", session_id, e);
            response.warning = Some("audio merge failed".to_string());
        }
    }

    let sid = session_id.clone();
    if let Err(e) = with_storage(&state, move |storage| storage.mark_ended(&sid, record)).await {
        tracing::warn!("[SESSION] 更新会话 {} 元数据失败: {}", session_id, e);
    }

    tracing::info!(
        "[SESSION] 会话结束: {} chunks={}",
        session_id,
        response.chunk_count
    );
    Ok(Json(response))
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    with_storage(&state, |storage| storage.list_sessions())
        .await
        .map(Json)
}

async fn session_detail(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
    with_storage(&state, move |storage| {
        storage
            .get_session_detail(&session_id)
            .map_err(not_found_on_invalid)
    })
    .await
    .map(Json)
}

// ========== 文件 ==========

async fn save_sketch(
    State(state): State<AppState>,
    payload: Result<Json<SaveSketchRequest>, JsonRejection>,
) -> Result<Json<SaveFileResponse>, ApiError> {
    let request = parse_json(payload)?;
    let session_id = required(request.session_id, "session_id")?;
    let svg_data = required(request.svg_data, "svg_data")?;

    let sketch_index = request.sketch_index;
    let filename = with_storage(&state, move |storage| {
        storage.save_sketch(&session_id, &svg_data, sketch_index.as_ref())
    })
    .await?;
    Ok(Json(SaveFileResponse {
        success: true,
        filename,
    }))
}

async fn save_audio_chunk(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<SaveFileResponse>, ApiError> {
    let mut multipart =
        multipart.map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e.body_text())))?;

    let mut audio: Option<Bytes> = None;
    let mut session_id: Option<String> = None;
    let mut chunk_number: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e.body_text())))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let read_err = |e: axum::extract::multipart::MultipartError| {
            ApiError::BadRequest(format!("Invalid multipart field {}: {}", name, e.body_text()))
        };
        match name.as_str() {
            "audio" => audio = Some(field.bytes().await.map_err(read_err)?),
            "session_id" => session_id = Some(field.text().await.map_err(read_err)?),
            "chunk_number" => chunk_number = Some(field.text().await.map_err(read_err)?),
            _ => {}
        }
    }

    let audio = audio.ok_or_else(|| ApiError::BadRequest("No audio file provided".to_string()))?;
    let session_id = required(session_id, "session_id")?;
    let chunk_number: u64 = required(chunk_number, "chunk_number")?
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid chunk_number".to_string()))?;

    let filename = with_storage(&state, move |storage| {
        storage.save_audio_chunk(&session_id, chunk_number, &audio)
    })
    .await?;
    Ok(Json(SaveFileResponse {
        success: true,
        filename,
    }))
}

async fn save_top3(
    State(state): State<AppState>,
    payload: Result<Json<SaveTop3Request>, JsonRejection>,
) -> Result<Json<SaveTop3Response>, ApiError> {
    let request = parse_json(payload)?;
    let session_id = required(request.session_id, "session_id")?;
    let svg_data_list = request
        .svg_data_list
        .ok_or_else(|| ApiError::missing("svg_data_list"))?;

    let filenames =
        with_storage(&state, move |storage| storage.save_top3(&session_id, &svg_data_list))
            .await?;
    Ok(Json(SaveTop3Response {
        success: true,
        filenames,
    }))
}

async fn download_sketch(
    State(state): State<AppState>,
    Path((session_id, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (name, bytes) = with_storage(&state, move |storage| {
        storage
            .read_sketch(&session_id, &filename)
            .map_err(not_found_on_invalid)
    })
    .await?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/svg+xml".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn save_drawing(
    State(state): State<AppState>,
    payload: Result<Json<LegacyDrawingRequest>, JsonRejection>,
) -> Result<Json<SaveFileResponse>, ApiError> {
    let request = parse_json(payload)?;
    let svg = request
        .svg
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("No SVG content provided".to_string()))?;

    let filename = with_storage(&state, move |storage| storage.save_legacy_drawing(&svg)).await?;
    Ok(Json(SaveFileResponse {
        success: true,
        filename,
    }))
}

/// 读取类接口：URL 中的非法会话 ID 一律按不存在处理
fn not_found_on_invalid(err: StorageError) -> ApiError {
    match err {
        StorageError::InvalidInput(msg) => ApiError::NotFound(msg),
        other => other.into(),
    }
}

// ========== 健康检查 ==========

#[derive(Debug, Serialize)]
struct CheckResult {
    status: String,
    message: Option<String>,
    latency_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: chrono::DateTime<Utc>,
    version: String,
    uptime_secs: u64,
    checks: HashMap<String, CheckResult>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    let base_dir = state.storage.base_dir().to_path_buf();
    let upload_root = tokio::task::spawn_blocking(move || check_upload_root(&base_dir))
        .await
        .unwrap_or_else(|e| CheckResult {
            status: "unhealthy".to_string(),
            message: Some(format!("check failed: {}", e)),
            latency_ms: None,
        });
    checks.insert("upload_root".to_string(), upload_root);

    let healthy = checks.values().all(|c| c.status == "healthy");
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthStatus {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: state.start_time.elapsed().as_secs(),
            checks,
        }),
    )
}

fn check_upload_root(base_dir: &std::path::Path) -> CheckResult {
    let start = std::time::Instant::now();
    let test_file = base_dir.join(".sketchcast_write_check");
    let writable = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&test_file)
        .and_then(|_| std::fs::remove_file(&test_file))
        .is_ok();

    CheckResult {
        status: if writable { "healthy" } else { "unhealthy" }.to_string(),
        message: if writable {
            None
        } else {
            Some("upload directory not writable".to_string())
        },
        latency_ms: Some(start.elapsed().as_millis() as u64),
    }
}
