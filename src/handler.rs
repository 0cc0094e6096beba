use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::config::SamplingOverrides;
use crate::db::MeasurementStore;
use crate::error::PipelineError;
use crate::measurement::{Measurement, NewMeasurement};
use crate::models::{ExtractedFrame, FrameFailure, SampleConfig};
use crate::processor::process_upload;
use crate::sampler::MediaDecoder;
use crate::upload::UploadPipeline;

/// 处理器共享的状态
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<UploadPipeline>,
    pub decoder: Arc<dyn MediaDecoder>,
    pub measurements: Arc<MeasurementStore>,
    /// 服务端采样的默认参数
    pub sampling: SampleConfig,
    /// 本地存储时对外提供静态文件：(URL 前缀, 目录)
    pub static_files: Option<(String, PathBuf)>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            status: "error",
            message: message.into(),
        }),
    )
}

/// 错误类型到 HTTP 状态码
fn api_error(e: PipelineError) -> ApiError {
    let status = match &e {
        PipelineError::Rejected(_) | PipelineError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        PipelineError::Decode(_) | PipelineError::FrameCapture { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Upload(_) => StatusCode::BAD_GATEWAY,
        PipelineError::MetadataRead(_) | PipelineError::Io(_) | PipelineError::Sqlite(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        error!("❌ 请求处理失败: {}", e);
    } else {
        warn!("⚠️  请求被拒绝: {}", e);
    }
    error_response(status, e.to_string())
}

/// 在阻塞线程中访问数据库
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("后台任务异常: {}", e)))?
        .map_err(api_error)
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, format!("解析表单失败: {}", e))
}

/// 构建全部路由
pub fn router(state: AppState) -> Router {
    // 视频上限之外再留 1MB 给表单其余部分
    let body_limit = state.pipeline.policy().max_video_bytes + 1024 * 1024;

    let mut app = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/api/upload-video", post(upload_video))
        .route("/api/upload-frame", post(upload_frame))
        .route("/api/process", post(process_video))
        .route("/api/measurements", post(create_measurement).get(list_measurements))
        .route("/api/measurements/:id", get(get_measurement).delete(delete_measurement));

    if let Some((prefix, dir)) = &state.static_files {
        app = app.nest_service(prefix.as_str(), ServeDir::new(dir));
    }

    app.layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 从表单里取出名为 `name` 的文件
async fn read_file_field(multipart: &mut Multipart, name: &str) -> Result<(Vec<u8>, String), ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(name) {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.mp4").to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok((bytes.to_vec(), filename));
    }
    Err(error_response(StatusCode::BAD_REQUEST, format!("缺少文件字段 '{}'", name)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadVideoResponse {
    pub status: &'static str,
    pub video_url: String,
    pub public_id: String,
    pub measurement_device: Option<String>,
}

pub async fn upload_video(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<UploadVideoResponse> {
    let (bytes, filename) = read_file_field(&mut multipart, "video").await?;
    info!("收到视频上传: {} ({} 字节)", filename, bytes.len());

    let uploaded = state.pipeline.upload_video(bytes, &filename).await.map_err(api_error)?;

    Ok(Json(UploadVideoResponse {
        status: "success",
        video_url: uploaded.url,
        public_id: uploaded.public_id,
        measurement_device: uploaded.device_hint,
    }))
}

#[derive(Debug, Serialize)]
pub struct UploadFramesResponse {
    pub urls: Vec<String>,
}

/// 表单中每个文件部分视为一帧，按出现顺序上传
pub async fn upload_frame(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<UploadFramesResponse> {
    let mut frames = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.file_name().is_none() {
            continue;
        }
        let bytes = field.bytes().await.map_err(multipart_error)?;
        frames.push(ExtractedFrame {
            index: frames.len(),
            timestamp: 0.0,
            image_bytes: bytes.to_vec(),
            preview_path: None,
            remote_url: None,
        });
    }
    if frames.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "表单中没有帧图像"));
    }

    info!("收到 {} 帧上传请求", frames.len());
    let urls = state.pipeline.upload_frames(&mut frames, |_| {}).await.map_err(api_error)?;
    Ok(Json(UploadFramesResponse { urls }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedFrame {
    pub index: usize,
    pub timestamp: f64,
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub status: &'static str,
    pub video_url: String,
    pub measurement_device: Option<String>,
    pub frames: Vec<ProcessedFrame>,
    pub failed_frames: Vec<FrameFailure>,
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("字段 {} 的值无效: {}", name, value)))
}

/// 服务端完整流水线：上传视频、采样、上传帧
///
/// 表单字段 `video` 为视频文件，可选的 `maxFrames`、`framesPerSecond`、
/// `quality`、`scaleFactor`、`randomize` 覆盖默认采样参数。
pub async fn process_video(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<ProcessResponse> {
    let mut video = None;
    let mut overrides = SamplingOverrides::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "video" {
            let filename = field.file_name().unwrap_or("upload.mp4").to_string();
            let bytes = field.bytes().await.map_err(multipart_error)?;
            video = Some((bytes.to_vec(), filename));
            continue;
        }
        let value = field.text().await.map_err(multipart_error)?;
        match name.as_str() {
            "maxFrames" => overrides.max_frames = Some(parse_field(&name, &value)?),
            "framesPerSecond" => overrides.frames_per_second = Some(parse_field(&name, &value)?),
            "quality" => overrides.quality = Some(parse_field(&name, &value)?),
            "scaleFactor" => overrides.scale_factor = Some(parse_field(&name, &value)?),
            "randomize" => overrides.randomize = Some(parse_field(&name, &value)?),
            _ => {}
        }
    }

    let (bytes, filename) =
        video.ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "缺少文件字段 'video'"))?;
    let config = overrides.apply(&state.sampling);

    let output = process_upload(&state.pipeline, state.decoder.clone(), bytes, &filename, config)
        .await
        .map_err(api_error)?;

    let frames = output
        .frames
        .iter()
        .zip(&output.upload.frame_urls)
        .map(|(frame, url)| ProcessedFrame {
            index: frame.index,
            timestamp: frame.timestamp,
            url: url.clone(),
        })
        .collect();

    Ok(Json(ProcessResponse {
        status: "success",
        video_url: output.upload.video_url,
        measurement_device: output.upload.device_hint,
        frames,
        failed_frames: output.failures,
    }))
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub status: &'static str,
    pub message: String,
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub status: &'static str,
    pub data: T,
}

pub async fn create_measurement(
    State(state): State<AppState>,
    payload: Result<Json<NewMeasurement>, JsonRejection>,
) -> ApiResult<CreatedResponse> {
    let Json(payload) = payload.map_err(|rejection| {
        warn!("⚠️  测量记录请求体无效: {}", rejection.body_text());
        error_response(StatusCode::BAD_REQUEST, format!("请求体无效: {}", rejection.body_text()))
    })?;
    let record = payload.resolve(chrono::Utc::now()).map_err(api_error)?;
    let store = state.measurements.clone();
    let id = blocking(move || store.insert(&record)).await?;

    Ok(Json(CreatedResponse {
        status: "success",
        message: "测量记录已保存".to_string(),
        id,
    }))
}

pub async fn list_measurements(State(state): State<AppState>) -> ApiResult<DataResponse<Vec<Measurement>>> {
    let store = state.measurements.clone();
    let data = blocking(move || store.list()).await?;
    Ok(Json(DataResponse { status: "success", data }))
}

pub async fn get_measurement(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<DataResponse<Measurement>> {
    let store = state.measurements.clone();
    match blocking(move || store.get(id)).await? {
        Some(data) => Ok(Json(DataResponse { status: "success", data })),
        None => Err(error_response(StatusCode::NOT_FOUND, format!("测量记录不存在: {}", id))),
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub status: &'static str,
    pub message: String,
}

pub async fn delete_measurement(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<MessageResponse> {
    let store = state.measurements.clone();
    if blocking(move || store.delete(id)).await? {
        Ok(Json(MessageResponse {
            status: "success",
            message: format!("测量记录已删除: {}", id),
        }))
    } else {
        Err(error_response(StatusCode::NOT_FOUND, format!("测量记录不存在: {}", id)))
    }
}
