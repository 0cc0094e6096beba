use futures::future::join_all;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::metadata_reader::{device_hint, MetadataReader, UNKNOWN_DEVICE};
use crate::models::{ExtractedFrame, VideoUpload};
use crate::store::{extension_of, MediaStore, ResourceKind, StoredObject};

/// 帧上传方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameUploadStrategy {
    /// 每帧一个请求，全部并发后统一等待
    Parallel,
    /// 固定大小分批，批与批之间串行
    Batched { batch_size: usize },
}

/// 上传约束与目标目录
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub video_folder: String,
    pub frame_folder: String,
    pub max_video_bytes: usize,
    pub allowed_video_formats: Vec<String>,
    pub frame_strategy: FrameUploadStrategy,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            video_folder: "tire-data/videos".to_string(),
            frame_folder: "tire-data/frames".to_string(),
            max_video_bytes: 100 * 1000 * 1000,
            allowed_video_formats: vec!["mp4".into(), "mov".into(), "avi".into()],
            frame_strategy: FrameUploadStrategy::Parallel,
        }
    }
}

/// 上传流水线：原始视频与采样帧写入远端存储
///
/// 存储客户端由调用方构造后注入。
pub struct UploadPipeline {
    store: Arc<dyn MediaStore>,
    metadata_reader: Option<Arc<dyn MetadataReader>>,
    policy: UploadPolicy,
}

impl UploadPipeline {
    pub fn new(store: Arc<dyn MediaStore>, policy: UploadPolicy) -> Self {
        Self {
            store,
            metadata_reader: None,
            policy,
        }
    }

    pub fn with_metadata_reader(mut self, reader: Arc<dyn MetadataReader>) -> Self {
        self.metadata_reader = Some(reader);
        self
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn MediaStore> {
        &self.store
    }

    /// 网络请求之前的校验：大小上限与容器格式
    pub fn validate_video(&self, size: usize, filename: &str) -> Result<()> {
        if size == 0 {
            return Err(PipelineError::Rejected("视频文件为空".into()));
        }
        if size > self.policy.max_video_bytes {
            return Err(PipelineError::Rejected(format!(
                "视频大小 {} 字节超过上限 {} 字节",
                size, self.policy.max_video_bytes
            )));
        }
        let ext = extension_of(filename);
        if !self.policy.allowed_video_formats.iter().any(|f| f.eq_ignore_ascii_case(&ext)) {
            return Err(PipelineError::Rejected(format!(
                "不支持的视频格式 '{}'，允许: {}",
                ext,
                self.policy.allowed_video_formats.join(", ")
            )));
        }
        Ok(())
    }

    /// 上传原始视频，并尽量读出拍摄设备
    pub async fn upload_video(&self, bytes: Vec<u8>, filename: &str) -> Result<VideoUpload> {
        self.validate_video(bytes.len(), filename)?;

        let device_hint = match &self.metadata_reader {
            Some(reader) => Some(self.read_device_hint(reader.clone(), &bytes, filename).await),
            None => None,
        };

        let start = Instant::now();
        let size = bytes.len();
        let stored: StoredObject = self
            .store
            .put(bytes, &self.policy.video_folder, ResourceKind::Video, filename)
            .await
            .map_err(|e| {
                error!("❌ 视频上传失败 ({}): {}", self.store.name(), e);
                e
            })?;

        info!(
            "✅ 视频已上传: {} ({} 字节, {:.2}秒) -> {}",
            filename,
            size,
            start.elapsed().as_secs_f64(),
            stored.url
        );

        Ok(VideoUpload {
            url: stored.url,
            public_id: stored.public_id,
            device_hint,
        })
    }

    /// 写临时文件读取容器标签；任何失败都退化为 "Unknown Device"
    ///
    /// 临时文件在函数返回时删除，无论成功与否。
    async fn read_device_hint(&self, reader: Arc<dyn MetadataReader>, bytes: &[u8], filename: &str) -> String {
        let scratch = match write_scratch_file(bytes, &extension_of(filename)) {
            Ok(file) => file,
            Err(e) => {
                warn!("⚠️  创建临时文件失败，跳过元数据读取: {}", e);
                return UNKNOWN_DEVICE.to_string();
            }
        };
        let path = scratch.path().to_path_buf();

        let tags = tokio::task::spawn_blocking(move || reader.read(&path))
            .await
            .map_err(|e| PipelineError::MetadataRead(format!("元数据读取任务异常: {}", e)))
            .and_then(|r| r);

        match tags {
            Ok(tags) => {
                let hint = device_hint(&tags);
                debug!("读取到 {} 个标签，设备: {}", tags.len(), hint);
                hint
            }
            Err(e) => {
                warn!("⚠️  {}，使用占位设备名", e);
                UNKNOWN_DEVICE.to_string()
            }
        }
    }

    /// 上传所有帧，返回与输入同序同长的地址列表，并回填 `remote_url`
    ///
    /// 任一帧失败则整体失败，且不会回填任何地址。
    pub async fn upload_frames<F>(&self, frames: &mut [ExtractedFrame], mut on_progress: F) -> Result<Vec<String>>
    where
        F: FnMut(f64),
    {
        if frames.is_empty() {
            on_progress(1.0);
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let total = frames.len();
        let batch_size = match self.policy.frame_strategy {
            FrameUploadStrategy::Parallel => total,
            FrameUploadStrategy::Batched { batch_size } => batch_size.max(1),
        };

        let mut urls = Vec::with_capacity(total);
        for batch in frames.chunks(batch_size) {
            let uploads = batch.iter().map(|frame| {
                let name = frame_filename(frame);
                let bytes = frame.image_bytes.clone();
                async move {
                    self.store
                        .put(bytes, &self.policy.frame_folder, ResourceKind::Image, &name)
                        .await
                }
            });

            // 等待整批全部结束后再检查失败
            let results = join_all(uploads).await;
            for (frame, result) in batch.iter().zip(results) {
                match result {
                    Ok(stored) => urls.push(stored.url),
                    Err(e) => {
                        error!("❌ 第 {} 帧上传失败: {}", frame.index, e);
                        return Err(e);
                    }
                }
            }

            let progress = urls.len() as f64 / total as f64;
            debug!("帧上传进度: {}/{} ({:.0}%)", urls.len(), total, progress * 100.0);
            on_progress(progress);
        }

        for (frame, url) in frames.iter_mut().zip(&urls) {
            frame.remote_url = Some(url.clone());
        }

        info!(
            "✅ {} 帧已上传 ({:?}), 耗时 {:.2}秒",
            total,
            self.policy.frame_strategy,
            start.elapsed().as_secs_f64()
        );
        Ok(urls)
    }
}

fn frame_filename(frame: &ExtractedFrame) -> String {
    format!("frame{}.jpg", frame.index)
}

/// 临时文件在 drop 时删除
fn write_scratch_file(bytes: &[u8], ext: &str) -> Result<tempfile::NamedTempFile> {
    let suffix = if ext.is_empty() { ".mov".to_string() } else { format!(".{}", ext) };
    let mut file = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(&suffix)
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}
