use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};
use crate::measurement::FrameRef;
use crate::models::{ExtractedFrame, FrameFailure, FrameManifestEntry, SampleConfig, SampleReport, UploadResult, VideoUpload};
use crate::sampler::{FrameSampler, MediaDecoder};
use crate::store::extension_of;
use crate::upload::UploadPipeline;

/// 完整流水线的结果
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub video: VideoUpload,
    /// 已上传的帧，`remote_url` 均已设置
    pub frames: Vec<ExtractedFrame>,
    pub failures: Vec<FrameFailure>,
    pub upload: UploadResult,
}

impl ProcessOutput {
    /// 供测量记录引用的帧地址
    pub fn frame_refs(&self) -> Vec<FrameRef> {
        self.upload
            .frame_urls
            .iter()
            .map(|url| FrameRef { url: url.clone() })
            .collect()
    }
}

/// 本地提取的结果
#[derive(Debug, Clone)]
pub struct ExtractOutput {
    pub frames: Vec<ExtractedFrame>,
    pub failures: Vec<FrameFailure>,
    pub manifest_path: PathBuf,
}

/// 上传视频、采样、上传帧
///
/// 视频字节先写入临时文件供解码器读取，流程结束时删除。
pub async fn process_upload(
    pipeline: &UploadPipeline,
    decoder: Arc<dyn MediaDecoder>,
    bytes: Vec<u8>,
    filename: &str,
    config: SampleConfig,
) -> Result<ProcessOutput> {
    let total_start = Instant::now();
    info!("🎬 [处理] 开始处理视频: {} ({} 字节)", filename, bytes.len());
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // 网络请求之前完成全部校验
    let sampler = FrameSampler::new(config)?;
    pipeline.validate_video(bytes.len(), filename)?;

    let scratch = write_scratch(&bytes, filename)?;

    // 1. 上传原始视频
    let upload_start = Instant::now();
    let video = pipeline.upload_video(bytes, filename).await?;
    let upload_duration = upload_start.elapsed();
    info!("✅ [处理] 视频上传完成，耗时: {:.2}秒", upload_duration.as_secs_f64());

    // 2. 在阻塞线程中采样
    let sample_start = Instant::now();
    let report = tokio::task::spawn_blocking(move || {
        let result = sampler.sample_file(decoder.as_ref(), scratch.path());
        drop(scratch);
        result
    })
    .await
    .map_err(|e| PipelineError::Decode(format!("采样任务异常: {}", e)))??;
    let sample_duration = sample_start.elapsed();
    info!(
        "✅ [处理] 采样完成，耗时: {:.2}秒，成功 {} 帧，跳过 {} 帧",
        sample_duration.as_secs_f64(),
        report.frames.len(),
        report.failures.len()
    );

    let SampleReport { mut frames, failures, .. } = report;

    // 3. 上传帧
    let frames_start = Instant::now();
    let frame_urls = pipeline
        .upload_frames(&mut frames, |p| info!("⏳ [处理] 帧上传进度: {:.0}%", p * 100.0))
        .await
        .map_err(|e| {
            error!("❌ [处理] 帧上传失败: {}", e);
            e
        })?;
    let frames_duration = frames_start.elapsed();

    let total_duration = total_start.elapsed();
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("🎉 [处理] 完成！总耗时: {:.2}秒", total_duration.as_secs_f64());
    info!("📊 [处理] 性能统计:");
    info!("   • 视频上传: {:.2}秒", upload_duration.as_secs_f64());
    info!("   • 帧采样: {:.2}秒", sample_duration.as_secs_f64());
    info!("   • 帧上传: {:.2}秒", frames_duration.as_secs_f64());
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let upload = UploadResult {
        video_url: video.url.clone(),
        frame_urls,
        device_hint: video.device_hint.clone(),
    };

    Ok(ProcessOutput {
        video,
        frames,
        failures,
        upload,
    })
}

fn write_scratch(bytes: &[u8], filename: &str) -> Result<tempfile::NamedTempFile> {
    let ext = extension_of(filename);
    let mut file = tempfile::Builder::new()
        .prefix("sample-")
        .suffix(&format!(".{}", if ext.is_empty() { "mp4" } else { ext.as_str() }))
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

/// 本地采样：帧写为 `frame_0000.jpg` 等文件，并生成 `frames.json` 清单
pub fn extract_to_dir(
    decoder: &dyn MediaDecoder,
    input: &Path,
    output_dir: &Path,
    config: SampleConfig,
) -> Result<ExtractOutput> {
    let start = Instant::now();
    info!("🎬 [提取] 开始处理视频: {}", input.display());

    let sampler = FrameSampler::new(config)?;
    std::fs::create_dir_all(output_dir)?;

    let SampleReport { mut frames, failures, .. } = sampler.sample_file(decoder, input)?;

    let mut manifest = Vec::with_capacity(frames.len());
    for frame in &mut frames {
        let file = format!("frame_{:04}.jpg", frame.index);
        let path = output_dir.join(&file);
        std::fs::write(&path, &frame.image_bytes)?;
        frame.preview_path = Some(path);
        manifest.push(FrameManifestEntry {
            index: frame.index,
            timestamp: frame.timestamp,
            file,
            url: frame.remote_url.clone(),
        });
    }

    let manifest_path = output_dir.join("frames.json");
    let json = serde_json::to_string_pretty(&manifest).map_err(std::io::Error::from)?;
    std::fs::write(&manifest_path, json)?;

    for failure in &failures {
        warn!("⚠️  [提取] 跳过第 {} 帧 ({:.2}s): {}", failure.index, failure.timestamp, failure.reason);
    }
    info!(
        "✅ [提取] 写出 {} 帧，耗时: {:.2}秒，输出目录: {}",
        frames.len(),
        start.elapsed().as_secs_f64(),
        output_dir.display()
    );

    Ok(ExtractOutput {
        frames,
        failures,
        manifest_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MeasurementStore;
    use crate::measurement::{NewMeasurement, TirePosition};
    use crate::sampler::tests::FakeDecoder;
    use crate::store::tests::FakeStore;
    use crate::sampler::FrameSource;
    use crate::upload::{FrameUploadStrategy, UploadPolicy};
    use std::sync::Mutex;

    /// 打开即失败，并记住收到的临时文件路径
    #[derive(Default)]
    struct UndecodableDecoder {
        opened: Mutex<Option<PathBuf>>,
    }

    impl MediaDecoder for UndecodableDecoder {
        fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
            assert!(path.exists());
            *self.opened.lock().unwrap() = Some(path.to_path_buf());
            Err(PipelineError::Decode("moov atom not found".into()))
        }
    }

    fn pipeline(store: Arc<FakeStore>) -> UploadPipeline {
        UploadPipeline::new(
            store,
            UploadPolicy {
                frame_strategy: FrameUploadStrategy::Batched { batch_size: 2 },
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_ten_second_video_end_to_end() {
        let store = Arc::new(FakeStore::default());
        let p = pipeline(store.clone());

        let output = process_upload(
            &p,
            Arc::new(FakeDecoder { duration: 10.0 }),
            b"fake-mp4".to_vec(),
            "tire.mp4",
            SampleConfig::default(),
        )
        .await
        .unwrap();

        let timestamps: Vec<f64> = output.frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(timestamps, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert!(output.frames.iter().all(|f| f.remote_url.is_some()));
        assert_eq!(output.upload.frame_urls.len(), 5);
        assert_eq!(output.upload.video_url, "https://media.test/tire-data/videos/tire.mp4");
        // 1 个视频 + 5 帧
        assert_eq!(store.call_count(), 6);

        let db = MeasurementStore::open_in_memory().unwrap();
        let record = NewMeasurement {
            position: Some(TirePosition::FL),
            frames: output.frame_refs(),
            original_video_url: Some(output.upload.video_url.clone()),
            ..Default::default()
        }
        .resolve(chrono::Utc::now())
        .unwrap();
        let id = db.insert(&record).unwrap();
        assert_eq!(db.get(id).unwrap().unwrap().frame_urls, output.upload.frame_urls);
    }

    #[tokio::test]
    async fn test_short_video_caps_frame_count() {
        let store = Arc::new(FakeStore::default());
        let config = SampleConfig {
            max_frames: 100,
            ..Default::default()
        };
        let output = process_upload(&pipeline(store), Arc::new(FakeDecoder { duration: 3.0 }), b"v".to_vec(), "a.mov", config)
            .await
            .unwrap();
        assert_eq!(output.frames.len(), 3);
        assert_eq!(output.upload.frame_urls.len(), 3);
    }

    #[tokio::test]
    async fn test_rejected_before_any_upload() {
        let store = Arc::new(FakeStore::default());
        let err = process_upload(
            &pipeline(store.clone()),
            Arc::new(FakeDecoder { duration: 3.0 }),
            b"v".to_vec(),
            "a.webm",
            SampleConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Rejected(_)));

        let bad_config = SampleConfig {
            quality: 0.0,
            ..Default::default()
        };
        let err = process_upload(&pipeline(store.clone()), Arc::new(FakeDecoder { duration: 3.0 }), b"v".to_vec(), "a.mp4", bad_config)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_decode_failure_after_video_upload() {
        let store = Arc::new(FakeStore::default());
        let decoder = Arc::new(UndecodableDecoder::default());

        let err = process_upload(&pipeline(store.clone()), decoder.clone(), b"v".to_vec(), "a.mp4", SampleConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Decode(_)), "{:?}", err);
        // 只有视频上传，没有任何帧上传
        assert_eq!(store.call_count(), 1);
        let scratch = decoder.opened.lock().unwrap().clone().unwrap();
        assert!(!scratch.exists(), "临时文件未删除: {}", scratch.display());
    }

    #[test]
    fn test_extract_to_dir_writes_frames_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames");

        let result = extract_to_dir(
            &FakeDecoder { duration: 10.0 },
            Path::new("input.mp4"),
            &out,
            SampleConfig::default(),
        )
        .unwrap();

        assert_eq!(result.frames.len(), 5);
        assert!(out.join("frame_0000.jpg").exists());
        assert!(out.join("frame_0004.jpg").exists());
        assert_eq!(result.frames[2].preview_path.as_deref(), Some(out.join("frame_0002.jpg").as_path()));

        let raw = std::fs::read_to_string(&result.manifest_path).unwrap();
        let manifest: Vec<FrameManifestEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(manifest.len(), 5);
        assert_eq!(manifest[1].file, "frame_0001.jpg");
        assert_eq!(manifest[1].timestamp, 1.0);
        assert!(manifest[1].url.is_none());
    }
}
