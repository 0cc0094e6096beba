use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use rand::seq::index;
use rand::Rng;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{ExtractedFrame, FrameFailure, SampleConfig, SampleReport, VideoInfo};

/// 已打开的可解码视频
pub trait FrameSource {
    fn info(&self) -> VideoInfo;

    /// seek 到 `timestamp` 并把当前帧渲染为 `width`x`height` 的 RGB 图像
    fn capture(&mut self, timestamp: f64, width: u32, height: u32) -> Result<RgbImage>;
}

/// 打开视频文件得到 [`FrameSource`]
pub trait MediaDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
}

/// 计算候选时间点总数：floor(duration * fps)
pub fn total_possible_frames(duration: f64, frames_per_second: f64) -> usize {
    let total = (duration * frames_per_second).floor();
    if total.is_finite() && total > 0.0 {
        total as usize
    } else {
        0
    }
}

/// 规划采样时间点
///
/// 候选点为 `i / fps`，`i < floor(duration * fps)`；只生成最终需要的
/// `min(total, max_frames)` 个下标。开启 randomize 时从全部候选中均匀
/// 抽取不重复的下标，结果总按升序排列，保证 seek 方向单调。
pub fn plan_timestamps<R: Rng + ?Sized>(duration: f64, config: &SampleConfig, rng: &mut R) -> Vec<f64> {
    let total = total_possible_frames(duration, config.frames_per_second);
    let count = total.min(config.max_frames);

    let mut timestamps: Vec<f64> = if config.randomize {
        index::sample(rng, total, count)
            .into_iter()
            .map(|i| i as f64 / config.frames_per_second)
            .collect()
    } else {
        (0..count).map(|i| i as f64 / config.frames_per_second).collect()
    };
    timestamps.sort_by(|a, b| a.total_cmp(b));
    timestamps
}

/// 按质量 (0, 1] 编码 JPEG
pub fn encode_jpeg(image: &RgbImage, quality: f64) -> Result<Vec<u8>> {
    let quality = (quality * 100.0).round().clamp(1.0, 100.0) as u8;
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgb8)
        .map_err(|e| PipelineError::Decode(format!("JPEG 编码失败: {}", e)))?;
    Ok(buf)
}

/// 缩放后的输出尺寸，至少 1 像素
pub fn scaled_size(info: &VideoInfo, scale_factor: f64) -> (u32, u32) {
    let w = (info.width as f64 * scale_factor).floor().max(1.0) as u32;
    let h = (info.height as f64 * scale_factor).floor().max(1.0) as u32;
    (w, h)
}

/// 帧采样器：把一个视频转换为有限、有序的静帧序列
#[derive(Debug, Clone)]
pub struct FrameSampler {
    config: SampleConfig,
}

impl FrameSampler {
    pub fn new(config: SampleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SampleConfig {
        &self.config
    }

    /// 打开文件并采样，解码器句柄在返回前释放
    pub fn sample_file(&self, decoder: &dyn MediaDecoder, path: &Path) -> Result<SampleReport> {
        let mut source = decoder.open(path)?;
        let mut rng = rand::rng();
        self.sample(source.as_mut(), &mut rng)
    }

    /// 对已打开的视频逐个时间点串行截帧
    ///
    /// 单帧失败不会中断整体，失败记录在 `failures` 中。
    pub fn sample<R: Rng + ?Sized>(&self, source: &mut dyn FrameSource, rng: &mut R) -> Result<SampleReport> {
        let info = source.info();
        if !(info.duration.is_finite() && info.duration >= 0.0) {
            return Err(PipelineError::Decode(format!("视频时长无效: {}", info.duration)));
        }

        let timestamps = plan_timestamps(info.duration, &self.config, rng);
        let (width, height) = scaled_size(&info, self.config.scale_factor);

        info!(
            "📊 采样参数: 时长 {:.2}s, 原始 {}x{}, 输出 {}x{}, 计划 {} 帧",
            info.duration,
            info.width,
            info.height,
            width,
            height,
            timestamps.len()
        );

        let start = Instant::now();
        let mut frames = Vec::with_capacity(timestamps.len());
        let mut failures = Vec::new();

        for (index, &timestamp) in timestamps.iter().enumerate() {
            let captured = source
                .capture(timestamp, width, height)
                .and_then(|img| encode_jpeg(&img, self.config.quality));

            match captured {
                Ok(image_bytes) => {
                    debug!("第 {} 帧 ({:.2}s): {} 字节", index, timestamp, image_bytes.len());
                    frames.push(ExtractedFrame {
                        index,
                        timestamp,
                        image_bytes,
                        preview_path: None,
                        remote_url: None,
                    });
                }
                Err(e) => {
                    let err = PipelineError::capture(index, timestamp, e);
                    warn!("⚠️  {}，跳过该帧", err);
                    failures.push(FrameFailure {
                        index,
                        timestamp,
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            "✅ 帧提取完成: 成功 {} 帧, 跳过 {} 帧, 耗时 {:.2}秒",
            frames.len(),
            failures.len(),
            start.elapsed().as_secs_f64()
        );

        Ok(SampleReport {
            info: Some(info),
            frames,
            failures,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::{Arc, Mutex};

    /// 纯内存的视频：按时间点生成纯色图像，可指定失败的时间点
    pub(crate) struct FakeSource {
        pub info: VideoInfo,
        pub fail_at: Vec<f64>,
        pub seeks: Arc<Mutex<Vec<(f64, u32, u32)>>>,
    }

    impl FakeSource {
        pub(crate) fn new(duration: f64) -> Self {
            Self {
                info: VideoInfo { duration, width: 64, height: 48 },
                fail_at: Vec::new(),
                seeks: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl FrameSource for FakeSource {
        fn info(&self) -> VideoInfo {
            self.info
        }

        fn capture(&mut self, timestamp: f64, width: u32, height: u32) -> Result<RgbImage> {
            self.seeks.lock().unwrap().push((timestamp, width, height));
            if self.fail_at.iter().any(|t| (t - timestamp).abs() < 1e-9) {
                return Err(PipelineError::Decode("模拟 seek 失败".into()));
            }
            let shade = (timestamp * 10.0) as u8;
            Ok(RgbImage::from_pixel(width, height, image::Rgb([shade, 0, 0])))
        }
    }

    /// 返回固定时长 FakeSource 的解码器
    pub(crate) struct FakeDecoder {
        pub duration: f64,
    }

    impl MediaDecoder for FakeDecoder {
        fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(FakeSource::new(self.duration)))
        }
    }

    struct BrokenDecoder;

    impl MediaDecoder for BrokenDecoder {
        fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>> {
            Err(PipelineError::Decode("无法打开".into()))
        }
    }

    fn config(max_frames: usize, fps: f64, randomize: bool) -> SampleConfig {
        SampleConfig {
            max_frames,
            frames_per_second: fps,
            randomize,
            ..Default::default()
        }
    }

    #[test]
    fn test_total_possible_frames() {
        assert_eq!(total_possible_frames(10.0, 1.0), 10);
        assert_eq!(total_possible_frames(3.5, 2.0), 7);
        assert_eq!(total_possible_frames(0.4, 1.0), 0);
        assert_eq!(total_possible_frames(f64::NAN, 1.0), 0);
    }

    #[test]
    fn test_plan_first_frames_in_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let ts = plan_timestamps(10.0, &config(5, 1.0, false), &mut rng);
        assert_eq!(ts, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_plan_bounded_by_duration() {
        let mut rng = StdRng::seed_from_u64(1);
        let ts = plan_timestamps(3.0, &config(100, 1.0, false), &mut rng);
        assert_eq!(ts, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_plan_randomized_subset_is_sorted() {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ts = plan_timestamps(10.0, &config(5, 1.0, true), &mut rng);
            assert_eq!(ts.len(), 5);
            assert!(ts.windows(2).all(|w| w[0] < w[1]), "未排序: {:?}", ts);
            assert!(ts.iter().all(|t| t.fract() == 0.0 && *t >= 0.0 && *t <= 9.0));
        }
    }

    #[test]
    fn test_plan_fractional_rate() {
        let mut rng = StdRng::seed_from_u64(1);
        let ts = plan_timestamps(2.0, &config(10, 2.0, false), &mut rng);
        assert_eq!(ts, vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_plan_huge_rate_only_builds_needed_frames() {
        let mut rng = StdRng::seed_from_u64(7);
        for fps in [1e9, 1e300] {
            let ts = plan_timestamps(10.0, &config(5, fps, false), &mut rng);
            assert_eq!(ts.len(), 5);
            assert_eq!(ts[0], 0.0);
            assert!(ts.windows(2).all(|w| w[0] < w[1]), "未排序: {:?}", ts);

            let ts = plan_timestamps(10.0, &config(5, fps, true), &mut rng);
            assert_eq!(ts.len(), 5);
            assert!(ts.windows(2).all(|w| w[0] <= w[1]), "未排序: {:?}", ts);
            assert!(ts.iter().all(|t| *t >= 0.0 && *t < 10.0));
        }
    }

    #[test]
    fn test_encode_jpeg_produces_jpeg() {
        let img = RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        let bytes = encode_jpeg(&img, 0.8).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_sample_scales_and_orders_frames() {
        let sampler = FrameSampler::new(config(5, 1.0, false)).unwrap();
        let mut source = FakeSource::new(10.0);
        let seeks = source.seeks.clone();
        let mut rng = StdRng::seed_from_u64(3);

        let report = sampler.sample(&mut source, &mut rng).unwrap();

        assert_eq!(report.frames.len(), 5);
        assert!(report.failures.is_empty());
        let times: Vec<f64> = report.frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert!(seeks.lock().unwrap().iter().all(|&(_, w, h)| w == 32 && h == 24));
        assert!(report.frames.iter().all(|f| f.remote_url.is_none()));
    }

    #[test]
    fn test_sample_skips_failed_frame_and_reports_it() {
        let sampler = FrameSampler::new(config(5, 1.0, false)).unwrap();
        let mut source = FakeSource::new(10.0);
        source.fail_at = vec![2.0];
        let mut rng = StdRng::seed_from_u64(3);

        let report = sampler.sample(&mut source, &mut rng).unwrap();

        let indices: Vec<usize> = report.frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 3, 4]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 2);
        assert_eq!(report.failures[0].timestamp, 2.0);
    }

    #[test]
    fn test_sample_randomized_stays_monotonic() {
        let sampler = FrameSampler::new(config(5, 1.0, true)).unwrap();
        let mut source = FakeSource::new(10.0);
        let seeks = source.seeks.clone();
        let mut rng = StdRng::seed_from_u64(42);

        let report = sampler.sample(&mut source, &mut rng).unwrap();

        assert_eq!(report.frames.len(), 5);
        let seek_times: Vec<f64> = seeks.lock().unwrap().iter().map(|s| s.0).collect();
        assert!(seek_times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_sample_file_propagates_decode_error() {
        let sampler = FrameSampler::new(SampleConfig::default()).unwrap();
        let err = sampler
            .sample_file(&BrokenDecoder, Path::new("missing.mp4"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn test_sample_file_with_fake_decoder() {
        let sampler = FrameSampler::new(config(100, 1.0, false)).unwrap();
        let report = sampler
            .sample_file(&FakeDecoder { duration: 3.0 }, Path::new("clip.mp4"))
            .unwrap();
        assert_eq!(report.frames.len(), 3);
    }
}
