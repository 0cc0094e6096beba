use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::models::VideoInfo;
use crate::sampler::{FrameSource, MediaDecoder};

/// 每次 seek 之后最多读取的数据包数量，避免在损坏的文件上无限读取
const MAX_PACKETS_PER_SEEK: usize = 600;

/// 初始化 FFmpeg，并把日志级别压到 ERROR
pub(crate) fn init_ffmpeg() -> Result<()> {
    ffmpeg::init().map_err(|e| PipelineError::Decode(format!("初始化 FFmpeg 失败: {}", e)))?;
    unsafe {
        ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
    }
    Ok(())
}

/// 基于 FFmpeg 的解码器工厂
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegDecoder;

impl MediaDecoder for FfmpegDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegSource::open(path)?))
    }
}

/// 打开的视频句柄，负责 seek 并把当前帧缩放成 RGB 图像
///
/// 同一个句柄只能串行 seek；句柄在 drop 时释放。
pub struct FfmpegSource {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    info: VideoInfo,
    scaler: Option<(u32, u32, ffmpeg::software::scaling::Context)>,
}

impl FfmpegSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        init_ffmpeg()?;
        let path = path.as_ref();

        let input = ffmpeg::format::input(&path)
            .map_err(|e| PipelineError::Decode(format!("无法打开视频文件 {}: {}", path.display(), e)))?;

        let (stream_index, time_base, stream_duration, parameters) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| PipelineError::Decode("未找到视频流".into()))?;
            (stream.index(), stream.time_base(), stream.duration(), stream.parameters())
        };

        let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| PipelineError::Decode(format!("无法创建解码器上下文: {}", e)))?
            .decoder()
            .video()
            .map_err(|e| PipelineError::Decode(format!("无法创建视频解码器: {}", e)))?;

        // 容器时长优先，拿不到时退回视频流时长
        let mut duration = input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
        if !(duration.is_finite() && duration > 0.0) && time_base.denominator() > 0 {
            duration = stream_duration as f64 * time_base.numerator() as f64
                / time_base.denominator() as f64;
        }
        if !(duration.is_finite() && duration > 0.0) {
            return Err(PipelineError::Decode(format!("无法获取视频时长: {}", path.display())));
        }

        let info = VideoInfo {
            duration,
            width: decoder.width(),
            height: decoder.height(),
        };
        if info.width == 0 || info.height == 0 {
            return Err(PipelineError::Decode("视频分辨率无效".into()));
        }

        tracing::debug!(
            "打开视频: {} ({:.2}s, {}x{})",
            path.display(),
            info.duration,
            info.width,
            info.height
        );

        Ok(Self {
            input,
            decoder,
            stream_index,
            time_base,
            info,
            scaler: None,
        })
    }

    fn scale(&mut self, frame: &ffmpeg::frame::Video, width: u32, height: u32) -> Result<RgbImage> {
        let reuse = matches!(&self.scaler, Some((w, h, _)) if *w == width && *h == height);
        if !reuse {
            let ctx = ffmpeg::software::scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                ffmpeg::format::Pixel::RGB24,
                width,
                height,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| PipelineError::Decode(format!("无法创建缩放器: {}", e)))?;
            self.scaler = Some((width, height, ctx));
        }

        let mut rgb_frame = ffmpeg::frame::Video::empty();
        if let Some((_, _, scaler)) = self.scaler.as_mut() {
            scaler
                .run(frame, &mut rgb_frame)
                .map_err(|e| PipelineError::Decode(format!("缩放失败: {}", e)))?;
        }
        frame_to_image(&rgb_frame)
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn capture(&mut self, timestamp: f64, width: u32, height: u32) -> Result<RgbImage> {
        let target = (timestamp * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;

        // 向前找到最近的关键帧，再往后解码到目标时间点
        self.input
            .seek(target, ..target)
            .map_err(|e| PipelineError::Decode(format!("seek 到 {:.3}s 失败: {}", timestamp, e)))?;
        self.decoder.flush();

        let tb_num = self.time_base.numerator() as f64;
        let tb_den = self.time_base.denominator().max(1) as f64;
        let to_seconds = |ts: i64| ts as f64 * tb_num / tb_den;

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut last: Option<ffmpeg::frame::Video> = None;
        let mut reached = false;
        let mut packets_read = 0;

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            packets_read += 1;
            if packets_read > MAX_PACKETS_PER_SEEK {
                break;
            }
            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let frame_time = decoded.timestamp().map(to_seconds).unwrap_or(0.0);
                last = Some(decoded.clone());
                if frame_time + 1e-3 >= timestamp {
                    reached = true;
                    break;
                }
            }
            if reached {
                break;
            }
        }

        // 文件末尾：把解码器里剩余的帧取出来
        if !reached && self.decoder.send_eof().is_ok() {
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let frame_time = decoded.timestamp().map(to_seconds).unwrap_or(0.0);
                last = Some(decoded.clone());
                if frame_time + 1e-3 >= timestamp {
                    break;
                }
            }
        }

        let frame = last.ok_or_else(|| {
            PipelineError::Decode(format!("{:.3}s 附近没有可解码的帧", timestamp))
        })?;
        self.scale(&frame, width, height)
    }
}

/// 将 RGB24 帧按行拷贝为 RgbImage（跳过行尾填充）
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_len = width as usize * 3;

    let mut buf = Vec::with_capacity(row_len * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let row = data
            .get(start..start + row_len)
            .ok_or_else(|| PipelineError::Decode("RGB 帧数据长度不足".into()))?;
        buf.extend_from_slice(row);
    }

    RgbImage::from_raw(width, height, buf)
        .ok_or_else(|| PipelineError::Decode("构建 RGB 图像失败".into()))
}
