use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{PipelineError, Result};

/// 帧采样配置（每次提取调用提供一次，不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleConfig {
    /// 最多提取多少帧
    pub max_frames: usize,
    /// 每秒候选时间点数
    pub frames_per_second: f64,
    /// JPEG 质量 (0, 1]
    pub quality: f64,
    /// 相对原始分辨率的缩放比例 (0, 1]
    pub scale_factor: f64,
    /// 截断前是否打乱候选时间点
    pub randomize: bool,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            max_frames: 5,
            frames_per_second: 1.0,
            quality: 0.8,
            scale_factor: 0.5,
            randomize: false,
        }
    }
}

impl SampleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_frames == 0 {
            return Err(PipelineError::InvalidConfig("max_frames 必须大于 0".into()));
        }
        if !(self.frames_per_second.is_finite() && self.frames_per_second > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "frames_per_second 必须大于 0: {}",
                self.frames_per_second
            )));
        }
        if !(self.quality > 0.0 && self.quality <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "quality 必须在 (0, 1] 内: {}",
                self.quality
            )));
        }
        if !(self.scale_factor > 0.0 && self.scale_factor <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "scale_factor 必须在 (0, 1] 内: {}",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

/// 视频基本信息
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    /// 时长（秒）
    pub duration: f64,
    pub width: u32,
    pub height: u32,
}

/// 采样得到的一帧
#[derive(Debug, Clone)]
pub struct ExtractedFrame {
    /// 在计划时间点列表中的位置
    pub index: usize,
    /// 时间点（秒）
    pub timestamp: f64,
    /// JPEG 数据
    pub image_bytes: Vec<u8>,
    /// 本地预览文件（CLI 模式写盘后设置）
    pub preview_path: Option<PathBuf>,
    /// 上传后的远端地址
    pub remote_url: Option<String>,
}

/// 被跳过的帧
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameFailure {
    pub index: usize,
    pub timestamp: f64,
    pub reason: String,
}

/// 采样结果：成功的帧按时间升序排列，失败的帧单独列出
#[derive(Debug, Clone, Default)]
pub struct SampleReport {
    pub info: Option<VideoInfo>,
    pub frames: Vec<ExtractedFrame>,
    pub failures: Vec<FrameFailure>,
}

/// 原始视频的上传结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoUpload {
    pub url: String,
    pub public_id: String,
    pub device_hint: Option<String>,
}

/// 整个流水线交给调用方的结果，frame_urls 与帧序列一一对应
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub video_url: String,
    pub frame_urls: Vec<String>,
    pub device_hint: Option<String>,
}

/// 写入 frames.json 的单帧清单
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameManifestEntry {
    pub index: usize,
    pub timestamp: f64,
    pub file: String,
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SampleConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_out_of_range_values() {
        let zero_frames = SampleConfig { max_frames: 0, ..Default::default() };
        assert!(zero_frames.validate().is_err());

        let bad_quality = SampleConfig { quality: 1.5, ..Default::default() };
        assert!(bad_quality.validate().is_err());

        let bad_scale = SampleConfig { scale_factor: 0.0, ..Default::default() };
        assert!(bad_scale.validate().is_err());

        let bad_fps = SampleConfig { frames_per_second: f64::NAN, ..Default::default() };
        assert!(bad_fps.validate().is_err());
    }
}
