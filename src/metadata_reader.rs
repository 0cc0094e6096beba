use ffmpeg_next as ffmpeg;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use crate::error::{PipelineError, Result};
use crate::video_processor::init_ffmpeg;

/// 读不到设备信息时的占位值
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// 依次查找的设备标签
const DEVICE_TAGS: [&str; 3] = ["CameraLensModel", "CameraModel", "Model"];

/// 容器元数据读取器
pub trait MetadataReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<HashMap<String, String>>;
}

/// 从标签中取出设备描述，取不到时返回 "Unknown Device"
pub fn device_hint(tags: &HashMap<String, String>) -> String {
    DEVICE_TAGS
        .iter()
        .filter_map(|key| tags.get(*key))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_string())
}

/// 调用 exiftool 命令行读取标签
#[derive(Debug, Clone)]
pub struct ExifToolReader {
    program: String,
}

impl Default for ExifToolReader {
    fn default() -> Self {
        Self {
            program: "exiftool".to_string(),
        }
    }
}

impl ExifToolReader {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl MetadataReader for ExifToolReader {
    fn read(&self, path: &Path) -> Result<HashMap<String, String>> {
        let output = Command::new(&self.program)
            .arg("-json")
            .arg(path)
            .output()
            .map_err(|e| PipelineError::MetadataRead(format!("执行 {} 失败: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::MetadataRead(format!(
                "{} 退出码 {:?}: {}",
                self.program,
                output.status.code(),
                stderr.trim()
            )));
        }

        parse_exiftool_json(&String::from_utf8_lossy(&output.stdout))
    }
}

/// 解析 `exiftool -json` 的输出（单文件时是只有一个对象的数组）
pub fn parse_exiftool_json(raw: &str) -> Result<HashMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| PipelineError::MetadataRead(format!("exiftool 输出不是合法 JSON: {}", e)))?;

    let object = value
        .as_array()
        .and_then(|items| items.first())
        .and_then(|item| item.as_object())
        .ok_or_else(|| PipelineError::MetadataRead("exiftool 输出为空".into()))?;

    Ok(object
        .iter()
        .map(|(k, v)| {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect())
}

/// 通过 FFmpeg 读取容器和视频流上的标签
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegTagReader;

impl MetadataReader for FfmpegTagReader {
    fn read(&self, path: &Path) -> Result<HashMap<String, String>> {
        init_ffmpeg().map_err(|e| PipelineError::MetadataRead(e.to_string()))?;
        let ictx = ffmpeg::format::input(&path)
            .map_err(|e| PipelineError::MetadataRead(format!("无法打开视频文件: {}", e)))?;

        let mut tags = HashMap::new();
        for (key, value) in ictx.metadata().iter() {
            tags.insert(normalize_tag(key), value.to_string());
        }
        if let Some(stream) = ictx.streams().best(ffmpeg::media::Type::Video) {
            for (key, value) in stream.metadata().iter() {
                tags.entry(normalize_tag(key)).or_insert_with(|| value.to_string());
            }
        }
        Ok(tags)
    }
}

/// QuickTime 键名映射为 exiftool 风格的标签名
fn normalize_tag(key: &str) -> String {
    match key {
        "com.apple.quicktime.camera.lens_model" => "CameraLensModel".to_string(),
        "com.apple.quicktime.model" => "CameraModel".to_string(),
        "com.android.model" | "model" => "Model".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_device_hint_prefers_lens_model() {
        let t = tags(&[
            ("CameraModel", "iPhone 14 Pro"),
            ("CameraLensModel", "iPhone 14 Pro back camera 6.86mm f/1.78"),
        ]);
        assert_eq!(device_hint(&t), "iPhone 14 Pro back camera 6.86mm f/1.78");
    }

    #[test]
    fn test_device_hint_falls_back() {
        assert_eq!(device_hint(&tags(&[("Model", "Pixel 8")])), "Pixel 8");
        assert_eq!(device_hint(&tags(&[("CameraLensModel", "  ")])), UNKNOWN_DEVICE);
        assert_eq!(device_hint(&HashMap::new()), UNKNOWN_DEVICE);
    }

    #[test]
    fn test_parse_exiftool_json() {
        let raw = r#"[{"SourceFile":"/tmp/a.mov","CameraModel":"iPhone 13","ImageWidth":1920}]"#;
        let t = parse_exiftool_json(raw).unwrap();
        assert_eq!(t.get("CameraModel").map(String::as_str), Some("iPhone 13"));
        assert_eq!(t.get("ImageWidth").map(String::as_str), Some("1920"));
    }

    #[test]
    fn test_parse_exiftool_json_rejects_empty() {
        assert!(matches!(parse_exiftool_json("[]"), Err(PipelineError::MetadataRead(_))));
        assert!(parse_exiftool_json("not json").is_err());
    }

    #[test]
    fn test_normalize_quicktime_keys() {
        assert_eq!(normalize_tag("com.apple.quicktime.camera.lens_model"), "CameraLensModel");
        assert_eq!(normalize_tag("com.apple.quicktime.model"), "CameraModel");
        assert_eq!(normalize_tag("encoder"), "encoder");
    }

    #[test]
    fn test_missing_exiftool_is_metadata_error() {
        let reader = ExifToolReader::with_program("definitely-not-exiftool-binary");
        let err = reader.read(Path::new("/tmp/none.mov")).unwrap_err();
        assert!(matches!(err, PipelineError::MetadataRead(_)));
    }
}
