use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// 远端资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Video,
    Image,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Video => "video",
            ResourceKind::Image => "image",
        }
    }
}

/// 上传后的对象
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub url: String,
    pub public_id: String,
}

/// 可按 URL 访问的远端媒体存储
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// 把 `bytes` 存到 `folder` 下，返回永久地址
    async fn put(
        &self,
        bytes: Vec<u8>,
        folder: &str,
        kind: ResourceKind,
        filename: &str,
    ) -> Result<StoredObject>;

    /// 后端名称，用于日志
    fn name(&self) -> &'static str;
}

/// 文件扩展名（小写），没有扩展名时返回空串
pub fn extension_of(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default()
}

/// 只保留字母、数字和点，其余替换为下划线
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

/// 根据文件扩展名猜测 Content-Type
pub fn guess_content_type(filename: &str) -> &'static str {
    match extension_of(filename).as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
