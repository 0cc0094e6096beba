use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::fmt;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::store::{guess_content_type, MediaStore, ResourceKind, StoredObject};

const DEFAULT_API_BASE: &str = "https://api.cloudinary.com/v1_1";

/// Cloudinary 凭证
#[derive(Clone)]
pub struct CloudinaryCredentials {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for CloudinaryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudinaryCredentials")
            .field("cloud_name", &self.cloud_name)
            .field("api_key", &self.api_key)
            .field("has_secret", &!self.api_secret.is_empty())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorMessage,
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    message: String,
}

/// Cloudinary 签名上传
///
/// 签名算法：参数按键名排序后拼成 `k=v&k=v`，末尾追加 api_secret，取 SHA-1 十六进制。
pub struct CloudinaryStore {
    client: Client,
    credentials: CloudinaryCredentials,
    api_base: String,
}

impl CloudinaryStore {
    pub fn new(credentials: CloudinaryCredentials, timeout: Duration) -> Result<Self> {
        if credentials.cloud_name.is_empty() || credentials.api_key.is_empty() || credentials.api_secret.is_empty() {
            return Err(PipelineError::InvalidConfig("Cloudinary 凭证不完整".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("创建 HTTP 客户端失败: {}", e)))?;

        tracing::debug!("Cloudinary 配置: {:?}", credentials);

        Ok(Self {
            client,
            credentials,
            api_base: DEFAULT_API_BASE.to_string(),
        })
    }

    /// 替换 API 根地址（私有部署或测试）
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn upload_url(&self, kind: ResourceKind) -> String {
        format!(
            "{}/{}/{}/upload",
            self.api_base.trim_end_matches('/'),
            self.credentials.cloud_name,
            kind.as_str()
        )
    }

    fn sign(&self, params: &[(&str, String)]) -> String {
        sign_params(params, &self.credentials.api_secret)
    }
}

/// 排序后的待签名串（不含 secret）
pub fn signature_payload(params: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn sign_params(params: &[(&str, String)], api_secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(signature_payload(params).as_bytes());
    hasher.update(api_secret.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[async_trait]
impl MediaStore for CloudinaryStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        folder: &str,
        kind: ResourceKind,
        filename: &str,
    ) -> Result<StoredObject> {
        let mut params: Vec<(&'static str, String)> = vec![
            ("folder", folder.to_string()),
            ("timestamp", Utc::now().timestamp().to_string()),
        ];
        // 图片统一转为 JPEG
        if kind == ResourceKind::Image {
            params.push(("format", "jpg".to_string()));
        }
        let signature = self.sign(&params);

        let size = bytes.len();
        let file_part = Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(guess_content_type(filename))
            .map_err(|e| PipelineError::Upload(format!("构建上传表单失败: {}", e)))?;

        let mut form = Form::new()
            .part("file", file_part)
            .text("api_key", self.credentials.api_key.clone())
            .text("signature", signature);
        for (key, value) in params {
            form = form.text(key, value);
        }

        let url = self.upload_url(kind);
        tracing::debug!("上传到 Cloudinary: {} ({} 字节) -> {}", filename, size, url);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::Upload(format!("请求 Cloudinary 失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(PipelineError::Upload(format!("Cloudinary 返回 HTTP {}: {}", status, message)));
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Upload(format!("解析 Cloudinary 响应失败: {}", e)))?;

        Ok(StoredObject {
            url: uploaded.secure_url,
            public_id: uploaded.public_id,
        })
    }

    fn name(&self) -> &'static str {
        "cloudinary"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> CloudinaryCredentials {
        CloudinaryCredentials {
            cloud_name: "demo".into(),
            api_key: "1234".into(),
            api_secret: "secret".into(),
        }
    }

    #[test]
    fn test_signature_payload_is_sorted() {
        let params = vec![
            ("timestamp", "1700000000".to_string()),
            ("folder", "tire-data/frames".to_string()),
            ("format", "jpg".to_string()),
        ];
        assert_eq!(
            signature_payload(&params),
            "folder=tire-data/frames&format=jpg&timestamp=1700000000"
        );
    }

    #[test]
    fn test_signature_is_hex_sha1() {
        let params = vec![("timestamp", "1".to_string())];
        let sig = sign_params(&params, "secret");
        assert_eq!(sig.len(), 40);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(sig, sign_params(&params, "other"));
    }

    #[test]
    fn test_upload_url_per_kind() {
        let store = CloudinaryStore::new(credentials(), Duration::from_secs(5))
            .unwrap()
            .with_api_base("http://localhost:9999/v1_1/");
        assert_eq!(store.upload_url(ResourceKind::Video), "http://localhost:9999/v1_1/demo/video/upload");
        assert_eq!(store.upload_url(ResourceKind::Image), "http://localhost:9999/v1_1/demo/image/upload");
    }

    #[test]
    fn test_incomplete_credentials_rejected() {
        let mut creds = credentials();
        creds.api_secret.clear();
        assert!(CloudinaryStore::new(creds, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let text = format!("{:?}", credentials());
        assert!(!text.contains("secret\""));
        assert!(text.contains("has_secret: true"));
    }
}
