use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as base64_engine;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use sha1::Sha1;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::store::{extension_of, guess_content_type, MediaStore, ResourceKind, StoredObject};

type HmacSha1 = Hmac<Sha1>;

/// 对象键编码时保留路径分隔符和常见安全字符
const OBJECT_KEY_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.');

/// OSS 凭证
///
/// 函数计算环境会提供以下环境变量用于认证：
/// - ALIBABA_CLOUD_ACCESS_KEY_ID
/// - ALIBABA_CLOUD_ACCESS_KEY_SECRET
/// - ALIBABA_CLOUD_SECURITY_TOKEN
#[derive(Clone)]
pub struct OssCredentials {
    pub access_key_id: String,
    pub access_key_secret: String,
    /// STS 临时凭证（可选）
    pub security_token: Option<String>,
}

impl std::fmt::Debug for OssCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OssCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("has_security_token", &self.security_token.is_some())
            .finish()
    }
}

/// 阿里云 OSS 存储，手动实现 PUT 签名
pub struct OssStore {
    client: Client,
    credentials: OssCredentials,
    bucket: String,
    endpoint: String,
    /// 对外访问地址（CDN 域名等），未设置时使用 bucket 域名
    public_base_url: Option<String>,
}

impl OssStore {
    pub fn new(
        credentials: OssCredentials,
        bucket: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() || credentials.access_key_id.is_empty() || credentials.access_key_secret.is_empty() {
            return Err(PipelineError::InvalidConfig("OSS bucket 或凭证不完整".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            credentials,
            bucket,
            endpoint: endpoint.into(),
            public_base_url: None,
        })
    }

    pub fn with_public_base_url(mut self, base: Option<String>) -> Self {
        self.public_base_url = base.filter(|b| !b.is_empty());
        self
    }

    /// 构建 OSS URL
    fn build_url(&self, object_key: &str) -> String {
        let encoded_key = utf8_percent_encode(object_key, OBJECT_KEY_SET).to_string();

        if self.endpoint.starts_with("http") {
            format!("{}/{}/{}", self.endpoint.trim_end_matches('/'), self.bucket, encoded_key)
        } else {
            format!("https://{}.{}/{}", self.bucket, self.endpoint, encoded_key)
        }
    }

    fn public_url(&self, object_key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                utf8_percent_encode(object_key, OBJECT_KEY_SET)
            ),
            None => self.build_url(object_key),
        }
    }

    /// 生成 OSS 签名
    ///
    /// 参考: https://help.aliyun.com/document_detail/31951.html
    fn sign_request(&self, method: &str, object_key: &str, headers: &HeaderMap) -> Result<String> {
        let canonicalized_resource = format!("/{}/{}", self.bucket, object_key);

        let mut oss_headers: Vec<(String, &str)> = headers
            .iter()
            .filter_map(|(name, value)| {
                let name = name.as_str().to_lowercase();
                name.starts_with("x-oss-")
                    .then(|| (name, value.to_str().unwrap_or("")))
            })
            .collect();
        oss_headers.sort_by(|a, b| a.0.cmp(&b.0));
        let canonicalized_oss_headers: String = oss_headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}\n{}{}",
            method,
            header("Content-MD5"),
            header("Content-Type"),
            header("Date"),
            canonicalized_oss_headers,
            canonicalized_resource
        );

        let mut mac = HmacSha1::new_from_slice(self.credentials.access_key_secret.as_bytes())
            .map_err(|e| PipelineError::Upload(format!("创建 HMAC 失败: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(base64_engine.encode(mac.finalize().into_bytes()))
    }

    /// 构建带签名的请求头
    fn build_signed_headers(&self, method: &str, object_key: &str, content_type: &str) -> Result<HeaderMap> {
        let header_value = |v: &str| {
            HeaderValue::from_str(v).map_err(|e| PipelineError::Upload(format!("非法请求头: {}", e)))
        };

        let mut headers = HeaderMap::new();
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        headers.insert("Date", header_value(&date)?);
        headers.insert("Content-Type", header_value(content_type)?);
        if let Some(token) = &self.credentials.security_token {
            headers.insert("x-oss-security-token", header_value(token)?);
        }

        let signature = self.sign_request(method, object_key, &headers)?;
        let authorization = format!("OSS {}:{}", self.credentials.access_key_id, signature);
        headers.insert("Authorization", header_value(&authorization)?);

        Ok(headers)
    }
}

/// 生成对象键：`{folder}/{uuid}.{ext}`
pub fn object_key(folder: &str, kind: ResourceKind, filename: &str) -> String {
    let ext = match (kind, extension_of(filename)) {
        (ResourceKind::Image, _) => "jpg".to_string(),
        (ResourceKind::Video, ext) if !ext.is_empty() => ext,
        (ResourceKind::Video, _) => "mp4".to_string(),
    };
    format!("{}/{}.{}", folder.trim_matches('/'), uuid::Uuid::new_v4(), ext)
}

#[async_trait]
impl MediaStore for OssStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        folder: &str,
        kind: ResourceKind,
        filename: &str,
    ) -> Result<StoredObject> {
        let key = object_key(folder, kind, filename);
        let content_type = guess_content_type(&key);
        let url = self.build_url(&key);
        let headers = self.build_signed_headers("PUT", &key, content_type)?;

        tracing::debug!("正在上传到 OSS: {} ({} 字节) -> bucket={}, key={}", filename, bytes.len(), self.bucket, key);

        let response = self
            .client
            .put(&url)
            .headers(headers)
            .body(bytes)
            .send()
            .await
            .map_err(|e| PipelineError::Upload(format!("请求 OSS 失败: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Upload(format!("OSS 返回 HTTP {} - {}", status, error_text)));
        }

        Ok(StoredObject {
            url: self.public_url(&key),
            public_id: key,
        })
    }

    fn name(&self) -> &'static str {
        "oss"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: &str) -> OssStore {
        OssStore::new(
            OssCredentials {
                access_key_id: "id".into(),
                access_key_secret: "secret".into(),
                security_token: Some("sts".into()),
            },
            "tires",
            endpoint,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_build_url_virtual_host() {
        let s = store("oss-cn-hangzhou.aliyuncs.com");
        assert_eq!(
            s.build_url("tire-data/frames/a b.jpg"),
            "https://tires.oss-cn-hangzhou.aliyuncs.com/tire-data/frames/a%20b.jpg"
        );
    }

    #[test]
    fn test_build_url_explicit_endpoint() {
        let s = store("http://127.0.0.1:9000/");
        assert_eq!(s.build_url("v/clip.mp4"), "http://127.0.0.1:9000/tires/v/clip.mp4");
    }

    #[test]
    fn test_public_base_url_overrides() {
        let s = store("oss-cn-hangzhou.aliyuncs.com").with_public_base_url(Some("https://cdn.example.com/".into()));
        assert_eq!(s.public_url("f/x.jpg"), "https://cdn.example.com/f/x.jpg");
    }

    #[test]
    fn test_object_key_extension() {
        let key = object_key("/tire-data/frames/", ResourceKind::Image, "frame0.png");
        assert!(key.starts_with("tire-data/frames/"));
        assert!(key.ends_with(".jpg"));
        assert!(object_key("v", ResourceKind::Video, "clip.MOV").ends_with(".mov"));
        assert!(object_key("v", ResourceKind::Video, "blob").ends_with(".mp4"));
    }

    #[test]
    fn test_signed_headers_contain_authorization() {
        let s = store("oss-cn-hangzhou.aliyuncs.com");
        let headers = s.build_signed_headers("PUT", "v/clip.mp4", "video/mp4").unwrap();
        let auth = headers.get("Authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("OSS id:"));
        assert_eq!(headers.get("x-oss-security-token").unwrap().to_str().unwrap(), "sts");
    }

    #[test]
    fn test_missing_bucket_rejected() {
        let creds = OssCredentials {
            access_key_id: "id".into(),
            access_key_secret: "secret".into(),
            security_token: None,
        };
        assert!(OssStore::new(creds, "", "oss-cn-hangzhou.aliyuncs.com", Duration::from_secs(5)).is_err());
    }
}
