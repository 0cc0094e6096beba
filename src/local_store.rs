use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::{PipelineError, Result};
use crate::store::{sanitize_filename, MediaStore, ResourceKind, StoredObject};

/// 本地目录存储，文件通过 `/uploads` 静态路由对外提供
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into(),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }
}

#[async_trait]
impl MediaStore for LocalStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        folder: &str,
        kind: ResourceKind,
        filename: &str,
    ) -> Result<StoredObject> {
        let folder = folder.trim_matches('/');
        let prefix = match kind {
            ResourceKind::Video => "video",
            ResourceKind::Image => "frame",
        };
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}_{}_{}_{}",
            prefix,
            chrono::Utc::now().timestamp_millis(),
            &unique[..8],
            sanitize_filename(filename)
        );
        let dir = self.root.join(folder);
        let path = dir.join(&name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PipelineError::Upload(format!("创建本地目录失败: {}: {}", dir.display(), e)))?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| PipelineError::Upload(format!("写入本地存储失败: {}: {}", path.display(), e)))?;

        let public_id = format!("{}/{}", folder, name);
        Ok(StoredObject {
            url: format!("{}/{}", self.url_prefix.trim_end_matches('/'), public_id),
            public_id,
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
