use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// 采样与上传流水线的错误分类
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 视频无法打开或读取不到元信息，整个采样失败
    #[error("视频解码失败: {0}")]
    Decode(String),

    /// 单帧 seek/渲染/编码失败，该帧被跳过
    #[error("第 {index} 帧 ({timestamp:.3}s) 截取失败: {reason}")]
    FrameCapture {
        index: usize,
        timestamp: f64,
        reason: String,
    },

    /// 远端存储拒绝或网络失败
    #[error("上传失败: {0}")]
    Upload(String),

    /// 容器元数据读取失败（非致命）
    #[error("读取视频元数据失败: {0}")]
    MetadataRead(String),

    /// 在发起任何网络请求之前被拒绝
    #[error("上传被拒绝: {0}")]
    Rejected(String),

    #[error("无效配置: {0}")]
    InvalidConfig(String),

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite 错误: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl PipelineError {
    pub(crate) fn capture(index: usize, timestamp: f64, reason: impl ToString) -> Self {
        Self::FrameCapture {
            index,
            timestamp,
            reason: reason.to_string(),
        }
    }
}
