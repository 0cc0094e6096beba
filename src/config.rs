use anyhow::{anyhow, bail, Context, Result};
use configparser::ini::Ini;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::cloudinary_client::{CloudinaryCredentials, CloudinaryStore};
use crate::local_store::LocalStore;
use crate::metadata_reader::{ExifToolReader, FfmpegTagReader, MetadataReader};
use crate::models::SampleConfig;
use crate::oss_client::{OssCredentials, OssStore};
use crate::store::MediaStore;
use crate::upload::{FrameUploadStrategy, UploadPipeline, UploadPolicy};

/// 媒体存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Cloudinary,
    Oss,
    Local,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cloudinary" => Ok(StoreBackend::Cloudinary),
            "oss" => Ok(StoreBackend::Oss),
            "local" => Ok(StoreBackend::Local),
            other => Err(anyhow!("未知存储后端: {}（可选 cloudinary, oss, local）", other)),
        }
    }
}

/// 设备元数据读取方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataReaderKind {
    ExifTool,
    Ffmpeg,
    Disabled,
}

impl FromStr for MetadataReaderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "exiftool" => Ok(MetadataReaderKind::ExifTool),
            "ffmpeg" => Ok(MetadataReaderKind::Ffmpeg),
            "none" | "off" | "" => Ok(MetadataReaderKind::Disabled),
            other => Err(anyhow!("未知元数据读取方式: {}（可选 exiftool, ffmpeg, none）", other)),
        }
    }
}

fn parse_strategy(value: &str, batch_size: usize) -> Result<FrameUploadStrategy> {
    match value.trim().to_lowercase().as_str() {
        "parallel" => Ok(FrameUploadStrategy::Parallel),
        "batched" => Ok(FrameUploadStrategy::Batched { batch_size }),
        other => Err(anyhow!("未知帧上传方式: {}（可选 parallel, batched）", other)),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[derive(Debug, Clone, Default)]
pub struct CloudinarySettings {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Default)]
pub struct OssSettings {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub security_token: Option<String>,
    pub bucket: String,
    pub endpoint: String,
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub upload_dir: PathBuf,
    pub url_prefix: String,
}

/// 完整应用配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub sampling: SampleConfig,
    pub backend: StoreBackend,
    pub upload: UploadPolicy,
    /// 每个网络请求的超时
    pub timeout: Duration,
    pub cloudinary: CloudinarySettings,
    pub oss: OssSettings,
    pub local: LocalSettings,
    pub metadata_reader: MetadataReaderKind,
    pub database_path: PathBuf,
    pub server_bind: Option<String>,
    pub log_level: String,
}

/// 命令行上可以覆盖的采样参数
#[derive(Debug, Clone, Default)]
pub struct SamplingOverrides {
    pub max_frames: Option<usize>,
    pub frames_per_second: Option<f64>,
    pub quality: Option<f64>,
    pub scale_factor: Option<f64>,
    pub randomize: Option<bool>,
}

impl SamplingOverrides {
    /// 在已有配置上叠加
    pub fn apply(&self, base: &SampleConfig) -> SampleConfig {
        SampleConfig {
            max_frames: self.max_frames.unwrap_or(base.max_frames),
            frames_per_second: self.frames_per_second.unwrap_or(base.frames_per_second),
            quality: self.quality.unwrap_or(base.quality),
            scale_factor: self.scale_factor.unwrap_or(base.scale_factor),
            randomize: self.randomize.unwrap_or(base.randomize),
        }
    }
}

/// 按 环境变量 > 配置文件 的顺序查找单个值
struct Sources<'a> {
    file: Option<&'a Ini>,
    env: &'a dyn Fn(&str) -> Option<String>,
}

impl Sources<'_> {
    fn get(&self, env_key: Option<&str>, section: &str, key: &str) -> Option<String> {
        env_key
            .and_then(|k| (self.env)(k))
            .or_else(|| self.file.and_then(|ini| ini.get(section, key)))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, env_key: Option<&str>, section: &str, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(env_key, section, key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| anyhow!("配置项 [{}] {} 的值无效 '{}': {}", section, key, raw, e)),
            None => Ok(None),
        }
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load(config_file: Option<&Path>, overrides: &SamplingOverrides) -> Result<AppConfig> {
        let ini = match config_file {
            Some(path) => Some(Self::load_file(path)?),
            None => Self::load_from_default_locations(),
        };
        let env_lookup = |key: &str| env::var(key).ok();
        Self::resolve(ini.as_ref(), &env_lookup, overrides)
    }

    /// 合并各配置源
    pub fn resolve(
        file: Option<&Ini>,
        env: &dyn Fn(&str) -> Option<String>,
        overrides: &SamplingOverrides,
    ) -> Result<AppConfig> {
        let src = Sources { file, env };
        let defaults = SampleConfig::default();
        let policy_defaults = UploadPolicy::default();

        let file_sampling = SampleConfig {
            max_frames: src
                .parse(Some("TIRE_DATA_MAX_FRAMES"), "sampling", "max_frames")?
                .unwrap_or(defaults.max_frames),
            frames_per_second: src
                .parse(Some("TIRE_DATA_FPS"), "sampling", "frames_per_second")?
                .unwrap_or(defaults.frames_per_second),
            quality: src
                .parse(Some("TIRE_DATA_QUALITY"), "sampling", "quality")?
                .unwrap_or(defaults.quality),
            scale_factor: src
                .parse(Some("TIRE_DATA_SCALE"), "sampling", "scale_factor")?
                .unwrap_or(defaults.scale_factor),
            randomize: src
                .get(Some("TIRE_DATA_RANDOMIZE"), "sampling", "randomize")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.randomize),
        };
        let sampling = overrides.apply(&file_sampling);
        sampling.validate().context("采样配置无效")?;

        let backend = src
            .parse(Some("TIRE_DATA_BACKEND"), "upload", "backend")?
            .unwrap_or(StoreBackend::Local);

        let batch_size: usize = src
            .parse(Some("TIRE_DATA_BATCH_SIZE"), "upload", "batch_size")?
            .unwrap_or(5);
        if batch_size == 0 {
            bail!("batch_size 必须大于 0");
        }
        let frame_strategy = match src.get(Some("TIRE_DATA_FRAME_STRATEGY"), "upload", "frame_strategy") {
            Some(v) => parse_strategy(&v, batch_size)?,
            None => policy_defaults.frame_strategy,
        };

        let max_video_bytes = src
            .parse::<usize>(None, "upload", "max_video_mb")?
            .map(|mb| {
                mb.checked_mul(1000 * 1000)
                    .ok_or_else(|| anyhow!("max_video_mb 过大: {}", mb))
            })
            .transpose()?
            .unwrap_or(policy_defaults.max_video_bytes);
        let allowed_video_formats = src
            .get(None, "upload", "allowed_formats")
            .map(|v| {
                v.split(',')
                    .map(|f| f.trim().trim_start_matches('.').to_lowercase())
                    .filter(|f| !f.is_empty())
                    .collect()
            })
            .unwrap_or(policy_defaults.allowed_video_formats);

        let upload = UploadPolicy {
            video_folder: src
                .get(None, "upload", "video_folder")
                .unwrap_or(policy_defaults.video_folder),
            frame_folder: src
                .get(None, "upload", "frame_folder")
                .unwrap_or(policy_defaults.frame_folder),
            max_video_bytes,
            allowed_video_formats,
            frame_strategy,
        };

        let timeout = Duration::from_secs(src.parse(None, "upload", "timeout_secs")?.unwrap_or(300));

        let cloudinary = CloudinarySettings {
            cloud_name: src
                .get(Some("CLOUDINARY_CLOUD_NAME"), "cloudinary", "cloud_name")
                .unwrap_or_default(),
            api_key: src
                .get(Some("CLOUDINARY_API_KEY"), "cloudinary", "api_key")
                .unwrap_or_default(),
            api_secret: src
                .get(Some("CLOUDINARY_API_SECRET"), "cloudinary", "api_secret")
                .unwrap_or_default(),
        };

        // 访问凭证只从环境变量读取
        let oss = OssSettings {
            access_key_id: (src.env)("ALIBABA_CLOUD_ACCESS_KEY_ID").unwrap_or_default(),
            access_key_secret: (src.env)("ALIBABA_CLOUD_ACCESS_KEY_SECRET").unwrap_or_default(),
            security_token: (src.env)("ALIBABA_CLOUD_SECURITY_TOKEN").filter(|t| !t.is_empty()),
            bucket: src.get(Some("OSS_BUCKET"), "oss", "bucket").unwrap_or_default(),
            endpoint: src
                .get(Some("OSS_ENDPOINT"), "oss", "endpoint")
                .unwrap_or_else(|| "oss-cn-hangzhou.aliyuncs.com".to_string()),
            public_base_url: src.get(None, "oss", "public_base_url"),
        };

        let local = LocalSettings {
            upload_dir: src
                .get(None, "local", "upload_dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("public/uploads")),
            url_prefix: src
                .get(None, "local", "url_prefix")
                .unwrap_or_else(|| "/uploads".to_string()),
        };

        let metadata_reader = src
            .parse(Some("TIRE_DATA_METADATA_READER"), "metadata", "reader")?
            .unwrap_or(MetadataReaderKind::ExifTool);

        let database_path = src
            .get(Some("TIRE_DATA_DB_PATH"), "database", "path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("tire-data.db"));

        // TIRE_DATA_PORT 只给端口，优先于配置文件里的完整地址
        let server_bind = match (src.env)("TIRE_DATA_PORT").map(|p| p.trim().to_string()) {
            Some(port) if !port.is_empty() => {
                let port: u16 = port
                    .parse()
                    .map_err(|e| anyhow!("TIRE_DATA_PORT 的值无效 '{}': {}", port, e))?;
                Some(format!("0.0.0.0:{}", port))
            }
            _ => src.get(None, "server", "bind"),
        };

        let log_level = src
            .get(Some("LOG_LEVEL"), "logging", "level")
            .unwrap_or_else(|| "info".to_string());

        Ok(AppConfig {
            sampling,
            backend,
            upload,
            timeout,
            cloudinary,
            oss,
            local,
            metadata_reader,
            database_path,
            server_bind,
            log_level,
        })
    }

    /// 从INI配置文件加载
    fn load_file(config_path: &Path) -> Result<Ini> {
        if !config_path.exists() {
            bail!("配置文件不存在: {}", config_path.display());
        }
        let mut ini = Ini::new();
        ini.load(config_path)
            .map_err(|e| anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;
        Ok(ini)
    }

    /// 从默认位置查找配置文件
    fn load_from_default_locations() -> Option<Ini> {
        let mut candidates = vec![PathBuf::from("tire-data.ini"), PathBuf::from(".tire-data.ini")];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".tire-data.ini"));
        }
        candidates.push(PathBuf::from("/etc/tire-data.ini"));

        candidates
            .into_iter()
            .find(|p| p.exists())
            .and_then(|p| Self::load_file(&p).ok())
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = SampleConfig::default();
        let mut ini = Ini::new();
        let mut set = |section: &str, key: &str, value: &str| {
            ini.set(section, key, Some(value.to_string()));
        };

        set("sampling", "max_frames", &defaults.max_frames.to_string());
        set("sampling", "frames_per_second", &defaults.frames_per_second.to_string());
        set("sampling", "quality", &defaults.quality.to_string());
        set("sampling", "scale_factor", &defaults.scale_factor.to_string());
        set("sampling", "randomize", "false");
        set("upload", "backend", "local");
        set("upload", "video_folder", "tire-data/videos");
        set("upload", "frame_folder", "tire-data/frames");
        set("upload", "max_video_mb", "100");
        set("upload", "allowed_formats", "mp4,mov,avi");
        set("upload", "frame_strategy", "parallel");
        set("upload", "batch_size", "5");
        set("upload", "timeout_secs", "300");
        set("cloudinary", "cloud_name", "");
        set("cloudinary", "api_key", "");
        set("cloudinary", "api_secret", "");
        set("oss", "bucket", "");
        set("oss", "endpoint", "oss-cn-hangzhou.aliyuncs.com");
        set("oss", "public_base_url", "");
        set("local", "upload_dir", "public/uploads");
        set("local", "url_prefix", "/uploads");
        set("metadata", "reader", "exiftool");
        set("database", "path", "tire-data.db");
        set("server", "bind", "0.0.0.0:3000");
        set("logging", "level", "info");

        ini.write(config_path)
            .map_err(|e| anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;
        Ok(())
    }
}

impl AppConfig {
    /// 按配置构造媒体存储客户端
    pub fn build_store(&self) -> Result<Arc<dyn MediaStore>> {
        let store: Arc<dyn MediaStore> = match self.backend {
            StoreBackend::Cloudinary => {
                let credentials = CloudinaryCredentials {
                    cloud_name: self.cloudinary.cloud_name.clone(),
                    api_key: self.cloudinary.api_key.clone(),
                    api_secret: self.cloudinary.api_secret.clone(),
                };
                Arc::new(CloudinaryStore::new(credentials, self.timeout).context("初始化 Cloudinary 客户端失败")?)
            }
            StoreBackend::Oss => {
                let credentials = OssCredentials {
                    access_key_id: self.oss.access_key_id.clone(),
                    access_key_secret: self.oss.access_key_secret.clone(),
                    security_token: self.oss.security_token.clone(),
                };
                let store = OssStore::new(credentials, &self.oss.bucket, &self.oss.endpoint, self.timeout)
                    .context("初始化 OSS 客户端失败")?
                    .with_public_base_url(self.oss.public_base_url.clone());
                Arc::new(store)
            }
            StoreBackend::Local => Arc::new(LocalStore::new(&self.local.upload_dir, &self.local.url_prefix)),
        };
        Ok(store)
    }

    pub fn build_metadata_reader(&self) -> Option<Arc<dyn MetadataReader>> {
        match self.metadata_reader {
            MetadataReaderKind::ExifTool => Some(Arc::new(ExifToolReader::default())),
            MetadataReaderKind::Ffmpeg => Some(Arc::new(FfmpegTagReader)),
            MetadataReaderKind::Disabled => None,
        }
    }

    /// 组装上传流水线，存储与元数据读取器都在这里注入
    pub fn build_pipeline(&self) -> Result<UploadPipeline> {
        let pipeline = UploadPipeline::new(self.build_store()?, self.upload.clone());
        Ok(match self.build_metadata_reader() {
            Some(reader) => pipeline.with_metadata_reader(reader),
            None => pipeline,
        })
    }
}
