pub mod error;
pub mod models;
pub mod sampler;
pub mod video_processor;
pub mod metadata_reader;
pub mod store;
pub mod cloudinary_client;
pub mod oss_client;
pub mod local_store;
pub mod upload;
pub mod measurement;
pub mod db;
pub mod processor;
pub mod handler;
pub mod config;

pub use error::{PipelineError, Result};
pub use models::{ExtractedFrame, FrameFailure, SampleConfig, SampleReport, UploadResult, VideoInfo, VideoUpload};
pub use sampler::{FrameSampler, FrameSource, MediaDecoder};
pub use video_processor::FfmpegDecoder;
pub use metadata_reader::{ExifToolReader, FfmpegTagReader, MetadataReader};
pub use store::{MediaStore, ResourceKind, StoredObject};
pub use cloudinary_client::CloudinaryStore;
pub use oss_client::OssStore;
pub use local_store::LocalStore;
pub use upload::{FrameUploadStrategy, UploadPipeline, UploadPolicy};
pub use measurement::{Measurement, NewMeasurement, TirePosition};
pub use db::MeasurementStore;
pub use processor::{extract_to_dir, process_upload, ExtractOutput, ProcessOutput};
pub use config::{AppConfig, ConfigLoader};
