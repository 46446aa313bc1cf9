/// 视频输入系统 (Video Input System)
///
/// 统一的帧源接口, 由处理线程按顺序拉取
/// - ImageDirSource: 按文件名顺序回放图片目录
/// - FfmpegSource:   RTSP 拉流 / 本地摄像头 (feature `ffmpeg`)
pub mod image_dir;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use image::RgbImage;

use crate::error::{GateError, Result};

pub use image_dir::ImageDirSource;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegSource;

/// 一次拉帧的结果
#[derive(Debug)]
pub enum FramePoll {
    Frame(RgbImage),
    /// 超时内没有新帧, 源仍然有效
    Pending,
    /// 源已结束 (文件读完 / 流断开)
    Ended,
}

/// 帧源
pub trait FrameSource: Send {
    /// 打开采集资源; 失败直接返回给调用方, 不自动重试
    fn open(&mut self) -> Result<()>;

    /// 最多等待 `timeout` 取下一帧
    fn next_frame(&mut self, timeout: Duration) -> Result<FramePoll>;

    /// 释放采集资源 (可重复调用)
    fn close(&mut self);

    fn describe(&self) -> String;
}

/// 命令行中的帧源描述
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    /// 图片目录
    ImageDir(PathBuf),
    /// 流地址或视频文件 (rtsp://, rtmp://, http://, *.mp4 ...)
    Stream(String),
    /// 本地摄像头索引 (`camera:0`)
    Camera(usize),
}

impl FromStr for SourceSpec {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(GateError::Capture("empty source".into()));
        }
        if let Some(index) = s.strip_prefix("camera:") {
            return index
                .parse()
                .map(SourceSpec::Camera)
                .map_err(|_| GateError::Capture(format!("invalid camera index: {index}")));
        }
        if s.contains("://") {
            return Ok(SourceSpec::Stream(s.to_string()));
        }
        let path = PathBuf::from(s);
        if path.is_dir() {
            Ok(SourceSpec::ImageDir(path))
        } else {
            Ok(SourceSpec::Stream(s.to_string()))
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::ImageDir(p) => write!(f, "dir:{}", p.display()),
            SourceSpec::Stream(url) => f.write_str(url),
            SourceSpec::Camera(i) => write!(f, "camera:{i}"),
        }
    }
}

impl SourceSpec {
    /// 构造帧源 (尚未打开)
    pub fn build(&self, queue_capacity: usize, fps: Option<f32>) -> Result<Box<dyn FrameSource>> {
        match self {
            SourceSpec::ImageDir(dir) => {
                let interval = fps
                    .filter(|f| *f > 0.0)
                    .map(|f| Duration::from_secs_f32(1.0 / f));
                Ok(Box::new(ImageDirSource::new(dir.clone(), interval)))
            }
            #[cfg(feature = "ffmpeg")]
            SourceSpec::Stream(url) => Ok(Box::new(FfmpegSource::stream(url.clone(), queue_capacity))),
            #[cfg(feature = "ffmpeg")]
            SourceSpec::Camera(index) => Ok(Box::new(FfmpegSource::camera(*index, queue_capacity))),
            #[cfg(not(feature = "ffmpeg"))]
            other => {
                let _ = queue_capacity;
                Err(GateError::Capture(format!(
                    "{other}: 需要启用 `ffmpeg` feature 才能打开流或摄像头"
                )))
            }
        }
    }
}
