//! 车辆闸口哨兵 (Gate Sentinel)
//!
//! 逐帧车辆检测 → 稳定轨迹 → 车牌识别 → 通行决策
pub mod access; // 通行决策系统
pub mod config; // 闸口参数配置
pub mod detection; // 车辆检测与稳定跟踪
pub mod error;
pub mod input; // 视频输入系统
pub mod pipeline; // 顺序处理流水线与控制面
pub mod render; // 显示帧标注

pub use crate::access::{
    AccessCoordinator, AccessDecision, AuthorizationStore, GateAction, HttpPlateRecognizer,
    JsonPlateStore, LatestDecision, OcrReading, PlateRecognizer,
};
pub use crate::config::{GateConfig, MatchStrategy};
pub use crate::detection::{
    BBox, DetectionAdapter, ObjectDetector, RawDetection, StabilityTracker, Track,
    VehicleDetection, YoloV8Detector,
};
pub use crate::error::{GateError, Result};
pub use crate::input::{FramePoll, FrameSource, SourceSpec};
pub use crate::pipeline::{FrameOutcome, GatePipeline, GateService, GateStatus};
