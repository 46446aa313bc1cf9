/// 检测系统 (Detection System)
///
/// 逐帧检测 → 稳定轨迹
/// - Detector: 目标检测 (YOLOv8 ONNX)
/// - Adapter:  类别过滤 + 几何校验
/// - Tracker:  IOU 关联 + EMA 平滑 + 稳定门
pub mod adapter;
pub mod tracker;
pub mod types;
pub mod yolo;

use image::RgbImage;

pub use adapter::DetectionAdapter;
pub use tracker::{associate, Association, StabilityTracker, Track};
pub use types::{BBox, RawDetection, VehicleDetection};
pub use yolo::YoloV8Detector;

/// 目标检测器接口
///
/// 返回帧像素坐标下的原始检测结果, 不做类别过滤
pub trait ObjectDetector: Send {
    fn detect(&mut self, frame: &RgbImage) -> anyhow::Result<Vec<RawDetection>>;
}
