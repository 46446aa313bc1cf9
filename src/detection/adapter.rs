//! 检测适配器 (Detection Adapter)
//! 职责: 检测器原始输出 → 统一的车辆检测记录 (类别过滤 + 几何校验)

use std::collections::BTreeMap;

use tracing::debug;

use super::types::{RawDetection, VehicleDetection};
use crate::config::GateConfig;

pub struct DetectionAdapter {
    confidence_threshold: f32,
    min_area: f32,
    vehicle_classes: BTreeMap<u32, String>,
    gate_classes: Vec<String>,
}

impl DetectionAdapter {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            min_area: config.min_detection_area,
            vehicle_classes: config.vehicle_classes.clone(),
            gate_classes: config
                .gate_classes
                .iter()
                .map(|name| name.to_lowercase())
                .collect(),
        }
    }

    /// 类别名是否属于闸口触发类别
    pub fn is_gate_class(&self, class_name: &str) -> bool {
        let name = class_name.to_lowercase();
        self.gate_classes.iter().any(|g| *g == name)
    }

    /// 过滤并归一化一帧的检测结果
    ///
    /// 丢弃: 非车辆类别、低置信度、退化框、完全在画面外的框、裁剪后面积过小的框
    pub fn normalize(
        &self,
        raw: &[RawDetection],
        frame_width: u32,
        frame_height: u32,
    ) -> Vec<VehicleDetection> {
        let mut out = Vec::with_capacity(raw.len());
        for det in raw {
            let Some(class_name) = self.vehicle_classes.get(&det.class_id) else {
                continue;
            };
            if !(det.confidence >= self.confidence_threshold) {
                continue;
            }
            let Some(bbox) = det.bbox.clamp_to(frame_width, frame_height) else {
                debug!("丢弃非法检测框: {:?}", det.bbox);
                continue;
            };
            if bbox.area() < self.min_area {
                continue;
            }
            out.push(VehicleDetection {
                class_name: class_name.clone(),
                gate_relevant: self.is_gate_class(class_name),
                confidence: det.confidence,
                bbox,
            });
        }
        out
    }
}
