/// 闸口检测系统数据结构定义
/// Data structures for the gate detection system
use serde::{Deserialize, Serialize};

// ========== 数据结构 ==========

/// 检测框 (Axis-aligned bounding box, 像素坐标)
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// 获取中心点
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// 坐标有限且 x2>x1, y2>y1
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x2 > self.x1
            && self.y2 > self.y1
    }

    /// 裁剪到画面范围内; 完全在画面外或退化时返回 None
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BBox> {
        if !self.is_valid() {
            return None;
        }
        let clamped = BBox {
            x1: self.x1.max(0.0),
            y1: self.y1.max(0.0),
            x2: self.x2.min(width as f32),
            y2: self.y2.min(height as f32),
        };
        clamped.is_valid().then_some(clamped)
    }

    /// 计算两个边界框的IOU (Intersection over Union)
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union <= 0.0 {
            return 0.0;
        }

        intersection / union
    }

    /// 指数滑动平均: new = α·observed + (1-α)·self
    pub fn blend(&self, observed: &BBox, alpha: f32) -> BBox {
        let ema = |prev: f32, obs: f32| alpha * obs + (1.0 - alpha) * prev;
        BBox {
            x1: ema(self.x1, observed.x1),
            y1: ema(self.y1, observed.y1),
            x2: ema(self.x2, observed.x2),
            y2: ema(self.y2, observed.y2),
        }
    }
}

/// 检测器原始输出 (无跨帧身份)
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BBox,
}

/// 经过适配器归一化后的车辆检测
#[derive(Clone, Debug, PartialEq)]
pub struct VehicleDetection {
    pub class_name: String,
    pub gate_relevant: bool,
    pub confidence: f32,
    pub bbox: BBox,
}
