//! 闸口配置 - 通过JSON文件调整参数

use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{GateError, Result};

/// 默认配置文件名
pub const DEFAULT_CONFIG_PATH: &str = "gate_config.json";

/// 轨迹匹配策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// 全局贪心: 按IoU从高到低一对一消耗检测框与轨迹
    Greedy,
    /// 逐检测独立匹配: 同一帧内两个检测框可能命中同一条轨迹
    PerDetection,
}

/// 闸口参数配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    // === 检测参数 ===
    pub confidence_threshold: f32, // 检测置信度阈值
    pub nms_threshold: f32,        // NMS IOU阈值
    pub max_detections: usize,     // 每帧最大检测数
    pub min_detection_area: f32,   // 最小检测面积 (像素²)
    pub vehicle_classes: BTreeMap<u32, String>, // 车辆类别 (类别ID → 名称)
    pub gate_classes: Vec<String>, // 触发闸口的类别名称

    // === 稳定化参数 ===
    pub iou_threshold: f32,          // 轨迹匹配IOU阈值
    pub smoothing_factor: f32,       // EMA平滑系数 α
    pub stability_threshold: u32,    // 稳定所需连续匹配次数
    pub detection_timeout_secs: f32, // 轨迹超时 (秒)
    pub process_every_n_frames: u32, // 每N帧做一次关联
    pub match_strategy: MatchStrategy,

    // === 通行决策参数 ===
    pub cooldown_secs: f32,         // 两次决策的最小间隔 (秒)
    pub min_crop_size: u32,         // 车牌识别ROI最小边长 (像素)
    pub min_plate_length: usize,    // 车牌文本最小长度
    pub enforce_plate_format: bool, // 是否强制土耳其车牌格式

    // === 外部协作方 ===
    pub model_path: String,       // YOLOv8 ONNX 模型
    pub model_input_size: u32,    // 模型输入尺寸
    pub ocr_endpoint: String,     // OCR 服务地址
    pub ocr_timeout_secs: f32,    // OCR 请求超时
    pub store_path: Option<String>, // 授权库文件 (None = 仅内存)

    // === 采集参数 ===
    pub frame_queue_capacity: usize, // 显示帧队列容量
}

impl Default for GateConfig {
    fn default() -> Self {
        let vehicle_classes = [(2, "car"), (3, "motorcycle"), (5, "bus"), (7, "truck")]
            .into_iter()
            .map(|(id, name)| (id, name.to_string()))
            .collect();

        Self {
            // 检测参数
            confidence_threshold: 0.6,
            nms_threshold: 0.4,
            max_detections: 10,
            min_detection_area: 2000.0,
            vehicle_classes,
            gate_classes: vec!["truck".into(), "lorry".into(), "bus".into()],

            // 稳定化
            iou_threshold: 0.3,
            smoothing_factor: 0.7,
            stability_threshold: 3,
            detection_timeout_secs: 2.0,
            process_every_n_frames: 2,
            match_strategy: MatchStrategy::Greedy,

            // 通行决策
            cooldown_secs: 3.0,
            min_crop_size: 50,
            min_plate_length: 5,
            enforce_plate_format: false,

            // 外部协作方
            model_path: "models/yolov8n.onnx".into(),
            model_input_size: 640,
            ocr_endpoint: "http://127.0.0.1:8866/ocr".into(),
            ocr_timeout_secs: 2.0,
            store_path: dirs::data_dir().map(|dir| {
                dir.join("gate-sentinel")
                    .join("plates.json")
                    .to_string_lossy()
                    .into_owned()
            }),

            frame_queue_capacity: 8,
        }
    }
}

impl GateConfig {
    /// 从JSON文件加载配置
    ///
    /// 文件不存在时写出默认配置; 解析失败时回退默认值
    pub fn load(path: &str) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!("✅ 配置已从 {} 加载", path);
                    config
                }
                Err(e) => {
                    warn!("⚠️ 配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("❌ 保存配置失败: {}", e);
                }
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("💾 配置已保存到 {}", path);
        Ok(())
    }

    /// 参数合法性检查
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(GateError::InvalidConfig(format!("{name} must be in [0, 1], got {v}")))
            }
        };
        unit("confidence_threshold", self.confidence_threshold)?;
        unit("nms_threshold", self.nms_threshold)?;
        unit("iou_threshold", self.iou_threshold)?;

        if !(self.smoothing_factor > 0.0 && self.smoothing_factor < 1.0) {
            return Err(GateError::InvalidConfig(format!(
                "smoothing_factor must be in (0, 1), got {}",
                self.smoothing_factor
            )));
        }
        if self.stability_threshold == 0 {
            return Err(GateError::InvalidConfig("stability_threshold must be >= 1".into()));
        }
        if self.process_every_n_frames == 0 {
            return Err(GateError::InvalidConfig("process_every_n_frames must be >= 1".into()));
        }
        for (name, secs) in [
            ("detection_timeout_secs", self.detection_timeout_secs),
            ("cooldown_secs", self.cooldown_secs),
            ("ocr_timeout_secs", self.ocr_timeout_secs),
        ] {
            if Duration::try_from_secs_f32(secs).is_err() {
                return Err(GateError::InvalidConfig(format!(
                    "{name} must be a non-negative duration, got {secs}"
                )));
            }
        }
        if self.min_detection_area < 0.0 {
            return Err(GateError::InvalidConfig("min_detection_area must be >= 0".into()));
        }
        if self.model_input_size == 0 || self.frame_queue_capacity == 0 {
            return Err(GateError::InvalidConfig(
                "model_input_size and frame_queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// 未经 `validate` 的非法值按 0 处理
    pub fn detection_timeout(&self) -> Duration {
        secs_to_duration(self.detection_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        secs_to_duration(self.cooldown_secs)
    }

    pub fn ocr_timeout(&self) -> Duration {
        secs_to_duration(self.ocr_timeout_secs)
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️ 当前闸口配置:");
        info!(
            "  检测置信度: {:.2} | 最小面积: {:.0}",
            self.confidence_threshold, self.min_detection_area
        );
        info!(
            "  匹配IOU: {:.2} | 平滑α: {:.2} | 稳定阈值: {} | 超时: {:.1}s",
            self.iou_threshold,
            self.smoothing_factor,
            self.stability_threshold,
            self.detection_timeout_secs
        );
        info!(
            "  每{}帧关联 | 冷却: {:.1}s | 匹配策略: {:?}",
            self.process_every_n_frames, self.cooldown_secs, self.match_strategy
        );
        info!(
            "  ROI最小边: {}px | 车牌最短: {} | 格式校验: {}",
            self.min_crop_size, self.min_plate_length, self.enforce_plate_format
        );
    }
}

fn secs_to_duration(secs: f32) -> Duration {
    Duration::try_from_secs_f32(secs).unwrap_or_default()
}
