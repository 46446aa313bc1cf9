/// 闸口处理流水线 (Gate Processing Pipeline)
///
/// 单线程顺序处理, 一次一帧:
/// - Detector:    原始检测 (失败视为本帧无检测)
/// - Adapter:     类别过滤 + 几何校验
/// - Tracker:     关联 / 平滑 / 稳定门 (每 N 帧一次, 其余帧复用稳定轨迹)
/// - Coordinator: 冷却 + 车牌识别 + 通行决策
pub mod service;

use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use serde::Serialize;
use tracing::{debug, warn};

use crate::access::{AccessCoordinator, AccessDecision, AuthorizationStore, LatestDecision, PlateRecognizer};
use crate::config::GateConfig;
use crate::detection::{DetectionAdapter, ObjectDetector, StabilityTracker, Track};
use crate::error::Result;

pub use service::{GateService, GateStatus};

/// 单帧处理结果
#[derive(Clone, Debug)]
pub struct FrameOutcome {
    /// 自上次 reset 起的帧序号 (从 1 开始)
    pub frame_id: u64,
    /// 本帧是否做了检测 + 关联
    pub processed: bool,
    /// 本帧输出的可行动轨迹
    pub tracks: Vec<Track>,
    pub decision: Option<AccessDecision>,
}

/// 流水线计数
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_seen: u64,
    pub frames_processed: u64,
    pub detector_failures: u64,
    pub decisions: u64,
}

pub struct GatePipeline {
    detector: Box<dyn ObjectDetector>,
    adapter: DetectionAdapter,
    tracker: StabilityTracker,
    coordinator: AccessCoordinator,
    process_every_n: u64,
    frame_count: u64,
    stats: PipelineStats,
}

impl GatePipeline {
    pub fn new(
        config: &GateConfig,
        detector: Box<dyn ObjectDetector>,
        ocr: Box<dyn PlateRecognizer>,
        store: Arc<dyn AuthorizationStore>,
        latest: LatestDecision,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            detector,
            adapter: DetectionAdapter::new(config),
            tracker: StabilityTracker::new(config),
            coordinator: AccessCoordinator::new(config, ocr, store, latest)?,
            process_every_n: u64::from(config.process_every_n_frames),
            frame_count: 0,
            stats: PipelineStats::default(),
        })
    }

    pub fn process_frame(&mut self, frame: &RgbImage) -> FrameOutcome {
        self.process_frame_at(frame, Instant::now())
    }

    /// 处理一帧; `now` 为该帧的到达时间
    pub fn process_frame_at(&mut self, frame: &RgbImage, now: Instant) -> FrameOutcome {
        self.frame_count += 1;
        self.stats.frames_seen += 1;
        let processed = self.frame_count % self.process_every_n == 0;

        let tracks = if processed {
            self.stats.frames_processed += 1;
            let raw = match self.detector.detect(frame) {
                Ok(raw) => raw,
                Err(e) => {
                    self.stats.detector_failures += 1;
                    warn!("⚠️ 检测失败, 本帧按无检测处理: {:#}", e);
                    Vec::new()
                }
            };
            let detections = self.adapter.normalize(&raw, frame.width(), frame.height());
            debug!("帧 #{}: 原始 {} → 车辆 {}", self.frame_count, raw.len(), detections.len());
            self.tracker.update(&detections, now)
        } else {
            // 跳帧: 先清除超时轨迹, 再复用已稳定的轨迹
            self.tracker.evict_expired(now);
            self.tracker.actionable(now)
        };

        let decision = self.coordinator.evaluate(frame, &tracks, now);
        if decision.is_some() {
            self.stats.decisions += 1;
        }

        FrameOutcome {
            frame_id: self.frame_count,
            processed,
            tracks,
            decision,
        }
    }

    /// 清空轨迹与冷却, 帧计数归零 (ID 计数器不回退)
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.coordinator.reset();
        self.frame_count = 0;
    }

    /// 当前全部轨迹 (含未稳定)
    pub fn active_tracks(&self) -> &[Track] {
        self.tracker.tracks()
    }

    pub fn stability_threshold(&self) -> u32 {
        self.tracker.stability_threshold()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn latest(&self) -> &LatestDecision {
        self.coordinator.latest()
    }

    pub fn store(&self) -> &Arc<dyn AuthorizationStore> {
        self.coordinator.store()
    }
}
