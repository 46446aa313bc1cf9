//! 通行决策协调器 (Access Decision Coordinator)
//!
//! 稳定轨迹 → 冷却检查 → ROI 裁剪 → OCR → 车牌规则 → 授权库 → 决策
//! 每次被冷却允许的触发最多产生一个决策

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{imageops, RgbImage};
use tracing::{debug, error, info, warn};

use super::decision::{AccessDecision, LatestDecision};
use super::ocr::PlateRecognizer;
use super::plate::PlateRules;
use super::store::{AccessLogEntry, AuthorizationStore};
use crate::config::GateConfig;
use crate::detection::{BBox, Track};
use crate::error::Result;

pub struct AccessCoordinator {
    ocr: Box<dyn PlateRecognizer>,
    store: Arc<dyn AuthorizationStore>,
    latest: LatestDecision,
    rules: PlateRules,
    cooldown: Duration,
    min_crop_size: u32,
    last_trigger: Option<Instant>,
}

impl AccessCoordinator {
    pub fn new(
        config: &GateConfig,
        ocr: Box<dyn PlateRecognizer>,
        store: Arc<dyn AuthorizationStore>,
        latest: LatestDecision,
    ) -> Result<Self> {
        Ok(Self {
            ocr,
            store,
            latest,
            rules: PlateRules::from_config(config)?,
            cooldown: config.cooldown(),
            min_crop_size: config.min_crop_size,
            last_trigger: None,
        })
    }

    /// 最新决策单槽 (与外部读者共享)
    pub fn latest(&self) -> &LatestDecision {
        &self.latest
    }

    pub fn store(&self) -> &Arc<dyn AuthorizationStore> {
        &self.store
    }

    /// 冷却是否允许在 `now` 触发
    pub fn cooldown_permits(&self, now: Instant) -> bool {
        match self.last_trigger {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.cooldown,
        }
    }

    /// 清除冷却计时 (重新开始检测时调用)
    pub fn reset(&mut self) {
        self.last_trigger = None;
    }

    /// 评估一帧的稳定轨迹, 至多产生一个决策
    pub fn evaluate(&mut self, frame: &RgbImage, tracks: &[Track], now: Instant) -> Option<AccessDecision> {
        let candidates: Vec<&Track> = tracks.iter().filter(|t| t.gate_relevant).collect();
        if candidates.is_empty() || !self.cooldown_permits(now) {
            return None;
        }
        info!("🚛 {} 辆稳定车辆候选", candidates.len());

        for track in candidates {
            let Some(crop) = self.crop(frame, &track.bbox) else {
                debug!("轨迹 #{} ROI 过小, 跳过", track.id);
                continue;
            };

            let reading = match self.ocr.recognize(&crop) {
                Ok(r) => r,
                Err(e) => {
                    warn!("⚠️ 车牌识别失败 (轨迹 #{}): {:#}", track.id, e);
                    continue;
                }
            };
            if !reading.detected {
                debug!("轨迹 #{} 未读到车牌", track.id);
                continue;
            }
            let Some(plate_text) = self.rules.accept(&reading.text) else {
                debug!("车牌文本不合规: {:?}", reading.text);
                continue;
            };
            info!("📋 车牌: {} ({:.2})", plate_text, reading.confidence);

            let authorized = match self.store.is_authorized(&plate_text) {
                Ok(v) => v,
                Err(e) => {
                    error!("❌ 授权查询失败, 按拒绝处理: {}", e);
                    false
                }
            };

            let decision = AccessDecision::new(plate_text, track.class_name.clone(), authorized);
            if authorized {
                info!("✅ 允许通行: {}", decision.plate_text);
            } else {
                warn!("⛔ 拒绝通行: {}", decision.plate_text);
            }

            if let Err(e) = self.store.record_access(AccessLogEntry::from(&decision)) {
                error!("❌ 通行日志写入失败: {}", e);
            }
            self.latest.publish(decision.clone());
            self.last_trigger = Some(now);
            return Some(decision);
        }

        None
    }

    /// 按轨迹框裁剪 ROI; 任一边小于阈值时返回 None
    fn crop(&self, frame: &RgbImage, bbox: &BBox) -> Option<RgbImage> {
        let b = bbox.clamp_to(frame.width(), frame.height())?;
        let x = b.x1.floor() as u32;
        let y = b.y1.floor() as u32;
        let w = (b.x2.ceil() as u32).min(frame.width()).saturating_sub(x);
        let h = (b.y2.ceil() as u32).min(frame.height()).saturating_sub(y);
        if w < self.min_crop_size || h < self.min_crop_size {
            return None;
        }
        Some(imageops::crop_imm(frame, x, y, w, h).to_image())
    }
}
