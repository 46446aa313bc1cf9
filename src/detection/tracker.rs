//! 车辆稳定跟踪 (Track Associator + Smoother + Stability Gate)
//! Stabilises the per-frame detection stream into persistent tracks
//!
//! 流程:
//! 1. 清除超时轨迹 (按墙钟时间, 与帧数无关)
//! 2. IOU 关联检测框与现有轨迹
//! 3. 命中轨迹做 EMA 平滑, 稳定计数 +1
//! 4. 未命中检测框 → 新建轨迹 (ID 单调递增, 永不复用)
//! 5. 只有稳定计数达到阈值的轨迹才对下游可见

use std::time::{Duration, Instant};

use tracing::debug;

use super::types::{BBox, VehicleDetection};
use crate::config::{GateConfig, MatchStrategy};

// ========== 跟踪对象 ==========

/// 一辆车在时间上的持续身份
#[derive(Clone, Debug)]
pub struct Track {
    /// 唯一跟踪ID
    pub id: u64,

    /// 当前边界框 (EMA 平滑后)
    pub bbox: BBox,

    pub class_name: String,

    /// 是否属于闸口触发类别
    pub gate_relevant: bool,

    /// 平滑后的置信度
    pub confidence: f32,

    /// 自创建以来的连续匹配次数 (只增不减, 超时即删除)
    pub stability_count: u32,

    /// 最近一次匹配时间
    pub last_seen: Instant,
}

impl Track {
    fn spawn(id: u64, det: &VehicleDetection, now: Instant) -> Self {
        Self {
            id,
            bbox: det.bbox,
            class_name: det.class_name.clone(),
            gate_relevant: det.gate_relevant,
            confidence: det.confidence,
            stability_count: 1,
            last_seen: now,
        }
    }

    /// 融合一次观测: 几何与置信度按 α 做指数滑动平均
    pub fn absorb(&mut self, det: &VehicleDetection, alpha: f32, now: Instant) {
        self.bbox = self.bbox.blend(&det.bbox, alpha);
        self.confidence = alpha * det.confidence + (1.0 - alpha) * self.confidence;
        self.class_name = det.class_name.clone();
        self.gate_relevant = det.gate_relevant;
        self.stability_count += 1;
        self.last_seen = now;
    }

    pub fn is_stable(&self, threshold: u32) -> bool {
        self.stability_count >= threshold
    }
}

// ========== 关联 ==========

/// 一帧的关联结果
#[derive(Debug, Default, PartialEq)]
pub struct Association {
    /// (检测下标, 轨迹下标)
    pub matches: Vec<(usize, usize)>,
    /// 未匹配的检测下标
    pub unmatched: Vec<usize>,
}

/// IOU 关联
///
/// `Greedy`: 所有超过阈值的 (检测, 轨迹) 对按 IOU 从高到低一对一消耗。
/// `PerDetection`: 每个检测框独立选 IOU 最大的轨迹, 两个检测框可能同时命中
/// 同一条轨迹, 该轨迹在一帧内会被更新两次。
pub fn associate(
    detections: &[VehicleDetection],
    tracks: &[Track],
    iou_threshold: f32,
    strategy: MatchStrategy,
) -> Association {
    let mut assoc = Association::default();

    match strategy {
        MatchStrategy::PerDetection => {
            for (det_idx, det) in detections.iter().enumerate() {
                let best = tracks
                    .iter()
                    .enumerate()
                    .map(|(idx, t)| (idx, det.bbox.iou(&t.bbox)))
                    .fold(None, |best: Option<(usize, f32)>, cur| match best {
                        Some(b) if b.1 >= cur.1 => Some(b),
                        _ => Some(cur),
                    });
                match best {
                    Some((track_idx, iou)) if iou > iou_threshold => {
                        assoc.matches.push((det_idx, track_idx))
                    }
                    _ => assoc.unmatched.push(det_idx),
                }
            }
        }
        MatchStrategy::Greedy => {
            let mut candidates = Vec::new();
            for (det_idx, det) in detections.iter().enumerate() {
                for (track_idx, track) in tracks.iter().enumerate() {
                    let iou = det.bbox.iou(&track.bbox);
                    if iou > iou_threshold {
                        candidates.push((iou, det_idx, track_idx));
                    }
                }
            }

            // 贪心匹配: 按 IOU 降序
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

            let mut used_det = vec![false; detections.len()];
            let mut used_track = vec![false; tracks.len()];
            for (_, det_idx, track_idx) in candidates {
                if !used_det[det_idx] && !used_track[track_idx] {
                    assoc.matches.push((det_idx, track_idx));
                    used_det[det_idx] = true;
                    used_track[track_idx] = true;
                }
            }
            assoc.matches.sort_unstable();
            assoc.unmatched = (0..detections.len()).filter(|&i| !used_det[i]).collect();
        }
    }

    assoc
}

// ========== 稳定门 ==========

/// 轨迹集合的唯一持有者
pub struct StabilityTracker {
    tracks: Vec<Track>,
    next_id: u64,
    iou_threshold: f32,
    smoothing_factor: f32,
    stability_threshold: u32,
    timeout: Duration,
    strategy: MatchStrategy,
}

impl StabilityTracker {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold: config.iou_threshold,
            smoothing_factor: config.smoothing_factor,
            stability_threshold: config.stability_threshold,
            timeout: config.detection_timeout(),
            strategy: config.match_strategy,
        }
    }

    /// 删除 `now - last_seen > timeout` 的轨迹, 返回删除数量
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.tracks.len();
        let timeout = self.timeout;
        self.tracks
            .retain(|t| now.saturating_duration_since(t.last_seen) <= timeout);
        let removed = before - self.tracks.len();
        if removed > 0 {
            debug!("🗑️ 清除超时轨迹 {} 条, 剩余 {}", removed, self.tracks.len());
        }
        removed
    }

    /// 用一帧检测更新轨迹
    ///
    /// 返回本轮被匹配且已稳定的轨迹快照 (按轨迹创建顺序)
    pub fn update(&mut self, detections: &[VehicleDetection], now: Instant) -> Vec<Track> {
        self.evict_expired(now);

        let assoc = associate(detections, &self.tracks, self.iou_threshold, self.strategy);

        let mut matched = vec![false; self.tracks.len()];
        for &(det_idx, track_idx) in &assoc.matches {
            self.tracks[track_idx].absorb(&detections[det_idx], self.smoothing_factor, now);
            matched[track_idx] = true;
        }

        for det_idx in assoc.unmatched {
            let track = Track::spawn(self.next_id, &detections[det_idx], now);
            debug!("🆕 新轨迹 #{} ({})", track.id, track.class_name);
            self.tracks.push(track);
            matched.push(true);
            self.next_id += 1;
        }

        // 新建轨迹同样计入 (阈值为 1 时当帧即稳定)
        let threshold = self.stability_threshold;
        self.tracks
            .iter()
            .zip(&matched)
            .filter(|(t, m)| **m && t.is_stable(threshold))
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// 当前所有已稳定且未超时的轨迹 (用于跳帧时原样输出)
    pub fn actionable(&self, now: Instant) -> Vec<Track> {
        self.tracks
            .iter()
            .filter(|t| t.is_stable(self.stability_threshold))
            .filter(|t| now.saturating_duration_since(t.last_seen) <= self.timeout)
            .cloned()
            .collect()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn stability_threshold(&self) -> u32 {
        self.stability_threshold
    }

    /// 清空轨迹; ID 计数器不回退
    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    /// 获取跟踪统计信息
    pub fn get_stats(&self) -> String {
        format!(
            "跟踪: {} 辆 | 稳定: {} | 总ID: {}",
            self.tracks.len(),
            self.tracks
                .iter()
                .filter(|t| t.is_stable(self.stability_threshold))
                .count(),
            self.next_id - 1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> VehicleDetection {
        det_conf(x1, y1, x2, y2, 0.9)
    }

    fn det_conf(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> VehicleDetection {
        VehicleDetection {
            class_name: "truck".into(),
            gate_relevant: true,
            confidence,
            bbox: BBox::new(x1, y1, x2, y2),
        }
    }

    fn ms(t0: Instant, millis: u64) -> Instant {
        t0 + Duration::from_millis(millis)
    }

    #[test]
    fn test_stability_count_increments_per_frame() {
        let mut tracker = StabilityTracker::new(&GateConfig::default());
        let t0 = Instant::now();

        for frame in 0..5u32 {
            let shift = frame as f32 * 5.0;
            let stable = tracker.update(&[det(100.0 + shift, 100.0, 300.0 + shift, 300.0)], ms(t0, frame as u64 * 100));
            assert_eq!(tracker.track_count(), 1);
            assert_eq!(tracker.tracks()[0].stability_count, frame + 1);
            assert_eq!(tracker.tracks()[0].id, 1);
            // 阈值 3: 第三帧开始可见
            assert_eq!(stable.len(), usize::from(frame + 1 >= 3));
        }
    }

    #[test]
    fn test_ema_law_on_match() {
        let mut config = GateConfig::default();
        config.smoothing_factor = 0.7;
        let mut tracker = StabilityTracker::new(&config);
        let t0 = Instant::now();

        tracker.update(&[det_conf(0.0, 0.0, 100.0, 100.0, 0.5)], t0);
        tracker.update(&[det_conf(10.0, 10.0, 110.0, 110.0, 0.8)], ms(t0, 100));

        let t = &tracker.tracks()[0];
        assert!((t.bbox.x1 - 7.0).abs() < 1e-4);
        assert!((t.bbox.y1 - 7.0).abs() < 1e-4);
        assert!((t.bbox.x2 - 107.0).abs() < 1e-4);
        assert!((t.bbox.y2 - 107.0).abs() < 1e-4);
        assert!((t.confidence - 0.71).abs() < 1e-5);
        assert_eq!(t.stability_count, 2);
    }

    #[test]
    fn test_new_track_uses_observation_unsmoothed() {
        let mut tracker = StabilityTracker::new(&GateConfig::default());
        tracker.update(&[det_conf(10.0, 20.0, 210.0, 220.0, 0.65)], Instant::now());
        let t = &tracker.tracks()[0];
        assert_eq!(t.bbox, BBox::new(10.0, 20.0, 210.0, 220.0));
        assert_eq!(t.confidence, 0.65);
        assert_eq!(t.stability_count, 1);
    }

    #[test]
    fn test_timeout_destroys_track_and_reissues_new_id() {
        let mut tracker = StabilityTracker::new(&GateConfig::default());
        let t0 = Instant::now();
        let b = det(100.0, 100.0, 300.0, 300.0);

        tracker.update(&[b.clone()], t0);
        tracker.update(&[b.clone()], ms(t0, 500));
        assert_eq!(tracker.tracks()[0].stability_count, 2);

        // 间隔 2.5s > 2s 超时
        tracker.update(&[b], ms(t0, 3000));
        assert_eq!(tracker.track_count(), 1);
        assert_eq!(tracker.tracks()[0].id, 2);
        assert_eq!(tracker.tracks()[0].stability_count, 1);
    }

    #[test]
    fn test_gap_within_timeout_keeps_track() {
        let mut tracker = StabilityTracker::new(&GateConfig::default());
        let t0 = Instant::now();
        let b = det(100.0, 100.0, 300.0, 300.0);
        tracker.update(&[b.clone()], t0);
        tracker.update(&[], ms(t0, 1000));
        tracker.update(&[b], ms(t0, 1900));
        assert_eq!(tracker.tracks()[0].id, 1);
        assert_eq!(tracker.tracks()[0].stability_count, 2);
    }

    #[test]
    fn test_unmatched_detection_creates_exactly_one_track() {
        let mut tracker = StabilityTracker::new(&GateConfig::default());
        let t0 = Instant::now();
        tracker.update(&[det(0.0, 0.0, 100.0, 100.0)], t0);
        tracker.update(&[det(0.0, 0.0, 100.0, 100.0), det(400.0, 300.0, 500.0, 400.0)], ms(t0, 100));

        assert_eq!(tracker.track_count(), 2);
        let ids: Vec<u64> = tracker.tracks().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_greedy_assignment_is_one_to_one() {
        let mut tracker = StabilityTracker::new(&GateConfig::default());
        let t0 = Instant::now();
        tracker.update(&[det(100.0, 100.0, 300.0, 300.0)], t0);

        // 两个检测框都与同一条轨迹高度重叠
        tracker.update(
            &[det(110.0, 100.0, 310.0, 300.0), det(102.0, 100.0, 302.0, 300.0)],
            ms(t0, 100),
        );
        assert_eq!(tracker.track_count(), 2);
        assert_eq!(tracker.tracks()[0].stability_count, 2);
        assert_eq!(tracker.tracks()[1].id, 2);
        // IOU 更高的检测框胜出
        assert!((tracker.tracks()[0].bbox.x1 - (0.7 * 102.0 + 0.3 * 100.0)).abs() < 1e-3);
    }

    #[test]
    fn test_per_detection_allows_shared_track() {
        let mut config = GateConfig::default();
        config.match_strategy = MatchStrategy::PerDetection;
        let mut tracker = StabilityTracker::new(&config);
        let t0 = Instant::now();
        tracker.update(&[det(100.0, 100.0, 300.0, 300.0)], t0);

        tracker.update(
            &[det(110.0, 100.0, 310.0, 300.0), det(102.0, 100.0, 302.0, 300.0)],
            ms(t0, 100),
        );
        assert_eq!(tracker.track_count(), 1);
        assert_eq!(tracker.tracks()[0].stability_count, 3);
    }

    #[test]
    fn test_iou_must_exceed_threshold() {
        let tracks = vec![Track::spawn(1, &det(0.0, 0.0, 100.0, 100.0), Instant::now())];
        // IOU = 5000 / 15000 ≈ 0.333
        let d = [det(50.0, 0.0, 150.0, 100.0)];
        let hit = associate(&d, &tracks, 0.3, MatchStrategy::Greedy);
        assert_eq!(hit.matches, vec![(0, 0)]);
        let miss = associate(&d, &tracks, 0.34, MatchStrategy::Greedy);
        assert!(miss.matches.is_empty());
        assert_eq!(miss.unmatched, vec![0]);
    }

    #[test]
    fn test_actionable_and_reset_keep_ids_monotonic() {
        let mut tracker = StabilityTracker::new(&GateConfig::default());
        let t0 = Instant::now();
        let b = det(100.0, 100.0, 300.0, 300.0);
        for i in 0..3 {
            tracker.update(&[b.clone()], ms(t0, i * 100));
        }
        assert_eq!(tracker.actionable(ms(t0, 300)).len(), 1);

        tracker.reset();
        assert_eq!(tracker.track_count(), 0);
        tracker.update(&[b], ms(t0, 400));
        assert_eq!(tracker.tracks()[0].id, 2);
    }

    #[test]
    fn test_actionable_excludes_expired_tracks() {
        let mut tracker = StabilityTracker::new(&GateConfig::default());
        let t0 = Instant::now();
        let b = det(100.0, 100.0, 300.0, 300.0);
        for i in 0..3 {
            tracker.update(&[b.clone()], ms(t0, i * 100));
        }
        // 最后一次匹配在 200ms, 超时 2s
        assert_eq!(tracker.actionable(ms(t0, 2200)).len(), 1);
        assert!(tracker.actionable(ms(t0, 2201)).is_empty());
        assert!(tracker.actionable(ms(t0, 60_000)).is_empty());
    }

    #[test]
    fn test_threshold_one_reports_new_track_immediately() {
        let mut config = GateConfig::default();
        config.stability_threshold = 1;
        let mut tracker = StabilityTracker::new(&config);
        let t0 = Instant::now();

        let stable = tracker.update(&[det(100.0, 100.0, 300.0, 300.0)], t0);
        assert_eq!(stable.len(), 1);
        assert_eq!(stable[0].id, 1);
        assert_eq!(stable[0].stability_count, 1);

        // 默认阈值 3 时新轨迹不输出
        let mut tracker = StabilityTracker::new(&GateConfig::default());
        assert!(tracker.update(&[det(100.0, 100.0, 300.0, 300.0)], t0).is_empty());
    }
}
