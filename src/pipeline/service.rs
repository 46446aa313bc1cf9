//! 闸口控制面 (Control Surface)
//! 采集线程生命周期 + 检测开关 + 最新决策读取 + 显示帧订阅

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::RgbImage;
use serde::Serialize;
use tracing::{error, info, warn};

use super::GatePipeline;
use crate::access::{AccessDecision, LatestDecision};
use crate::error::{GateError, Result};
use crate::input::{FramePoll, FrameSource};
use crate::render;

/// 拉帧等待上限; 同时决定停止信号的响应延迟
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// 每隔多少帧打印一次吞吐统计
const REPORT_EVERY_FRAMES: u64 = 100;

/// 服务状态快照
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GateStatus {
    pub capturing: bool,
    pub detection_active: bool,
    pub frames_seen: u64,
    pub frames_processed: u64,
    pub decisions: u64,
    /// 最近一帧输出的已稳定轨迹数
    pub stable_tracks: usize,
}

/// 处理线程与控制面共享的状态
#[derive(Default)]
struct Shared {
    detection_active: AtomicBool,
    frames_seen: AtomicU64,
    frames_processed: AtomicU64,
    decisions: AtomicU64,
    stable_tracks: AtomicUsize,
    subscribers: Mutex<Vec<Sender<RgbImage>>>,
}

impl Shared {
    /// 推送显示帧; 队列满的订阅者丢帧, 断开的订阅者移除
    fn broadcast(&self, frame: &RgbImage) {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| !matches!(tx.try_send(frame.clone()), Err(TrySendError::Disconnected(_))));
    }
}

/// 处理线程在交接失败时返回 `None`
type LoopHandle = JoinHandle<Option<GatePipeline>>;
type LoopBody = Box<dyn FnOnce() -> Option<GatePipeline> + Send>;

struct Worker {
    stop: Arc<AtomicBool>,
    handle: LoopHandle,
}

pub struct GateService {
    pipeline: Option<GatePipeline>,
    latest: LatestDecision,
    shared: Arc<Shared>,
    worker: Option<Worker>,
    frame_queue_capacity: usize,
}

impl GateService {
    pub fn new(pipeline: GatePipeline, frame_queue_capacity: usize) -> Self {
        Self {
            latest: pipeline.latest().clone(),
            pipeline: Some(pipeline),
            shared: Arc::new(Shared::default()),
            worker: None,
            frame_queue_capacity: frame_queue_capacity.max(1),
        }
    }

    /// 打开帧源并启动处理线程
    ///
    /// 帧源打开失败时直接返回错误, 不重试
    pub fn start_capture(&mut self, source: Box<dyn FrameSource>) -> Result<()> {
        self.start_capture_with(source, |body| {
            thread::Builder::new().name("gate-loop".into()).spawn(body)
        })
    }

    /// 帧源与流水线在线程启动成功后才交给线程, 启动失败时两者都收回
    fn start_capture_with<F>(&mut self, mut source: Box<dyn FrameSource>, spawn: F) -> Result<()>
    where
        F: FnOnce(LoopBody) -> io::Result<LoopHandle>,
    {
        self.reap_finished()?;
        if self.worker.is_some() {
            return Err(GateError::Capture("capture already running".into()));
        }
        let Some(mut pipeline) = self.pipeline.take() else {
            return Err(GateError::Capture("pipeline unavailable".into()));
        };

        if let Err(e) = source.open() {
            error!("❌ 采集源打开失败: {}", e);
            self.pipeline = Some(pipeline);
            return Err(e);
        }
        pipeline.reset();

        let stop = Arc::new(AtomicBool::new(false));
        let shared = self.shared.clone();
        let stop_flag = stop.clone();
        let (handoff_tx, handoff_rx) = bounded::<(Box<dyn FrameSource>, GatePipeline)>(1);
        let body: LoopBody = Box::new(move || {
            let (source, pipeline) = handoff_rx.recv().ok()?;
            Some(run_loop(source, pipeline, stop_flag, shared))
        });

        let handle = match spawn(body) {
            Ok(handle) => handle,
            Err(e) => {
                error!("❌ 处理线程启动失败: {}", e);
                source.close();
                self.pipeline = Some(pipeline);
                return Err(e.into());
            }
        };
        let description = source.describe();
        if let Err(returned) = handoff_tx.send((source, pipeline)) {
            let (mut source, pipeline) = returned.into_inner();
            source.close();
            self.pipeline = Some(pipeline);
            let _ = handle.join();
            return Err(GateError::Capture("processing thread exited before start".into()));
        }

        info!("🎥 开始采集: {}", description);
        self.worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// 请求停止并等待处理线程在帧间退出
    pub fn stop_capture(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stop.store(true, Ordering::Release);
        self.join(worker)?;
        info!("⏹️ 采集已停止");
        Ok(())
    }

    pub fn start_detection(&self) {
        if !self.shared.detection_active.swap(true, Ordering::AcqRel) {
            info!("🔍 车辆检测已开启");
        }
    }

    pub fn stop_detection(&self) {
        if self.shared.detection_active.swap(false, Ordering::AcqRel) {
            info!("⏸️ 车辆检测已关闭");
        }
    }

    pub fn is_detecting(&self) -> bool {
        self.shared.detection_active.load(Ordering::Acquire)
    }

    pub fn is_capturing(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// 取出最新决策 (读取即清空)
    pub fn take_latest(&self) -> Option<AccessDecision> {
        self.latest.take()
    }

    /// 供其他线程使用的最新决策句柄
    pub fn latest_handle(&self) -> LatestDecision {
        self.latest.clone()
    }

    /// 订阅显示帧 (检测开启时带标注)
    pub fn subscribe_frames(&self) -> Receiver<RgbImage> {
        let (tx, rx) = bounded(self.frame_queue_capacity);
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn status(&self) -> GateStatus {
        GateStatus {
            capturing: self.is_capturing(),
            detection_active: self.is_detecting(),
            frames_seen: self.shared.frames_seen.load(Ordering::Relaxed),
            frames_processed: self.shared.frames_processed.load(Ordering::Relaxed),
            decisions: self.shared.decisions.load(Ordering::Relaxed),
            stable_tracks: self.shared.stable_tracks.load(Ordering::Relaxed),
        }
    }

    /// 处理线程已自行结束时 (源结束 / 出错) 收回流水线
    fn reap_finished(&mut self) -> Result<()> {
        if self.worker.as_ref().is_some_and(|w| w.handle.is_finished()) {
            if let Some(worker) = self.worker.take() {
                self.join(worker)?;
            }
        }
        Ok(())
    }

    fn join(&mut self, worker: Worker) -> Result<()> {
        match worker.handle.join() {
            Ok(Some(pipeline)) => {
                self.pipeline = Some(pipeline);
                Ok(())
            }
            Ok(None) => Err(GateError::Capture("processing thread never received the pipeline".into())),
            Err(_) => Err(GateError::Capture("processing thread panicked".into())),
        }
    }

    /// 等待处理线程自行结束 (用于有限帧源)
    pub fn wait(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(worker) => self.join(worker),
            None => Ok(()),
        }
    }
}

impl Drop for GateService {
    fn drop(&mut self) {
        if let Err(e) = self.stop_capture() {
            warn!("⚠️ 停止采集失败: {}", e);
        }
    }
}

/// 顺序处理循环: 一次一帧, 只在帧间响应停止信号
fn run_loop(
    mut source: Box<dyn FrameSource>,
    mut pipeline: GatePipeline,
    stop: Arc<AtomicBool>,
    shared: Arc<Shared>,
) -> GatePipeline {
    let mut report_start = Instant::now();
    while !stop.load(Ordering::Acquire) {
        let mut frame = match source.next_frame(POLL_TIMEOUT) {
            Ok(FramePoll::Frame(frame)) => frame,
            Ok(FramePoll::Pending) => continue,
            Ok(FramePoll::Ended) => {
                info!("📭 采集源已结束: {}", source.describe());
                break;
            }
            Err(e) => {
                error!("❌ 采集失败: {}", e);
                break;
            }
        };
        let seen = shared.frames_seen.fetch_add(1, Ordering::Relaxed) + 1;

        if shared.detection_active.load(Ordering::Acquire) {
            let outcome = pipeline.process_frame(&frame);
            if outcome.processed {
                shared.frames_processed.fetch_add(1, Ordering::Relaxed);
            }
            if outcome.decision.is_some() {
                shared.decisions.fetch_add(1, Ordering::Relaxed);
            }
            shared
                .stable_tracks
                .store(outcome.tracks.len(), Ordering::Relaxed);
            render::annotate(&mut frame, &outcome.tracks, pipeline.stability_threshold());
        }

        shared.broadcast(&frame);

        if seen % REPORT_EVERY_FRAMES == 0 {
            let fps = REPORT_EVERY_FRAMES as f64 / report_start.elapsed().as_secs_f64().max(1e-3);
            info!(
                "📊 采集 {:.1}fps | 已处理 {} | 决策 {} | 稳定轨迹 {}",
                fps,
                shared.frames_processed.load(Ordering::Relaxed),
                shared.decisions.load(Ordering::Relaxed),
                shared.stable_tracks.load(Ordering::Relaxed)
            );
            report_start = Instant::now();
        }
    }

    source.close();
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AuthorizationStore, GateAction, JsonPlateStore, OcrReading, PlateRecognizer};
    use crate::config::GateConfig;
    use crate::detection::{BBox, ObjectDetector, RawDetection};

    /// 内存帧源: 先吐出若干帧, 然后结束或一直 Pending
    struct MemorySource {
        frames: usize,
        endless: bool,
        fail_open: bool,
        closed: Arc<AtomicBool>,
    }

    impl FrameSource for MemorySource {
        fn open(&mut self) -> Result<()> {
            if self.fail_open {
                return Err(GateError::Capture("device busy".into()));
            }
            Ok(())
        }

        fn next_frame(&mut self, timeout: Duration) -> Result<FramePoll> {
            if self.frames > 0 {
                self.frames -= 1;
                return Ok(FramePoll::Frame(RgbImage::new(640, 480)));
            }
            if self.endless {
                thread::sleep(timeout.min(Duration::from_millis(5)));
                Ok(FramePoll::Pending)
            } else {
                Ok(FramePoll::Ended)
            }
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "memory".into()
        }
    }

    struct FixedDetector;

    impl ObjectDetector for FixedDetector {
        fn detect(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<RawDetection>> {
            Ok(vec![RawDetection {
                class_id: 7,
                confidence: 0.95,
                bbox: BBox::new(100.0, 100.0, 400.0, 350.0),
            }])
        }
    }

    struct FixedOcr;

    impl PlateRecognizer for FixedOcr {
        fn recognize(&mut self, _crop: &RgbImage) -> anyhow::Result<OcrReading> {
            Ok(OcrReading::read("34ABC123", 0.9))
        }
    }

    fn service() -> GateService {
        let mut config = GateConfig::default();
        config.process_every_n_frames = 1;
        let store = JsonPlateStore::in_memory();
        store.add_plate("34ABC123").unwrap();
        let store: Arc<dyn AuthorizationStore> = Arc::new(store);
        let pipeline = GatePipeline::new(
            &config,
            Box::new(FixedDetector),
            Box::new(FixedOcr),
            store,
            LatestDecision::new(),
        )
        .unwrap();
        GateService::new(pipeline, 4)
    }

    fn source(frames: usize, endless: bool) -> (Box<dyn FrameSource>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let src = MemorySource {
            frames,
            endless,
            fail_open: false,
            closed: closed.clone(),
        };
        (Box::new(src), closed)
    }

    #[test]
    fn test_open_failure_is_surfaced_and_pipeline_kept() {
        let mut svc = service();
        let bad = MemorySource {
            frames: 0,
            endless: false,
            fail_open: true,
            closed: Arc::default(),
        };
        assert!(matches!(svc.start_capture(Box::new(bad)), Err(GateError::Capture(_))));
        assert!(!svc.is_capturing());

        let (src, _) = source(1, false);
        assert!(svc.start_capture(src).is_ok());
        svc.wait().unwrap();
    }

    #[test]
    fn test_detection_flag_gates_processing() {
        let mut svc = service();
        let frames = svc.subscribe_frames();
        let (src, closed) = source(5, false);
        svc.start_capture(src).unwrap();
        svc.wait().unwrap();

        let status = svc.status();
        assert_eq!(status.frames_seen, 5);
        assert_eq!(status.frames_processed, 0);
        assert!(svc.take_latest().is_none());
        assert!(closed.load(Ordering::SeqCst));
        // 队列容量 4, 多余的帧被丢弃
        assert_eq!(frames.try_iter().count(), 4);
    }

    #[test]
    fn test_decision_is_delivered_once() {
        let mut svc = service();
        svc.start_detection();
        let (src, _) = source(6, false);
        svc.start_capture(src).unwrap();
        svc.wait().unwrap();

        let status = svc.status();
        assert_eq!(status.frames_processed, 6);
        assert_eq!(status.decisions, 1);
        assert_eq!(status.stable_tracks, 1);

        let d = svc.take_latest().unwrap();
        assert_eq!(d.action, GateAction::Open);
        assert!(svc.take_latest().is_none());
    }

    #[test]
    fn test_stop_capture_ends_endless_source() {
        let mut svc = service();
        let (src, closed) = source(2, true);
        svc.start_capture(src).unwrap();
        assert!(svc.is_capturing());
        assert!(matches!(
            svc.start_capture(source(1, false).0),
            Err(GateError::Capture(_))
        ));

        svc.stop_capture().unwrap();
        assert!(!svc.is_capturing());
        assert!(closed.load(Ordering::SeqCst));

        // 流水线已收回, 可再次启动
        let (src, _) = source(1, false);
        svc.start_capture(src).unwrap();
        svc.wait().unwrap();
    }

    #[test]
    fn test_display_frames_show_only_stable_tracks() {
        let mut svc = service();
        svc.start_detection();
        let frames = svc.subscribe_frames();
        let (src, _) = source(3, false);
        svc.start_capture(src).unwrap();
        svc.wait().unwrap();

        let frames: Vec<RgbImage> = frames.try_iter().collect();
        assert_eq!(frames.len(), 3);
        // 检测框左边缘 x=100; 前两帧轨迹未稳定, 不画框
        let black = image::Rgb([0, 0, 0]);
        assert_eq!(*frames[0].get_pixel(100, 200), black);
        assert_eq!(*frames[1].get_pixel(100, 200), black);
        assert_ne!(*frames[2].get_pixel(100, 200), black);
        assert_eq!(svc.status().stable_tracks, 1);
    }

    #[test]
    fn test_spawn_failure_keeps_pipeline() {
        let mut svc = service();
        let (src, closed) = source(1, false);
        let result = svc.start_capture_with(src, |_body| {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "thread limit reached"))
        });
        assert!(matches!(result, Err(GateError::Io(_))));
        assert!(!svc.is_capturing());
        assert!(closed.load(Ordering::SeqCst));

        // 流水线未丢失
        let (src, _) = source(1, false);
        svc.start_capture(src).unwrap();
        svc.wait().unwrap();
        assert_eq!(svc.status().frames_seen, 1);
    }
}
