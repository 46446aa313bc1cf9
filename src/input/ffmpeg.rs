//! FFmpeg 帧源: RTSP 拉流 / 本地摄像头
//! FFmpeg-backed frame source (RTSP pull or local camera, software decode only)
//!
//! 解码在独立线程中运行, 帧经有界队列交给处理线程; 队列满时丢帧

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;
use tracing::{debug, error, info, warn};

use super::{FramePoll, FrameSource};
use crate::error::{GateError, Result};

/// 启动握手超时
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
enum Target {
    Stream(String),
    Camera(usize),
}

pub struct FfmpegSource {
    target: Target,
    queue_capacity: usize,
    rx: Option<Receiver<RgbImage>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl FfmpegSource {
    pub fn stream(url: String, queue_capacity: usize) -> Self {
        Self::with_target(Target::Stream(url), queue_capacity)
    }

    pub fn camera(index: usize, queue_capacity: usize) -> Self {
        Self::with_target(Target::Camera(index), queue_capacity)
    }

    /// 本机视频输入设备, 下标即 `camera:N` 中的 N
    pub fn list_devices() -> Result<Vec<(usize, String)>> {
        let devices = ez_ffmpeg::device::get_input_video_devices()
            .map_err(|e| GateError::Capture(format!("获取摄像头列表失败: {e}")))?;
        Ok(devices.into_iter().enumerate().collect())
    }

    fn with_target(target: Target, queue_capacity: usize) -> Self {
        Self {
            target,
            queue_capacity: queue_capacity.max(1),
            rx: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl FrameSource for FfmpegSource {
    fn open(&mut self) -> Result<()> {
        self.close();
        self.stop = Arc::new(AtomicBool::new(false));

        let (tx, rx) = bounded(self.queue_capacity);
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);
        let sink = FrameSink::new(tx, self.stop.clone());
        let target = self.target.clone();

        let worker = thread::Builder::new()
            .name("ffmpeg-decode".into())
            .spawn(move || run_decoder(target, sink, ready_tx))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                info!("✅ 采集已启动: {}", self.describe());
                self.rx = Some(rx);
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => Err(GateError::Capture(e)),
            Err(_) => {
                self.stop.store(true, Ordering::Release);
                Err(GateError::Capture(format!("{}: 打开超时", self.describe())))
            }
        }
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<FramePoll> {
        let Some(rx) = &self.rx else {
            return Err(GateError::Capture("source not open".into()));
        };
        match rx.recv_timeout(timeout) {
            Ok(frame) => Ok(FramePoll::Frame(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(FramePoll::Pending),
            Err(RecvTimeoutError::Disconnected) => Ok(FramePoll::Ended),
        }
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        // 接收端释放后, 解码线程在下一帧时退出
        self.rx = None;
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
    }

    fn describe(&self) -> String {
        match &self.target {
            Target::Stream(url) => format!("流 {url}"),
            Target::Camera(index) => format!("摄像头 #{index}"),
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// 解码线程入口: 构建 FFmpeg 上下文, 通过 `ready` 回报启动结果, 然后阻塞到流结束
fn run_decoder(target: Target, sink: FrameSink, ready: Sender<std::result::Result<(), String>>) {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("decode", Box::new(sink));
    let out = create_null_output().add_frame_pipeline(pipe);

    let input = match &target {
        Target::Stream(url) => Input::new(url.as_str()).set_input_opts(
            [
                ("rtsp_transport", "tcp"),
                ("buffer_size", "67108864"),
                ("rtsp_flags", "prefer_tcp"),
            ]
            .into(),
        ),
        Target::Camera(index) => Input::new(camera_url(*index))
            .set_format(camera_format())
            .set_input_opts([("framerate", "30"), ("video_size", "1280x720")].into()),
    };

    // 统一转为 YUV420P, 由滤镜做 RGB 转换
    let ctx = match FfmpegContext::builder()
        .input(input)
        .filter_descs(["format=yuv420p"].into())
        .output(out)
        .build()
    {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = ready.send(Err(format!("构建失败: {e}")));
            return;
        }
    };

    let sch = match ctx.start() {
        Ok(sch) => sch,
        Err(e) => {
            let _ = ready.send(Err(format!("启动失败: {e}")));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    if let Err(e) = sch.wait() {
        debug!("解码结束: {}", e);
    }
    info!("📹 解码线程退出");
}

/// 摄像头 URL - 根据平台选择
fn camera_url(index: usize) -> String {
    #[cfg(target_os = "linux")]
    {
        format!("/dev/video{index}")
    }
    #[cfg(not(target_os = "linux"))]
    {
        format!("{index}")
    }
}

fn camera_format() -> &'static str {
    #[cfg(target_os = "windows")]
    let format = "dshow"; // DirectShow

    #[cfg(target_os = "macos")]
    let format = "avfoundation"; // AVFoundation

    #[cfg(target_os = "linux")]
    let format = "v4l2"; // Video4Linux2

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    let format = "video4linux2";

    format
}

// ========== 帧过滤器 ==========

/// FFmpeg 帧过滤器: YUV420P 帧 → RgbImage → 有界队列
struct FrameSink {
    tx: Sender<RgbImage>,
    stop: Arc<AtomicBool>,
    count: usize,
    last: Instant,
    dropped_frames: usize,
    total_frames: usize,
}

impl FrameSink {
    fn new(tx: Sender<RgbImage>, stop: Arc<AtomicBool>) -> Self {
        Self {
            tx,
            stop,
            count: 0,
            last: Instant::now(),
            dropped_frames: 0,
            total_frames: 0,
        }
    }

    fn drop_frame(&mut self, reason: &str) {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            warn!("⚠️ 丢弃帧 #{}: {}", self.total_frames, reason);
        }
    }
}

impl FrameFilter for FrameSink {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> std::result::Result<(), String> {
        debug!("解码滤镜初始化");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> std::result::Result<Option<Frame>, String> {
        if self.stop.load(Ordering::Acquire) {
            return Err("capture stopped".to_string());
        }
        self.total_frames += 1;

        // SAFETY: 仅在指针非空时读取 AVFrame 字段, 平面指针与步长在下方逐一检查
        let rgb = unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.drop_frame("空帧/损坏帧");
                return Ok(None);
            }
            let av = &*frame.as_ptr();
            let (w, h) = (av.width as u32, av.height as u32);
            if w == 0 || h == 0 || w > 4096 || h > 4096 {
                self.drop_frame("非法分辨率");
                return Ok(None);
            }
            // 只丢弃严重错误的帧 (缺少参考帧、无效比特流)
            if av.decode_error_flags & 0x03 != 0 {
                self.drop_frame("解码错误标志");
                return Ok(None);
            }

            let (y_plane, u_plane, v_plane) = (av.data[0], av.data[1], av.data[2]);
            let y_stride = av.linesize[0] as usize;
            let uv_stride = av.linesize[1] as usize;
            if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                self.drop_frame("YUV指针为空");
                return Ok(None);
            }
            if y_stride < w as usize || uv_stride < (w as usize).div_ceil(2) {
                self.drop_frame("步长异常");
                return Ok(None);
            }

            let mut buffer = vec![0u8; (w * h * 3) as usize];
            yuv420p_to_rgb(
                y_plane,
                u_plane,
                v_plane,
                y_stride,
                uv_stride,
                &mut buffer,
                w as usize,
                h as usize,
            );
            RgbImage::from_raw(w, h, buffer)
        };

        let Some(rgb) = rgb else {
            self.drop_frame("缓冲区尺寸不匹配");
            return Ok(None);
        };

        match self.tx.try_send(rgb) {
            Ok(()) => self.count += 1,
            Err(TrySendError::Full(_)) => self.dropped_frames += 1,
            Err(TrySendError::Disconnected(_)) => {
                return Err("frame receiver dropped".to_string());
            }
        }

        if self.last.elapsed().as_secs_f64() >= 1.0 {
            let elapsed = self.last.elapsed().as_secs_f64();
            let drop_rate = self.dropped_frames as f64 / self.total_frames.max(1) as f64 * 100.0;
            debug!(
                "📺 解码统计: {:.1}fps | 总帧{} | 丢弃{} ({:.1}%)",
                self.count as f64 / elapsed,
                self.total_frames,
                self.dropped_frames,
                drop_rate
            );
            self.last = Instant::now();
            self.count = 0;
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        if self.total_frames == 0 {
            error!("❌ 未收到任何视频帧");
        }
        debug!("解码滤镜退出");
    }
}

/// YUV420P → RGB24 (BT.601, 定点系数 ×128)
///
/// # Safety
/// 三个平面指针必须覆盖 `height` 行 (色度平面 `ceil(height/2)` 行) 与给定步长
#[allow(clippy::too_many_arguments)]
#[inline]
unsafe fn yuv420p_to_rgb(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out_idx = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;

        for x in 0..width {
            let y_val = *y_plane.add(y_row + x) as i32;
            let u_val = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v_val = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            buffer[out_idx] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 1] =
                (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
            out_idx += 3;
        }
    }
}
