//! YOLOv8 ONNX 检测器
//! Letterbox preprocess → ONNX Runtime → decode `[1, 4+nc, anchors]` → NMS

use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context};
use fast_image_resize as fr;
use image::RgbImage;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::types::{BBox, RawDetection};
use super::ObjectDetector;
use crate::config::GateConfig;
use crate::error::GateError;

const CXYWH_OFFSET: usize = 4;
const PAD_VALUE: u8 = 114;

/// Letterbox 变换参数 (原图 → 模型输入)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn fit(src_w: u32, src_h: u32, size: u32) -> (Self, u32, u32) {
        let scale = (size as f32 / src_w as f32).min(size as f32 / src_h as f32);
        let new_w = ((src_w as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((src_h as f32 * scale).round() as u32).clamp(1, size);
        let letterbox = Self {
            scale,
            pad_x: ((size - new_w) / 2) as f32,
            pad_y: ((size - new_h) / 2) as f32,
        };
        (letterbox, new_w, new_h)
    }

    /// 模型坐标 (cx, cy, w, h) → 原图坐标
    pub fn unmap(&self, cx: f32, cy: f32, w: f32, h: f32) -> BBox {
        BBox::new(
            (cx - w / 2.0 - self.pad_x) / self.scale,
            (cy - h / 2.0 - self.pad_y) / self.scale,
            (cx + w / 2.0 - self.pad_x) / self.scale,
            (cy + h / 2.0 - self.pad_y) / self.scale,
        )
    }
}

pub struct YoloV8Detector {
    session: Session,
    input_size: u32,
    conf: f32,
    iou: f32,
    max_det: usize,
    resizer: fr::Resizer,
}

fn build_session(path: &Path) -> Result<Session, ort::Error> {
    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(path)
}

impl YoloV8Detector {
    pub fn new(config: &GateConfig) -> crate::error::Result<Self> {
        let path = Path::new(&config.model_path);
        if !path.exists() {
            return Err(GateError::Model(format!("模型文件不存在: {}", path.display())));
        }
        let session = build_session(path).map_err(|e| GateError::Model(e.to_string()))?;
        info!("✅ YOLOv8 检测模型加载成功: {}", path.display());

        Ok(Self {
            session,
            input_size: config.model_input_size,
            conf: config.confidence_threshold,
            iou: config.nms_threshold,
            max_det: config.max_detections,
            resizer: fr::Resizer::new(),
        })
    }

    /// 缩放 + 灰边填充 + 归一化, 输出 NCHW
    fn preprocess(&mut self, frame: &RgbImage) -> anyhow::Result<(Array4<f32>, Letterbox)> {
        let size = self.input_size;
        let (letterbox, new_w, new_h) = Letterbox::fit(frame.width(), frame.height(), size);

        let src = fr::images::Image::from_vec_u8(
            frame.width(),
            frame.height(),
            frame.as_raw().clone(),
            fr::PixelType::U8x3,
        )?;
        let mut dst = fr::images::Image::new(new_w, new_h, fr::PixelType::U8x3);
        self.resizer.resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )?;

        let size = size as usize;
        let mut input = Array4::<f32>::from_elem((1, 3, size, size), PAD_VALUE as f32 / 255.0);
        let (pad_x, pad_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        for (i, px) in dst.buffer().chunks_exact(3).enumerate() {
            let x = i % new_w as usize + pad_x;
            let y = i / new_w as usize + pad_y;
            input[[0, 0, y, x]] = px[0] as f32 / 255.0;
            input[[0, 1, y, x]] = px[1] as f32 / 255.0;
            input[[0, 2, y, x]] = px[2] as f32 / 255.0;
        }

        Ok((input, letterbox))
    }
}

impl ObjectDetector for YoloV8Detector {
    fn detect(&mut self, frame: &RgbImage) -> anyhow::Result<Vec<RawDetection>> {
        let t0 = Instant::now();
        let (input, letterbox) = self.preprocess(frame)?;
        let tensor = Tensor::from_array(input)?;

        let (conf, iou, max_det) = (self.conf, self.iou, self.max_det);
        let outputs = self.session.run(ort::inputs![tensor])?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("读取模型输出失败")?;

        if shape.len() != 3 || shape[1] <= CXYWH_OFFSET as i64 {
            bail!("不支持的输出形状: {:?}", &shape[..]);
        }
        let channels = shape[1] as usize;
        let anchors = shape[2] as usize;

        let mut dets = decode_predictions(data, channels, anchors, &letterbox, conf);
        non_max_suppression(&mut dets, iou);
        dets.truncate(max_det);

        debug!("🔍 检测 {} 个目标, 耗时 {:.1}ms", dets.len(), t0.elapsed().as_secs_f64() * 1000.0);
        Ok(dets)
    }
}

/// 解析 `[1, 4+nc, anchors]` 输出 (通道优先)
pub fn decode_predictions(
    data: &[f32],
    channels: usize,
    anchors: usize,
    letterbox: &Letterbox,
    conf_threshold: f32,
) -> Vec<RawDetection> {
    let num_classes = channels - CXYWH_OFFSET;
    let at = |c: usize, i: usize| data[c * anchors + i];

    let mut dets = Vec::new();
    for i in 0..anchors {
        let (class_id, confidence) = (0..num_classes)
            .map(|c| (c, at(CXYWH_OFFSET + c, i)))
            .fold((0, f32::MIN), |max, x| if x.1 > max.1 { x } else { max });

        if confidence < conf_threshold {
            continue;
        }

        dets.push(RawDetection {
            class_id: class_id as u32,
            confidence,
            bbox: letterbox.unmap(at(0, i), at(1, i), at(2, i), at(3, i)),
        });
    }
    dets
}

/// 按类别 NMS (不同类别互不抑制), 结果按置信度降序
pub fn non_max_suppression(xs: &mut Vec<RawDetection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class_id == xs[index].class_id
                && xs[prev_index].bbox.iou(&xs[index].bbox) > iou_threshold
            {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}
