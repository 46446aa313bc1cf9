//! 显示帧标注: 只画已稳定的轨迹, 颜色随稳定度加深

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detection::Track;

/// 达到该计数视为"非常稳定"
const VERY_STABLE_COUNT: u32 = 5;

const VERY_STABLE: Rgb<u8> = Rgb([0, 255, 0]);
const STABLE: Rgb<u8> = Rgb([0, 200, 0]);
const GATE_VERY_STABLE: Rgb<u8> = Rgb([255, 255, 0]);
const GATE_STABLE: Rgb<u8> = Rgb([200, 200, 0]);

/// 轨迹框颜色 (闸口类别为黄色系)
pub fn track_color(track: &Track) -> Rgb<u8> {
    match (track.stability_count >= VERY_STABLE_COUNT, track.gate_relevant) {
        (true, true) => GATE_VERY_STABLE,
        (true, false) => VERY_STABLE,
        (false, true) => GATE_STABLE,
        (false, false) => STABLE,
    }
}

/// 线宽随稳定度增加, 上限 6px
pub fn track_thickness(track: &Track) -> u32 {
    (3 + track.stability_count / 2).min(6)
}

/// 在帧上绘制轨迹; 未达到稳定阈值的轨迹不画
pub fn annotate(frame: &mut RgbImage, tracks: &[Track], stability_threshold: u32) {
    let (fw, fh) = frame.dimensions();
    for track in tracks.iter().filter(|t| t.is_stable(stability_threshold)) {
        let Some(b) = track.bbox.clamp_to(fw, fh) else {
            continue;
        };
        let color = track_color(track);
        let (x, y) = (b.x1 as i32, b.y1 as i32);
        let (w, h) = (b.width() as u32, b.height() as u32);

        // 逐层向内收缩画出线宽
        for inset in 0..track_thickness(track) {
            let (iw, ih) = (w.saturating_sub(2 * inset), h.saturating_sub(2 * inset));
            if iw == 0 || ih == 0 {
                break;
            }
            let rect = Rect::at(x + inset as i32, y + inset as i32).of_size(iw, ih);
            draw_hollow_rect_mut(frame, rect, color);
        }

        // 左上角标记
        if w > 12 && h > 12 {
            draw_filled_rect_mut(frame, Rect::at(x, y).of_size(12, 12), color);
        }
    }
}
