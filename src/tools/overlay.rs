// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 结果叠加绘制: 检测框 / 标签 / 检测区域 / OK-NG 角标
// 只在配置了字体文件时绘制文字

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::warn;

use crate::detection::{BoundingBox, Detection};

pub const OK_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
pub const NG_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
pub const REGION_COLOR: Rgb<u8> = Rgb([255, 200, 0]);

/// 绘制参数
#[derive(Clone, Default)]
pub struct OverlayStyle {
    pub line_width: u32,
    pub show_labels: bool,
    pub show_confidence: bool,
    pub font: Option<FontArc>,
    pub font_size: f32,
}

/// 读取字体文件, 失败返回 None (只画框)
pub fn load_font(path: &str) -> Option<FontArc> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            warn!("⚠️ 字体文件读取失败 {}: {}", path, e);
            return None;
        }
    };
    match FontArc::try_from_vec(bytes) {
        Ok(font) => Some(font),
        Err(e) => {
            warn!("⚠️ 字体解析失败 {}: {}", path, e);
            None
        }
    }
}

/// 类别颜色 (黄金角度采样色相)
pub fn class_color(class_id: usize) -> Rgb<u8> {
    let hue = (class_id as f32 * 137.508) % 360.0;
    let (r, g, b) = hsv_to_rgb(hue, 0.8, 0.9);
    Rgb([r, g, b])
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = match h as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    )
}

fn to_rect(bbox: &BoundingBox, inset: i32) -> Option<Rect> {
    let x = bbox.x1.round() as i32 + inset;
    let y = bbox.y1.round() as i32 + inset;
    let w = (bbox.width().round() as i32 - 2 * inset).max(0) as u32;
    let h = (bbox.height().round() as i32 - 2 * inset).max(0) as u32;
    (w > 0 && h > 0).then(|| Rect::at(x, y).of_size(w, h))
}

/// 画空心框, 线宽通过向内缩进叠画实现
pub fn draw_box(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, line_width: u32) {
    for i in 0..line_width.max(1) as i32 {
        if let Some(rect) = to_rect(bbox, i) {
            draw_hollow_rect_mut(img, rect, color);
        }
    }
}

/// 带底色的文字标签 (左上角在 x, y)
pub fn draw_label(
    img: &mut RgbImage,
    x: i32,
    y: i32,
    text: &str,
    color: Rgb<u8>,
    font: &FontArc,
    size: f32,
) {
    let scale = PxScale::from(size);
    let width = (text.chars().count() as f32 * size * 0.6).ceil().max(1.0) as u32;
    let height = size.ceil().max(1.0) as u32;
    draw_filled_rect_mut(img, Rect::at(x, y).of_size(width, height), color);
    draw_text_mut(img, Rgb([255, 255, 255]), x, y, scale, font, text);
}

pub fn draw_detections(img: &mut RgbImage, detections: &[Detection], style: &OverlayStyle) {
    for d in detections {
        let color = class_color(d.class_id);
        draw_box(img, &d.bbox, color, style.line_width);

        let Some(font) = style.font.as_ref() else {
            continue;
        };
        if !style.show_labels {
            continue;
        }
        let text = if style.show_confidence {
            format!("{} {:.2}", d.class_name, d.confidence)
        } else {
            d.class_name.clone()
        };
        let y = (d.bbox.y1 - style.font_size).max(0.0) as i32;
        draw_label(img, d.bbox.x1 as i32, y, &text, color, font, style.font_size);
    }
}

/// 检测区域外框
pub fn draw_region(img: &mut RgbImage, region: &BoundingBox) {
    draw_box(img, region, REGION_COLOR, 1);
}

/// 右上角 OK/NG 角标
pub fn draw_badge(img: &mut RgbImage, ok: bool, style: &OverlayStyle) {
    let color = if ok { OK_COLOR } else { NG_COLOR };
    let (w, h) = img.dimensions();
    let badge_w = (w / 8).clamp(1, 120);
    let badge_h = (h / 12).clamp(1, 60);
    let x = w.saturating_sub(badge_w) as i32;
    draw_filled_rect_mut(img, Rect::at(x, 0).of_size(badge_w, badge_h), color);

    if let Some(font) = style.font.as_ref() {
        let text = if ok { "OK" } else { "NG" };
        let size = (badge_h as f32 * 0.8).max(8.0);
        draw_text_mut(
            img,
            Rgb([255, 255, 255]),
            x + 4,
            0,
            PxScale::from(size),
            font,
            text,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_drawn_on_edges_only() {
        let mut img = RgbImage::new(20, 20);
        let bbox = BoundingBox::new(2.0, 2.0, 12.0, 12.0);
        draw_box(&mut img, &bbox, Rgb([255, 0, 0]), 1);
        assert_eq!(img.get_pixel(2, 2).0, [255, 0, 0]);
        assert_eq!(img.get_pixel(7, 7).0, [0, 0, 0]);
    }

    #[test]
    fn test_badge_colors() {
        let style = OverlayStyle::default();
        let mut img = RgbImage::new(80, 60);
        draw_badge(&mut img, true, &style);
        assert_eq!(*img.get_pixel(79, 0), OK_COLOR);

        draw_badge(&mut img, false, &style);
        assert_eq!(*img.get_pixel(79, 0), NG_COLOR);
        assert_eq!(img.get_pixel(0, 59).0, [0, 0, 0]);
    }

    #[test]
    fn test_class_colors_differ() {
        assert_ne!(class_color(0), class_color(1));
    }
}
