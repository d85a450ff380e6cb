// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 推理前处理: letterbox 缩放 + NCHW 张量

use fast_image_resize as fr;
use image::{imageops, Rgb, RgbImage};
use ndarray::{Array, ArrayD};

use crate::detection::BoundingBox;
use crate::error::{Result, VisionError};

/// YOLO 默认填充色
pub const PAD_COLOR: [u8; 3] = [114, 114, 114];

/// letterbox 参数 (用于把框映射回原图)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub new_width: u32,
    pub new_height: u32,
    pub target_width: u32,
    pub target_height: u32,
}

impl Letterbox {
    pub fn compute(src_w: u32, src_h: u32, target_w: u32, target_h: u32) -> Self {
        let scale = (target_w as f32 / src_w as f32).min(target_h as f32 / src_h as f32);
        let new_width = ((src_w as f32 * scale).round() as u32).clamp(1, target_w);
        let new_height = ((src_h as f32 * scale).round() as u32).clamp(1, target_h);
        Self {
            scale,
            pad_x: (target_w - new_width) / 2,
            pad_y: (target_h - new_height) / 2,
            new_width,
            new_height,
            target_width: target_w,
            target_height: target_h,
        }
    }

    /// letterbox 坐标 → 原图坐标
    pub fn unletterbox(&self, bbox: &BoundingBox) -> BoundingBox {
        let px = self.pad_x as f32;
        let py = self.pad_y as f32;
        BoundingBox::new(
            (bbox.x1 - px) / self.scale,
            (bbox.y1 - py) / self.scale,
            (bbox.x2 - px) / self.scale,
            (bbox.y2 - py) / self.scale,
        )
    }
}

/// 归一化参数: 先 /255, 再按 mean/std 标准化 (可选)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Normalization {
    pub mean: Option<[f32; 3]>,
    pub std: Option<[f32; 3]>,
    /// 保留 0..255 原值 (关闭 normalize 的分类模型)
    pub raw_pixels: bool,
}

/// RGB 图像缩放 (fast_image_resize, 双线性)
pub fn resize_rgb(img: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    if img.dimensions() == (width, height) {
        return Ok(img.clone());
    }
    let src = fr::images::Image::from_vec_u8(
        img.width(),
        img.height(),
        img.as_raw().clone(),
        fr::PixelType::U8x3,
    )
    .map_err(|e| VisionError::InferenceError(format!("缩放源图像无效: {}", e)))?;
    let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )
        .map_err(|e| VisionError::InferenceError(format!("缩放失败: {}", e)))?;

    RgbImage::from_raw(width, height, dst.into_vec())
        .ok_or_else(|| VisionError::InferenceError("缩放结果尺寸不符".into()))
}

/// 保持宽高比缩放, 四周对称填充到目标尺寸
pub fn letterbox(
    img: &RgbImage,
    target_w: u32,
    target_h: u32,
    pad: [u8; 3],
) -> Result<(RgbImage, Letterbox)> {
    let (w0, h0) = img.dimensions();
    if w0 == 0 || h0 == 0 || target_w == 0 || target_h == 0 {
        return Err(VisionError::InferenceError("letterbox 输入尺寸为 0".into()));
    }
    let lb = Letterbox::compute(w0, h0, target_w, target_h);
    let resized = resize_rgb(img, lb.new_width, lb.new_height)?;

    let mut canvas = RgbImage::from_pixel(target_w, target_h, Rgb(pad));
    imageops::replace(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);
    Ok((canvas, lb))
}

/// HWC → NCHW (batch = 1), 像素 /255 后可选 mean/std
pub fn to_nchw(img: &RgbImage, norm: &Normalization) -> ArrayD<f32> {
    let (w, h) = img.dimensions();
    let mut ys = Array::zeros((1, 3, h as usize, w as usize));
    for (x, y, rgb) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        for c in 0..3 {
            let mut v = rgb.0[c] as f32;
            if norm.raw_pixels {
                ys[[0, c, y, x]] = v;
                continue;
            }
            v /= 255.0;
            if let (Some(mean), Some(std)) = (norm.mean, norm.std) {
                v = (v - mean[c]) / std[c];
            }
            ys[[0, c, y, x]] = v;
        }
    }
    ys.into_dyn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_wide_image() {
        let img = RgbImage::from_pixel(640, 320, Rgb([10, 20, 30]));
        let (out, lb) = letterbox(&img, 320, 320, PAD_COLOR).unwrap();
        assert_eq!(out.dimensions(), (320, 320));
        assert_eq!(lb.scale, 0.5);
        assert_eq!((lb.new_width, lb.new_height), (320, 160));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        assert_eq!(out.get_pixel(0, 0).0, PAD_COLOR);
        assert_eq!(out.get_pixel(160, 160).0, [10, 20, 30]);
    }

    #[test]
    fn test_letterbox_single_pixel() {
        let img = RgbImage::from_pixel(1, 1, Rgb([200, 100, 50]));
        let (out, lb) = letterbox(&img, 64, 64, PAD_COLOR).unwrap();
        assert_eq!(lb.scale, 64.0);
        assert_eq!(out.dimensions(), (64, 64));
        let t = to_nchw(&out, &Normalization::default());
        assert_eq!(t.shape(), &[1, 3, 64, 64]);
    }

    #[test]
    fn test_unletterbox_inverts_mapping() {
        let lb = Letterbox::compute(640, 320, 320, 320);
        let b = BoundingBox::new(10.0, 90.0, 110.0, 140.0);
        let o = lb.unletterbox(&b);
        assert_eq!((o.x1, o.y1, o.x2, o.y2), (20.0, 20.0, 220.0, 120.0));
    }

    #[test]
    fn test_nchw_normalization() {
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 0, 51]));
        let t = to_nchw(&img, &Normalization::default());
        assert_eq!(t[[0, 0, 1, 1]], 1.0);
        assert_eq!(t[[0, 1, 0, 0]], 0.0);
        assert!((t[[0, 2, 0, 1]] - 0.2).abs() < 1e-6);

        let norm = Normalization {
            mean: Some([0.5, 0.5, 0.5]),
            std: Some([0.5, 0.5, 0.5]),
            ..Default::default()
        };
        let t = to_nchw(&img, &norm);
        assert_eq!(t[[0, 0, 0, 0]], 1.0);
        assert_eq!(t[[0, 1, 0, 0]], -1.0);

        let raw = Normalization {
            raw_pixels: true,
            ..Default::default()
        };
        assert_eq!(to_nchw(&img, &raw)[[0, 2, 0, 0]], 51.0);
    }
}
