// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 帧数据结构 (相机 → 执行器 / 回看环)
//!
//! 像素字节序只看缓冲区的实际通道数,不看相机报告的格式名:
//! - 3 通道一律按 BGR (IMX296 上 "RGB888" 输出的也是 BGR 字节)
//! - 4 通道一律按 BGRA (XRGB8888 / XBGR8888)
//! - 1 通道为灰度

use std::sync::Arc;
use std::time::Instant;

use image::{imageops, GrayImage, ImageBuffer, Luma, Pixel, Rgb, RgbImage, Rgba};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VisionError};

/// 像素排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    Bgr,
    Bgra,
    Gray,
    /// 仅用于工具生成的标注图
    Rgb,
}

impl PixelLayout {
    pub fn channels(&self) -> u8 {
        match self {
            PixelLayout::Bgr | PixelLayout::Rgb => 3,
            PixelLayout::Bgra => 4,
            PixelLayout::Gray => 1,
        }
    }

    /// 由实际通道数推断相机帧的排列
    pub fn from_camera_channels(channels: usize) -> Option<Self> {
        match channels {
            1 => Some(PixelLayout::Gray),
            3 => Some(PixelLayout::Bgr),
            4 => Some(PixelLayout::Bgra),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelLayout::Bgr => "BGR",
            PixelLayout::Bgra => "BGRA",
            PixelLayout::Gray => "GRAY",
            PixelLayout::Rgb => "RGB",
        }
    }
}

/// 图像旋转角度 (只允许 0/90/180/270)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }

    /// 顺时针再转 90°
    pub fn rotated_cw(&self) -> Self {
        match self {
            Rotation::R0 => Rotation::R90,
            Rotation::R90 => Rotation::R180,
            Rotation::R180 => Rotation::R270,
            Rotation::R270 => Rotation::R0,
        }
    }
}

impl TryFrom<u32> for Rotation {
    type Error = VisionError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Rotation::R0),
            90 => Ok(Rotation::R90),
            180 => Ok(Rotation::R180),
            270 => Ok(Rotation::R270),
            other => Err(VisionError::rejected(
                "rotation",
                format!("{} 不是 0/90/180/270", other),
            )),
        }
    }
}

impl From<Rotation> for u32 {
    fn from(r: Rotation) -> u32 {
        r.degrees()
    }
}

/// 相机返回的元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub exposure_us: Option<u32>,
    pub analogue_gain: Option<f32>,
    /// 相机报告的格式名 (可能与实际字节序不一致)
    pub reported_format: Option<String>,
}

/// 一帧图像, 发出后不可变; clone 只增加引用计数
#[derive(Clone)]
pub struct Frame {
    data: Arc<Vec<u8>>,
    width: u32,
    height: u32,
    layout: PixelLayout,
    captured_at: Instant,
    sequence: u64,
    metadata: Option<FrameMetadata>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    /// 按给定排列创建, 缓冲区长度必须等于 w*h*c
    pub fn new(data: Vec<u8>, width: u32, height: u32, layout: PixelLayout) -> Result<Self> {
        let expected = width as usize * height as usize * layout.channels() as usize;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(VisionError::rejected(
                "frame",
                format!(
                    "缓冲区 {} 字节与 {}x{}x{} 不符",
                    data.len(),
                    width,
                    height,
                    layout.channels()
                ),
            ));
        }
        Ok(Self {
            data: Arc::new(data),
            width,
            height,
            layout,
            captured_at: Instant::now(),
            sequence: 0,
            metadata: None,
        })
    }

    /// 从相机缓冲区创建, 字节序由实际通道数决定
    ///
    /// YUV420/NV12 的平面缓冲 (w*h*3/2 字节) 只保留亮度平面
    pub fn from_camera_buffer(
        data: Vec<u8>,
        width: u32,
        height: u32,
        reported_format: &str,
    ) -> Result<Self> {
        let pixels = width as usize * height as usize;
        if pixels == 0 {
            return Err(VisionError::rejected("frame", "尺寸为 0"));
        }

        let mut data = data;
        if data.len() == pixels * 3 / 2 && pixels % 2 == 0 {
            data.truncate(pixels);
        }
        if data.len() % pixels != 0 {
            return Err(VisionError::rejected(
                "frame",
                format!("缓冲区 {} 字节不是 {}x{} 的整数倍", data.len(), width, height),
            ));
        }
        let channels = data.len() / pixels;
        let layout = PixelLayout::from_camera_channels(channels).ok_or_else(|| {
            VisionError::rejected("frame", format!("不支持的通道数 {}", channels))
        })?;

        let mut frame = Self::new(data, width, height, layout)?;
        frame.metadata = Some(FrameMetadata {
            reported_format: Some(reported_format.to_string()),
            ..Default::default()
        });
        Ok(frame)
    }

    pub fn from_rgb_image(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            data: Arc::new(img.into_raw()),
            width,
            height,
            layout: PixelLayout::Rgb,
            captured_at: Instant::now(),
            sequence: 0,
            metadata: None,
        }
    }

    /// 黑色占位帧
    pub fn black(width: u32, height: u32) -> Self {
        Self::from_rgb_image(RgbImage::new(width.max(1), height.max(1)))
    }

    /// 打上序号与时间戳 (只在发出前调用)
    pub fn stamped(mut self, sequence: u64, captured_at: Instant) -> Self {
        self.sequence = sequence;
        self.captured_at = captured_at;
        self
    }

    pub fn with_metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// 派生帧沿用源帧的序号/时间戳/元数据
    pub fn derived_from(mut self, source: &Frame) -> Self {
        self.sequence = source.sequence;
        self.captured_at = source.captured_at;
        self.metadata = source.metadata.clone();
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.layout.channels()
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn metadata(&self) -> Option<&FrameMetadata> {
        self.metadata.as_ref()
    }

    /// 声明的形状与缓冲区长度一致
    pub fn is_consistent(&self) -> bool {
        self.data.len()
            == self.width as usize * self.height as usize * self.layout.channels() as usize
    }

    pub fn shares_buffer(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// 像素内容相同 (忽略序号与时间戳)
    pub fn pixels_eq(&self, other: &Frame) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.layout == other.layout
            && (self.shares_buffer(other) || self.data == other.data)
    }

    /// 转成显示/推理用的 RGB 图像
    pub fn to_rgb_image(&self) -> RgbImage {
        let rgb: Vec<u8> = match self.layout {
            PixelLayout::Rgb => self.data.as_ref().clone(),
            PixelLayout::Bgr => self
                .data
                .chunks_exact(3)
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect(),
            PixelLayout::Bgra => self
                .data
                .chunks_exact(4)
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect(),
            PixelLayout::Gray => self.data.iter().flat_map(|&g| [g, g, g]).collect(),
        };
        RgbImage::from_raw(self.width, self.height, rgb)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// 转成 BGR 字节 (分类器关闭 RGB 转换时使用)
    pub fn to_bgr_image(&self) -> RgbImage {
        let mut img = self.to_rgb_image();
        for p in img.pixels_mut() {
            p.0.swap(0, 2);
        }
        img
    }

    pub fn to_gray_image(&self) -> GrayImage {
        match self.layout {
            PixelLayout::Gray => GrayImage::from_raw(self.width, self.height, self.data.to_vec())
                .unwrap_or_else(|| GrayImage::new(self.width, self.height)),
            _ => image::DynamicImage::ImageRgb8(self.to_rgb_image()).into_luma8(),
        }
    }

    /// 裁剪 (超出部分截断), 结果至少 1x1
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Frame {
        let x = x.min(self.width - 1);
        let y = y.min(self.height - 1);
        let width = width.clamp(1, self.width - x);
        let height = height.clamp(1, self.height - y);

        let raw = self.data.as_ref().clone();
        let (w, h, data) = match self.layout.channels() {
            1 => crop_raw::<Luma<u8>>(self.width, self.height, raw, x, y, width, height),
            4 => crop_raw::<Rgba<u8>>(self.width, self.height, raw, x, y, width, height),
            _ => crop_raw::<Rgb<u8>>(self.width, self.height, raw, x, y, width, height),
        };
        self.rebuilt(w, h, data)
    }

    /// 旋转 (顺时针)
    pub fn rotate(&self, rotation: Rotation) -> Frame {
        if rotation == Rotation::R0 {
            return self.clone();
        }
        let raw = self.data.as_ref().clone();
        let (w, h, data) = match self.layout.channels() {
            1 => rotate_raw::<Luma<u8>>(self.width, self.height, raw, rotation),
            4 => rotate_raw::<Rgba<u8>>(self.width, self.height, raw, rotation),
            _ => rotate_raw::<Rgb<u8>>(self.width, self.height, raw, rotation),
        };
        self.rebuilt(w, h, data)
    }

    fn rebuilt(&self, width: u32, height: u32, data: Vec<u8>) -> Frame {
        Frame {
            data: Arc::new(data),
            width,
            height,
            layout: self.layout,
            captured_at: self.captured_at,
            sequence: self.sequence,
            metadata: self.metadata.clone(),
        }
    }
}

fn crop_raw<P>(
    w: u32,
    h: u32,
    data: Vec<u8>,
    x: u32,
    y: u32,
    cw: u32,
    ch: u32,
) -> (u32, u32, Vec<u8>)
where
    P: Pixel<Subpixel = u8> + 'static,
{
    match ImageBuffer::<P, Vec<u8>>::from_raw(w, h, data) {
        Some(img) => {
            let out = imageops::crop_imm(&img, x, y, cw, ch).to_image();
            (out.width(), out.height(), out.into_raw())
        }
        None => (cw, ch, vec![0; (cw * ch) as usize * P::CHANNEL_COUNT as usize]),
    }
}

fn rotate_raw<P>(w: u32, h: u32, data: Vec<u8>, rotation: Rotation) -> (u32, u32, Vec<u8>)
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let img = match ImageBuffer::<P, Vec<u8>>::from_raw(w, h, data) {
        Some(img) => img,
        None => return (w, h, vec![0; (w * h) as usize * P::CHANNEL_COUNT as usize]),
    };
    let out = match rotation {
        Rotation::R0 => img,
        Rotation::R90 => imageops::rotate90(&img),
        Rotation::R180 => imageops::rotate180(&img),
        Rotation::R270 => imageops::rotate270(&img),
    };
    (out.width(), out.height(), out.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgra_labelled_xbgr_converts_as_bgra() {
        // 2x1 BGRA
        let data = vec![10, 20, 30, 255, 40, 50, 60, 0];
        let frame = Frame::from_camera_buffer(data, 2, 1, "XBGR8888").unwrap();
        assert_eq!(frame.layout(), PixelLayout::Bgra);
        assert_eq!(frame.to_rgb_image().into_raw(), vec![30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn test_rgb888_is_still_bgr_bytes() {
        let data = vec![1, 2, 3, 4, 5, 6];
        let frame = Frame::from_camera_buffer(data, 2, 1, "RGB888").unwrap();
        assert_eq!(frame.layout(), PixelLayout::Bgr);
        assert_eq!(frame.to_rgb_image().into_raw(), vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_gray_replicates() {
        let frame = Frame::from_camera_buffer(vec![7, 9], 2, 1, "YUV420").unwrap();
        assert_eq!(frame.layout(), PixelLayout::Gray);
        assert_eq!(frame.to_rgb_image().into_raw(), vec![7, 7, 7, 9, 9, 9]);
    }

    #[test]
    fn test_yuv_planar_keeps_luma() {
        // 2x2 亮度 + 2 字节色度
        let data = vec![1, 2, 3, 4, 128, 128];
        let frame = Frame::from_camera_buffer(data, 2, 2, "YUV420").unwrap();
        assert_eq!(frame.channels(), 1);
        assert_eq!(frame.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(Frame::from_camera_buffer(vec![0; 10], 2, 2, "RGB888").is_err());
        assert!(Frame::from_camera_buffer(vec![0; 8], 2, 2, "RGB888").is_err()); // 2 通道
        assert!(Frame::new(vec![0; 5], 2, 1, PixelLayout::Bgr).is_err());
    }

    #[test]
    fn test_rotate_and_crop() {
        // 3x2 灰度
        let frame = Frame::new(vec![1, 2, 3, 4, 5, 6], 3, 2, PixelLayout::Gray).unwrap();
        let r = frame.rotate(Rotation::R90);
        assert_eq!((r.width(), r.height()), (2, 3));
        assert_eq!(r.data(), &[4, 1, 5, 2, 6, 3]);

        let c = frame.crop(1, 0, 5, 5);
        assert_eq!((c.width(), c.height()), (2, 2));
        assert_eq!(c.data(), &[2, 3, 5, 6]);
        assert!(c.is_consistent());
    }

    #[test]
    fn test_rotation_serde_degrees() {
        let r: Rotation = serde_json::from_str("270").unwrap();
        assert_eq!(r, Rotation::R270);
        assert!(serde_json::from_str::<Rotation>("45").is_err());
        assert_eq!(serde_json::to_string(&Rotation::R90).unwrap(), "90");
    }
}
