// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测/分类结果数据结构
/// Data structures for detection and classification results
use serde::{Deserialize, Serialize};

// ========== 公共常量 ==========

/// IoU 分母保护
pub const IOU_EPS: f32 = 1e-6;

// ========== 数据结构 ==========

/// 检测框 (角点形式, 包含端点)
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// 构造时保证 x1<=x2, y1<=y2
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// 中心点形式 → 角点形式
    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// 包含端点的面积
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1 + 1.0).max(0.0) * (self.y2 - self.y1 + 1.0).max(0.0)
    }

    pub fn intersection_area(&self, another: &BoundingBox) -> f32 {
        let l = self.x1.max(another.x1);
        let r = self.x2.min(another.x2);
        let t = self.y1.max(another.y1);
        let b = self.y2.min(another.y2);
        (r - l + 1.).max(0.) * (b - t + 1.).max(0.)
    }

    pub fn union(&self, another: &BoundingBox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &BoundingBox) -> f32 {
        self.intersection_area(another) / (self.union(another) + IOU_EPS)
    }

    /// 截断到图像范围内
    pub fn clip(&self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        Self::new(
            self.x1.clamp(0.0, max_x),
            self.y1.clamp(0.0, max_y),
            self.x2.clamp(0.0, max_x),
            self.y2.clamp(0.0, max_y),
        )
    }

    /// 四周按宽高比例外扩
    pub fn expand(&self, ratio: f32) -> Self {
        let dx = self.width() * ratio;
        let dy = self.height() * ratio;
        Self::new(self.x1 - dx, self.y1 - dy, self.x2 + dx, self.y2 + dy)
    }

    pub fn offset(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    pub fn is_within(&self, width: u32, height: u32) -> bool {
        self.x1 >= 0.0
            && self.y1 >= 0.0
            && self.x2 <= width as f32
            && self.y2 <= height as f32
            && self.x1 <= self.x2
            && self.y1 <= self.y2
    }
}

/// 单个检测记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_id: usize, class_name: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            class_name: class_name.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }
}

/// 单个分类结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
}

/// 检测框区域上的分类结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoiClassification {
    pub bbox: BoundingBox,
    pub predictions: Vec<Classification>,
}

/// 类别名查表, 越界时回落为 class_{id}
pub fn class_name(labels: &[String], id: usize) -> String {
    labels
        .get(id)
        .cloned()
        .unwrap_or_else(|| format!("class_{}", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_symmetric_and_self() {
        let a = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        let b = BoundingBox::new(12.0, 12.0, 52.0, 52.0);
        assert!((a.iou(&b) - b.iou(&a)).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!(a.iou(&b) > 0.8 && a.iou(&b) < 0.9);
    }

    #[test]
    fn test_disjoint_iou_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_new_orders_corners() {
        let b = BoundingBox::new(50.0, 40.0, 10.0, 5.0);
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (10.0, 5.0, 50.0, 40.0));
    }

    #[test]
    fn test_clip_to_frame() {
        let b = BoundingBox::new(-5.0, 3.0, 700.0, 900.0).clip(640, 480);
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (0.0, 3.0, 639.0, 479.0));
        assert!(b.is_within(640, 480));
    }

    #[test]
    fn test_expand_and_class_name() {
        let b = BoundingBox::new(10.0, 10.0, 20.0, 30.0).expand(0.5);
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (5.0, 0.0, 25.0, 40.0));
        let labels = vec!["A".to_string()];
        assert_eq!(class_name(&labels, 0), "A");
        assert_eq!(class_name(&labels, 3), "class_3");
    }
}
