// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测结果类型 (Detection Types)
///
/// - BoundingBox:    角点形式检测框, IoU / 截断 / 外扩
/// - Detection:      单个检测记录
/// - Classification: 单个分类结果
pub mod types;

pub use types::{class_name, BoundingBox, Classification, Detection, RoiClassification};

/// 非极大值抑制
///
/// 按置信度降序 (同分保持插入顺序) 贪心保留, 与已保留框 IoU 超过阈值的丢弃
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].bbox.iou(&xs[index].bbox);
            if iou > iou_threshold {
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
