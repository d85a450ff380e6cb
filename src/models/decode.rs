// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 通用检测输出解码
//
// 支持的输出形式:
// - 4 个张量 [count, boxes, scores, classes]      (TF / 带 NMS 的导出)
// - 单张量 N×6 / N×7                             (已 NMS, N×7 首列为 batch id)
// - 单张量 N×(5+C)                               (YOLOv5 原始输出, 需要 NMS)
// - 单张量 (4+C)×N / (5+C)×N                     (YOLOv8 锚点优先布局, 转置后处理)

use ndarray::{Array2, ArrayD, Axis};

use crate::detection::{class_name, non_max_suppression, BoundingBox, Classification, Detection};
use crate::error::{Result, VisionError};

/// 解码参数
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions<'a> {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub labels: &'a [String],
}

/// 识别出的输出布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    CountBoxesScoresClasses,
    Final { batch_column: bool },
    Raw { objectness: bool, transposed: bool },
}

/// 去掉前导维度, 变成 rows × cols 矩阵
fn as_matrix(t: &ArrayD<f32>) -> Result<Array2<f32>> {
    let cols = *t
        .shape()
        .last()
        .ok_or_else(|| VisionError::InferenceError("输出张量维度为 0".into()))?;
    if cols == 0 {
        return Ok(Array2::zeros((0, 0)));
    }
    let rows = t.len() / cols;
    t.to_shape((rows, cols))
        .map(|m| m.to_owned())
        .map_err(|e| VisionError::InferenceError(format!("输出形状无法解释: {}", e)))
}

/// 根据张量个数与形状判断布局
pub fn detect_layout(outputs: &[ArrayD<f32>], num_classes: usize) -> Result<OutputLayout> {
    match outputs.len() {
        0 => Err(VisionError::InferenceError("模型没有输出".into())),
        4 => Ok(OutputLayout::CountBoxesScoresClasses),
        _ => {
            let m = as_matrix(&outputs[0])?;
            let (rows, cols) = m.dim();
            if cols == 6 || cols == 7 {
                return Ok(OutputLayout::Final {
                    batch_column: cols == 7,
                });
            }
            // 类别数已知时按精确列数/行数匹配
            if num_classes > 0 {
                if cols == 5 + num_classes || cols == 4 + num_classes {
                    return Ok(OutputLayout::Raw {
                        objectness: cols == 5 + num_classes,
                        transposed: false,
                    });
                }
                if rows == 5 + num_classes || rows == 4 + num_classes {
                    return Ok(OutputLayout::Raw {
                        objectness: rows == 5 + num_classes,
                        transposed: true,
                    });
                }
            }
            // 行数少于列数: 锚点在最后一维 (YOLOv8 的 [1, 4+C, 8400])
            Ok(OutputLayout::Raw {
                objectness: rows >= cols,
                transposed: rows < cols,
            })
        }
    }
}

/// 解码为 letterbox 坐标系下的检测框 (已过置信度阈值, 原始输出已做 NMS)
pub fn decode_detections(outputs: &[ArrayD<f32>], opts: &DecodeOptions) -> Result<Vec<Detection>> {
    let layout = detect_layout(outputs, opts.labels.len())?;
    let mut ys = match layout {
        OutputLayout::CountBoxesScoresClasses => decode_four(outputs, opts)?,
        OutputLayout::Final { batch_column } => {
            decode_final(&as_matrix(&outputs[0])?, batch_column, opts)
        }
        OutputLayout::Raw {
            objectness,
            transposed,
        } => {
            let m = as_matrix(&outputs[0])?;
            let m = if transposed { m.reversed_axes() } else { m };
            let mut ys = decode_raw(&m, objectness, opts);
            non_max_suppression(&mut ys, opts.iou_threshold);
            ys
        }
    };
    ys.retain(|d| d.confidence >= opts.conf_threshold);
    Ok(ys)
}

fn decode_four(outputs: &[ArrayD<f32>], opts: &DecodeOptions) -> Result<Vec<Detection>> {
    let count = outputs[0].iter().next().copied().unwrap_or(0.0).max(0.0) as usize;
    let boxes = as_matrix(&outputs[1])?;
    if boxes.ncols() != 4 {
        return Err(VisionError::InferenceError(format!(
            "boxes 张量最后一维应为 4, 实际 {}",
            boxes.ncols()
        )));
    }
    let scores: Vec<f32> = outputs[2].iter().copied().collect();
    let classes: Vec<f32> = outputs[3].iter().copied().collect();
    let n = count.min(boxes.nrows()).min(scores.len()).min(classes.len());

    let mut ys = Vec::with_capacity(n);
    for i in 0..n {
        let b = boxes.row(i);
        let id = classes[i].max(0.0) as usize;
        ys.push(Detection::new(
            id,
            class_name(opts.labels, id),
            scores[i],
            BoundingBox::new(b[0], b[1], b[2], b[3]),
        ));
    }
    Ok(ys)
}

fn decode_final(m: &Array2<f32>, batch_column: bool, opts: &DecodeOptions) -> Vec<Detection> {
    let off = usize::from(batch_column);
    m.axis_iter(Axis(0))
        .filter_map(|row| {
            let confidence = row[off + 4];
            if confidence < opts.conf_threshold {
                return None;
            }
            let id = row[off + 5].max(0.0) as usize;
            Some(Detection::new(
                id,
                class_name(opts.labels, id),
                confidence,
                BoundingBox::new(row[off], row[off + 1], row[off + 2], row[off + 3]),
            ))
        })
        .collect()
}

fn decode_raw(m: &Array2<f32>, objectness: bool, opts: &DecodeOptions) -> Vec<Detection> {
    const CXYWH_OFFSET: usize = 4;
    let cls_offset = CXYWH_OFFSET + usize::from(objectness);
    if m.ncols() <= cls_offset {
        return Vec::new();
    }

    let mut ys = Vec::new();
    for pred in m.axis_iter(Axis(0)) {
        let obj = if objectness { pred[CXYWH_OFFSET] } else { 1.0 };
        let (id, &prob) = match pred
            .iter()
            .skip(cls_offset)
            .enumerate()
            .reduce(|max, x| if x.1 > max.1 { x } else { max })
        {
            Some(best) => best,
            None => continue,
        };
        let confidence = obj * prob;
        if confidence < opts.conf_threshold {
            continue;
        }
        ys.push(Detection::new(
            id,
            class_name(opts.labels, id),
            confidence,
            BoundingBox::from_cxcywh(pred[0], pred[1], pred[2], pred[3]),
        ));
    }
    ys
}

/// 数值稳定的 softmax
pub fn softmax(xs: &[f32]) -> Vec<f32> {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = xs.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; xs.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

/// 取概率最高的 k 个 (大于阈值), 按置信度降序; k 超过类别数时返回全部类别
pub fn top_k(probs: &[f32], k: usize, threshold: f32, labels: &[String]) -> Vec<Classification> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed
        .into_iter()
        .filter(|(_, p)| *p >= threshold)
        .take(k)
        .map(|(id, confidence)| Classification {
            class_id: id,
            class_name: class_name(labels, id),
            confidence,
        })
        .collect()
}
