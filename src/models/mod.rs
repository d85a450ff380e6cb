// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 模型接口与前后处理
///
/// # 架构说明
///
/// 推理引擎本身是外部协作者, 这里只约定它的形状:
/// ```text
/// 原始帧 → preprocess (letterbox + NCHW) → InferenceBackend::run
///        → decode (通用输出解码 + NMS) → 检测结果
/// ```
/// - `backend`:     InferenceBackend trait + 按路径加载
/// - `ort_backend`: ONNX Runtime 实现 (特性 `onnx`)
/// - `preprocess`:  letterbox / 归一化 / NCHW
/// - `decode`:      检测输出解码, softmax, top-k
pub mod backend;
pub mod decode;
#[cfg(feature = "onnx")]
pub mod ort_backend;
pub mod preprocess;

pub use backend::{load_backend, InferenceBackend};
pub use decode::{decode_detections, softmax, top_k, DecodeOptions, OutputLayout};
pub use preprocess::{letterbox, resize_rgb, to_nchw, Letterbox, Normalization, PAD_COLOR};
