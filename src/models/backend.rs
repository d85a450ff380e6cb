// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 推理引擎接口: 张量进, 张量出

use std::path::Path;

use ndarray::ArrayD;
use tracing::info;

use crate::error::{Result, VisionError};

/// 推理引擎 (ONNX Runtime 或测试替身)
pub trait InferenceBackend: Send {
    /// 执行一次前向, 返回模型全部输出
    fn run(&mut self, input: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>>;

    /// 模型元数据里的类别名 (没有则返回 None)
    fn class_names(&self) -> Option<Vec<String>> {
        None
    }

    fn name(&self) -> &str {
        "backend"
    }
}

/// 按路径加载模型
///
/// 文件不存在 → ModelNotLoaded; 未开启 `onnx` 特性时同样返回 ModelNotLoaded
pub fn load_backend(path: &str) -> Result<Box<dyn InferenceBackend>> {
    if path.is_empty() {
        return Err(VisionError::ModelNotLoaded("未设置模型路径".into()));
    }
    if !Path::new(path).is_file() {
        return Err(VisionError::ModelNotLoaded(format!("模型文件不存在: {}", path)));
    }

    #[cfg(feature = "onnx")]
    {
        let backend = crate::models::ort_backend::OrtBackend::build(path)?;
        info!("✅ 模型加载成功: {}", path);
        Ok(Box::new(backend))
    }

    #[cfg(not(feature = "onnx"))]
    {
        info!("⚠️ 未编译 onnx 支持, 跳过模型 {}", path);
        Err(VisionError::ModelNotLoaded(format!(
            "未编译 onnx 支持, 无法加载 {}",
            path
        )))
    }
}
