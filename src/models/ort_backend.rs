// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 后端 (CPU EP)

use ndarray::ArrayD;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

use super::backend::InferenceBackend;
use crate::error::{Result, VisionError};

fn model_err(e: impl std::fmt::Display) -> VisionError {
    VisionError::ModelNotLoaded(e.to_string())
}

fn infer_err(e: impl std::fmt::Display) -> VisionError {
    VisionError::InferenceError(e.to_string())
}

pub struct OrtBackend {
    session: Session,
    path: String,
}

impl OrtBackend {
    pub fn build(path: &str) -> Result<Self> {
        let builder = Session::builder().map_err(model_err)?;
        let builder = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_err)?;
        let session = builder.commit_from_file(path).map_err(model_err)?;
        Ok(Self {
            session,
            path: path.to_string(),
        })
    }
}

impl InferenceBackend for OrtBackend {
    fn run(&mut self, input: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
        let tensor = TensorRef::from_array_view(input.view()).map_err(infer_err)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(infer_err)?;

        let mut ys = Vec::with_capacity(outputs.len());
        for (_, value) in outputs.iter() {
            let array = value.try_extract_array::<f32>().map_err(infer_err)?;
            ys.push(array.into_owned());
        }
        Ok(ys)
    }

    fn name(&self) -> &str {
        &self.path
    }
}
