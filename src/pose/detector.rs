use anyhow::{Context, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::info;

use super::adapter::InferenceEngine;
use super::landmark::{HandLandmark, HandPose, Landmark};
use super::preprocess::{to_input_tensor, RgbImage};
use crate::config::InferenceConfig;
use crate::error::InferenceError;

/// 手ランドマークモデル (ONNX) を使用した検出器
///
/// 入力: [1, N, N, 3] の f32 テンソル (0.0-1.0)
/// 出力: ランドマーク [1, 63] (x, y, z の入力ピクセル座標) と手の存在スコア [1, 1]
pub struct OnnxHandLandmarker {
    session: Session,
    input_size: u32,
    input_name: String,
    landmarks_output: String,
    score_output: String,
}

impl OnnxHandLandmarker {
    /// ONNXモデルを読み込んで初期化
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(&config.model_path)
            .with_context(|| format!("Failed to load ONNX model {}", config.model_path))?;
        info!(model = %config.model_path, "hand landmark model loaded");

        Ok(Self {
            session,
            input_size: config.input_size,
            input_name: config.input_name.clone(),
            landmarks_output: config.landmarks_output.clone(),
            score_output: config.score_output.clone(),
        })
    }
}

fn engine_error(e: impl std::fmt::Display) -> InferenceError {
    InferenceError::Engine(e.to_string())
}

impl InferenceEngine for OnnxHandLandmarker {
    fn detect(&mut self, image: &RgbImage, _timestamp_us: u64) -> Result<HandPose, InferenceError> {
        let input = to_input_tensor(image, self.input_size);
        let input_tensor = Tensor::from_array(input).map_err(engine_error)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])
            .map_err(engine_error)?;

        let score: ndarray::ArrayViewD<f32> = outputs[self.score_output.as_str()]
            .try_extract_array()
            .map_err(engine_error)?;
        let raw: ndarray::ArrayViewD<f32> = outputs[self.landmarks_output.as_str()]
            .try_extract_array()
            .map_err(engine_error)?;

        let confidence = score.iter().next().copied().unwrap_or(0.0);
        let values: Vec<f32> = raw.iter().copied().collect();
        if values.len() < HandLandmark::COUNT * 3 {
            return Err(InferenceError::Engine(format!(
                "landmark output has {} values",
                values.len()
            )));
        }

        let size = self.input_size as f32;
        let landmarks = values
            .chunks_exact(3)
            .take(HandLandmark::COUNT)
            .map(|p| Landmark::new(p[0] / size, p[1] / size))
            .collect();

        Ok(HandPose::detected(landmarks, confidence))
    }
}
