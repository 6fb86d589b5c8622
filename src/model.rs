// 该文件是 Guoyuan （果园） 项目的一部分。
// src/model.rs - 模型与推理调用
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use thiserror::Error;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  reaper::Reaper,
  tensor::{Tensor, TensorShape},
};

mod manifest;
pub use self::manifest::{FRUIT_LABELS, ManifestError, ModelManifest};

mod replay;
pub use self::replay::{ReplayModel, ReplayModelError};

#[cfg(feature = "model_yolo26")]
mod yolo26;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{Yolo26, Yolo26Error};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("输入形状不匹配: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch {
    expected: TensorShape,
    actual: TensorShape,
  },
  #[error("计算后端不可用: {0}")]
  BackendUnavailable(String),
  #[error("推理后端错误: {0}")]
  Backend(String),
  #[error("模型输出格式错误: {0}")]
  MalformedOutput(String),
}

/// 模型声明的输入输出契约
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSignature {
  pub input: TensorShape,
  pub max_detections: usize,
}

/// 模型一次推理的原始输出：`boxes[N][4]`、`scores[N]`、`classes[N]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelOutput {
  pub boxes: Vec<f32>,
  pub scores: Vec<f32>,
  pub classes: Vec<f32>,
}

pub trait Model {
  fn signature(&self) -> ModelSignature;

  /// 初始化计算后端，在打开摄像头时调用
  fn load(&mut self) -> Result<(), InferenceError> {
    Ok(())
  }

  /// 释放计算后端，在回到 Idle 时调用
  fn unload(&mut self) {}

  fn infer(&self, input: &Tensor) -> Result<ModelOutput, InferenceError>;
}

impl<M: Model + ?Sized> Model for Box<M> {
  fn signature(&self) -> ModelSignature {
    (**self).signature()
  }

  fn load(&mut self) -> Result<(), InferenceError> {
    (**self).load()
  }

  fn unload(&mut self) {
    (**self).unload()
  }

  fn infer(&self, input: &Tensor) -> Result<ModelOutput, InferenceError> {
    (**self).infer(input)
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
  pub bbox: [f32; 4], // [y0, x0, y1, x1]，归一化坐标
  pub score: f32,
  pub class_index: i64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawDetectionBatch {
  pub items: Box<[RawDetection]>,
}

impl RawDetectionBatch {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &RawDetection> {
    self.items.iter()
  }
}

impl FromIterator<RawDetection> for RawDetectionBatch {
  fn from_iter<I: IntoIterator<Item = RawDetection>>(iter: I) -> Self {
    Self {
      items: iter.into_iter().collect(),
    }
  }
}

/// 推理调用器：持有模型和后端状态，负责形状检查和输出张量的回收
pub struct Invoker<M> {
  model: M,
  reaper: Reaper,
  loaded: bool,
}

impl<M: Model> Invoker<M> {
  pub fn new(model: M, reaper: Reaper) -> Self {
    Self {
      model,
      reaper,
      loaded: false,
    }
  }

  pub fn signature(&self) -> ModelSignature {
    self.model.signature()
  }

  pub fn is_loaded(&self) -> bool {
    self.loaded
  }

  pub fn acquire_backend(&mut self) -> Result<(), InferenceError> {
    if self.loaded {
      return Ok(());
    }
    info!("初始化推理后端");
    self.model.load()?;
    self.loaded = true;
    Ok(())
  }

  pub fn release_backend(&mut self) {
    if self.loaded {
      info!("释放推理后端");
      self.model.unload();
      self.loaded = false;
    }
  }

  /// 启动前检查预处理目标形状与模型声明是否一致
  pub fn check_input(&self, shape: TensorShape) -> Result<(), InferenceError> {
    let expected = self.model.signature().input;
    if expected != shape {
      warn!("预处理形状 {} 与模型输入 {} 不一致", shape, expected);
      return Err(InferenceError::ShapeMismatch {
        expected,
        actual: shape,
      });
    }
    Ok(())
  }

  pub fn infer(&self, input: &Tensor) -> Result<RawDetectionBatch, InferenceError> {
    if !self.loaded {
      return Err(InferenceError::BackendUnavailable(
        "后端尚未初始化".to_string(),
      ));
    }
    self.check_input(input.shape())?;

    let signature = self.model.signature();
    let output = self.reaper.acquire(self.model.infer(input)?);
    let batch = decode_output(&output, signature.max_detections)?;
    output.release();

    debug!("模型返回 {} 个候选", batch.len());
    Ok(batch)
  }
}

fn decode_output(
  output: &ModelOutput,
  max_detections: usize,
) -> Result<RawDetectionBatch, InferenceError> {
  let n = output.scores.len();
  if n > max_detections {
    return Err(InferenceError::MalformedOutput(format!(
      "候选数量 {} 超过声明的最大值 {}",
      n, max_detections
    )));
  }
  if output.boxes.len() != n * 4 || output.classes.len() != n {
    return Err(InferenceError::MalformedOutput(format!(
      "输出长度不一致: boxes={}, scores={}, classes={}",
      output.boxes.len(),
      n,
      output.classes.len()
    )));
  }

  Ok(
    output
      .boxes
      .chunks_exact(4)
      .zip(output.scores.iter().zip(output.classes.iter()))
      .map(|(bbox, (&score, &class))| RawDetection {
        bbox: [bbox[0], bbox[1], bbox[2], bbox[3]],
        score,
        class_index: class_index(class),
      })
      .collect(),
  )
}

/// 类别必须是精确的整数，否则记为 -1，由后处理丢弃
fn class_index(class: f32) -> i64 {
  if class.is_finite() && class.fract() == 0.0 && class.abs() < i64::MAX as f32 {
    class as i64
  } else {
    trace!("非整数类别 {}", class);
    -1
  }
}

pub enum ModelWrapper {
  Replay(ReplayModel),
  #[cfg(feature = "model_yolo26")]
  Yolo26(Yolo26),
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("回放模型错误: {0}")]
  ReplayModelError(#[from] ReplayModelError),
  #[cfg(feature = "model_yolo26")]
  #[error("YOLO26 模型错误: {0}")]
  Yolo26Error(#[from] Yolo26Error),
  #[error("清单错误: {0}")]
  ManifestError(#[from] ManifestError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrl for ModelWrapper {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ReplayModel::SCHEME => Ok(ModelWrapper::Replay(ReplayModel::from_url(url)?)),
      #[cfg(feature = "model_yolo26")]
      Yolo26::SCHEME => Ok(ModelWrapper::Yolo26(Yolo26::from_url(url)?)),
      other => Err(ModelError::SchemeMismatch(other.to_string())),
    }
  }
}

impl ModelWrapper {
  /// 与模型一同声明的类别名称
  pub fn class_names(&self) -> &[String] {
    match self {
      ModelWrapper::Replay(model) => model.class_names(),
      #[cfg(feature = "model_yolo26")]
      ModelWrapper::Yolo26(model) => model.class_names(),
    }
  }
}

impl Model for ModelWrapper {
  fn signature(&self) -> ModelSignature {
    match self {
      ModelWrapper::Replay(model) => model.signature(),
      #[cfg(feature = "model_yolo26")]
      ModelWrapper::Yolo26(model) => model.signature(),
    }
  }

  fn load(&mut self) -> Result<(), InferenceError> {
    match self {
      ModelWrapper::Replay(model) => model.load(),
      #[cfg(feature = "model_yolo26")]
      ModelWrapper::Yolo26(model) => model.load(),
    }
  }

  fn unload(&mut self) {
    match self {
      ModelWrapper::Replay(model) => model.unload(),
      #[cfg(feature = "model_yolo26")]
      ModelWrapper::Yolo26(model) => model.unload(),
    }
  }

  fn infer(&self, input: &Tensor) -> Result<ModelOutput, InferenceError> {
    match self {
      ModelWrapper::Replay(model) => model.infer(input),
      #[cfg(feature = "model_yolo26")]
      ModelWrapper::Yolo26(model) => model.infer(input),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Fixed {
    output: ModelOutput,
  }

  impl Model for Fixed {
    fn signature(&self) -> ModelSignature {
      ModelSignature {
        input: TensorShape::rgb_input(4, 4),
        max_detections: 2,
      }
    }

    fn infer(&self, _input: &Tensor) -> Result<ModelOutput, InferenceError> {
      Ok(self.output.clone())
    }
  }

  fn fixed(output: ModelOutput) -> Invoker<Fixed> {
    Invoker::new(Fixed { output }, Reaper::new())
  }

  #[test]
  fn infer_requires_loaded_backend() {
    let invoker = fixed(ModelOutput::default());
    let input = Tensor::zeros(TensorShape::rgb_input(4, 4)).unwrap();
    assert!(matches!(
      invoker.infer(&input),
      Err(InferenceError::BackendUnavailable(_))
    ));
  }

  #[test]
  fn infer_rejects_wrong_shape() {
    let mut invoker = fixed(ModelOutput::default());
    invoker.acquire_backend().unwrap();
    let input = Tensor::zeros(TensorShape::rgb_input(8, 8)).unwrap();
    assert_eq!(
      invoker.infer(&input).unwrap_err(),
      InferenceError::ShapeMismatch {
        expected: TensorShape::rgb_input(4, 4),
        actual: TensorShape::rgb_input(8, 8),
      }
    );
  }

  #[test]
  fn infer_copies_outputs_and_releases_them() {
    let reaper = Reaper::new();
    let mut invoker = Invoker::new(
      Fixed {
        output: ModelOutput {
          boxes: vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.5, 0.6, 0.6],
          scores: vec![0.9, 0.1],
          classes: vec![1.0, 0.0],
        },
      },
      reaper.clone(),
    );
    invoker.acquire_backend().unwrap();
    let batch = invoker
      .infer(&Tensor::zeros(TensorShape::rgb_input(4, 4)).unwrap())
      .unwrap();

    assert_eq!(batch.len(), 2);
    assert_eq!(batch.items[0].bbox, [0.1, 0.2, 0.3, 0.4]);
    assert_eq!(batch.items[0].class_index, 1);
    assert!(reaper.stats().is_balanced());
  }

  #[test]
  fn non_integer_classes_never_get_a_label() {
    let mut invoker = fixed(ModelOutput {
      boxes: vec![0.1, 0.1, 0.3, 0.3, 0.1, 0.1, 0.3, 0.3],
      scores: vec![0.9, 0.9],
      classes: vec![f32::NAN, 0.6],
    });
    invoker.acquire_backend().unwrap();
    let batch = invoker
      .infer(&Tensor::zeros(TensorShape::rgb_input(4, 4)).unwrap())
      .unwrap();
    assert!(batch.iter().all(|raw| raw.class_index == -1));

    let names = vec!["apple".to_string(), "banana".to_string()];
    let detections = crate::postprocess::process(
      &batch,
      0.5,
      &names,
      crate::postprocess::SurfaceSize::new(640, 640),
    );
    assert!(detections.is_empty());
  }

  #[test]
  fn class_index_accepts_only_exact_integers() {
    assert_eq!(class_index(2.0), 2);
    assert_eq!(class_index(-0.0), 0);
    assert_eq!(class_index(-0.4), -1);
    assert_eq!(class_index(f32::INFINITY), -1);
    assert_eq!(class_index(1e30), -1);
  }

  #[test]
  fn malformed_output_is_reported_and_released() {
    let reaper = Reaper::new();
    let mut invoker = Invoker::new(
      Fixed {
        output: ModelOutput {
          boxes: vec![0.0; 3],
          scores: vec![0.5],
          classes: vec![0.0],
        },
      },
      reaper.clone(),
    );
    invoker.acquire_backend().unwrap();
    assert!(matches!(
      invoker.infer(&Tensor::zeros(TensorShape::rgb_input(4, 4)).unwrap()),
      Err(InferenceError::MalformedOutput(_))
    ));
    assert!(reaper.stats().is_balanced());
  }

  #[test]
  fn too_many_candidates_is_malformed() {
    let mut invoker = fixed(ModelOutput {
      boxes: vec![0.0; 12],
      scores: vec![0.5; 3],
      classes: vec![0.0; 3],
    });
    invoker.acquire_backend().unwrap();
    assert!(matches!(
      invoker.infer(&Tensor::zeros(TensorShape::rgb_input(4, 4)).unwrap()),
      Err(InferenceError::MalformedOutput(_))
    ));
  }

  #[test]
  fn release_backend_is_idempotent() {
    let mut invoker = fixed(ModelOutput::default());
    invoker.acquire_backend().unwrap();
    assert!(invoker.is_loaded());
    invoker.release_backend();
    invoker.release_backend();
    assert!(!invoker.is_loaded());
  }
}
