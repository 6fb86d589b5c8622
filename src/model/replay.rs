// 该文件是 Guoyuan （果园） 项目的一部分。
// src/model/replay.rs - 回放模型
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

//! 按顺序循环回放事先录制的模型输出，无需加速器即可驱动完整流水线。
//!
//! 录制文件是一个 JSON 数组，每个元素对应一次推理：
//!
//! ```json
//! [
//!   { "boxes": [[0.1, 0.1, 0.3, 0.3]], "scores": [0.92], "classes": [0] },
//!   { "boxes": [], "scores": [], "classes": [] }
//! ]
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{InferenceError, ManifestError, Model, ModelManifest, ModelOutput, ModelSignature},
  tensor::Tensor,
};

#[derive(Error, Debug)]
pub enum ReplayModelError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("录制文件解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("清单错误: {0}")]
  ManifestError(#[from] ManifestError),
  #[error("录制文件为空")]
  Empty,
}

#[derive(Debug, Deserialize)]
struct RecordedOutput {
  boxes: Vec<[f32; 4]>,
  scores: Vec<f32>,
  classes: Vec<f32>,
}

impl From<RecordedOutput> for ModelOutput {
  fn from(recorded: RecordedOutput) -> Self {
    ModelOutput {
      boxes: recorded.boxes.into_iter().flatten().collect(),
      scores: recorded.scores,
      classes: recorded.classes,
    }
  }
}

pub struct ReplayModel {
  manifest: ModelManifest,
  outputs: Vec<ModelOutput>,
  cursor: AtomicUsize,
  loaded: bool,
}

impl FromUrlWithScheme for ReplayModel {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayModel {
  type Error = ReplayModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReplayModelError::SchemeMismatch);
    }

    let manifest = match url.query_pairs().find(|(k, _)| k == "manifest") {
      Some((_, path)) => ModelManifest::load(path.as_ref())?,
      None => ModelManifest::fruits(),
    };

    info!("加载回放文件: {}", url.path());
    let text = std::fs::read_to_string(url.path())?;
    let recorded: Vec<RecordedOutput> = serde_json::from_str(&text)?;
    Self::new(manifest, recorded.into_iter().map(ModelOutput::from).collect())
  }
}

impl ReplayModel {
  pub fn new(manifest: ModelManifest, outputs: Vec<ModelOutput>) -> Result<Self, ReplayModelError> {
    if outputs.is_empty() {
      return Err(ReplayModelError::Empty);
    }
    Ok(Self {
      manifest,
      outputs,
      cursor: AtomicUsize::new(0),
      loaded: false,
    })
  }

  pub fn class_names(&self) -> &[String] {
    &self.manifest.class_names
  }
}

impl Model for ReplayModel {
  fn signature(&self) -> ModelSignature {
    self.manifest.signature()
  }

  fn load(&mut self) -> Result<(), InferenceError> {
    self.loaded = true;
    self.cursor.store(0, Ordering::Release);
    Ok(())
  }

  fn unload(&mut self) {
    self.loaded = false;
  }

  fn infer(&self, _input: &Tensor) -> Result<ModelOutput, InferenceError> {
    if !self.loaded {
      return Err(InferenceError::BackendUnavailable(
        "回放模型未加载".to_string(),
      ));
    }
    let index = self.cursor.fetch_add(1, Ordering::AcqRel) % self.outputs.len();
    Ok(self.outputs[index].clone())
  }
}
