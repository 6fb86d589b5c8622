// 该文件是 Guoyuan （果园） 项目的一部分。
// src/model/manifest.rs - 模型清单
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

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{model::ModelSignature, tensor::TensorShape};

pub const FRUIT_LABELS: [&str; 5] = ["apple", "banana", "orange", "mango", "strawberry"];

const DEFAULT_INPUT_SIZE: usize = 640;
const DEFAULT_MAX_DETECTIONS: usize = 100;

#[derive(Error, Debug)]
pub enum ManifestError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("清单无效: {0}")]
  Invalid(String),
}

/// 随模型一同发布的输入输出声明与类别表
///
/// ```json
/// { "input": [1, 640, 640, 3], "max_detections": 100, "class_names": ["apple"] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelManifest {
  pub input: TensorShape,
  #[serde(default = "default_max_detections")]
  pub max_detections: usize,
  pub class_names: Vec<String>,
}

fn default_max_detections() -> usize {
  DEFAULT_MAX_DETECTIONS
}

impl ModelManifest {
  /// 内置的水果类别表，输入 640x640
  pub fn fruits() -> Self {
    Self {
      input: TensorShape::rgb_input(DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE),
      max_detections: DEFAULT_MAX_DETECTIONS,
      class_names: FRUIT_LABELS.iter().map(|s| s.to_string()).collect(),
    }
  }

  /// 读取清单文件，`.json` 按完整清单解析，其他扩展名按每行一个类别名解析
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
    let path = path.as_ref();
    info!("加载模型清单: {}", path.display());
    let text = std::fs::read_to_string(path)?;

    let manifest = if path.extension().is_some_and(|ext| ext == "json") {
      serde_json::from_str::<ModelManifest>(&text)?
    } else {
      Self {
        class_names: parse_label_lines(&text),
        ..Self::fruits()
      }
    };

    manifest.validate()?;
    debug!(
      "清单: 输入 {}, 最大检测数 {}, 类别 {:?}",
      manifest.input, manifest.max_detections, manifest.class_names
    );
    Ok(manifest)
  }

  pub fn validate(&self) -> Result<(), ManifestError> {
    if self.class_names.is_empty() {
      return Err(ManifestError::Invalid("类别表为空".to_string()));
    }
    if self.input.batch != 1 || self.input.channels != 3 || !self.input.is_valid() {
      return Err(ManifestError::Invalid(format!(
        "不支持的输入形状 {}",
        self.input
      )));
    }
    if self.max_detections == 0 {
      return Err(ManifestError::Invalid("最大检测数必须大于 0".to_string()));
    }
    Ok(())
  }

  pub fn signature(&self) -> ModelSignature {
    ModelSignature {
      input: self.input,
      max_detections: self.max_detections,
    }
  }
}

fn parse_label_lines(text: &str) -> Vec<String> {
  text
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty() && !line.starts_with('#'))
    .map(String::from)
    .collect()
}
