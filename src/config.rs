// 该文件是 Guoyuan （果园） 项目的一部分。
// src/config.rs - 检测配置
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

use std::time::Duration;

use thiserror::Error;

use crate::{
  input::{DEFAULT_FRAME_INTERVAL, FacingMode},
  output::OverlayStyle,
  tally::TallyMode,
  tensor::TensorShape,
};

pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_INPUT_SIZE: usize = 640;
pub const DEFAULT_SLOW_INFERENCE: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("置信度阈值 {0} 不在 [0, 1] 范围内")]
  InvalidThreshold(f32),
  #[error("目标形状不可用: {0}")]
  InvalidShape(TensorShape),
  #[error("帧间隔不能为零")]
  ZeroFrameInterval,
  #[error("连续失败阈值不能为零")]
  ZeroFailureLimit,
}

/// 一次检测会话的参数
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
  pub threshold: f32,
  pub target_shape: TensorShape,
  pub facing: FacingMode,
  pub frame_interval: Duration,
  pub tally_mode: TallyMode,
  /// 连续失败多少次后退回 CameraActive，`None` 表示不限制
  pub max_consecutive_failures: Option<u32>,
  /// 推理耗时超过该值时告警
  pub slow_inference_warning: Option<Duration>,
  pub overlay: OverlayStyle,
}

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      threshold: DEFAULT_THRESHOLD,
      target_shape: TensorShape::rgb_input(DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE),
      facing: FacingMode::default(),
      frame_interval: DEFAULT_FRAME_INTERVAL,
      tally_mode: TallyMode::default(),
      max_consecutive_failures: None,
      slow_inference_warning: Some(DEFAULT_SLOW_INFERENCE),
      overlay: OverlayStyle::default(),
    }
  }
}

impl DetectorConfig {
  pub fn with_threshold(mut self, threshold: f32) -> Self {
    self.threshold = threshold;
    self
  }

  pub fn with_target_shape(mut self, shape: TensorShape) -> Self {
    self.target_shape = shape;
    self
  }

  pub fn with_facing(mut self, facing: FacingMode) -> Self {
    self.facing = facing;
    self
  }

  pub fn with_frame_interval(mut self, interval: Duration) -> Self {
    self.frame_interval = interval;
    self
  }

  pub fn with_tally_mode(mut self, mode: TallyMode) -> Self {
    self.tally_mode = mode;
    self
  }

  pub fn with_max_consecutive_failures(mut self, limit: Option<u32>) -> Self {
    self.max_consecutive_failures = limit;
    self
  }

  pub fn with_slow_inference_warning(mut self, warning: Option<Duration>) -> Self {
    self.slow_inference_warning = warning;
    self
  }

  pub fn with_overlay(mut self, overlay: OverlayStyle) -> Self {
    self.overlay = overlay;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&self.threshold) {
      return Err(ConfigError::InvalidThreshold(self.threshold));
    }
    if !self.target_shape.is_valid() {
      return Err(ConfigError::InvalidShape(self.target_shape));
    }
    if self.frame_interval.is_zero() {
      return Err(ConfigError::ZeroFrameInterval);
    }
    if self.max_consecutive_failures == Some(0) {
      return Err(ConfigError::ZeroFailureLimit);
    }
    Ok(())
  }
}
