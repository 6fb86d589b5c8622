// 该文件是 Guoyuan （果园） 项目的一部分。
// src/tensor.rs - 张量定义
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

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// NHWC 形状
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[usize; 4]", into = "[usize; 4]")]
pub struct TensorShape {
  pub batch: usize,
  pub height: usize,
  pub width: usize,
  pub channels: usize,
}

impl TensorShape {
  pub const fn nhwc(batch: usize, height: usize, width: usize, channels: usize) -> Self {
    Self {
      batch,
      height,
      width,
      channels,
    }
  }

  /// 单张 RGB 图像的输入形状 `[1, H, W, 3]`
  pub const fn rgb_input(height: usize, width: usize) -> Self {
    Self::nhwc(1, height, width, 3)
  }

  /// 元素总数，乘积溢出时返回 `None`
  pub fn checked_len(&self) -> Option<usize> {
    self
      .batch
      .checked_mul(self.height)?
      .checked_mul(self.width)?
      .checked_mul(self.channels)
  }

  /// 各维均非零且元素总数可表示
  pub fn is_valid(&self) -> bool {
    self.checked_len().is_some_and(|len| len > 0)
  }
}

impl From<[usize; 4]> for TensorShape {
  fn from([batch, height, width, channels]: [usize; 4]) -> Self {
    Self::nhwc(batch, height, width, channels)
  }
}

impl From<TensorShape> for [usize; 4] {
  fn from(shape: TensorShape) -> Self {
    [shape.batch, shape.height, shape.width, shape.channels]
  }
}

impl fmt::Display for TensorShape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "[{}, {}, {}, {}]",
      self.batch, self.height, self.width, self.channels
    )
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TensorError {
  #[error("张量数据长度 {actual} 与形状 {shape} 不符")]
  LengthMismatch { shape: TensorShape, actual: usize },
  #[error("形状 {0} 的元素总数溢出")]
  Overflow(TensorShape),
}

fn element_count(shape: TensorShape) -> Result<usize, TensorError> {
  shape.checked_len().ok_or(TensorError::Overflow(shape))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  shape: TensorShape,
  data: Box<[f32]>,
}

impl Tensor {
  pub fn new(shape: TensorShape, data: Vec<f32>) -> Result<Self, TensorError> {
    if data.len() != element_count(shape)? {
      return Err(TensorError::LengthMismatch {
        shape,
        actual: data.len(),
      });
    }
    Ok(Self {
      shape,
      data: data.into_boxed_slice(),
    })
  }

  pub fn zeros(shape: TensorShape) -> Result<Self, TensorError> {
    Ok(Self {
      shape,
      data: vec![0.0; element_count(shape)?].into_boxed_slice(),
    })
  }

  pub fn shape(&self) -> TensorShape {
    self.shape
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn as_mut_slice(&mut self) -> &mut [f32] {
    &mut self.data
  }

  /// 以新形状重新解释数据，元素总数必须一致
  pub fn reshape(self, shape: TensorShape) -> Result<Self, TensorError> {
    if element_count(shape)? != self.data.len() {
      return Err(TensorError::LengthMismatch {
        shape,
        actual: self.data.len(),
      });
    }
    Ok(Self {
      shape,
      data: self.data,
    })
  }
}
