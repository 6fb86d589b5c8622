// 该文件是 Guoyuan （果园） 项目的一部分。
// src/preprocess.rs - 帧预处理
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

use image::imageops::{self, FilterType};
use thiserror::Error;
use tracing::debug;

use crate::{
  frame::{Frame, RGB_CHANNELS},
  reaper::{Reaper, Scoped},
  tensor::{Tensor, TensorError, TensorShape},
};

const PIXEL_SCALE: f32 = 255.0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PreprocessError {
  #[error("空帧: {width}x{height}")]
  EmptyFrame { width: u32, height: u32 },
  #[error("不支持的目标形状: {0}")]
  UnsupportedTarget(TensorShape),
  #[error("张量错误: {0}")]
  Tensor(#[from] TensorError),
}

/// 将一帧转换为模型输入张量 `[1, H, W, 3]`，像素值缩放到 `[0, 1]`
///
/// 帧按值传入，函数返回前即被释放。中间张量（缩放、归一化、加批次维）
/// 都经过 `reaper` 登记，上一阶段的张量在下一阶段生成后立即释放。
pub fn prepare(
  frame: Frame,
  target: TensorShape,
  reaper: &Reaper,
) -> Result<Scoped<Tensor>, PreprocessError> {
  if target.batch != 1 || target.channels != RGB_CHANNELS || !target.is_valid() {
    return Err(PreprocessError::UnsupportedTarget(target));
  }
  let (Ok(width), Ok(height)) = (u32::try_from(target.width), u32::try_from(target.height)) else {
    return Err(PreprocessError::UnsupportedTarget(target));
  };
  if frame.width() == 0 || frame.height() == 0 {
    return Err(PreprocessError::EmptyFrame {
      width: frame.width(),
      height: frame.height(),
    });
  }

  debug!(
    "预处理第 {} 帧: {}x{} -> {}",
    frame.index(),
    frame.width(),
    frame.height(),
    target
  );

  let resized = reaper.acquire(resize(frame, width, height)?);
  let normalized = resized.map(normalize);
  let batched = normalized.try_map(|tensor| tensor.reshape(target))?;

  Ok(batched)
}

// 双线性缩放，输出 [H, W, 3] 的原始像素值
fn resize(frame: Frame, width: u32, height: u32) -> Result<Tensor, TensorError> {
  let image = frame.into_rgb_image();
  let resized = if image.dimensions() == (width, height) {
    image
  } else {
    imageops::resize(&image, width, height, FilterType::Triangle)
  };

  let data = resized
    .into_raw()
    .into_iter()
    .map(f32::from)
    .collect::<Vec<f32>>();
  let shape = TensorShape::nhwc(1, height as usize, width as usize, RGB_CHANNELS);
  Tensor::new(shape, data)
}

fn normalize(mut tensor: Tensor) -> Tensor {
  tensor
    .as_mut_slice()
    .iter_mut()
    .for_each(|v| *v /= PIXEL_SCALE);
  tensor
}
