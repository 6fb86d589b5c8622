// 该文件是 Guoyuan （果园） 项目的一部分。
// src/frame.rs - 采集帧定义
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

use image::RgbImage;
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
pub struct FrameSizeMismatch {
  pub expected: usize,
  pub actual: usize,
}

/// 一帧 RGB 图像，像素按 HWC 交错排列
#[derive(Debug, Clone)]
pub struct Frame {
  width: u32,
  height: u32,
  data: Box<[u8]>,
  index: u64,
  timestamp: Duration,
}

impl Frame {
  pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameSizeMismatch> {
    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameSizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      data: data.into_boxed_slice(),
      index: 0,
      timestamp: Duration::ZERO,
    })
  }

  /// 纯色帧，主要用于测试和预热
  pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
    let data = rgb
      .iter()
      .copied()
      .cycle()
      .take(RGB_CHANNELS * width as usize * height as usize)
      .collect::<Vec<u8>>();

    Self {
      width,
      height,
      data: data.into_boxed_slice(),
      index: 0,
      timestamp: Duration::ZERO,
    }
  }

  pub fn with_index(mut self, index: u64) -> Self {
    self.index = index;
    self
  }

  pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
    self.timestamp = timestamp;
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn index(&self) -> u64 {
    self.index
  }

  /// 相对设备打开时刻的采集时间
  pub fn timestamp(&self) -> Duration {
    self.timestamp
  }

  pub fn as_hwc(&self) -> &[u8] {
    &self.data
  }

  pub fn into_rgb_image(self) -> RgbImage {
    let (width, height) = (self.width, self.height);
    // 长度在构造时已校验
    RgbImage::from_raw(width, height, self.data.into_vec())
      .unwrap_or_else(|| RgbImage::new(width, height))
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      data: image.into_raw().into_boxed_slice(),
      index: 0,
      timestamp: Duration::ZERO,
    }
  }
}

/// 将 YUYV 格式转换为 RGB
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height) as usize * RGB_CHANNELS);

  for chunk in yuyv.chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

/// BGR 转 RGB，保持 HWC 排列
pub fn bgr_to_rgb(bgr: &[u8]) -> Vec<u8> {
  bgr
    .chunks_exact(RGB_CHANNELS)
    .flat_map(|px| [px[2], px[1], px[0]])
    .collect()
}
