// 该文件是 Guoyuan （果园） 项目的一部分。
// src/postprocess.rs - 检测结果后处理
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

use tracing::trace;

use crate::model::{RawDetection, RawDetectionBatch};

/// 绘制表面的像素尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSize {
  pub width: u32,
  pub height: u32,
}

impl SurfaceSize {
  pub const fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }
}

/// 像素坐标下的边界框，(x, y) 为左上角
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub class_name: String,
  pub score: f32,
  pub pixel_box: PixelBox,
}

impl Detection {
  /// 叠加层标签，如 `apple (92%)`
  pub fn label(&self) -> String {
    format!("{} ({}%)", self.class_name, (self.score * 100.0).round() as i64)
  }
}

/// 按阈值过滤原始检测，映射类别名并换算到像素坐标
///
/// 只有 `score > threshold` 的候选会保留；类别索引越界的候选直接丢弃。
/// 输出顺序与输入批次一致。
pub fn process(
  batch: &RawDetectionBatch,
  threshold: f32,
  class_names: &[String],
  surface: SurfaceSize,
) -> Vec<Detection> {
  batch
    .iter()
    .filter(|raw| raw.score > threshold)
    .filter_map(|raw| {
      let class_name = usize::try_from(raw.class_index)
        .ok()
        .and_then(|idx| class_names.get(idx));
      if class_name.is_none() {
        trace!("丢弃越界类别索引 {}", raw.class_index);
      }
      class_name.map(|name| Detection {
        class_name: name.clone(),
        score: raw.score,
        pixel_box: scale_box(raw, surface),
      })
    })
    .collect()
}

fn scale_box(raw: &RawDetection, surface: SurfaceSize) -> PixelBox {
  let [y0, x0, y1, x1] = raw.bbox;
  let (w, h) = (surface.width as f32, surface.height as f32);
  PixelBox {
    x: x0 * w,
    y: y0 * h,
    width: (x1 - x0) * w,
    height: (y1 - y0) * h,
  }
}
