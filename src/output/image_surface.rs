// 该文件是 Guoyuan （果园） 项目的一部分。
// src/output/image_surface.rs - 基于图像的绘制表面
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use tracing::debug;

use crate::{
  frame::Frame,
  output::{OverlayStyle, RenderError, Surface},
  postprocess::{PixelBox, SurfaceSize},
};

/// 从文件加载标签字体
pub fn load_font(path: impl AsRef<Path>) -> Result<FontArc, RenderError> {
  let data = std::fs::read(path.as_ref())?;
  FontArc::try_from_vec(data).map_err(|e| RenderError::Font(e.to_string()))
}

/// 以视频帧为底图的 RGB 画布
///
/// 没有配置字体时只绘制检测框，标签文本被跳过。
pub struct ImageSurface {
  canvas: RgbImage,
  background: Option<RgbImage>,
  font: Option<FontArc>,
}

impl ImageSurface {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      canvas: RgbImage::new(width, height),
      background: None,
      font: None,
    }
  }

  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn image(&self) -> &RgbImage {
    &self.canvas
  }
}

impl Surface for ImageSurface {
  fn size(&self) -> SurfaceSize {
    SurfaceSize::new(self.canvas.width(), self.canvas.height())
  }

  fn set_background(&mut self, frame: &Frame) {
    self.background = RgbImage::from_raw(frame.width(), frame.height(), frame.as_hwc().to_vec());
    if let Some(background) = &self.background {
      self.canvas = background.clone();
    }
  }

  fn clear(&mut self) {
    match &self.background {
      Some(background) => self.canvas.clone_from(background),
      None => self.canvas.pixels_mut().for_each(|p| *p = Rgb([0, 0, 0])),
    }
  }

  fn draw_rect(&mut self, rect: PixelBox, style: &OverlayStyle) {
    let x = rect.x.round() as i32;
    let y = rect.y.round() as i32;
    let width = rect.width.round() as i64;
    let height = rect.height.round() as i64;

    // 线宽向内加粗
    for inset in 0..style.line_width as i64 {
      let (w, h) = (width - 2 * inset, height - 2 * inset);
      if w <= 0 || h <= 0 {
        break;
      }
      let r = Rect::at(x + inset as i32, y + inset as i32).of_size(w as u32, h as u32);
      draw_hollow_rect_mut(&mut self.canvas, r, Rgb(style.color));
    }
  }

  fn draw_text(&mut self, text: &str, x: f32, y: f32, style: &OverlayStyle) {
    let Some(font) = &self.font else {
      debug!("未配置字体，跳过标签: {}", text);
      return;
    };
    // imageproc 以左上角定位文本，换算为基线位置
    let top = (y - style.font_size).round() as i32;
    draw_text_mut(
      &mut self.canvas,
      Rgb(style.color),
      x.round() as i32,
      top,
      PxScale::from(style.font_size),
      font,
      text,
    );
  }
}
