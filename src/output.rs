// 该文件是 Guoyuan （果园） 项目的一部分。
// src/output.rs - 叠加层绘制
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
use tracing::trace;
use url::Url;

use crate::{
  FromUrl,
  frame::Frame,
  postprocess::{Detection, PixelBox, SurfaceSize},
};

#[cfg(feature = "save_image_file")]
mod image_surface;
#[cfg(feature = "save_image_file")]
pub use self::image_surface::{ImageSurface, load_font};

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

/// 叠加层颜色 #16a34a
pub const OVERLAY_COLOR: [u8; 3] = [0x16, 0xa3, 0x4a];
pub const OVERLAY_LINE_WIDTH: u32 = 2;
pub const LABEL_FONT_SIZE: f32 = 16.0;
/// 标签基线距离框顶部的像素数
pub const LABEL_OFFSET: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayStyle {
  pub color: [u8; 3],
  pub line_width: u32,
  pub font_size: f32,
  pub label_offset: f32,
}

impl Default for OverlayStyle {
  fn default() -> Self {
    Self {
      color: OVERLAY_COLOR,
      line_width: OVERLAY_LINE_WIDTH,
      font_size: LABEL_FONT_SIZE,
      label_offset: LABEL_OFFSET,
    }
  }
}

#[derive(Error, Debug)]
pub enum RenderError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("字体错误: {0}")]
  Font(String),
  #[error("绘制表面错误: {0}")]
  Surface(String),
}

/// 绘制表面：位于视频画面之上的透明叠加层
pub trait Surface {
  fn size(&self) -> SurfaceSize;

  /// 本帧的视频画面，只关心叠加层的表面可以忽略
  fn set_background(&mut self, _frame: &Frame) {}

  /// 清除上一帧的叠加内容
  fn clear(&mut self);

  fn draw_rect(&mut self, rect: PixelBox, style: &OverlayStyle);

  /// 以 (x, y) 为基线左端绘制文本
  fn draw_text(&mut self, text: &str, x: f32, y: f32, style: &OverlayStyle);

  /// 一帧绘制完成，文件类表面在这里落盘
  fn present(&mut self, _detections: &[Detection]) -> Result<(), RenderError> {
    Ok(())
  }
}

impl<S: Surface + ?Sized> Surface for Box<S> {
  fn size(&self) -> SurfaceSize {
    (**self).size()
  }

  fn set_background(&mut self, frame: &Frame) {
    (**self).set_background(frame)
  }

  fn clear(&mut self) {
    (**self).clear()
  }

  fn draw_rect(&mut self, rect: PixelBox, style: &OverlayStyle) {
    (**self).draw_rect(rect, style)
  }

  fn draw_text(&mut self, text: &str, x: f32, y: f32, style: &OverlayStyle) {
    (**self).draw_text(text, x, y, style)
  }

  fn present(&mut self, detections: &[Detection]) -> Result<(), RenderError> {
    (**self).present(detections)
  }
}

/// 把检测结果画到表面上
#[derive(Debug, Clone, Default)]
pub struct RenderSink {
  style: OverlayStyle,
}

impl RenderSink {
  pub fn new(style: OverlayStyle) -> Self {
    Self { style }
  }

  pub fn style(&self) -> &OverlayStyle {
    &self.style
  }

  /// 清除旧叠加层后逐个绘制检测框与标签，然后呈现
  pub fn draw<S: Surface + ?Sized>(
    &self,
    detections: &[Detection],
    surface: &mut S,
  ) -> Result<(), RenderError> {
    surface.clear();
    for detection in detections {
      let b = detection.pixel_box;
      surface.draw_rect(b, &self.style);
      surface.draw_text(
        &detection.label(),
        b.x,
        b.y - self.style.label_offset,
        &self.style,
      );
    }
    trace!("绘制 {} 个检测框", detections.len());
    surface.present(detections)
  }
}

/// 不落地的表面，尺寸跟随视频画面
#[derive(Debug, Clone)]
pub struct HeadlessSurface {
  size: SurfaceSize,
}

impl HeadlessSurface {
  pub fn new(size: SurfaceSize) -> Self {
    Self { size }
  }
}

impl Surface for HeadlessSurface {
  fn size(&self) -> SurfaceSize {
    self.size
  }

  fn set_background(&mut self, frame: &Frame) {
    self.size = SurfaceSize::new(frame.width(), frame.height());
  }

  fn clear(&mut self) {}

  fn draw_rect(&mut self, _rect: PixelBox, _style: &OverlayStyle) {}

  fn draw_text(&mut self, _text: &str, _x: f32, _y: f32, _style: &OverlayStyle) {}
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  Headless(HeadlessSurface),
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl OutputWrapper {
  pub fn headless() -> Self {
    OutputWrapper::Headless(HeadlessSurface::new(SurfaceSize::new(640, 640)))
  }
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(any(feature = "save_image_file", feature = "directory_record"))]
    use crate::FromUrlWithScheme;

    match url.scheme() {
      "null" => Ok(OutputWrapper::headless()),
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => Ok(OutputWrapper::SaveImageFileOutput(
        SaveImageFileOutput::from_url(url)?,
      )),
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => Ok(OutputWrapper::DirectoryRecordOutput(
        DirectoryRecordOutput::from_url(url)?,
      )),
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl OutputWrapper {
  fn inner(&self) -> &dyn Surface {
    match self {
      OutputWrapper::Headless(surface) => surface,
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(surface) => surface,
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(surface) => surface,
    }
  }

  fn inner_mut(&mut self) -> &mut dyn Surface {
    match self {
      OutputWrapper::Headless(surface) => surface,
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(surface) => surface,
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(surface) => surface,
    }
  }
}

impl Surface for OutputWrapper {
  fn size(&self) -> SurfaceSize {
    self.inner().size()
  }

  fn set_background(&mut self, frame: &Frame) {
    self.inner_mut().set_background(frame)
  }

  fn clear(&mut self) {
    self.inner_mut().clear()
  }

  fn draw_rect(&mut self, rect: PixelBox, style: &OverlayStyle) {
    self.inner_mut().draw_rect(rect, style)
  }

  fn draw_text(&mut self, text: &str, x: f32, y: f32, style: &OverlayStyle) {
    self.inner_mut().draw_text(text, x, y, style)
  }

  fn present(&mut self, detections: &[Detection]) -> Result<(), RenderError> {
    self.inner_mut().present(detections)
  }
}
