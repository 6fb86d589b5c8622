// 该文件是 Guoyuan （果园） 项目的一部分。
// src/output/save_image_file.rs - 保存叠加图像文件
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  output::{ImageSurface, OverlayStyle, RenderError, Surface, load_font},
  postprocess::{Detection, PixelBox, SurfaceSize},
};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("加载字体失败: {0}")]
  FontError(#[from] RenderError),
}

/// 每次呈现都覆盖写入同一个图像文件
pub struct SaveImageFileOutput {
  path: PathBuf,
  surface: ImageSurface,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let mut surface = ImageSurface::new(640, 640);
    if let Some((_, font)) = uri.query_pairs().find(|(k, _)| k == "font") {
      surface = surface.with_font(load_font(font.as_ref())?);
    }

    Ok(SaveImageFileOutput::new(uri.path(), surface))
  }
}

impl SaveImageFileOutput {
  pub fn new(path: impl Into<PathBuf>, surface: ImageSurface) -> Self {
    Self {
      path: path.into(),
      surface,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Surface for SaveImageFileOutput {
  fn size(&self) -> SurfaceSize {
    self.surface.size()
  }

  fn set_background(&mut self, frame: &Frame) {
    self.surface.set_background(frame)
  }

  fn clear(&mut self) {
    self.surface.clear()
  }

  fn draw_rect(&mut self, rect: PixelBox, style: &OverlayStyle) {
    self.surface.draw_rect(rect, style)
  }

  fn draw_text(&mut self, text: &str, x: f32, y: f32, style: &OverlayStyle) {
    self.surface.draw_text(text, x, y, style)
  }

  fn present(&mut self, detections: &[Detection]) -> Result<(), RenderError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    self.surface.image().save(&self.path)?;
    info!(
      "保存叠加图像到文件: {} ({} 个检测)",
      self.path.display(),
      detections.len()
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::output::RenderSink;

  #[test]
  fn present_writes_overlay_png() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("overlay.png");
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let mut output = SaveImageFileOutput::from_url(&url).unwrap();

    output.set_background(&Frame::filled(64, 48, [200, 200, 200]));
    RenderSink::default().draw(&[], &mut output).unwrap();

    let saved = image::open(&path).unwrap().into_rgb8();
    assert_eq!(saved.dimensions(), (64, 48));
  }

  #[test]
  fn wrong_scheme_is_rejected() {
    let url = Url::parse("folder:///tmp/out").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }
}
