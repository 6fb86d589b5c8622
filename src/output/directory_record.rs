// 该文件是 Guoyuan （果园） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::path::PathBuf;

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  output::{ImageSurface, OverlayStyle, RenderError, Surface, load_font},
  postprocess::{Detection, PixelBox, SurfaceSize},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("加载字体失败: {0}")]
  FontError(#[from] RenderError),
}

/// 按日期分目录保存叠加图像：`<dir>/YYYY/MM/DD/HH-MM-SS-XXXX.png`
///
/// 默认只保存有检测结果的帧，`?always` 保存每一帧。只写图像，不保存检测结果。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  surface: ImageSurface,
  frame_counter: u16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");

    let mut surface = ImageSurface::new(640, 640);
    if let Some((_, font)) = uri.query_pairs().find(|(k, _)| k == "font") {
      surface = surface.with_font(load_font(font.as_ref())?);
    }

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      surface,
      frame_counter: 0,
      always,
    })
  }
}

impl DirectoryRecordOutput {
  fn frame_id(&mut self) -> u16 {
    self.frame_counter = self.frame_counter.wrapping_add(1);
    self.frame_counter
  }

  fn frame_path(&mut self) -> Result<PathBuf, RenderError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Surface for DirectoryRecordOutput {
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
    if !self.always && detections.is_empty() {
      return Ok(());
    }
    let path = self.frame_path()?;
    self.surface.image().save(&path)?;
    debug!("记录帧: {}", path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::path::Path;

  use super::*;
  use crate::output::RenderSink;

  fn files(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
      for entry in std::fs::read_dir(d).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          stack.push(path);
        } else if path.extension().is_some_and(|e| e == ext) {
          found.push(path);
        }
      }
    }
    found
  }

  fn apple() -> Detection {
    Detection {
      class_name: "apple".to_string(),
      score: 0.92,
      pixel_box: PixelBox {
        x: 4.0,
        y: 4.0,
        width: 8.0,
        height: 8.0,
      },
    }
  }

  #[test]
  fn empty_frames_are_skipped_unless_always() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let mut output = DirectoryRecordOutput::from_url(&url).unwrap();
    output.set_background(&Frame::filled(16, 16, [0, 0, 0]));

    RenderSink::default().draw(&[], &mut output).unwrap();
    assert!(files(dir.path(), "png").is_empty());

    RenderSink::default().draw(&[apple()], &mut output).unwrap();
    assert_eq!(files(dir.path(), "png").len(), 1);
  }

  #[test]
  fn only_overlay_images_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("folder://{}?always&record", dir.path().display())).unwrap();
    let mut output = DirectoryRecordOutput::from_url(&url).unwrap();
    output.set_background(&Frame::filled(16, 16, [0, 0, 0]));

    RenderSink::default().draw(&[apple()], &mut output).unwrap();
    assert_eq!(files(dir.path(), "png").len(), 1);
    assert!(files(dir.path(), "txt").is_empty());
  }
}
