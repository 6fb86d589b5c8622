// 该文件是 Guoyuan （果园） 项目的一部分。
// src/input/read_image_file.rs - 静态图像输入
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

use std::{path::PathBuf, time::Instant};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{AcquireError, DeviceHandle, FacingMode, FrameError, FrameSource, log_indicator},
};

#[derive(Error, Debug)]
pub enum StillImageInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
}

struct Opened {
  handle_id: u64,
  image: RgbImage,
  started: Instant,
  frame_index: u64,
}

/// 把一张图片当作摄像头：每次取帧都返回同一张图像
pub struct StillImageInput {
  path: PathBuf,
  opened: Option<Opened>,
}

impl FromUrlWithScheme for StillImageInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for StillImageInput {
  type Error = StillImageInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(StillImageInputError::SchemaMismatch);
    }

    Ok(StillImageInput::new(url.path()))
  }
}

impl StillImageInput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      opened: None,
    }
  }
}

impl FrameSource for StillImageInput {
  fn open(&mut self, _facing: FacingMode) -> Result<DeviceHandle, AcquireError> {
    if self.opened.is_some() {
      return Err(AcquireError::AlreadyOpen);
    }

    let image = ImageReader::open(&self.path)?
      .decode()
      .map_err(|e| AcquireError::Device(e.to_string()))?
      .into_rgb8();
    debug!(
      "读取图像 {}: {}x{}",
      self.path.display(),
      image.width(),
      image.height()
    );

    let handle = DeviceHandle::issue();
    self.opened = Some(Opened {
      handle_id: handle.id(),
      image,
      started: Instant::now(),
      frame_index: 0,
    });
    log_indicator(&self.path.display().to_string(), true);
    Ok(handle)
  }

  fn next_frame(&mut self, handle: &DeviceHandle) -> Result<Frame, FrameError> {
    let opened = match &mut self.opened {
      Some(opened) if opened.handle_id == handle.id() => opened,
      _ => return Err(FrameError::Closed),
    };

    opened.frame_index += 1;
    Ok(
      Frame::from(opened.image.clone())
        .with_index(opened.frame_index)
        .with_timestamp(opened.started.elapsed()),
    )
  }

  fn close(&mut self, handle: &DeviceHandle) {
    if self
      .opened
      .as_ref()
      .is_some_and(|opened| opened.handle_id == handle.id())
    {
      self.opened = None;
      log_indicator(&self.path.display().to_string(), false);
    }
  }

  fn is_active(&self) -> bool {
    self.opened.is_some()
  }
}
