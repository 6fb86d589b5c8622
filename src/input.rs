// 该文件是 Guoyuan （果园） 项目的一部分。
// src/input.rs - 摄像头/图像输入
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

use std::{
  str::FromStr,
  sync::atomic::{AtomicU64, Ordering},
  time::Duration,
};

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, frame::Frame};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{StillImageInput, StillImageInputError};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lInput, V4lInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerInput, GStreamerInputError};

pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// 摄像头朝向偏好，尽力满足
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
  /// 后置摄像头
  #[default]
  Environment,
  /// 前置摄像头
  User,
  Any,
}

impl FromStr for FacingMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "environment" | "rear" | "back" => Ok(FacingMode::Environment),
      "user" | "front" => Ok(FacingMode::User),
      "any" => Ok(FacingMode::Any),
      other => Err(format!("未知摄像头朝向: {}", other)),
    }
  }
}

impl FacingMode {
  /// 设备名中可能出现的朝向关键字
  pub fn name_hints(&self) -> &'static [&'static str] {
    match self {
      FacingMode::Environment => &["back", "rear", "world", "environment"],
      FacingMode::User => &["front", "user", "face", "integrated"],
      FacingMode::Any => &[],
    }
  }
}

/// 已打开设备的不透明句柄
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
  id: u64,
}

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

impl DeviceHandle {
  /// 生成一个新的唯一句柄，由设备实现在 `open` 时调用
  pub fn issue() -> Self {
    Self {
      id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
  #[error("没有访问摄像头的权限")]
  PermissionDenied,
  #[error("没有可用的摄像头设备")]
  NoDevice,
  #[error("摄像头已被打开")]
  AlreadyOpen,
  #[error("设备错误: {0}")]
  Device(String),
}

impl From<std::io::Error> for AcquireError {
  fn from(err: std::io::Error) -> Self {
    match err.kind() {
      std::io::ErrorKind::PermissionDenied => AcquireError::PermissionDenied,
      std::io::ErrorKind::NotFound => AcquireError::NoDevice,
      _ => AcquireError::Device(err.to_string()),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("等待新帧超时")]
  Timeout,
  #[error("设备未打开或句柄已失效")]
  Closed,
  #[error("输入流结束")]
  EndOfStream,
  #[error("设备错误: {0}")]
  Device(String),
  #[error("帧格式错误: {0}")]
  Format(String),
}

/// 帧来源：打开设备、按需取最新帧、关闭设备
pub trait FrameSource {
  fn open(&mut self, facing: FacingMode) -> Result<DeviceHandle, AcquireError>;

  /// 返回最新的一帧，阻塞时间不超过一个帧间隔
  fn next_frame(&mut self, handle: &DeviceHandle) -> Result<Frame, FrameError>;

  /// 释放设备；重复关闭或关闭失效句柄不做任何事
  fn close(&mut self, handle: &DeviceHandle);

  /// 摄像头指示灯状态
  fn is_active(&self) -> bool;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn open(&mut self, facing: FacingMode) -> Result<DeviceHandle, AcquireError> {
    (**self).open(facing)
  }

  fn next_frame(&mut self, handle: &DeviceHandle) -> Result<Frame, FrameError> {
    (**self).next_frame(handle)
  }

  fn close(&mut self, handle: &DeviceHandle) {
    (**self).close(handle)
  }

  fn is_active(&self) -> bool {
    (**self).is_active()
  }
}

pub(crate) fn log_indicator(name: &str, on: bool) {
  info!("摄像头指示灯 [{}]: {}", name, if on { "开" } else { "关" });
}

/// 从 URL 查询参数读取帧间隔，`fps=30`
pub(crate) fn frame_interval_from_url(url: &Url) -> Duration {
  url
    .query_pairs()
    .find(|(k, _)| k == "fps")
    .and_then(|(_, v)| v.parse::<u32>().ok())
    .filter(|fps| *fps > 0)
    .map(|fps| Duration::from_secs_f64(1.0 / fps as f64))
    .unwrap_or(DEFAULT_FRAME_INTERVAL)
}

pub(crate) fn query_u32(url: &Url, key: &str) -> Option<u32> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .and_then(|(_, v)| v.parse::<u32>().ok())
}

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  StillImageInputError(#[from] StillImageInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L input error: {0}")]
  V4lInputError(#[from] V4lInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
}

#[cfg(not(any(
  feature = "read_image_file",
  feature = "v4l_input",
  feature = "gstreamer_input"
)))]
compile_error!("至少需要启用一个输入特性: read_image_file、v4l_input 或 gstreamer_input");

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  StillImage(StillImageInput),
  #[cfg(feature = "v4l_input")]
  V4l(V4lInput),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == StillImageInput::SCHEME {
        return Ok(InputWrapper::StillImage(StillImageInput::from_url(url)?));
      }
    }
    #[cfg(feature = "v4l_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4lInput::SCHEME {
        return Ok(InputWrapper::V4l(V4lInput::from_url(url)?));
      }
    }
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInput::SCHEME {
        return Ok(InputWrapper::GStreamer(GStreamerInput::from_url(url)?));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl FrameSource for InputWrapper {
  fn open(&mut self, facing: FacingMode) -> Result<DeviceHandle, AcquireError> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::StillImage(input) => input.open(facing),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.open(facing),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.open(facing),
    }
  }

  fn next_frame(&mut self, handle: &DeviceHandle) -> Result<Frame, FrameError> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::StillImage(input) => input.next_frame(handle),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.next_frame(handle),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.next_frame(handle),
    }
  }

  fn close(&mut self, handle: &DeviceHandle) {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::StillImage(input) => input.close(handle),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.close(handle),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.close(handle),
    }
  }

  fn is_active(&self) -> bool {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::StillImage(input) => input.is_active(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.is_active(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.is_active(),
    }
  }
}
