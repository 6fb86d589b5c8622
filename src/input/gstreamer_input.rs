// 该文件是 Guoyuan （果园） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 摄像头输入
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

//! # GStreamer 摄像头输入
//!
//! 支持两种来源：
//!
//! - `gst://camera/dev/video0?width=640&height=480&fps=30`：通过 `v4l2src` 读取摄像头
//! - `gst://test?width=640&height=480`：`videotestsrc` 测试图案
//!
//! 管道在 `open` 时创建并进入 Playing 状态，在 `close` 时置为 Null。
//! appsink 只保留最新的一帧，来不及处理的旧帧直接丢弃。
//!
//! 使用前需要安装 GStreamer 开发库，例如 Ubuntu/Debian 上的
//! `libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev`。

use std::time::{Duration, Instant};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, bgr_to_rgb},
  input::{
    AcquireError, DeviceHandle, FacingMode, FrameError, FrameSource, frame_interval_from_url,
    log_indicator, query_u32,
  },
};

const GST_DEFAULT_WIDTH: u32 = 640;
const GST_DEFAULT_HEIGHT: u32 = 480;

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("Unknown GStreamer source: {0}")]
  UnknownSource(String),
}

/// 管道的来源部分
#[derive(Debug, Clone, PartialEq, Eq)]
enum SourceItem {
  Camera { device: String },
  Test,
}

struct Opened {
  handle_id: u64,
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  frame_index: u64,
  started: Instant,
}

pub struct GStreamerInput {
  source: SourceItem,
  width: u32,
  height: u32,
  frame_interval: Duration,
  opened: Option<Opened>,
}

impl FromUrlWithScheme for GStreamerInput {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInput {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let source = match url.host_str() {
      Some("camera") => SourceItem::Camera {
        device: url.path().to_string(),
      },
      Some("test") => SourceItem::Test,
      other => {
        return Err(GStreamerInputError::UnknownSource(
          other.unwrap_or_default().to_string(),
        ));
      }
    };

    Ok(GStreamerInput {
      source,
      width: query_u32(url, "width").unwrap_or(GST_DEFAULT_WIDTH),
      height: query_u32(url, "height").unwrap_or(GST_DEFAULT_HEIGHT),
      frame_interval: frame_interval_from_url(url),
      opened: None,
    })
  }
}

impl GStreamerInput {
  fn fps(&self) -> u32 {
    let secs = self.frame_interval.as_secs_f64();
    if secs > 0.0 {
      (1.0 / secs).round().max(1.0) as u32
    } else {
      30
    }
  }

  fn pipeline_description(&self) -> String {
    let source = match &self.source {
      SourceItem::Camera { device } => format!("v4l2src device={}", device),
      SourceItem::Test => "videotestsrc is-live=true".to_string(),
    };
    format!(
      "{} ! videoconvert ! videoscale ! video/x-raw,format=RGB,width={},height={},framerate={}/1 ! appsink max-buffers=1 drop=true name=sink",
      source,
      self.width,
      self.height,
      self.fps()
    )
  }

  fn launch(&self) -> Result<(gst::Pipeline, gst_app::AppSink), AcquireError> {
    gst::init().map_err(|e| AcquireError::Device(e.to_string()))?;

    let description = self.pipeline_description();
    info!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(&description)
      .map_err(|e| AcquireError::Device(e.to_string()))?
      .downcast::<gst::Pipeline>()
      .map_err(|_| AcquireError::Device("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| AcquireError::Device("Failed to get appsink element".to_string()))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| AcquireError::Device("Failed to convert element to appsink".to_string()))?;

    if let Err(e) = pipeline.set_state(gst::State::Playing) {
      // 设备被占用或不存在时 v4l2src 会在这里失败
      let _ = pipeline.set_state(gst::State::Null);
      return Err(AcquireError::Device(e.to_string()));
    }

    Ok((pipeline, appsink))
  }
}

impl FrameSource for GStreamerInput {
  fn open(&mut self, _facing: FacingMode) -> Result<DeviceHandle, AcquireError> {
    if self.opened.is_some() {
      return Err(AcquireError::AlreadyOpen);
    }
    if let SourceItem::Camera { device } = &self.source
      && !std::path::Path::new(device).exists()
    {
      return Err(AcquireError::NoDevice);
    }

    let (pipeline, appsink) = self.launch()?;
    let handle = DeviceHandle::issue();
    self.opened = Some(Opened {
      handle_id: handle.id(),
      pipeline,
      appsink,
      frame_index: 0,
      started: Instant::now(),
    });
    log_indicator(&format!("{:?}", self.source), true);
    Ok(handle)
  }

  fn next_frame(&mut self, handle: &DeviceHandle) -> Result<Frame, FrameError> {
    let interval = self.frame_interval;
    let opened = match &mut self.opened {
      Some(opened) if opened.handle_id == handle.id() => opened,
      _ => return Err(FrameError::Closed),
    };

    let timeout = gst::ClockTime::from_mseconds(interval.as_millis().max(1) as u64);
    let sample = match opened.appsink.try_pull_sample(timeout) {
      Some(sample) => sample,
      None if opened.appsink.is_eos() => return Err(FrameError::EndOfStream),
      None => return Err(FrameError::Timeout),
    };

    opened.frame_index += 1;
    let frame = convert_sample(sample)?;
    Ok(
      frame
        .with_index(opened.frame_index)
        .with_timestamp(opened.started.elapsed()),
    )
  }

  fn close(&mut self, handle: &DeviceHandle) {
    match self.opened.take() {
      Some(opened) if opened.handle_id == handle.id() => {
        if let Err(e) = opened.pipeline.set_state(gst::State::Null) {
          warn!("Failed to stop GStreamer pipeline: {}", e);
        }
        log_indicator(&format!("{:?}", self.source), false);
      }
      other => {
        self.opened = other;
        debug!("忽略对已关闭设备的关闭请求");
      }
    }
  }

  fn is_active(&self) -> bool {
    self.opened.is_some()
  }
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Some(opened) = self.opened.take()
      && let Err(e) = opened.pipeline.set_state(gst::State::Null)
    {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

/// 去掉行对齐填充，得到紧密排列的 3 字节像素
fn packed_rows(data: &[u8], width: u32, height: u32, stride: i32) -> Result<Vec<u8>, FrameError> {
  let stride = usize::try_from(stride)
    .map_err(|_| FrameError::Format(format!("Unsupported row stride: {}", stride)))?;
  let row = width as usize * 3;
  let rows = height as usize;
  let expected = row * rows;
  let required = rows
    .checked_sub(1)
    .and_then(|last| last.checked_mul(stride))
    .and_then(|offset| offset.checked_add(row));
  if stride < row || required.is_none_or(|required| data.len() < required) {
    return Err(FrameError::Format(format!(
      "Buffer size mismatch: expected {} bytes, got {} bytes",
      expected,
      data.len()
    )));
  }

  let mut pixels = Vec::with_capacity(expected);
  for y in 0..rows {
    pixels.extend_from_slice(&data[y * stride..y * stride + row]);
  }
  Ok(pixels)
}

fn convert_sample(sample: gst::Sample) -> Result<Frame, FrameError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| FrameError::Format("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| FrameError::Format("No caps in sample".to_string()))?;
  let video_info = gst_video::VideoInfo::from_caps(caps)
    .map_err(|_| FrameError::Format("Failed to get video info from caps".to_string()))?;

  let width = video_info.width();
  let height = video_info.height();
  let map = buffer
    .map_readable()
    .map_err(|e| FrameError::Format(format!("Failed to map buffer for reading: {}", e)))?;
  let pixels = packed_rows(map.as_slice(), width, height, video_info.stride()[0])?;

  let pixels = match video_info.format() {
    gst_video::VideoFormat::Rgb => pixels,
    gst_video::VideoFormat::Bgr => bgr_to_rgb(&pixels),
    other => {
      return Err(FrameError::Format(format!(
        "Unsupported video format: {:?}",
        other
      )));
    }
  };

  Frame::from_rgb(width, height, pixels).map_err(|e| FrameError::Format(e.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn camera_url_builds_v4l2_pipeline() {
    let url = Url::parse("gst://camera/dev/video2?width=320&height=240&fps=15").unwrap();
    let input = GStreamerInput::from_url(&url).unwrap();
    let description = input.pipeline_description();
    assert!(description.starts_with("v4l2src device=/dev/video2 !"));
    assert!(description.contains("width=320,height=240,framerate=15/1"));
    assert!(description.ends_with("name=sink"));
  }

  #[test]
  fn test_url_uses_test_source() {
    let url = Url::parse("gst://test").unwrap();
    let input = GStreamerInput::from_url(&url).unwrap();
    assert!(input.pipeline_description().starts_with("videotestsrc"));
  }

  #[test]
  fn row_padding_is_stripped() {
    let data = [1, 2, 3, 0, 4, 5, 6, 0];
    assert_eq!(packed_rows(&data, 1, 2, 4).unwrap(), vec![1, 2, 3, 4, 5, 6]);
  }

  #[test]
  fn bad_strides_are_format_errors() {
    let data = [0u8; 16];
    for (stride, height) in [(-4, 2), (2, 2), (4, 0), (8, 3)] {
      assert!(matches!(
        packed_rows(&data, 1, height, stride),
        Err(FrameError::Format(_))
      ));
    }
  }

  #[test]
  fn unknown_host_is_rejected() {
    let url = Url::parse("gst://file/tmp/video.mp4").unwrap();
    assert!(matches!(
      GStreamerInput::from_url(&url),
      Err(GStreamerInputError::UnknownSource(_))
    ));
  }
}
