// 该文件是 Guoyuan （果园） 项目的一部分。
// src/input/v4l_input.rs - V4L2 摄像头输入
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
  io,
  sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;
use v4l::{
  Device, FourCC, buffer::Type, io::mmap::Stream, io::traits::CaptureStream, video::Capture,
};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, yuyv_to_rgb},
  input::{
    AcquireError, DeviceHandle, FacingMode, FrameError, FrameSource, frame_interval_from_url,
    log_indicator, query_u32,
  },
};

const V4L_DEFAULT_DEVICE: &str = "/dev/video0";
const V4L_DEFAULT_WIDTH: u32 = 640;
const V4L_DEFAULT_HEIGHT: u32 = 480;
const V4L_BUFFER_COUNT: u32 = 4;

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
}

/// 采集线程的参数
#[derive(Debug, Clone)]
struct CaptureConfig {
  path: String,
  width: u32,
  height: u32,
  timeout: Duration,
}

/// 打开后的采集线程
///
/// v4l 的 Device 与引用它的 Stream 都留在采集线程内，`V4lInput` 只持有通道，
/// 每次取帧发送一个请求并等待一帧。请求通道关闭后采集线程退出并释放设备。
struct Capture {
  handle_id: u64,
  path: String,
  requests: SyncSender<()>,
  frames: Receiver<Result<Frame, FrameError>>,
  worker: JoinHandle<()>,
}

pub struct V4lInput {
  device_path: Option<String>,
  width: u32,
  height: u32,
  frame_interval: Duration,
  capture: Option<Capture>,
}

impl FromUrlWithScheme for V4lInput {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lInput {
  type Error = V4lInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    // v4l:///dev/video0?width=640&height=480&fps=30，路径为空时按朝向选择设备
    let device_path = match url.path() {
      "" | "/" => None,
      path => Some(path.to_string()),
    };

    Ok(V4lInput {
      device_path,
      width: query_u32(url, "width").unwrap_or(V4L_DEFAULT_WIDTH),
      height: query_u32(url, "height").unwrap_or(V4L_DEFAULT_HEIGHT),
      frame_interval: frame_interval_from_url(url),
      capture: None,
    })
  }
}

impl V4lInput {
  fn resolve_device(&self, facing: FacingMode) -> Result<String, AcquireError> {
    if let Some(path) = &self.device_path {
      return Ok(path.clone());
    }

    let nodes = v4l::context::enum_devices();
    if nodes.is_empty() {
      return Err(AcquireError::NoDevice);
    }

    let hints = facing.name_hints();
    let preferred = nodes.iter().find(|node| {
      node.name().is_some_and(|name| {
        let name = name.to_lowercase();
        hints.iter().any(|hint| name.contains(hint))
      })
    });

    let node = match preferred {
      Some(node) => node,
      None => {
        debug!("未找到匹配朝向 {:?} 的设备，使用第一个设备", facing);
        &nodes[0]
      }
    };
    Ok(
      node
        .path()
        .to_str()
        .map(String::from)
        .unwrap_or_else(|| V4L_DEFAULT_DEVICE.to_string()),
    )
  }

  /// 等待一帧的上限：设备自身超时再留出一个帧间隔
  fn frame_wait(&self) -> Duration {
    self.frame_interval * 2
  }
}

fn open_device(config: &CaptureConfig) -> Result<(Device, u32, u32), AcquireError> {
  let device = Device::with_path(&config.path)?;

  let mut format = device.format()?;
  format.width = config.width;
  format.height = config.height;
  format.fourcc = FourCC::new(b"YUYV");
  let format = device.set_format(&format)?;
  if format.fourcc != FourCC::new(b"YUYV") {
    return Err(AcquireError::Device(format!(
      "设备不支持 YUYV 格式: {}",
      format.fourcc
    )));
  }

  Ok((device, format.width, format.height))
}

fn capture_loop(
  config: CaptureConfig,
  ready: SyncSender<Result<(u32, u32), AcquireError>>,
  requests: Receiver<()>,
  frames: SyncSender<Result<Frame, FrameError>>,
) {
  let (device, width, height) = match open_device(&config) {
    Ok(opened) => opened,
    Err(e) => {
      let _ = ready.send(Err(e));
      return;
    }
  };
  let mut stream = match Stream::with_buffers(&device, Type::VideoCapture, V4L_BUFFER_COUNT) {
    Ok(stream) => stream,
    Err(e) => {
      let _ = ready.send(Err(e.into()));
      return;
    }
  };
  stream.set_timeout(config.timeout);
  if ready.send(Ok((width, height))).is_err() {
    return;
  }

  let started = Instant::now();
  let mut frame_index = 0u64;
  for () in requests.iter() {
    let frame = match stream.next() {
      Ok((buffer, _meta)) => {
        frame_index += 1;
        Frame::from_rgb(width, height, yuyv_to_rgb(buffer, width, height))
          .map(|frame| {
            frame
              .with_index(frame_index)
              .with_timestamp(started.elapsed())
          })
          .map_err(|e| FrameError::Format(e.to_string()))
      }
      Err(e) => Err(match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FrameError::Timeout,
        _ => FrameError::Device(e.to_string()),
      }),
    };
    if frames.send(frame).is_err() {
      break;
    }
  }
  debug!("采集线程退出: {}", config.path);
}

impl FrameSource for V4lInput {
  fn open(&mut self, facing: FacingMode) -> Result<DeviceHandle, AcquireError> {
    if self.capture.is_some() {
      return Err(AcquireError::AlreadyOpen);
    }

    let path = self.resolve_device(facing)?;
    info!("打开 V4L2 设备: {}", path);
    let config = CaptureConfig {
      path: path.clone(),
      width: self.width,
      height: self.height,
      timeout: self.frame_interval,
    };

    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    let (request_tx, request_rx) = mpsc::sync_channel(1);
    let (frame_tx, frame_rx) = mpsc::sync_channel(1);
    let worker = thread::Builder::new()
      .name("guoyuan-v4l".to_string())
      .spawn(move || capture_loop(config, ready_tx, request_rx, frame_tx))?;

    let (width, height) = match ready_rx.recv() {
      Ok(Ok(size)) => size,
      Ok(Err(e)) => {
        let _ = worker.join();
        return Err(e);
      }
      Err(_) => {
        let _ = worker.join();
        return Err(AcquireError::Device("采集线程提前退出".to_string()));
      }
    };
    info!("V4L2 设备已打开: {}x{}", width, height);

    let handle = DeviceHandle::issue();
    log_indicator(&path, true);
    self.capture = Some(Capture {
      handle_id: handle.id(),
      path,
      requests: request_tx,
      frames: frame_rx,
      worker,
    });
    Ok(handle)
  }

  fn next_frame(&mut self, handle: &DeviceHandle) -> Result<Frame, FrameError> {
    let wait = self.frame_wait();
    let capture = match &self.capture {
      Some(capture) if capture.handle_id == handle.id() => capture,
      _ => return Err(FrameError::Closed),
    };

    // 丢弃上一次超时后才送达的旧帧
    while capture.frames.try_recv().is_ok() {}
    match capture.requests.try_send(()) {
      Ok(()) => {}
      // 上一个请求仍在处理
      Err(TrySendError::Full(())) => return Err(FrameError::Timeout),
      Err(TrySendError::Disconnected(())) => return Err(FrameError::Closed),
    }

    match capture.frames.recv_timeout(wait) {
      Ok(frame) => frame,
      Err(RecvTimeoutError::Timeout) => Err(FrameError::Timeout),
      Err(RecvTimeoutError::Disconnected) => Err(FrameError::Closed),
    }
  }

  fn close(&mut self, handle: &DeviceHandle) {
    match self.capture.take() {
      Some(capture) if capture.handle_id == handle.id() => {
        let Capture {
          path,
          requests,
          frames,
          worker,
          ..
        } = capture;
        drop(requests);
        drop(frames);
        if worker.join().is_err() {
          warn!("采集线程异常退出: {}", path);
        }
        log_indicator(&path, false);
      }
      other => {
        self.capture = other;
        debug!("忽略对已关闭设备的关闭请求");
      }
    }
  }

  fn is_active(&self) -> bool {
    self.capture.is_some()
  }
}
