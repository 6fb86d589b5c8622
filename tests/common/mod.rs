// 该文件是 Guoyuan （果园） 项目的一部分。
// tests/common/mod.rs - 测试用的帧来源、模型与绘制表面
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

#![allow(dead_code)]

use std::{
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc::{self, Receiver, Sender},
  },
  time::{Duration, Instant},
};

use guoyuan::{
  config::DetectorConfig,
  frame::Frame,
  input::{AcquireError, DeviceHandle, FacingMode, FrameError, FrameSource},
  model::{InferenceError, Model, ModelOutput, ModelSignature},
  output::{OverlayStyle, Surface},
  postprocess::{PixelBox, SurfaceSize},
  tensor::{Tensor, TensorShape},
};

pub const INPUT: TensorShape = TensorShape::rgb_input(32, 32);

pub fn config() -> DetectorConfig {
  DetectorConfig::default()
    .with_target_shape(INPUT)
    .with_frame_interval(Duration::from_millis(1))
}

pub fn names(list: &[&str]) -> Vec<String> {
  list.iter().map(|s| s.to_string()).collect()
}

/// 按 `(bbox, score, class)` 构造模型输出，bbox 为 `[y0, x0, y1, x1]`
pub fn output(items: &[([f32; 4], f32, f32)]) -> ModelOutput {
  ModelOutput {
    boxes: items.iter().flat_map(|(b, _, _)| b.iter().copied()).collect(),
    scores: items.iter().map(|(_, s, _)| *s).collect(),
    classes: items.iter().map(|(_, _, c)| *c).collect(),
  }
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(2));
  }
  condition()
}

#[derive(Debug, Default)]
pub struct SourceCounters {
  pub opens: AtomicUsize,
  pub closes: AtomicUsize,
  pub frames: AtomicUsize,
  pub active: AtomicBool,
}

pub struct ScriptedSource {
  counters: Arc<SourceCounters>,
  script: Vec<Result<(), FrameError>>,
  open_error: Option<AcquireError>,
  handle: Option<u64>,
}

impl ScriptedSource {
  pub fn new() -> Self {
    Self {
      counters: Arc::new(SourceCounters::default()),
      script: vec![Ok(())],
      open_error: None,
      handle: None,
    }
  }

  /// 取帧结果循环使用，`Ok(())` 产生一帧
  pub fn with_script(mut self, script: Vec<Result<(), FrameError>>) -> Self {
    self.script = script;
    self
  }

  pub fn failing_open(mut self, error: AcquireError) -> Self {
    self.open_error = Some(error);
    self
  }

  pub fn counters(&self) -> Arc<SourceCounters> {
    self.counters.clone()
  }
}

impl FrameSource for ScriptedSource {
  fn open(&mut self, _facing: FacingMode) -> Result<DeviceHandle, AcquireError> {
    if let Some(error) = &self.open_error {
      return Err(error.clone());
    }
    if self.handle.is_some() {
      return Err(AcquireError::AlreadyOpen);
    }
    let handle = DeviceHandle::issue();
    self.handle = Some(handle.id());
    self.counters.opens.fetch_add(1, Ordering::SeqCst);
    self.counters.active.store(true, Ordering::SeqCst);
    Ok(handle)
  }

  fn next_frame(&mut self, handle: &DeviceHandle) -> Result<Frame, FrameError> {
    if self.handle != Some(handle.id()) {
      return Err(FrameError::Closed);
    }
    let n = self.counters.frames.fetch_add(1, Ordering::SeqCst);
    match &self.script[n % self.script.len()] {
      Ok(()) => Ok(Frame::filled(64, 48, [120, 200, 80]).with_index(n as u64 + 1)),
      Err(e) => Err(e.clone()),
    }
  }

  fn close(&mut self, handle: &DeviceHandle) {
    if self.handle == Some(handle.id()) {
      self.handle = None;
      self.counters.closes.fetch_add(1, Ordering::SeqCst);
      self.counters.active.store(false, Ordering::SeqCst);
    }
  }

  fn is_active(&self) -> bool {
    self.handle.is_some()
  }
}

#[derive(Debug, Clone)]
pub enum Step {
  Output(ModelOutput),
  Fail(InferenceError),
  Panic,
}

#[derive(Debug, Default)]
pub struct ModelCounters {
  pub infers: AtomicUsize,
  pub loaded: AtomicBool,
}

pub struct ScriptedModel {
  signature: ModelSignature,
  script: Vec<Step>,
  load_error: Option<InferenceError>,
  counters: Arc<ModelCounters>,
}

impl ScriptedModel {
  /// 步骤循环使用
  pub fn new(script: Vec<Step>) -> Self {
    Self {
      signature: ModelSignature {
        input: INPUT,
        max_detections: 4,
      },
      script,
      load_error: None,
      counters: Arc::new(ModelCounters::default()),
    }
  }

  pub fn always(output: ModelOutput) -> Self {
    Self::new(vec![Step::Output(output)])
  }

  pub fn with_input(mut self, input: TensorShape) -> Self {
    self.signature.input = input;
    self
  }

  pub fn failing_load(mut self, error: InferenceError) -> Self {
    self.load_error = Some(error);
    self
  }

  pub fn counters(&self) -> Arc<ModelCounters> {
    self.counters.clone()
  }
}

impl Model for ScriptedModel {
  fn signature(&self) -> ModelSignature {
    self.signature
  }

  fn load(&mut self) -> Result<(), InferenceError> {
    if let Some(error) = &self.load_error {
      return Err(error.clone());
    }
    self.counters.loaded.store(true, Ordering::SeqCst);
    Ok(())
  }

  fn unload(&mut self) {
    self.counters.loaded.store(false, Ordering::SeqCst);
  }

  fn infer(&self, _input: &Tensor) -> Result<ModelOutput, InferenceError> {
    let n = self.counters.infers.fetch_add(1, Ordering::SeqCst);
    match &self.script[n % self.script.len()] {
      Step::Output(output) => Ok(output.clone()),
      Step::Fail(error) => Err(error.clone()),
      Step::Panic => panic!("scripted model panic"),
    }
  }
}

/// 每次推理先通知 `entered`，再阻塞到闸门放行或闸门关闭
pub struct GatedModel {
  inner: ScriptedModel,
  entered: Sender<()>,
  gate: Mutex<Receiver<()>>,
}

impl GatedModel {
  /// 返回模型、推理开始的通知和闸门
  pub fn new(inner: ScriptedModel) -> (Self, Receiver<()>, Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel();
    let model = Self {
      inner,
      entered: entered_tx,
      gate: Mutex::new(gate_rx),
    };
    (model, entered_rx, gate_tx)
  }
}

impl Model for GatedModel {
  fn signature(&self) -> ModelSignature {
    self.inner.signature()
  }

  fn load(&mut self) -> Result<(), InferenceError> {
    self.inner.load()
  }

  fn unload(&mut self) {
    self.inner.unload()
  }

  fn infer(&self, input: &Tensor) -> Result<ModelOutput, InferenceError> {
    let _ = self.entered.send(());
    let _ = self.gate.lock().unwrap().recv();
    self.inner.infer(input)
  }
}

/// 固定 640x640 的表面，记录每一次绘制调用
#[derive(Clone)]
pub struct RecordingSurface {
  calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingSurface {
  pub fn new() -> Self {
    Self {
      calls: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  fn push(&self, call: String) {
    self.calls.lock().unwrap().push(call);
  }
}

impl Surface for RecordingSurface {
  fn size(&self) -> SurfaceSize {
    SurfaceSize::new(640, 640)
  }

  fn clear(&mut self) {
    self.push("clear".to_string());
  }

  fn draw_rect(&mut self, rect: PixelBox, _style: &OverlayStyle) {
    self.push(format!(
      "rect {:.0} {:.0} {:.0} {:.0}",
      rect.x, rect.y, rect.width, rect.height
    ));
  }

  fn draw_text(&mut self, text: &str, x: f32, y: f32, _style: &OverlayStyle) {
    self.push(format!("text {} {:.0} {:.0}", text, x, y));
  }
}
