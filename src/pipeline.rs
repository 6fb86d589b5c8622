// 该文件是 Guoyuan （果园） 项目的一部分。
// src/pipeline.rs - 单次检测迭代
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

//! # 检测管线
//!
//! [`Pipeline`] 持有一次检测所需的全部资源：帧来源与其设备句柄、推理调用器、
//! 绘制表面和计数器。[`Pipeline::run_tick`] 执行一次完整的迭代：
//!
//! 取帧 → 预处理 → 推理 → 回收张量 → 后处理 → 计数 → 绘制
//!
//! 输入张量在后处理之前释放，推理失败时同样如此。

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::DetectorConfig,
  input::{AcquireError, DeviceHandle, FrameError, FrameSource},
  model::{InferenceError, Invoker, Model},
  output::{RenderError, RenderSink, Surface},
  postprocess::{self, Detection},
  preprocess::{self, PreprocessError},
  reaper::{Reaper, ReaperStats},
  tally::{Aggregator, ClassTally, TallyMode},
};

/// 一次成功迭代的结果
#[derive(Debug, Clone)]
pub struct TickReport {
  /// 会话内的迭代序号，从 1 开始
  pub index: u64,
  pub frame_index: u64,
  /// 帧的采集时间，相对设备打开时刻
  pub frame_timestamp: Duration,
  pub detections: Vec<Detection>,
  pub tally: ClassTally,
  pub preprocess: Duration,
  pub inference: Duration,
  pub total: Duration,
}

#[derive(Error, Debug)]
pub enum TickError {
  #[error("取帧失败: {0}")]
  Frame(#[from] FrameError),
  #[error("预处理失败: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error("推理失败: {0}")]
  Inference(#[from] InferenceError),
  #[error("绘制失败: {0}")]
  Render(#[from] RenderError),
}

impl TickError {
  /// 继续迭代也无法恢复的错误
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      TickError::Inference(InferenceError::ShapeMismatch { .. })
        | TickError::Frame(FrameError::Closed)
        | TickError::Frame(FrameError::EndOfStream)
    )
  }
}

pub struct Pipeline<S, M, R> {
  source: S,
  handle: Option<DeviceHandle>,
  invoker: Invoker<M>,
  surface: R,
  sink: RenderSink,
  aggregator: Aggregator,
  class_names: Vec<String>,
  config: DetectorConfig,
  reaper: Reaper,
  ticks: u64,
}

impl<S: FrameSource, M: Model, R: Surface> Pipeline<S, M, R> {
  pub fn new(
    source: S,
    model: M,
    surface: R,
    class_names: Vec<String>,
    config: DetectorConfig,
  ) -> Self {
    let reaper = Reaper::new();
    Self {
      source,
      handle: None,
      invoker: Invoker::new(model, reaper.clone()),
      surface,
      sink: RenderSink::new(config.overlay),
      aggregator: Aggregator::new(config.tally_mode),
      class_names,
      config,
      reaper,
      ticks: 0,
    }
  }

  pub fn config(&self) -> &DetectorConfig {
    &self.config
  }

  pub fn class_names(&self) -> &[String] {
    &self.class_names
  }

  pub fn is_open(&self) -> bool {
    self.handle.is_some()
  }

  pub fn reaper_stats(&self) -> ReaperStats {
    self.reaper.stats()
  }

  pub fn tick_count(&self) -> u64 {
    self.ticks
  }

  /// 打开摄像头并初始化推理后端，任一失败都不会留下已打开的设备
  pub fn open(&mut self) -> Result<(), OpenError> {
    if self.handle.is_some() {
      return Err(OpenError::Acquire(AcquireError::AlreadyOpen));
    }
    let handle = self.source.open(self.config.facing)?;
    if let Err(e) = self.invoker.acquire_backend() {
      self.source.close(&handle);
      return Err(e.into());
    }
    self.handle = Some(handle);
    Ok(())
  }

  /// 关闭摄像头并释放推理后端，重复调用无副作用
  pub fn close(&mut self) {
    if let Some(handle) = self.handle.take() {
      self.source.close(&handle);
    }
    self.invoker.release_backend();
  }

  /// 预处理目标形状必须与模型声明的输入一致
  pub fn check_input(&self) -> Result<(), InferenceError> {
    self.invoker.check_input(self.config.target_shape)
  }

  /// 进入新的检测会话
  pub fn begin_detection(&mut self) {
    self.ticks = 0;
    self.reaper.reset_peak();
    if self.aggregator.mode() == TallyMode::Session {
      self.aggregator.reset();
    }
  }

  pub fn run_tick(&mut self) -> Result<TickReport, TickError> {
    let started = Instant::now();
    let handle = self.handle.as_ref().ok_or(FrameError::Closed)?;
    let frame = self.source.next_frame(handle)?;
    let (frame_index, frame_timestamp) = (frame.index(), frame.timestamp());
    self.surface.set_background(&frame);

    let input = preprocess::prepare(frame, self.config.target_shape, &self.reaper)?;
    let preprocess = started.elapsed();

    let infer_started = Instant::now();
    let batch = self.invoker.infer(&input);
    input.release();
    let batch = batch?;
    let inference = infer_started.elapsed();
    if let Some(limit) = self.config.slow_inference_warning
      && inference > limit
    {
      warn!("推理耗时 {:.2?} 超过 {:.2?}", inference, limit);
    }

    let detections = postprocess::process(
      &batch,
      self.config.threshold,
      &self.class_names,
      self.surface.size(),
    );
    let tally = self.aggregator.record(&detections);
    self.sink.draw(&detections, &mut self.surface)?;

    self.ticks += 1;
    let total = started.elapsed();
    debug!(
      "第 {} 次迭代 (帧 {} @ {:.2?}): 预处理 {:.2?}, 推理 {:.2?}, 总计 {:.2?}",
      self.ticks, frame_index, frame_timestamp, preprocess, inference, total
    );
    info!("计数: {}", tally);

    Ok(TickReport {
      index: self.ticks,
      frame_index,
      frame_timestamp,
      detections,
      tally,
      preprocess,
      inference,
      total,
    })
  }
}

#[derive(Error, Debug)]
pub enum OpenError {
  #[error("打开摄像头失败: {0}")]
  Acquire(#[from] AcquireError),
  #[error("初始化推理后端失败: {0}")]
  Inference(#[from] InferenceError),
}
