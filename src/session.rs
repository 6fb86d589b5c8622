// 该文件是 Guoyuan （果园） 项目的一部分。
// src/session.rs - 检测会话状态机
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

//! # 检测会话
//!
//! ```text
//! Idle --open_camera--> CameraActive --start_detection--> Detecting
//!  ^                        ^    |                           |
//!  |                        |    +------run_once------+      |
//!  |                        +------stop_detection------------+
//!  +----------------close_camera (任意状态)------------------+
//! shutdown (任意状态) --> Stopped
//! ```
//!
//! 检测期间，[`Pipeline`] 被移入独立的工作线程，由它逐帧执行迭代；停止时
//! 通过原子标志通知工作线程，等待当前迭代结束后取回 `Pipeline`。

use std::{
  fmt,
  panic::{self, AssertUnwindSafe},
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc::{self, Receiver, SyncSender, TrySendError},
  },
  thread::{self, JoinHandle},
  time::Instant,
};

use thiserror::Error;
use tracing::{error, info, trace, warn};

use crate::{
  config::{ConfigError, DetectorConfig},
  input::{AcquireError, FrameSource},
  model::{InferenceError, Model},
  output::Surface,
  pipeline::{OpenError, Pipeline, TickError, TickReport},
  reaper::ReaperStats,
  tally::ClassTally,
};

/// 事件队列容量；订阅者读取不及时，超出的事件被丢弃
pub const EVENT_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
  Idle,
  CameraActive,
  Detecting,
  Stopped,
}

impl fmt::Display for LoopState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      LoopState::Idle => "Idle",
      LoopState::CameraActive => "CameraActive",
      LoopState::Detecting => "Detecting",
      LoopState::Stopped => "Stopped",
    };
    write!(f, "{}", name)
  }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
  Tally(TickReport),
  /// 单次迭代失败，循环继续
  IterationFailed {
    /// 本次检测中的迭代序号，含失败的迭代
    tick: u64,
    error: Arc<TickError>,
  },
  /// 循环因致命错误退出，会话回到 CameraActive
  Fatal(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("摄像头错误: {0}")]
  Acquire(#[from] AcquireError),
  #[error("推理错误: {0}")]
  Inference(#[from] InferenceError),
  #[error("迭代错误: {0}")]
  Tick(#[from] TickError),
  #[error("状态 {state} 下不能执行 {action}")]
  InvalidState {
    state: LoopState,
    action: &'static str,
  },
  #[error("会话已停止")]
  Stopped,
  #[error("工作线程错误: {0}")]
  Worker(String),
}

impl From<OpenError> for SessionError {
  fn from(err: OpenError) -> Self {
    match err {
      OpenError::Acquire(e) => SessionError::Acquire(e),
      OpenError::Inference(e) => SessionError::Inference(e),
    }
  }
}

/// 会话与工作线程共享的状态
#[derive(Default)]
struct Shared {
  cancel: AtomicBool,
  ticks: AtomicU64,
  latest: Mutex<ClassTally>,
  events: Mutex<Option<SyncSender<SessionEvent>>>,
}

impl Shared {
  fn emit(&self, event: SessionEvent) {
    let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(tx) = events.as_ref() else {
      return;
    };
    match tx.try_send(event) {
      Ok(()) => {}
      Err(TrySendError::Full(_)) => trace!("事件队列已满，丢弃事件"),
      // 接收端已丢弃
      Err(TrySendError::Disconnected(_)) => *events = None,
    }
  }

  fn set_latest(&self, tally: ClassTally) {
    *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = tally;
  }
}

type Worker<S, M, R> = JoinHandle<Option<Pipeline<S, M, R>>>;

pub struct Session<S, M, R>
where
  S: FrameSource + Send + 'static,
  M: Model + Send + 'static,
  R: Surface + Send + 'static,
{
  state: LoopState,
  pipeline: Option<Pipeline<S, M, R>>,
  worker: Option<Worker<S, M, R>>,
  shared: Arc<Shared>,
}

impl<S, M, R> Session<S, M, R>
where
  S: FrameSource + Send + 'static,
  M: Model + Send + 'static,
  R: Surface + Send + 'static,
{
  pub fn new(
    source: S,
    model: M,
    surface: R,
    class_names: Vec<String>,
    config: DetectorConfig,
  ) -> Result<Self, SessionError> {
    config.validate()?;
    Ok(Self {
      state: LoopState::Idle,
      pipeline: Some(Pipeline::new(source, model, surface, class_names, config)),
      worker: None,
      shared: Arc::new(Shared::default()),
    })
  }

  /// 当前状态；工作线程因致命错误退出后报告 CameraActive
  pub fn state(&self) -> LoopState {
    match (&self.state, &self.worker) {
      (LoopState::Detecting, Some(worker)) if worker.is_finished() => LoopState::CameraActive,
      (state, _) => *state,
    }
  }

  /// 最近一次成功迭代的计数
  pub fn latest_tally(&self) -> ClassTally {
    self
      .shared
      .latest
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// 本次检测会话中成功完成的迭代数
  pub fn tick_count(&self) -> u64 {
    self.shared.ticks.load(Ordering::Acquire)
  }

  /// 订阅会话事件，替换之前的订阅者
  ///
  /// 队列最多缓存 [`EVENT_QUEUE_CAPACITY`] 个事件。
  pub fn events(&self) -> Receiver<SessionEvent> {
    let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_CAPACITY);
    *self
      .shared
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(tx);
    rx
  }

  /// 检测进行中返回 `None`
  pub fn reaper_stats(&self) -> Option<ReaperStats> {
    self.pipeline.as_ref().map(Pipeline::reaper_stats)
  }

  pub fn open_camera(&mut self) -> Result<(), SessionError> {
    self.settle()?;
    self.expect_state(LoopState::Idle, "open_camera")?;
    let pipeline = self.pipeline_mut()?;
    pipeline.open()?;
    self.transition(LoopState::CameraActive);
    Ok(())
  }

  pub fn start_detection(&mut self) -> Result<(), SessionError> {
    self.settle()?;
    self.expect_state(LoopState::CameraActive, "start_detection")?;
    let mut pipeline = self.pipeline.take().ok_or(SessionError::Stopped)?;
    if let Err(e) = pipeline.check_input() {
      error!("拒绝开始检测: {}", e);
      self.pipeline = Some(pipeline);
      return Err(e.into());
    }
    pipeline.begin_detection();
    self.shared.cancel.store(false, Ordering::Release);
    self.shared.ticks.store(0, Ordering::Release);
    self.shared.set_latest(ClassTally::default());

    let (tx, rx) = mpsc::channel::<Pipeline<S, M, R>>();
    let shared = self.shared.clone();
    let spawned = thread::Builder::new()
      .name("guoyuan-detect".to_string())
      .spawn(move || {
        let pipeline = rx.recv().ok()?;
        Some(detect_loop(pipeline, &shared))
      });
    let worker = match spawned {
      Ok(worker) => worker,
      Err(e) => {
        self.pipeline = Some(pipeline);
        return Err(SessionError::Worker(e.to_string()));
      }
    };
    if let Err(mpsc::SendError(pipeline)) = tx.send(pipeline) {
      self.pipeline = Some(pipeline);
      return Err(SessionError::Worker("工作线程提前退出".to_string()));
    }

    self.worker = Some(worker);
    self.transition(LoopState::Detecting);
    Ok(())
  }

  /// 请求停止并等待当前迭代结束，摄像头保持打开
  pub fn stop_detection(&mut self) -> Result<(), SessionError> {
    match self.state {
      LoopState::Detecting => self.join_worker(),
      // 循环已因致命错误自行退出
      LoopState::CameraActive => Ok(()),
      LoopState::Stopped => Err(SessionError::Stopped),
      state => Err(SessionError::InvalidState {
        state,
        action: "stop_detection",
      }),
    }
  }

  /// 任意状态下关闭摄像头并回到 Idle
  pub fn close_camera(&mut self) -> Result<(), SessionError> {
    if self.state == LoopState::Stopped {
      return Err(SessionError::Stopped);
    }
    if self.state == LoopState::Detecting {
      self.join_worker()?;
    }
    if let Some(pipeline) = self.pipeline.as_mut() {
      pipeline.close();
    }
    if self.state != LoopState::Idle {
      self.transition(LoopState::Idle);
    }
    Ok(())
  }

  /// 在调用线程上同步执行一次迭代
  pub fn run_once(&mut self) -> Result<TickReport, SessionError> {
    self.settle()?;
    self.expect_state(LoopState::CameraActive, "run_once")?;
    let pipeline = self.pipeline_mut()?;
    pipeline.check_input()?;
    let report = pipeline.run_tick()?;
    self.shared.set_latest(report.tally.clone());
    self.shared.ticks.fetch_add(1, Ordering::AcqRel);
    Ok(report)
  }

  /// 停止检测、关闭摄像头并进入终止状态
  pub fn shutdown(&mut self) {
    if self.state == LoopState::Stopped {
      return;
    }
    if let Err(e) = self.close_camera() {
      warn!("关闭会话时出错: {}", e);
    }
    if let Some(pipeline) = self.pipeline.as_mut() {
      pipeline.close();
    }
    *self
      .shared
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = None;
    self.transition(LoopState::Stopped);
  }

  fn transition(&mut self, next: LoopState) {
    info!("会话状态: {} -> {}", self.state, next);
    self.state = next;
  }

  fn expect_state(&self, expected: LoopState, action: &'static str) -> Result<(), SessionError> {
    match self.state {
      LoopState::Stopped => Err(SessionError::Stopped),
      state if state == expected => Ok(()),
      state => Err(SessionError::InvalidState { state, action }),
    }
  }

  fn pipeline_mut(&mut self) -> Result<&mut Pipeline<S, M, R>, SessionError> {
    self.pipeline.as_mut().ok_or(SessionError::Stopped)
  }

  /// 回收已自行退出的工作线程
  fn settle(&mut self) -> Result<(), SessionError> {
    if self.state == LoopState::Detecting
      && self.worker.as_ref().is_some_and(JoinHandle::is_finished)
    {
      self.join_worker()?;
    }
    Ok(())
  }

  fn join_worker(&mut self) -> Result<(), SessionError> {
    self.shared.cancel.store(true, Ordering::Release);
    let Some(worker) = self.worker.take() else {
      self.transition(LoopState::CameraActive);
      return Ok(());
    };
    worker.thread().unpark();
    match worker.join() {
      Ok(Some(pipeline)) => {
        info!(
          "检测循环已停止，共完成 {} 次迭代",
          pipeline.tick_count()
        );
        self.pipeline = Some(pipeline);
        self.transition(LoopState::CameraActive);
        Ok(())
      }
      Ok(None) => {
        self.transition(LoopState::Stopped);
        Err(SessionError::Worker("工作线程未收到检测管线".to_string()))
      }
      Err(_) => {
        self.transition(LoopState::Stopped);
        Err(SessionError::Worker("工作线程异常退出".to_string()))
      }
    }
  }
}

impl<S, M, R> Drop for Session<S, M, R>
where
  S: FrameSource + Send + 'static,
  M: Model + Send + 'static,
  R: Surface + Send + 'static,
{
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn detect_loop<S, M, R>(mut pipeline: Pipeline<S, M, R>, shared: &Shared) -> Pipeline<S, M, R>
where
  S: FrameSource,
  M: Model,
  R: Surface,
{
  let interval = pipeline.config().frame_interval;
  let failure_limit = pipeline.config().max_consecutive_failures;
  let mut failures = 0u32;
  let mut tick = 0u64;
  info!("检测循环启动，帧间隔 {:.2?}", interval);

  while !shared.cancel.load(Ordering::Acquire) {
    let started = Instant::now();
    tick += 1;

    match panic::catch_unwind(AssertUnwindSafe(|| pipeline.run_tick())) {
      Ok(Ok(report)) => {
        failures = 0;
        shared.set_latest(report.tally.clone());
        shared.ticks.fetch_add(1, Ordering::AcqRel);
        shared.emit(SessionEvent::Tally(report));
      }
      Ok(Err(e)) if e.is_fatal() => {
        error!("第 {} 次迭代发生致命错误: {}", tick, e);
        shared.emit(SessionEvent::Fatal(e.to_string()));
        break;
      }
      Ok(Err(e)) => {
        failures += 1;
        warn!("第 {} 次迭代失败: {}", tick, e);
        shared.emit(SessionEvent::IterationFailed {
          tick,
          error: Arc::new(e),
        });
        if let Some(limit) = failure_limit
          && failures >= limit
        {
          error!("连续失败 {} 次，停止检测", failures);
          shared.emit(SessionEvent::Fatal(format!("连续失败 {} 次", failures)));
          break;
        }
      }
      Err(_) => {
        error!("第 {} 次迭代发生 panic，停止检测", tick);
        shared.emit(SessionEvent::Fatal(format!("第 {} 次迭代发生 panic", tick)));
        break;
      }
    }

    // 按帧间隔节拍，慢迭代直接进入下一次
    let deadline = started + interval;
    while !shared.cancel.load(Ordering::Acquire) {
      let now = Instant::now();
      if now >= deadline {
        break;
      }
      thread::park_timeout(deadline - now);
    }
  }

  info!("检测循环退出");
  pipeline
}
