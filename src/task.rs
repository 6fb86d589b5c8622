// 该文件是 Guoyuan （果园） 项目的一部分。
// src/task.rs - 检测任务
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
  sync::mpsc::{self, Receiver, RecvTimeoutError},
  thread,
  time::Duration,
};

use tracing::{error, info, warn};

use crate::{
  input::FrameSource,
  model::Model,
  output::Surface,
  pipeline::TickReport,
  session::{Session, SessionEvent},
  tally::ClassTally,
};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const FORCE_EXIT_DELAY: Duration = Duration::from_secs(30);

pub trait Task<S, M, R>: Sized
where
  S: FrameSource + Send + 'static,
  M: Model + Send + 'static,
  R: Surface + Send + 'static,
{
  type Output;
  fn run_task(self, session: &mut Session<S, M, R>) -> anyhow::Result<Self::Output>;
}

/// 打开摄像头，执行一次迭代后关闭
pub struct OneShotTask;

impl<S, M, R> Task<S, M, R> for OneShotTask
where
  S: FrameSource + Send + 'static,
  M: Model + Send + 'static,
  R: Surface + Send + 'static,
{
  type Output = TickReport;

  fn run_task(self, session: &mut Session<S, M, R>) -> anyhow::Result<TickReport> {
    info!("开始任务...");
    session.open_camera()?;
    let report = session.run_once();
    session.close_camera()?;
    let report = report?;
    info!(
      "推理完成，耗时: {:.2?} / {:.2?}",
      report.inference, report.total
    );
    info!("检测到 {} 个目标: {}", report.detections.len(), report.tally);
    Ok(report)
  }
}

/// 持续检测，直到收到中断信号、达到指定帧数或循环因致命错误退出
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<u64>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 以 `stop` 通道作为中断信号运行
  pub fn run_until<S, M, R>(
    &self,
    session: &mut Session<S, M, R>,
    stop: &Receiver<()>,
  ) -> anyhow::Result<ClassTally>
  where
    S: FrameSource + Send + 'static,
    M: Model + Send + 'static,
    R: Surface + Send + 'static,
  {
    info!("开始任务...");
    let events = session.events();
    session.open_camera()?;
    if let Err(e) = session.start_detection() {
      session.close_camera()?;
      return Err(e.into());
    }

    loop {
      if stop.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      match events.recv_timeout(EVENT_POLL_INTERVAL) {
        Ok(SessionEvent::Tally(report)) => {
          info!("第 {} 帧: {}", report.index, report.tally);
          if self.frame_number.is_some_and(|n| report.index >= n) {
            info!("达到指定帧数 {}, 退出任务循环", report.index);
            break;
          }
        }
        Ok(SessionEvent::IterationFailed { tick, error }) => {
          warn!("第 {} 帧处理失败: {}", tick, error);
        }
        Ok(SessionEvent::Fatal(reason)) => {
          error!("检测循环终止: {}", reason);
          break;
        }
        Err(RecvTimeoutError::Timeout) => {}
        Err(RecvTimeoutError::Disconnected) => break,
      }
    }

    session.stop_detection()?;
    let tally = session.latest_tally();
    session.close_camera()?;
    info!("任务完成，退出");
    Ok(tally)
  }
}

impl<S, M, R> Task<S, M, R> for ContinuousTask
where
  S: FrameSource + Send + 'static,
  M: Model + Send + 'static,
  R: Surface + Send + 'static,
{
  type Output = ClassTally;

  fn run_task(self, session: &mut Session<S, M, R>) -> anyhow::Result<ClassTally> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(FORCE_EXIT_DELAY);
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;

    self.run_until(session, &rx)
  }
}
