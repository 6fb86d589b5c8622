// 该文件是 Guoyuan （果园） 项目的一部分。
// src/bin/live_detect.rs - 摄像头实时检测
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

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use guoyuan::{
  FromUrl,
  config::DetectorConfig,
  input::{FacingMode, InputWrapper},
  model::{Model, ModelWrapper},
  output::OutputWrapper,
  session::Session,
  tally::TallyMode,
  task::{ContinuousTask, Task},
};

/// Guoyuan 实时水果检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 yolo26:///path/model.rknn?manifest=/path/model.json
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 v4l:///dev/video0 或 gst://camera/dev/video0
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 叠加层输出，例如 folder:///var/lib/guoyuan；不指定时不落盘
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,

  #[arg(long, default_value_t = 0.5)]
  pub threshold: f32,
  #[arg(long, default_value = "environment")]
  pub facing: FacingMode,
  #[arg(long, default_value_t = 30)]
  pub fps: u32,
  /// tick 或 session
  #[arg(long, default_value = "tick")]
  pub tally_mode: TallyMode,
  /// 连续失败多少次后停止检测，0 表示不限制
  #[arg(long, default_value_t = 10)]
  pub max_failures: u32,

  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);

  let model = ModelWrapper::from_url(&args.model)?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = match &args.output {
    Some(url) => OutputWrapper::from_url(url)?,
    None => OutputWrapper::headless(),
  };
  let class_names = model.class_names().to_vec();

  let config = DetectorConfig::default()
    .with_threshold(args.threshold)
    .with_target_shape(model.signature().input)
    .with_facing(args.facing)
    .with_frame_interval(Duration::from_secs_f64(1.0 / args.fps.max(1) as f64))
    .with_tally_mode(args.tally_mode)
    .with_max_consecutive_failures((args.max_failures > 0).then_some(args.max_failures));

  let mut session = Session::new(input, model, output, class_names, config)?;
  let frame_number = (args.frame_number > 0).then_some(args.frame_number);
  let tally = ContinuousTask::default()
    .with_frame_number(frame_number)
    .run_task(&mut session)?;

  info!("最终计数: {}", tally);
  session.shutdown();
  Ok(())
}
