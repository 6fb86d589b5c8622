// 该文件是 Guoyuan （果园） 项目的一部分。
// src/bin/oneshot_detect.rs - 单张图像检测
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use guoyuan::{
  FromUrl,
  config::DetectorConfig,
  input::InputWrapper,
  model::{Model, ModelWrapper},
  output::OutputWrapper,
  session::Session,
  task::{OneShotTask, Task},
};

/// Guoyuan 单帧检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，通常为 image:///path/to/fruit.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，例如 image:///tmp/overlay.png?font=/path/font.ttf
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  #[arg(long, default_value_t = 0.5)]
  pub threshold: f32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let model = ModelWrapper::from_url(&args.model)?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let class_names = model.class_names().to_vec();

  let config = DetectorConfig::default()
    .with_threshold(args.threshold)
    .with_target_shape(model.signature().input);

  let mut session = Session::new(input, model, output, class_names, config)?;
  let report = OneShotTask.run_task(&mut session)?;
  for detection in &report.detections {
    info!(
      "  - {} at ({:.0}, {:.0}, {:.0}x{:.0})",
      detection.label(),
      detection.pixel_box.x,
      detection.pixel_box.y,
      detection.pixel_box.width,
      detection.pixel_box.height
    );
  }
  info!("计数: {}", report.tally);
  Ok(())
}
