// 该文件是 Guoyuan （果园） 项目的一部分。
// src/model/yolo26.rs - RKNPU 上的 YOLO26 模型
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
  sync::mpsc::{self, Receiver, SyncSender},
  thread::{self, JoinHandle},
};

use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{InferenceError, ManifestError, Model, ModelManifest, ModelOutput, ModelSignature},
  tensor::Tensor,
};

const YOLO26_NUM_INPUTS: u32 = 1;
const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];
// 模型内部的粗筛阈值，最终阈值由后处理决定
const YOLO26_CANDIDATE_THRESH: f32 = 0.25;

#[derive(Error, Debug)]
pub enum Yolo26Error {
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("清单错误: {0}")]
  ManifestError(#[from] ManifestError),
}

/// 一次推理请求：UInt8 量化后的 NHWC 输入和回复通道
struct InferRequest {
  input: Vec<u8>,
  reply: SyncSender<Result<ModelOutput, InferenceError>>,
}

/// RKNN 上下文所在的推理线程
///
/// 上下文在推理线程内创建、使用和释放，`Yolo26` 只持有请求通道。
struct Backend {
  requests: SyncSender<InferRequest>,
  worker: JoinHandle<()>,
}

pub struct Yolo26 {
  model_path: String,
  manifest: ModelManifest,
  backend: Option<Backend>,
}

impl FromUrlWithScheme for Yolo26 {
  const SCHEME: &'static str = "yolo26";
}

impl FromUrl for Yolo26 {
  type Error = Yolo26Error;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(Yolo26Error::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let manifest = match url.query_pairs().find(|(k, _)| k == "manifest") {
      Some((_, path)) => ModelManifest::load(path.as_ref())?,
      None => ModelManifest::fruits(),
    };

    Ok(Yolo26 {
      model_path: url.path().to_string(),
      manifest,
      backend: None,
    })
  }
}

impl Yolo26 {
  pub fn class_names(&self) -> &[String] {
    &self.manifest.class_names
  }
}

fn create_context(model_path: &str) -> Result<Context, InferenceError> {
  info!("加载模型文件: {}", model_path);
  let model_data = std::fs::read(model_path)
    .map_err(|e| InferenceError::BackendUnavailable(format!("无法读取模型文件: {}", e)))?;
  debug!(
    "模型文件大小: {:.2} MB",
    model_data.len() as f64 / (1024.0 * 1024.0)
  );

  info!("创建 RKNN 推理上下文");
  let context = Context::new(&model_data, InitFlags::default())
    .map_err(|e| InferenceError::BackendUnavailable(format!("RKNN 初始化失败: {}", e)))?;

  if let Ok(version) = context.sdk_version() {
    if let Ok(api_ver) = version.api_version() {
      debug!("模型 API 版本: {}", api_ver);
    }
    if let Ok(drv_ver) = version.driver_version() {
      debug!("模型驱动版本: {}", drv_ver);
    }
  }

  let num_inputs = context
    .num_inputs()
    .map_err(|e| InferenceError::BackendUnavailable(format!("无法获取输入数量: {}", e)))?;
  let num_outputs = context
    .num_outputs()
    .map_err(|e| InferenceError::BackendUnavailable(format!("无法获取输出数量: {}", e)))?;

  if num_inputs != YOLO26_NUM_INPUTS || num_outputs != YOLO26_NUM_OUTPUTS {
    error!(
      "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
      YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
    );
    return Err(InferenceError::BackendUnavailable(format!(
      "模型输入/输出数量不符: {}/{}",
      num_inputs, num_outputs
    )));
  }

  info!("模型加载完成");
  Ok(context)
}

fn run_context(
  context: &Context,
  manifest: &ModelManifest,
  input: &[u8],
) -> Result<ModelOutput, InferenceError> {
  debug!("设置模型输入");
  context
    .set_input(0, input, rknpu::TensorFormat::NHWC, TensorType::UInt8)
    .map_err(|e| InferenceError::Backend(e.to_string()))?;

  debug!("执行模型推理");
  context
    .run()
    .map_err(|e| InferenceError::Backend(e.to_string()))?;

  let output = context
    .get_outputs()
    .map_err(|e| InferenceError::Backend(e.to_string()))?;
  Ok(decode(manifest, &output))
}

fn inference_loop(
  model_path: String,
  manifest: ModelManifest,
  ready: SyncSender<Result<(), InferenceError>>,
  requests: Receiver<InferRequest>,
) {
  let context = match create_context(&model_path) {
    Ok(context) => context,
    Err(e) => {
      let _ = ready.send(Err(e));
      return;
    }
  };
  if ready.send(Ok(())).is_err() {
    return;
  }

  for request in requests.iter() {
    let result = run_context(&context, &manifest, &request.input);
    // 调用方放弃等待时丢弃结果
    let _ = request.reply.send(result);
  }
  info!("释放 RKNN 推理上下文");
}

fn decode(manifest: &ModelManifest, output: &rknpu::Output) -> ModelOutput {
  let class_num = manifest.class_names.len();
  let input_w = manifest.input.width as f32;
  let input_h = manifest.input.height as f32;

  let mut candidates = Vec::new();
  for (head_idx, stride) in YOLO26_STRIDES.iter().copied().enumerate() {
    let map_h = (input_h / stride) as usize;
    let map_w = (input_w / stride) as usize;
    let spatial = map_h * map_w;

    // RKNN 输出顺序可能不同，按张量大小区分回归和分类
    let output_idx1 = head_idx * 2;
    let output_idx2 = head_idx * 2 + 1;
    let (tensor1, tensor2) = match (output.get_f32(output_idx1), output.get_f32(output_idx2)) {
      (Ok(t1), Ok(t2)) => (t1, t2),
      _ => {
        error!("检测头 {}: 获取输出失败", head_idx);
        continue;
      }
    };
    let (reg, cls) = match match_reg_cls_tensors(tensor1, tensor2, 4 * spatial, class_num * spatial)
    {
      Some(tensors) => tensors,
      None => {
        error!(
          "检测头 {}: 输出大小不匹配 - {}, {}",
          head_idx,
          tensor1.len(),
          tensor2.len()
        );
        continue;
      }
    };

    for h in 0..map_h {
      for w in 0..map_w {
        let idx = h * map_w + w;

        let (max_logit, class_id) = (0..class_num)
          .map(|c| (cls[c * spatial + idx], c))
          .fold((f32::MIN, 0), |best, cur| if cur.0 > best.0 { cur } else { best });
        let score = sigmoid(max_logit);
        if score <= YOLO26_CANDIDATE_THRESH {
          continue;
        }

        let grid_x = (w as f32) + 0.5;
        let grid_y = (h as f32) + 0.5;
        let x0 = ((grid_x - reg[idx]) * stride).clamp(0.0, input_w) / input_w;
        let y0 = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, input_h) / input_h;
        let x1 = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, input_w) / input_w;
        let y1 = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, input_h) / input_h;

        candidates.push(([y0, x0, y1, x1], score, class_id as f32));
      }
    }
  }

  candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
  candidates.truncate(manifest.max_detections);
  debug!("检测到 {} 个候选", candidates.len());

  let mut output = ModelOutput::default();
  for (bbox, score, class) in candidates {
    output.boxes.extend_from_slice(&bbox);
    output.scores.push(score);
    output.classes.push(class);
  }
  output
}

/// 模型为 UInt8 量化输入
fn quantize(input: &Tensor) -> Vec<u8> {
  input
    .as_slice()
    .iter()
    .map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
    .collect()
}

impl Model for Yolo26 {
  fn signature(&self) -> ModelSignature {
    self.manifest.signature()
  }

  fn load(&mut self) -> Result<(), InferenceError> {
    if self.backend.is_some() {
      return Ok(());
    }

    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    let (request_tx, request_rx) = mpsc::sync_channel(1);
    let model_path = self.model_path.clone();
    let manifest = self.manifest.clone();
    let worker = thread::Builder::new()
      .name("guoyuan-rknn".to_string())
      .spawn(move || inference_loop(model_path, manifest, ready_tx, request_rx))
      .map_err(|e| InferenceError::BackendUnavailable(format!("无法启动推理线程: {}", e)))?;

    match ready_rx.recv() {
      Ok(Ok(())) => {
        self.backend = Some(Backend {
          requests: request_tx,
          worker,
        });
        Ok(())
      }
      Ok(Err(e)) => {
        let _ = worker.join();
        Err(e)
      }
      Err(_) => {
        let _ = worker.join();
        Err(InferenceError::BackendUnavailable(
          "推理线程提前退出".to_string(),
        ))
      }
    }
  }

  fn unload(&mut self) {
    if let Some(Backend { requests, worker }) = self.backend.take() {
      drop(requests);
      if worker.join().is_err() {
        warn!("推理线程异常退出");
      }
    }
  }

  fn infer(&self, input: &Tensor) -> Result<ModelOutput, InferenceError> {
    let backend = self
      .backend
      .as_ref()
      .ok_or_else(|| InferenceError::BackendUnavailable("RKNN 上下文未创建".to_string()))?;

    let (reply_tx, reply_rx) = mpsc::sync_channel(1);
    backend
      .requests
      .send(InferRequest {
        input: quantize(input),
        reply: reply_tx,
      })
      .map_err(|_| InferenceError::Backend("推理线程已退出".to_string()))?;
    reply_rx
      .recv()
      .map_err(|_| InferenceError::Backend("推理线程未返回结果".to_string()))?
  }
}

/// 根据张量大小匹配回归和分类输出，返回 (reg, cls)
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    Some((tensor2, tensor1))
  } else {
    None
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
