// 该文件是 Guoyuan （果园） 项目的一部分。
// src/tally.rs - 类别计数
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

use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::postprocess::Detection;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassTally {
  counts: BTreeMap<String, usize>,
}

impl ClassTally {
  pub fn get(&self, class_name: &str) -> usize {
    self.counts.get(class_name).copied().unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.counts.is_empty()
  }

  pub fn len(&self) -> usize {
    self.counts.len()
  }

  pub fn total(&self) -> usize {
    self.counts.values().sum()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
    self.counts.iter().map(|(k, v)| (k.as_str(), *v))
  }

  fn add(&mut self, class_name: &str, n: usize) {
    *self.counts.entry(class_name.to_string()).or_insert(0) += n;
  }

  fn merge(&mut self, other: &ClassTally) {
    for (name, n) in other.iter() {
      self.add(name, n);
    }
  }
}

impl<'a> FromIterator<(&'a str, usize)> for ClassTally {
  fn from_iter<I: IntoIterator<Item = (&'a str, usize)>>(iter: I) -> Self {
    let mut tally = ClassTally::default();
    for (name, n) in iter {
      tally.add(name, n);
    }
    tally
  }
}

impl fmt::Display for ClassTally {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_empty() {
      return write!(f, "无");
    }
    let parts = self
      .iter()
      .map(|(name, n)| format!("{} {}", name, n))
      .collect::<Vec<_>>();
    write!(f, "{}", parts.join(", "))
  }
}

/// 计数模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TallyMode {
  /// 每一帧重新计数
  #[default]
  PerTick,
  /// 在一次检测会话内累计，开始检测时清零
  Session,
}

impl FromStr for TallyMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "tick" | "per-tick" => Ok(TallyMode::PerTick),
      "session" => Ok(TallyMode::Session),
      other => Err(format!("未知计数模式: {}", other)),
    }
  }
}

#[derive(Debug, Default)]
pub struct Aggregator {
  mode: TallyMode,
  session: ClassTally,
}

impl Aggregator {
  pub fn new(mode: TallyMode) -> Self {
    Self {
      mode,
      session: ClassTally::default(),
    }
  }

  pub fn mode(&self) -> TallyMode {
    self.mode
  }

  /// 从本帧的检测结果重新构建计数
  pub fn tally(detections: &[Detection]) -> ClassTally {
    detections
      .iter()
      .map(|d| (d.class_name.as_str(), 1))
      .collect()
  }

  /// 记录本帧结果，返回按模式对外展示的计数
  pub fn record(&mut self, detections: &[Detection]) -> ClassTally {
    let current = Self::tally(detections);
    match self.mode {
      TallyMode::PerTick => current,
      TallyMode::Session => {
        self.session.merge(&current);
        self.session.clone()
      }
    }
  }

  pub fn reset(&mut self) {
    self.session = ClassTally::default();
  }
}
