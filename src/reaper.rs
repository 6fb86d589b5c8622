// 该文件是 Guoyuan （果园） 项目的一部分。
// src/reaper.rs - 张量生命周期回收
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

//! # 张量回收
//!
//! 每一次迭代中创建的张量都通过 [`Reaper::acquire`] 登记，得到一个
//! [`Scoped`] 守卫。守卫被释放时（正常返回、`?` 提前返回、panic 展开、
//! 取消）计数器随之递减，因此 `acquired == released` 在任意退出路径上都成立。

use std::{
  convert::Infallible,
  ops::{Deref, DerefMut},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use tracing::trace;

#[derive(Debug, Default)]
struct Counters {
  acquired: AtomicUsize,
  released: AtomicUsize,
  live: AtomicUsize,
  peak_live: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReaperStats {
  pub acquired: usize,
  pub released: usize,
  pub live: usize,
  pub peak_live: usize,
}

impl ReaperStats {
  pub fn is_balanced(&self) -> bool {
    self.acquired == self.released && self.live == 0
  }
}

/// 张量登记处，克隆后共享同一组计数器
#[derive(Debug, Clone, Default)]
pub struct Reaper {
  counters: Arc<Counters>,
}

impl Reaper {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn acquire<T>(&self, value: T) -> Scoped<T> {
    self.counters.acquired.fetch_add(1, Ordering::Relaxed);
    let live = self.counters.live.fetch_add(1, Ordering::AcqRel) + 1;
    self.counters.peak_live.fetch_max(live, Ordering::Relaxed);
    trace!("登记张量，当前存活 {}", live);

    Scoped {
      value: Some(value),
      counters: self.counters.clone(),
    }
  }

  pub fn stats(&self) -> ReaperStats {
    ReaperStats {
      acquired: self.counters.acquired.load(Ordering::Acquire),
      released: self.counters.released.load(Ordering::Acquire),
      live: self.counters.live.load(Ordering::Acquire),
      peak_live: self.counters.peak_live.load(Ordering::Acquire),
    }
  }

  /// 重置峰值为当前存活数，便于按会话观察
  pub fn reset_peak(&self) {
    let live = self.counters.live.load(Ordering::Acquire);
    self.counters.peak_live.store(live, Ordering::Release);
  }
}

/// 作用域守卫：离开作用域即释放
#[derive(Debug)]
pub struct Scoped<T> {
  value: Option<T>,
  counters: Arc<Counters>,
}

impl<T> Scoped<T> {
  /// 立即释放，等价于 `drop`，在调用处标明释放点
  pub fn release(self) {}

  /// 用当前值生成下一阶段的值：释放当前登记并登记新值
  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Scoped<U> {
    match self.try_map(|value| Ok::<U, Infallible>(f(value))) {
      Ok(next) => next,
      Err(never) => match never {},
    }
  }

  /// 同 [`Scoped::map`]，失败时当前值已释放，不登记新值
  pub fn try_map<U, E>(mut self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Scoped<U>, E> {
    let counters = self.counters.clone();
    let value = match self.value.take() {
      Some(value) => value,
      None => unreachable!("scoped value taken before drop"),
    };
    counters.released.fetch_add(1, Ordering::Relaxed);
    counters.live.fetch_sub(1, Ordering::AcqRel);

    let next = f(value)?;
    counters.acquired.fetch_add(1, Ordering::Relaxed);
    let live = counters.live.fetch_add(1, Ordering::AcqRel) + 1;
    counters.peak_live.fetch_max(live, Ordering::Relaxed);

    Ok(Scoped {
      value: Some(next),
      counters,
    })
  }
}

impl<T> Deref for Scoped<T> {
  type Target = T;

  fn deref(&self) -> &T {
    // value 仅在 drop 中被取走
    match &self.value {
      Some(value) => value,
      None => unreachable!("scoped value taken before drop"),
    }
  }
}

impl<T> DerefMut for Scoped<T> {
  fn deref_mut(&mut self) -> &mut T {
    match &mut self.value {
      Some(value) => value,
      None => unreachable!("scoped value taken before drop"),
    }
  }
}

impl<T> Drop for Scoped<T> {
  fn drop(&mut self) {
    if self.value.take().is_some() {
      self.counters.released.fetch_add(1, Ordering::Relaxed);
      let live = self.counters.live.fetch_sub(1, Ordering::AcqRel) - 1;
      trace!("释放张量，当前存活 {}", live);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn drop_releases() {
    let reaper = Reaper::new();
    {
      let _a = reaper.acquire(1u8);
      let _b = reaper.acquire(2u8);
      assert_eq!(reaper.stats().live, 2);
    }
    let stats = reaper.stats();
    assert_eq!(stats.acquired, 2);
    assert_eq!(stats.released, 2);
    assert_eq!(stats.peak_live, 2);
    assert!(stats.is_balanced());
  }

  #[test]
  fn early_return_releases() {
    fn fails(reaper: &Reaper) -> Result<(), &'static str> {
      let _tensor = reaper.acquire(vec![0.0f32; 16]);
      Err("推理失败")
    }

    let reaper = Reaper::new();
    assert!(fails(&reaper).is_err());
    assert!(reaper.stats().is_balanced());
  }

  #[test]
  fn failed_stage_releases_input() {
    let reaper = Reaper::new();
    let result = reaper.acquire(4u32).try_map(|_| Err::<u32, _>("stage failed"));
    assert!(result.is_err());
    let stats = reaper.stats();
    assert_eq!((stats.acquired, stats.released), (1, 1));
    assert!(stats.is_balanced());
  }

  #[test]
  fn panic_unwinding_releases() {
    let reaper = Reaper::new();
    let cloned = reaper.clone();
    let result = std::panic::catch_unwind(move || {
      let _tensor = cloned.acquire(3u32);
      panic!("boom");
    });
    assert!(result.is_err());
    assert!(reaper.stats().is_balanced());
  }

  #[test]
  fn deref_mut_reaches_value() {
    let reaper = Reaper::new();
    let mut scoped = reaper.acquire(vec![1, 2]);
    scoped.push(3);
    assert_eq!(&*scoped, &[1, 2, 3]);
    scoped.release();
    assert!(reaper.stats().is_balanced());
  }

  #[test]
  fn map_counts_one_release_and_one_acquire() {
    let reaper = Reaper::new();
    let scoped = reaper.acquire(2u32);
    let mapped = scoped.map(|v| v * 10);
    assert_eq!(*mapped, 20);
    let stats = reaper.stats();
    assert_eq!((stats.acquired, stats.released, stats.live), (2, 1, 1));
    drop(mapped);
    assert!(reaper.stats().is_balanced());
  }

  #[test]
  fn reset_peak_tracks_live() {
    let reaper = Reaper::new();
    let a = reaper.acquire(());
    let b = reaper.acquire(());
    drop(a);
    drop(b);
    assert_eq!(reaper.stats().peak_live, 2);
    reaper.reset_peak();
    assert_eq!(reaper.stats().peak_live, 0);
  }
}
