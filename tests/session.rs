// 该文件是 Guoyuan （果园） 项目的一部分。
// tests/session.rs - 会话状态机与检测循环测试
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

mod common;

use std::{
  sync::atomic::Ordering,
  thread,
  time::Duration,
};

use guoyuan::{
  input::AcquireError,
  model::InferenceError,
  session::{EVENT_QUEUE_CAPACITY, LoopState, Session, SessionError, SessionEvent},
  tally::TallyMode,
  tensor::TensorShape,
};

use common::{
  GatedModel, RecordingSurface, ScriptedModel, ScriptedSource, Step, config, names, output,
  wait_until,
};

const WAIT: Duration = Duration::from_secs(5);

fn apple_model() -> ScriptedModel {
  ScriptedModel::always(output(&[([0.1, 0.1, 0.3, 0.3], 0.92, 0.0)]))
}

fn session(
  source: ScriptedSource,
  model: ScriptedModel,
) -> Session<ScriptedSource, ScriptedModel, RecordingSurface> {
  Session::new(
    source,
    model,
    RecordingSurface::new(),
    names(&["apple", "banana"]),
    config(),
  )
  .unwrap()
}

fn next_tally(events: &std::sync::mpsc::Receiver<SessionEvent>) -> guoyuan::pipeline::TickReport {
  loop {
    match events.recv_timeout(WAIT).unwrap() {
      SessionEvent::Tally(report) => return report,
      SessionEvent::IterationFailed { .. } => continue,
      SessionEvent::Fatal(reason) => panic!("unexpected fatal event: {}", reason),
    }
  }
}

#[test]
fn full_lifecycle_keeps_resources_balanced() {
  let source = ScriptedSource::new();
  let counters = source.counters();
  let mut session = session(source, apple_model());
  let events = session.events();
  assert_eq!(session.state(), LoopState::Idle);

  session.open_camera().unwrap();
  assert_eq!(session.state(), LoopState::CameraActive);
  assert!(counters.active.load(Ordering::SeqCst));

  session.start_detection().unwrap();
  assert_eq!(session.state(), LoopState::Detecting);
  let report = next_tally(&events);
  assert_eq!(report.tally.get("apple"), 1);

  session.stop_detection().unwrap();
  assert_eq!(session.state(), LoopState::CameraActive);
  assert!(counters.active.load(Ordering::SeqCst));
  assert!(session.tick_count() >= 1);
  assert_eq!(session.latest_tally().get("apple"), 1);
  let stats = session.reaper_stats().unwrap();
  assert!(stats.is_balanced(), "{:?}", stats);

  session.close_camera().unwrap();
  assert_eq!(session.state(), LoopState::Idle);
  assert!(!counters.active.load(Ordering::SeqCst));
  assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
  assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn no_iteration_starts_after_stop() {
  let model = apple_model();
  let model_counters = model.counters();
  let mut session = session(ScriptedSource::new(), model);
  let events = session.events();
  session.open_camera().unwrap();
  session.start_detection().unwrap();
  next_tally(&events);

  session.stop_detection().unwrap();
  let infers = model_counters.infers.load(Ordering::SeqCst);
  std::thread::sleep(Duration::from_millis(50));
  assert_eq!(model_counters.infers.load(Ordering::SeqCst), infers);
  assert_eq!(session.state(), LoopState::CameraActive);
}

#[test]
fn stop_during_inference_finishes_the_current_tick_only() {
  let inner = apple_model();
  let model_counters = inner.counters();
  let (model, entered, gate) = GatedModel::new(inner);
  let surface = RecordingSurface::new();
  let mut session = Session::new(
    ScriptedSource::new(),
    model,
    surface.clone(),
    names(&["apple"]),
    config(),
  )
  .unwrap();
  session.open_camera().unwrap();
  session.start_detection().unwrap();

  // 第一次推理已进入模型，在其返回前请求停止
  entered.recv_timeout(WAIT).unwrap();
  let release = thread::spawn(move || {
    thread::sleep(Duration::from_millis(100));
    gate.send(()).unwrap();
  });
  session.stop_detection().unwrap();
  release.join().unwrap();

  assert_eq!(session.state(), LoopState::CameraActive);
  assert_eq!(session.tick_count(), 1);
  assert_eq!(model_counters.infers.load(Ordering::SeqCst), 1);
  let draws = surface.calls();
  assert_eq!(draws.iter().filter(|c| *c == "clear").count(), 1);
  assert!(session.reaper_stats().unwrap().is_balanced());

  thread::sleep(Duration::from_millis(50));
  assert_eq!(session.tick_count(), 1);
  assert_eq!(model_counters.infers.load(Ordering::SeqCst), 1);
  assert_eq!(surface.calls(), draws);
}

#[test]
fn idle_subscriber_does_not_grow_the_event_queue() {
  let mut session = session(ScriptedSource::new(), apple_model());
  let events = session.events();
  session.open_camera().unwrap();
  session.start_detection().unwrap();

  let ticks = 4 * EVENT_QUEUE_CAPACITY as u64;
  assert!(wait_until(WAIT, || session.tick_count() >= ticks));
  session.stop_detection().unwrap();

  let queued = events.try_iter().count();
  assert!(queued <= EVENT_QUEUE_CAPACITY, "{} events queued", queued);
  assert!(queued > 0);
}

#[test]
fn detection_can_restart_after_stop() {
  let mut session = session(ScriptedSource::new(), apple_model());
  let events = session.events();
  session.open_camera().unwrap();

  session.start_detection().unwrap();
  next_tally(&events);
  session.stop_detection().unwrap();
  while events.try_recv().is_ok() {}

  session.start_detection().unwrap();
  let report = next_tally(&events);
  assert_eq!(report.index, 1);
  session.stop_detection().unwrap();
}

#[test]
fn close_camera_while_detecting_returns_to_idle() {
  let source = ScriptedSource::new();
  let counters = source.counters();
  let model = apple_model();
  let model_counters = model.counters();
  let mut session = session(source, model);
  let events = session.events();
  session.open_camera().unwrap();
  session.start_detection().unwrap();
  next_tally(&events);

  session.close_camera().unwrap();
  assert_eq!(session.state(), LoopState::Idle);
  assert!(!counters.active.load(Ordering::SeqCst));
  assert!(!model_counters.loaded.load(Ordering::SeqCst));
  assert!(session.reaper_stats().unwrap().is_balanced());
}

#[test]
fn acquisition_failure_stays_idle() {
  let source = ScriptedSource::new().failing_open(AcquireError::PermissionDenied);
  let mut session = session(source, apple_model());

  let error = session.open_camera().unwrap_err();
  assert!(matches!(
    error,
    SessionError::Acquire(AcquireError::PermissionDenied)
  ));
  assert_eq!(session.state(), LoopState::Idle);

  let source = ScriptedSource::new().failing_open(AcquireError::NoDevice);
  let mut session = self::session(source, apple_model());
  assert!(matches!(
    session.open_camera(),
    Err(SessionError::Acquire(AcquireError::NoDevice))
  ));
  assert_eq!(session.state(), LoopState::Idle);
}

#[test]
fn shape_mismatch_is_refused_at_start() {
  let model = apple_model().with_input(TensorShape::rgb_input(16, 16));
  let mut session = session(ScriptedSource::new(), model);
  session.open_camera().unwrap();

  let error = session.start_detection().unwrap_err();
  assert!(matches!(
    error,
    SessionError::Inference(InferenceError::ShapeMismatch { .. })
  ));
  assert_eq!(session.state(), LoopState::CameraActive);
}

#[test]
fn iteration_failures_do_not_stop_the_loop() {
  let model = ScriptedModel::new(vec![
    Step::Fail(InferenceError::Backend("glitch".to_string())),
    Step::Output(output(&[([0.1, 0.1, 0.3, 0.3], 0.92, 0.0)])),
  ]);
  let mut session = session(ScriptedSource::new(), model);
  let events = session.events();
  session.open_camera().unwrap();
  session.start_detection().unwrap();

  let mut failed = 0;
  let mut succeeded = 0;
  while succeeded < 3 {
    match events.recv_timeout(WAIT).unwrap() {
      SessionEvent::Tally(_) => succeeded += 1,
      SessionEvent::IterationFailed { .. } => failed += 1,
      SessionEvent::Fatal(reason) => panic!("unexpected fatal event: {}", reason),
    }
  }
  assert!(failed >= 2);
  assert_eq!(session.state(), LoopState::Detecting);

  session.stop_detection().unwrap();
  assert!(session.reaper_stats().unwrap().is_balanced());
}

#[test]
fn consecutive_failures_demote_to_camera_active() {
  let source = ScriptedSource::new();
  let counters = source.counters();
  let model = ScriptedModel::new(vec![Step::Fail(InferenceError::Backend(
    "npu lost".to_string(),
  ))]);
  let mut session = Session::new(
    source,
    model,
    RecordingSurface::new(),
    names(&["apple"]),
    config().with_max_consecutive_failures(Some(3)),
  )
  .unwrap();
  let events = session.events();
  session.open_camera().unwrap();
  session.start_detection().unwrap();

  let mut failed = 0;
  loop {
    match events.recv_timeout(WAIT).unwrap() {
      SessionEvent::IterationFailed { .. } => failed += 1,
      SessionEvent::Fatal(_) => break,
      SessionEvent::Tally(_) => panic!("no tick should succeed"),
    }
  }
  assert_eq!(failed, 3);
  assert!(wait_until(WAIT, || session.state() == LoopState::CameraActive));
  assert!(counters.active.load(Ordering::SeqCst));

  session.stop_detection().unwrap();
  assert_eq!(session.state(), LoopState::CameraActive);
  assert!(session.reaper_stats().unwrap().is_balanced());
}

#[test]
fn panicking_model_is_fatal_but_recoverable() {
  let model = ScriptedModel::new(vec![Step::Panic]);
  let mut session = session(ScriptedSource::new(), model);
  let events = session.events();
  session.open_camera().unwrap();
  session.start_detection().unwrap();

  assert!(matches!(
    events.recv_timeout(WAIT).unwrap(),
    SessionEvent::Fatal(_)
  ));
  assert!(wait_until(WAIT, || session.state() == LoopState::CameraActive));

  // 下一条命令回收工作线程并取回管线
  session.close_camera().unwrap();
  assert_eq!(session.state(), LoopState::Idle);
  assert!(session.reaper_stats().unwrap().is_balanced());
}

#[test]
fn session_mode_counts_accumulate() {
  let mut session = Session::new(
    ScriptedSource::new(),
    apple_model(),
    RecordingSurface::new(),
    names(&["apple"]),
    config().with_tally_mode(TallyMode::Session),
  )
  .unwrap();
  let events = session.events();
  session.open_camera().unwrap();
  session.start_detection().unwrap();

  for expected in 1..=3u64 {
    let report = next_tally(&events);
    assert_eq!(report.index, expected);
    assert_eq!(report.tally.get("apple") as u64, expected);
  }
  session.stop_detection().unwrap();
}

#[test]
fn commands_in_wrong_state_are_rejected() {
  let mut session = session(ScriptedSource::new(), apple_model());
  assert!(matches!(
    session.start_detection(),
    Err(SessionError::InvalidState {
      state: LoopState::Idle,
      ..
    })
  ));
  assert!(matches!(
    session.stop_detection(),
    Err(SessionError::InvalidState { .. })
  ));
  // 关闭未打开的摄像头不做任何事
  session.close_camera().unwrap();
  assert_eq!(session.state(), LoopState::Idle);

  session.open_camera().unwrap();
  assert!(matches!(
    session.open_camera(),
    Err(SessionError::InvalidState {
      state: LoopState::CameraActive,
      ..
    })
  ));
}

#[test]
fn run_once_ticks_on_the_calling_thread() {
  let mut session = session(ScriptedSource::new(), apple_model());
  session.open_camera().unwrap();
  let report = session.run_once().unwrap();
  assert_eq!(report.tally.get("apple"), 1);
  assert_eq!(session.tick_count(), 1);
  assert_eq!(session.state(), LoopState::CameraActive);
}

#[test]
fn shutdown_is_terminal() {
  let source = ScriptedSource::new();
  let counters = source.counters();
  let mut session = session(source, apple_model());
  let events = session.events();
  session.open_camera().unwrap();
  session.start_detection().unwrap();
  next_tally(&events);

  session.shutdown();
  assert_eq!(session.state(), LoopState::Stopped);
  assert!(!counters.active.load(Ordering::SeqCst));
  assert!(matches!(session.open_camera(), Err(SessionError::Stopped)));
  assert!(matches!(session.close_camera(), Err(SessionError::Stopped)));
}

#[test]
fn dropping_a_detecting_session_closes_the_camera() {
  let source = ScriptedSource::new();
  let counters = source.counters();
  {
    let mut session = session(source, apple_model());
    let events = session.events();
    session.open_camera().unwrap();
    session.start_detection().unwrap();
    next_tally(&events);
  }
  assert!(!counters.active.load(Ordering::SeqCst));
  assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn invalid_config_is_rejected() {
  let result = Session::new(
    ScriptedSource::new(),
    apple_model(),
    RecordingSurface::new(),
    names(&["apple"]),
    config().with_threshold(2.0),
  );
  assert!(matches!(result, Err(SessionError::Config(_))));
}
