mod support;

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use screenbridge_capture::backends::SyntheticSession;
use screenbridge_capture::{
    CaptureController, CaptureSession, ChangeNotifier, LifecycleState, SessionChange,
    VideoFrameConsumer,
};
use screenbridge_core::{CaptureConfiguration, PixelFormat};
use support::*;

fn controller(consumer: Arc<RecordingConsumer>) -> (CaptureController<FakeSession>, FakeHandle) {
    let (session, handle) = fake_session();
    let consumer: Arc<dyn VideoFrameConsumer> = consumer;
    (CaptureController::new(session, consumer, small_config()).unwrap(), handle)
}

// ── Start / stop ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn start_moves_to_starting_before_returning() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    assert_eq!(controller.state(), LifecycleState::Idle);

    handle.pause();
    let (on_complete, rx) = signal();
    controller.start_capture(small_config(), on_complete);
    assert_eq!(controller.state(), LifecycleState::Starting);
    handle.resume();

    rx.await.unwrap();
    assert_eq!(controller.state(), LifecycleState::Running);
    assert_eq!(controller.active_format(), Some(PixelFormat::Nv12));
}

#[tokio::test]
async fn repeated_start_runs_session_once() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    let (first, first_rx) = signal();
    let (second, second_rx) = signal();

    controller.start_capture(small_config(), first);
    controller.start_capture(small_config(), second);
    first_rx.await.unwrap();
    second_rx.await.unwrap();

    assert_eq!(controller.state(), LifecycleState::Running);
    assert_eq!(handle.calls().start_running, 1);
    assert_eq!(handle.calls().commits, vec![1]);
}

#[tokio::test]
async fn stop_while_idle_completes_without_touching_session() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    let fired_on = Arc::new(Mutex::new(None));

    let record = fired_on.clone();
    controller.stop_capture_with_completion_handler(Some(Box::new(move || {
        *record.lock() = Some(thread::current().id());
    })));

    settle(&controller).await;
    // Never inline with the call.
    let fired_on = (*fired_on.lock()).expect("completion fired");
    assert_ne!(fired_on, thread::current().id());
    assert_eq!(controller.state(), LifecycleState::Idle);
    assert_eq!(handle.calls().total(), 0);
}

#[tokio::test]
async fn stop_after_start_returns_to_idle() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    assert_eq!(controller.start(small_config()).await, LifecycleState::Running);

    handle.pause();
    let (on_complete, rx) = signal();
    controller.stop_capture_with_completion_handler(on_complete);
    assert_eq!(controller.state(), LifecycleState::Stopping);
    handle.resume();
    rx.await.unwrap();

    assert_eq!(controller.state(), LifecycleState::Idle);
    assert_eq!(controller.active_format(), None);
    assert_eq!(handle.calls().stop_running, 1);
}

#[tokio::test]
async fn stop_while_starting_settles_after_start() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    controller.start_capture(small_config(), None);
    assert_eq!(controller.stop().await, LifecycleState::Idle);

    let calls = handle.calls();
    assert_eq!(calls.start_running, 1);
    assert_eq!(calls.stop_running, 1);
}

#[tokio::test]
async fn start_while_stopping_runs_after_stop() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    controller.start(small_config()).await;

    handle.pause();
    controller.stop_capture();
    assert_eq!(controller.state(), LifecycleState::Stopping);
    let (on_complete, rx) = signal();
    controller.start_capture(small_config(), on_complete);
    handle.resume();
    rx.await.unwrap();
    assert_eq!(controller.state(), LifecycleState::Running);

    let calls = handle.calls();
    assert_eq!(calls.stop_running, 1);
    assert_eq!(calls.start_running, 2);
    assert_eq!(calls.commits, vec![1, 2]);
}

#[tokio::test]
async fn double_stop_stops_session_once() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    controller.start(small_config()).await;

    controller.stop_capture();
    controller.stop().await;
    assert_eq!(handle.calls().stop_running, 1);
}

#[tokio::test]
async fn completions_fire_in_submission_order() {
    let (controller, _handle) = controller(RecordingConsumer::nv12_bgra());
    let log = Arc::new(Mutex::new(Vec::new()));

    controller.start_capture(small_config(), logged(&log, 1));
    controller.stop_capture_with_completion_handler(logged(&log, 2));
    controller.start_capture(small_config(), logged(&log, 3));
    controller.stop_capture_with_completion_handler(logged(&log, 4));
    settle(&controller).await;

    assert_eq!(*log.lock(), vec![1, 2, 3, 4]);
    assert_eq!(controller.state(), LifecycleState::Idle);
}

#[tokio::test]
async fn idle_stop_queued_before_start_keeps_it_starting() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    let controller = Arc::new(controller);

    // Hold the worker inside a completion so the commands below queue up.
    let (release, held) = mpsc::channel::<()>();
    controller.stop_capture_with_completion_handler(Some(Box::new(move || {
        let _ = held.recv();
    })));

    let seen = Arc::new(Mutex::new(None));
    let (record, weak) = (seen.clone(), Arc::downgrade(&controller));
    controller.stop_capture_with_completion_handler(Some(Box::new(move || {
        *record.lock() = weak.upgrade().map(|c| c.state());
    })));
    let (on_complete, rx) = signal();
    controller.start_capture(small_config(), on_complete);
    assert_eq!(controller.state(), LifecycleState::Starting);

    release.send(()).unwrap();
    rx.await.unwrap();

    assert_eq!(*seen.lock(), Some(LifecycleState::Starting));
    assert_eq!(controller.state(), LifecycleState::Running);
    let calls = handle.calls();
    assert_eq!(calls.stop_running, 0);
    assert_eq!(calls.start_running, 1);
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_input_device_leaves_controller_idle() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    handle.fail_input(true);

    let (on_complete, rx) = signal();
    controller.start_capture(small_config(), on_complete);
    rx.await.unwrap();

    assert_eq!(controller.state(), LifecycleState::Idle);
    assert_eq!(handle.calls().start_running, 0);

    // A later start with the device back succeeds.
    handle.fail_input(false);
    assert_eq!(controller.start(small_config()).await, LifecycleState::Running);
}

#[tokio::test]
async fn consumer_without_formats_cannot_start() {
    let (controller, handle) = controller(RecordingConsumer::new(std::iter::empty::<PixelFormat>()));
    assert_eq!(controller.start(small_config()).await, LifecycleState::Idle);
    assert_eq!(handle.calls().total(), 0);
}

#[tokio::test]
async fn invalid_configuration_cannot_start() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    let config = CaptureConfiguration { frame_rate: 0, ..small_config() };
    assert_eq!(controller.start(config).await, LifecycleState::Idle);
    assert_eq!(handle.calls().start_running, 0);
}

// ── Frame delivery ───────────────────────────────────────────────────────────

#[tokio::test]
async fn frames_are_rebased_and_monotonic() {
    let consumer = RecordingConsumer::nv12_bgra();
    let (controller, handle) = controller(consumer.clone());
    controller.start(small_config()).await;

    for i in 0..10 {
        handle.deliver(ms(5_000 + i * 33));
    }
    assert_eq!(controller.stop().await, LifecycleState::Idle);

    let timestamps = consumer.timestamps();
    assert_eq!(timestamps.len(), 10);
    assert_eq!(timestamps[0], 0);
    assert_eq!(timestamps[9], ms(9 * 33).as_nanos() as i64);
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(controller.stats().forwarded(), 10);
}

#[tokio::test]
async fn frames_outside_running_are_dropped() {
    let consumer = RecordingConsumer::nv12_bgra();
    let (controller, handle) = controller(consumer.clone());
    controller.start(small_config()).await;
    handle.deliver(ms(0));

    handle.pause();
    controller.stop_capture();
    assert_eq!(controller.state(), LifecycleState::Stopping);
    handle.deliver(ms(33));
    handle.resume();
    controller.stop().await;

    handle.pause();
    controller.start_capture(small_config(), None);
    assert_eq!(controller.state(), LifecycleState::Starting);
    // Still tagged with the first generation; the handler is the old one.
    handle.deliver_tagged(ms(66), 1);
    handle.resume();

    controller.stop().await;
    assert_eq!(consumer.count(), 1);
    assert_eq!(controller.stats().dropped(), 2);
}

#[tokio::test]
async fn timestamps_keep_advancing_when_restart_resets_the_clock() {
    let consumer = RecordingConsumer::nv12_bgra();
    let (controller, handle) = controller(consumer.clone());

    controller.start(small_config()).await;
    handle.deliver(ms(1_000));
    handle.deliver(ms(1_033));
    controller.stop().await;

    controller.start(small_config()).await;
    // The new session's capture clock starts again from zero.
    for at in [0, 33, 66] {
        handle.deliver(ms(at));
    }

    let timestamps = consumer.timestamps();
    let expected: Vec<i64> = [0, 33, 43, 76, 109]
        .into_iter()
        .map(|t| ms(t).as_nanos() as i64)
        .collect();
    assert_eq!(timestamps, expected);
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn injected_image_follows_captured_timeline() {
    let consumer = RecordingConsumer::nv12_bgra();
    let (controller, handle) = controller(consumer.clone());
    controller.start(small_config()).await;

    // Capture clock far ahead of the controller's own age.
    handle.deliver(ms(60_000));
    tokio::time::sleep(ms(20)).await;
    controller.relay().push_image(&RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255])));

    let timestamps = consumer.timestamps();
    assert_eq!(timestamps.len(), 2);
    assert!(timestamps[1] >= ms(20).as_nanos() as i64);
    assert!(timestamps[1] < ms(60_000).as_nanos() as i64);
}

#[tokio::test]
async fn injected_image_is_forwarded_as_bgra() {
    let consumer = RecordingConsumer::nv12_bgra();
    let (controller, _handle) = controller(consumer.clone());

    let image = RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 255]));
    controller.relay().push_image(&image);
    assert_eq!(consumer.count(), 0);

    controller.start(small_config()).await;
    controller.relay().push_image(&image);

    let frames = consumer.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].format(), PixelFormat::Bgra);
    assert_eq!(&frames[0].buffer.data[..4], &[30, 20, 10, 255]);
    assert!(controller.stats().is_active());
}

// ── Reconfiguration ──────────────────────────────────────────────────────────

#[tokio::test]
async fn unsupported_format_falls_back_in_place() {
    let consumer = RecordingConsumer::nv12_bgra();
    let (controller, handle) = controller(consumer.clone());
    controller
        .start(small_config().with_preferred_format(PixelFormat::Bgra))
        .await;
    assert_eq!(controller.active_format(), Some(PixelFormat::Bgra));
    handle.deliver(ms(0));

    controller.handle_change(SessionChange::format(
        small_config().with_preferred_format(PixelFormat::I420),
    ));
    settle(&controller).await;

    assert_eq!(controller.state(), LifecycleState::Running);
    assert_eq!(controller.active_format(), Some(PixelFormat::Nv12));
    let calls = handle.calls();
    assert_eq!(calls.stop_running, 0);
    assert_eq!(calls.start_running, 1);
    assert_eq!(calls.formats, vec![PixelFormat::Bgra, PixelFormat::Nv12]);
    assert_eq!(calls.commits, vec![1, 2]);

    // In-flight sample from the old wiring.
    handle.deliver_tagged(ms(33), 1);
    assert_eq!(consumer.count(), 1);

    handle.deliver(ms(66));
    assert_eq!(consumer.count(), 2);
    assert_eq!(controller.relay().active_generation(), 2);
}

#[tokio::test]
async fn unchanged_reconfiguration_keeps_generation() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    controller.start(small_config()).await;

    controller.reconfigure_capture_session_input();
    settle(&controller).await;

    assert_eq!(handle.calls().commits, vec![1]);
    assert_eq!(controller.active_format(), Some(PixelFormat::Nv12));
}

#[tokio::test]
async fn failed_in_place_update_keeps_previous_wiring() {
    let consumer = RecordingConsumer::nv12_bgra();
    let (controller, handle) = controller(consumer.clone());
    controller.start(small_config()).await;

    handle.fail_next_commit(CommitFailure::Backend);
    controller.handle_change(SessionChange::format(
        small_config().with_preferred_format(PixelFormat::Bgra),
    ));
    settle(&controller).await;

    assert_eq!(controller.state(), LifecycleState::Running);
    assert_eq!(controller.active_format(), Some(PixelFormat::Nv12));
    assert_eq!(controller.relay().active_generation(), 1);
    handle.deliver(ms(0));
    assert_eq!(consumer.count(), 1);
}

#[tokio::test]
async fn interrupted_in_place_update_restarts() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    controller.start(small_config()).await;

    handle.fail_next_commit(CommitFailure::Interrupted);
    controller.handle_change(SessionChange::format(
        small_config().with_preferred_format(PixelFormat::Bgra),
    ));
    settle(&controller).await;

    let calls = handle.calls();
    assert_eq!(calls.stop_running, 1);
    assert_eq!(calls.start_running, 2);
    assert_eq!(controller.state(), LifecycleState::Running);
    assert_eq!(controller.active_format(), Some(PixelFormat::Bgra));
}

#[tokio::test]
async fn interruption_notification_restarts_session() {
    let notifier = ChangeNotifier::new();
    let (session, handle) = fake_session();
    let controller = CaptureController::with_change_notifier(
        session,
        RecordingConsumer::nv12_bgra(),
        small_config(),
        &notifier,
    )
    .unwrap();
    controller.start(small_config()).await;

    assert_eq!(notifier.notify(&SessionChange::interruption("display reclaimed")), 1);
    settle(&controller).await;

    let calls = handle.calls();
    assert_eq!(calls.stop_running, 1);
    assert_eq!(calls.start_running, 2);
    assert_eq!(controller.state(), LifecycleState::Running);
    assert_eq!(handle.generation(), 2);
}

#[tokio::test]
async fn change_while_idle_is_used_by_next_start() {
    let (controller, handle) = controller(RecordingConsumer::nv12_bgra());
    let wanted = CaptureConfiguration::high().with_preferred_format(PixelFormat::Bgra);

    controller.handle_change(SessionChange::format(wanted.clone()));
    settle(&controller).await;
    assert_eq!(controller.state(), LifecycleState::Idle);
    assert_eq!(handle.calls().total(), 0);
    assert_eq!(controller.desired_configuration(), wanted);

    let (on_complete, rx) = signal();
    controller.start_capture_screen(on_complete);
    rx.await.unwrap();

    assert_eq!(handle.calls().inputs, vec![wanted]);
    assert_eq!(controller.active_format(), Some(PixelFormat::Bgra));
}

#[tokio::test]
async fn dropping_controller_unsubscribes_and_stops_session() {
    let notifier = ChangeNotifier::new();
    let (session, handle) = fake_session();
    let controller = CaptureController::with_change_notifier(
        session,
        RecordingConsumer::nv12_bgra(),
        small_config(),
        &notifier,
    )
    .unwrap();
    assert!(controller.is_subscribed());
    assert_eq!(notifier.observer_count(), 1);
    controller.start(small_config()).await;

    drop(controller);
    assert_eq!(notifier.observer_count(), 0);
    assert_eq!(notifier.notify(&SessionChange::device()), 0);
    // Drop waits for the worker to tear the session down.
    assert_eq!(handle.calls().stop_running, 1);
}

// ── Synthetic backend ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn synthetic_session_end_to_end() {
    let consumer = RecordingConsumer::nv12_bgra();
    let controller =
        CaptureController::new(SyntheticSession::new(), consumer.clone(), small_config()).unwrap();

    assert_eq!(controller.start(small_config()).await, LifecycleState::Running);
    tokio::time::timeout(Duration::from_secs(5), consumer.wait_for(5))
        .await
        .expect("synthetic frames")
        .unwrap();
    assert_eq!(controller.stop().await, LifecycleState::Idle);

    let frames = consumer.frames();
    assert!(frames.len() >= 5);
    assert!(frames.iter().all(|f| f.format() == PixelFormat::Nv12));
    assert!(frames.iter().all(|f| f.width() == 64 && f.height() == 32));
    assert!(frames.windows(2).all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
    assert!(!controller.capture_session(|s| s.is_running()));
    assert!(controller.capture_session(|s| s.frames_produced()) >= frames.len() as u64);
}

#[tokio::test]
async fn synthetic_session_without_display_stays_idle() {
    let consumer = RecordingConsumer::nv12_bgra();
    let controller =
        CaptureController::new(SyntheticSession::unavailable(), consumer, small_config()).unwrap();
    assert_eq!(controller.start(small_config()).await, LifecycleState::Idle);
}
