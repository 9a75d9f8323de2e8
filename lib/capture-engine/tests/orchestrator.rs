use capture_device::CaptureMode;
use capture_device_sim::{SimBackend, SimControl, SimDeviceConfig, payload_length_of, plain_index_of};
use capture_engine::{
    CaptureContext, CaptureError, CaptureOrchestrator, CaptureSpeed, DeviceSelector, EngineConfig,
    EngineState, FrameMeta, ReaderRole, ResyncPolicy,
};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    orchestrator: Arc<CaptureOrchestrator>,
    runner: Option<JoinHandle<()>>,
}

impl Harness {
    fn start(configs: Vec<SimDeviceConfig>, config: EngineConfig) -> (Self, Vec<Arc<SimControl>>) {
        _ = env_logger::builder().is_test(true).try_init();

        let controls = configs.iter().map(|c| c.serial.clone()).collect::<Vec<_>>();
        let backend = SimBackend::new(configs);
        let controls = controls
            .iter()
            .filter_map(|serial| backend.control(serial))
            .collect();

        let orchestrator = Arc::new(CaptureOrchestrator::new(vec![Box::new(backend)], config).unwrap());
        let runner = {
            let orchestrator = orchestrator.clone();
            thread::spawn(move || orchestrator.run())
        };

        (
            Self {
                orchestrator,
                runner: Some(runner),
            },
            controls,
        )
    }

    fn context(&self) -> Arc<CaptureContext> {
        self.orchestrator.context()
    }

    fn wait_closed(&self) -> bool {
        wait_until(|| {
            let snapshot = self.orchestrator.snapshot();
            !snapshot.connected && snapshot.close_success
        })
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.orchestrator.stop();
        if let Some(runner) = self.runner.take() {
            runner.join().unwrap();
        }
    }
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn next_frame(context: &CaptureContext, role: ReaderRole) -> Option<(FrameMeta, Vec<u8>)> {
    let deadline = Instant::now() + TIMEOUT;
    let wait = match role {
        ReaderRole::Video => &context.status.video_wait,
        ReaderRole::Audio => &context.status.audio_wait,
    };

    while Instant::now() < deadline {
        wait.timed_lock();
        if let Some(frame) = context.pool.get_reader_slot(role) {
            let copy = (frame.meta().clone(), frame.data().to_vec());
            drop(frame);
            context.pool.release_reader_slot(role);
            return Some(copy);
        }
    }
    None
}

fn plain(serial: &str) -> SimDeviceConfig {
    SimDeviceConfig::plain(serial)
        .with_frame_bytes(4096)
        .with_frame_bytes_3d(6144)
        .with_audio_bytes(512)
        .with_frame_interval(Duration::from_millis(2))
}

fn framed(serial: &str) -> SimDeviceConfig {
    SimDeviceConfig::framed(serial)
        .with_frame_bytes(4080)
        .with_frame_bytes_3d(4080)
        .with_audio_bytes(0)
        .with_seed(11)
        .with_frame_interval(Duration::from_millis(2))
}

#[test]
fn test_frames_flow_in_order_with_cooldown() {
    let (harness, _) = Harness::start(vec![plain("A")], EngineConfig::new());
    let context = harness.context();

    let descriptor = harness.orchestrator.connect(DeviceSelector::Auto).unwrap();
    assert_eq!(descriptor.serial, "A");
    assert_eq!(harness.orchestrator.snapshot().device, Some(descriptor));

    let mut last_index = None;
    let mut last_sequence = None;
    for _ in 0..20 {
        let (meta, data) = next_frame(&context, ReaderRole::Video).unwrap();
        assert_eq!(data.len(), 4096);
        assert_eq!(meta.discard_candidate, meta.sequence < 3);

        let index = plain_index_of(&data).unwrap();
        assert!(last_index.is_none_or(|last| index > last));
        assert!(last_sequence.is_none_or(|last| meta.sequence > last));
        last_index = Some(index);
        last_sequence = Some(meta.sequence);
    }

    let snapshot = harness.orchestrator.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.cooldown, 0);
    assert_eq!(snapshot.engine_state, EngineState::Streaming);
    assert!(snapshot.frames_delivered >= 20);
}

#[test]
fn test_audio_role_is_independent() {
    let (harness, _) = Harness::start(vec![plain("A")], EngineConfig::new());
    let context = harness.context();
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();

    let (video, _) = next_frame(&context, ReaderRole::Video).unwrap();
    let (audio, _) = next_frame(&context, ReaderRole::Audio).unwrap();
    assert!(audio.sequence >= video.sequence);

    let (next_audio, _) = next_frame(&context, ReaderRole::Audio).unwrap();
    assert!(next_audio.sequence > audio.sequence);
}

#[test]
fn test_reconfigure_changes_frame_size_and_resets_cooldown() {
    let config = plain("A").with_frame_interval(Duration::from_millis(5));
    let (harness, _) = Harness::start(vec![config], EngineConfig::new().with_writer_lanes(2));
    let context = harness.context();
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();

    while next_frame(&context, ReaderRole::Video).unwrap().0.discard_candidate {}

    harness
        .orchestrator
        .request_reconfigure(CaptureMode::new(true, false))
        .unwrap();

    let mut sequences = vec![];
    let mut flagged = 0;
    let mut trusted = 0;
    while trusted < 5 {
        let (meta, data) = next_frame(&context, ReaderRole::Video).unwrap();
        if data.len() != 6144 {
            assert!(sequences.is_empty());
            continue;
        }

        sequences.push(meta.sequence);
        if meta.discard_candidate {
            assert_eq!(trusted, 0);
            flagged += 1;
        } else {
            trusted += 1;
        }
    }
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(flagged, 3);
    assert!(harness.orchestrator.snapshot().mode.stereo_3d);
}

#[test]
fn test_capture_speed_survives_reconnect() {
    let (harness, _) = Harness::start(vec![plain("A")], EngineConfig::new());
    let orchestrator = &harness.orchestrator;
    let context = harness.context();
    let full = context.status.video_wait.wait_time();

    orchestrator.set_capture_speed(CaptureSpeed::Half);
    orchestrator.connect(DeviceSelector::Auto).unwrap();
    next_frame(&context, ReaderRole::Video).unwrap();
    assert_eq!(orchestrator.snapshot().capture_speed, CaptureSpeed::Half);
    assert_eq!(context.status.video_wait.wait_time(), full);

    orchestrator.disconnect().unwrap();
    assert!(harness.wait_closed());
    orchestrator.connect(DeviceSelector::Auto).unwrap();
    assert_eq!(orchestrator.snapshot().capture_speed, CaptureSpeed::Half);
}

#[test]
fn test_disconnect_and_reconnect() {
    let (harness, controls) = Harness::start(vec![plain("A")], EngineConfig::new());
    let orchestrator = &harness.orchestrator;

    assert!(matches!(orchestrator.disconnect(), Err(CaptureError::NotConnected)));
    orchestrator.connect(DeviceSelector::Auto).unwrap();
    assert!(matches!(
        orchestrator.connect(DeviceSelector::Auto),
        Err(CaptureError::AlreadyConnected)
    ));

    next_frame(&harness.context(), ReaderRole::Video).unwrap();
    orchestrator.disconnect().unwrap();
    assert!(harness.wait_closed());
    assert!(!controls[0].is_opened());
    assert_eq!(orchestrator.snapshot().engine_state, EngineState::Idle);
    assert_eq!(orchestrator.snapshot().cooldown, 3);

    let delivered = orchestrator.snapshot().frames_delivered;
    orchestrator.connect(DeviceSelector::Auto).unwrap();
    assert!(wait_until(|| orchestrator.snapshot().frames_delivered > delivered + 3));
    assert_eq!(orchestrator.snapshot().cooldown, 0);
}

#[test]
fn test_unplug_surfaces_error_and_replug_reconnects() {
    let (harness, controls) = Harness::start(vec![plain("A")], EngineConfig::new());
    let orchestrator = &harness.orchestrator;
    orchestrator.connect(DeviceSelector::Auto).unwrap();
    next_frame(&harness.context(), ReaderRole::Video).unwrap();

    controls[0].unplug();
    assert!(harness.wait_closed());
    assert_eq!(orchestrator.snapshot().error_text, "Disconnected: Device removed");
    assert!(matches!(
        orchestrator.connect(DeviceSelector::Auto),
        Err(CaptureError::NoDeviceFound)
    ));

    controls[0].replug();
    orchestrator.connect(DeviceSelector::Auto).unwrap();
    assert!(next_frame(&harness.context(), ReaderRole::Video).is_some());
}

#[test]
fn test_consumers_wake_on_disconnect() {
    let (harness, controls) = Harness::start(vec![plain("A")], EngineConfig::new());
    let context = harness.context();
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();
    next_frame(&context, ReaderRole::Video).unwrap();

    let waiter = {
        let context = context.clone();
        thread::spawn(move || {
            while context.status.is_connected() {
                context.status.video_wait.lock();
                if let Some(_frame) = context.pool.get_reader_slot(ReaderRole::Video) {
                    context.pool.release_reader_slot(ReaderRole::Video);
                }
            }
        })
    };

    controls[0].unplug();
    waiter.join().unwrap();
    assert!(harness.wait_closed());
}

#[test]
fn test_stall_is_cleared() {
    let (harness, controls) = Harness::start(vec![plain("A")], EngineConfig::new());
    let context = harness.context();
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();
    next_frame(&context, ReaderRole::Video).unwrap();

    controls[0].inject_stall();
    assert!(wait_until(|| !controls[0].is_halted()));

    let delivered = harness.orchestrator.snapshot().frames_delivered;
    assert!(wait_until(|| harness.orchestrator.snapshot().frames_delivered > delivered + 5));
    assert!(harness.orchestrator.snapshot().connected);
}

#[test]
fn test_stall_that_cannot_be_cleared_disconnects() {
    let config = plain("A").with_stall_clearable(false);
    let (harness, controls) = Harness::start(vec![config], EngineConfig::new());
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();
    next_frame(&harness.context(), ReaderRole::Video).unwrap();

    controls[0].inject_stall();
    assert!(harness.wait_closed());
    assert_eq!(harness.orchestrator.snapshot().error_text, "Disconnected: Pipe stall");
}

#[test]
fn test_timeouts_below_threshold_are_skipped() {
    let config = EngineConfig::new().with_max_consecutive_timeouts(8);
    let (harness, controls) = Harness::start(vec![plain("A")], config);
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();
    next_frame(&harness.context(), ReaderRole::Video).unwrap();

    controls[0].inject_timeouts(3);
    controls[0].inject_short_reads(2);
    let skipped = harness.orchestrator.snapshot().frames_skipped;
    assert!(wait_until(|| harness.orchestrator.snapshot().frames_skipped >= skipped + 5));

    let (_, data) = next_frame(&harness.context(), ReaderRole::Video).unwrap();
    assert_eq!(data.len(), 4096);
    assert!(harness.orchestrator.snapshot().connected);
}

#[test]
fn test_too_many_timeouts_disconnect() {
    let config = EngineConfig::new().with_max_consecutive_timeouts(4);
    let (harness, controls) = Harness::start(vec![plain("A")], config);
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();

    controls[0].inject_timeouts(1000);
    assert!(harness.wait_closed());
    assert_eq!(harness.orchestrator.snapshot().error_text, "Disconnected: Read timeout");
}

#[test]
fn test_selection_between_devices() {
    let (harness, _) = Harness::start(vec![plain("A"), framed("B")], EngineConfig::new());
    let orchestrator = &harness.orchestrator;

    match orchestrator.connect(DeviceSelector::Auto) {
        Err(CaptureError::NeedsSelection(devices)) => {
            let serials: Vec<_> = devices.iter().map(|d| d.serial.as_str()).collect();
            assert_eq!(serials, ["A", "B"]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        orchestrator.connect(DeviceSelector::Index(2)),
        Err(CaptureError::InvalidSelection(_))
    ));
    assert!(matches!(
        orchestrator.connect(DeviceSelector::Serial("C".to_string())),
        Err(CaptureError::InvalidSelection(_))
    ));

    let descriptor = orchestrator
        .connect(DeviceSelector::Serial("B".to_string()))
        .unwrap();
    assert_eq!(descriptor.serial, "B");
    assert_eq!(orchestrator.list_devices().len(), 2);
}

#[test]
fn test_framed_stream_recovers_from_shift() {
    let config = EngineConfig::new()
        .with_writer_lanes(4)
        .with_resync_policy(ResyncPolicy::Scan);
    let (harness, controls) = Harness::start(vec![framed("F")], config);
    let context = harness.context();
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();

    for _ in 0..5 {
        check_framed(&next_frame(&context, ReaderRole::Video).unwrap().1);
    }

    let skipped = harness.orchestrator.snapshot().frames_skipped;
    controls[0].inject_shift(1000);
    assert!(wait_until(|| harness.orchestrator.snapshot().frames_skipped > skipped));

    for _ in 0..10 {
        check_framed(&next_frame(&context, ReaderRole::Video).unwrap().1);
    }
    assert!(harness.orchestrator.snapshot().connected);
}

#[test]
fn test_blocking_backend_delivers() {
    let config = plain("S").with_supports_async(false);
    let (harness, _) = Harness::start(vec![config], EngineConfig::new());
    let context = harness.context();
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();

    let first = plain_index_of(&next_frame(&context, ReaderRole::Video).unwrap().1).unwrap();
    let second = plain_index_of(&next_frame(&context, ReaderRole::Video).unwrap().1).unwrap();
    assert!(second > first);
}

#[test]
fn test_invalid_config_is_rejected() {
    let backend = SimBackend::new(vec![plain("A")]);
    let config = EngineConfig::new().with_writer_lanes(4).with_pool_slots(4);
    assert!(matches!(
        CaptureOrchestrator::new(vec![Box::new(backend)], config),
        Err(CaptureError::InvalidConfig(_))
    ));
}

fn check_framed(data: &[u8]) {
    assert!(data.len() < 4080);
    assert_eq!(payload_length_of(data), data.len());
}

#[test]
fn test_long_idle_run_triggers_hard_resync() {
    let config = EngineConfig::new()
        .with_writer_lanes(4)
        .with_resync_policy(ResyncPolicy::Scan);
    let device = framed("F").with_frame_interval(Duration::from_millis(5));
    let (harness, controls) = Harness::start(vec![device], config);
    let context = harness.context();
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();

    while next_frame(&context, ReaderRole::Video).unwrap().0.discard_candidate {}

    controls[0].inject_idle(60 * 4080 + 1234);

    let mut flagged = vec![];
    loop {
        let (meta, data) = next_frame(&context, ReaderRole::Video).unwrap();
        check_framed(&data);
        if meta.discard_candidate {
            flagged.push(meta.sequence);
        } else if !flagged.is_empty() {
            break;
        }
    }
    assert_eq!(flagged.len(), 8);
    assert!(flagged.windows(2).all(|w| w[1] == w[0] + 1));

    for _ in 0..5 {
        let (meta, data) = next_frame(&context, ReaderRole::Video).unwrap();
        assert!(!meta.discard_candidate);
        check_framed(&data);
    }
    let snapshot = harness.orchestrator.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.error_text, "");
}

#[test]
fn test_endless_idle_run_times_out() {
    let config = EngineConfig::new()
        .with_writer_lanes(4)
        .with_resync_policy(ResyncPolicy::Scan)
        .with_resync_timeout(Duration::from_millis(300));
    let (harness, controls) = Harness::start(vec![framed("F")], config);
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();
    check_framed(&next_frame(&harness.context(), ReaderRole::Video).unwrap().1);

    controls[0].inject_idle(1 << 40);
    assert!(harness.wait_closed());
    assert_eq!(harness.orchestrator.snapshot().error_text, "Disconnected: Resync timeout");
}

#[test]
fn test_sleep_and_guess_realigns_after_overrun() {
    let config = EngineConfig::new()
        .with_writer_lanes(4)
        .with_resync_policy(ResyncPolicy::SleepAndGuess);
    let device = framed("F").with_overrun_after(Duration::from_micros(500));
    let (harness, controls) = Harness::start(vec![device], config);
    let context = harness.context();
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();

    for _ in 0..5 {
        check_framed(&next_frame(&context, ReaderRole::Video).unwrap().1);
    }

    let skipped = harness.orchestrator.snapshot().frames_skipped;
    controls[0].inject_shift(1000);
    assert!(wait_until(|| harness.orchestrator.snapshot().frames_skipped > skipped));

    for _ in 0..10 {
        check_framed(&next_frame(&context, ReaderRole::Video).unwrap().1);
    }
    let snapshot = harness.orchestrator.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.error_text, "");
}

#[test]
fn test_sleep_and_guess_gives_up_on_a_stuck_stream() {
    let config = EngineConfig::new()
        .with_writer_lanes(4)
        .with_resync_policy(ResyncPolicy::SleepAndGuess)
        .with_resync_timeout(Duration::from_millis(300));
    let (harness, controls) = Harness::start(vec![framed("F")], config);
    harness.orchestrator.connect(DeviceSelector::Auto).unwrap();
    check_framed(&next_frame(&harness.context(), ReaderRole::Video).unwrap().1);

    controls[0].inject_shift(1000);
    assert!(harness.wait_closed());
    assert_eq!(harness.orchestrator.snapshot().error_text, "Disconnected: Resync timeout");
}
