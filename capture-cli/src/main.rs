//! Command line front end running a simulated capture session.

#[macro_use]
extern crate derivative;

mod config;
mod consumer;

use anyhow::{Context, Result};
use capture_device::CaptureMode;
use capture_device_sim::SimBackend;
use capture_engine::{CaptureOrchestrator, CaptureSpeed, DeviceSelector};
use clap::Parser;
use std::{path::PathBuf, sync::Arc, thread, time::Duration};

#[derive(Parser, Debug)]
#[command(version, about = "Capture frames from a simulated handheld-console adapter")]
struct Args {
    /// Stop after this many video frames
    #[arg(long)]
    frames: Option<u64>,

    /// Concurrently outstanding reads
    #[arg(long)]
    lanes: Option<usize>,

    /// Simulate an old DS adapter with a framed stream
    #[arg(long)]
    framed: bool,

    /// Shift the simulated stream every N transfers
    #[arg(long)]
    shift_every: Option<u64>,

    /// Toggle 3D capture every N video frames
    #[arg(long)]
    toggle_3d_every: Option<u64>,

    /// Capture speed of IS Nitro devices: full, half, third or quarter
    #[arg(long)]
    speed: Option<CaptureSpeed>,

    /// Config file to use instead of the one in the platform config directory
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_logger() {
    use std::io::Write;

    env_logger::builder()
        .format(|buf, record| {
            let style = buf.default_level_style(record.level());
            let ts = chrono::Local::now().format("%H:%M:%S");

            writeln!(
                buf,
                "[{} {style}{}{style:#} {} {}] {}",
                ts,
                record.level(),
                record
                    .file()
                    .unwrap_or("None")
                    .split('/')
                    .next_back()
                    .unwrap_or("None"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
}

fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();

    let mut conf = config::load(args.config.as_deref())?;
    if let Some(lanes) = args.lanes {
        conf.engine.writer_lanes = lanes;
    }
    if args.framed {
        conf.device.framed = true;
    }
    if args.shift_every.is_some() {
        conf.device.shift_every = args.shift_every;
    }
    if let Some(speed) = args.speed {
        conf.engine.capture_speed = speed;
    }

    let backend = SimBackend::new(vec![conf.device.sim_config()]);
    let orchestrator = Arc::new(
        CaptureOrchestrator::new(vec![Box::new(backend)], conf.engine.engine_config())
            .context("invalid engine configuration")?,
    );
    orchestrator.set_capture_speed(conf.engine.capture_speed);

    {
        let orchestrator = orchestrator.clone();
        ctrlc::set_handler(move || {
            log::info!("Ctrl-C received, stopping");
            orchestrator.stop();
        })?;
    }

    let runner = {
        let orchestrator = orchestrator.clone();
        thread::spawn(move || orchestrator.run())
    };

    let device = orchestrator.connect(DeviceSelector::Auto)?;
    log::info!("capturing from {}", device.long_name);

    let context = orchestrator.context();
    let stats = Arc::new(consumer::Stats::default());
    let video = consumer::spawn_video(context.clone(), stats.clone());
    let audio = consumer::spawn_audio(context.clone(), stats.clone());

    let mut next_toggle = args.toggle_3d_every;
    while context.status.is_running() {
        thread::sleep(Duration::from_millis(10));

        if let Some(error) = context.status.take_new_error() {
            log::warn!("{error}");
            orchestrator.stop();
        }

        let frames = stats.video_frames();
        if args.frames.is_some_and(|limit| frames >= limit) {
            log::info!("captured {frames} frames");
            orchestrator.stop();
        }

        if let Some(every) = args.toggle_3d_every
            && let Some(at) = next_toggle
            && frames >= at
        {
            let mode = context.status.mode();
            let mode = CaptureMode::new(!mode.stereo_3d, mode.low_bandwidth);
            if let Err(e) = orchestrator.request_reconfigure(mode) {
                log::warn!("reconfigure failed: {e}");
            }
            next_toggle = Some(at + every.max(1));
        }
    }

    for handle in [runner, video, audio] {
        if handle.join().is_err() {
            log::warn!("a capture thread panicked");
        }
    }

    let snapshot = orchestrator.snapshot();
    log::info!(
        "delivered {} frames, skipped {}, video {} (torn {}, dropped {}), audio samples {}",
        snapshot.frames_delivered,
        snapshot.frames_skipped,
        stats.video_frames(),
        stats.torn_frames(),
        stats.dropped_frames(),
        stats.audio_samples()
    );

    Ok(())
}
