use capture_device_sim::{SimBackend, SimDeviceConfig};
use capture_engine::{CaptureOrchestrator, DeviceSelector, EngineConfig, ReaderRole};
use std::{
    io::Write,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .format(|buf, record| {
            let ts = chrono::Local::now().format("%H:%M:%S");
            let style = buf.default_level_style(record.level());
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

    let backend = SimBackend::new(vec![SimDeviceConfig::plain("DEMO-0")]);
    let orchestrator = Arc::new(CaptureOrchestrator::new(
        vec![Box::new(backend)],
        EngineConfig::new(),
    )?);

    {
        let orchestrator = orchestrator.clone();
        ctrlc::set_handler(move || orchestrator.stop())?;
    }

    let runner = {
        let orchestrator = orchestrator.clone();
        thread::spawn(move || orchestrator.run())
    };

    let device = orchestrator.connect(DeviceSelector::Auto)?;
    log::info!("capturing from {}, press Ctrl-C to stop", device.long_name);

    let context = orchestrator.context();
    let mut frames = 0;
    let mut since = Instant::now();

    while context.status.is_running() {
        if !context.status.video_wait.timed_lock() {
            continue;
        }

        if let Some(frame) = context.pool.get_reader_slot(ReaderRole::Video) {
            frames += 1;
            log::trace!("frame {} of {} bytes", frame.meta().sequence, frame.data().len());
            drop(frame);
            context.pool.release_reader_slot(ReaderRole::Video);
        }

        if since.elapsed() >= Duration::from_secs(1) {
            log::info!("{frames} fps, {:?}", orchestrator.snapshot());
            frames = 0;
            since = Instant::now();
        }
    }

    _ = runner.join();
    Ok(())
}
