use capture_engine::{CaptureContext, ReaderRole};
use log::{info, trace};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
pub struct Stats {
    video_frames: AtomicU64,
    dropped_frames: AtomicU64,
    torn_frames: AtomicU64,
    audio_samples: AtomicU64,
}

impl Stats {
    pub fn video_frames(&self) -> u64 {
        self.video_frames.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn torn_frames(&self) -> u64 {
        self.torn_frames.load(Ordering::Relaxed)
    }

    pub fn audio_samples(&self) -> u64 {
        self.audio_samples.load(Ordering::Relaxed)
    }
}

struct RateCounter {
    count: u64,
    since: Instant,
}

impl RateCounter {
    fn new() -> Self {
        Self {
            count: 0,
            since: Instant::now(),
        }
    }

    /// Per-second rate, once every second.
    fn add(&mut self, n: u64) -> Option<f64> {
        self.count += n;

        let elapsed = self.since.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }

        let rate = self.count as f64 / elapsed.as_secs_f64();
        self.count = 0;
        self.since = Instant::now();
        Some(rate)
    }
}

pub fn spawn_video(context: Arc<CaptureContext>, stats: Arc<Stats>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut fps = RateCounter::new();
        let mut last_sequence: Option<u64> = None;

        while context.status.is_running() {
            if !context.status.video_wait.timed_lock() {
                continue;
            }

            let Some(frame) = context.pool.get_reader_slot(ReaderRole::Video) else {
                continue;
            };

            let meta = frame.meta();
            if let Some(last) = last_sequence
                && meta.sequence > last + 1
            {
                stats
                    .dropped_frames
                    .fetch_add(meta.sequence - last - 1, Ordering::Relaxed);
            }
            last_sequence = Some(meta.sequence);

            let counted = if meta.discard_candidate {
                stats.torn_frames.fetch_add(1, Ordering::Relaxed);
                0
            } else {
                if let Some(device) = context.status.device() {
                    let pixel = device.pixel_layout().decode(frame.data(), 0);
                    trace!("frame {} first pixel {pixel:?}", meta.sequence);
                }
                stats.video_frames.fetch_add(1, Ordering::Relaxed);
                1
            };

            drop(frame);
            context.pool.release_reader_slot(ReaderRole::Video);

            if let Some(rate) = fps.add(counted) {
                info!("video {rate:.1} fps");
            }
        }

        info!("exit video consumer");
    })
}

pub fn spawn_audio(context: Arc<CaptureContext>, stats: Arc<Stats>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut rate = RateCounter::new();

        while context.status.is_running() {
            if !context.status.audio_wait.timed_lock() {
                continue;
            }

            let Some(frame) = context.pool.get_reader_slot(ReaderRole::Audio) else {
                continue;
            };

            let samples = context
                .status
                .device()
                .map(|device| {
                    let video_in_size = device.video_in_size(context.status.mode());
                    device.audio_samples(frame.data().len(), video_in_size)
                })
                .unwrap_or_default() as u64;

            drop(frame);
            context.pool.release_reader_slot(ReaderRole::Audio);
            stats.audio_samples.fetch_add(samples, Ordering::Relaxed);

            if let Some(rate) = rate.add(samples) {
                info!("audio {rate:.0} samples/s");
            }
        }

        info!("exit audio consumer");
    })
}
