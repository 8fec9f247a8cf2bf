// crates/retrovue-playout/src/producer.rs
//
// Producer: owns one Decoder and one destination StagingQueue, running on
// its own thread. Grounded in the teacher's velocut_media::worker::MediaWorker
// thread-spawn + crossbeam-channel event reporting pattern, adapted from a
// single UI-facing probe/encode worker to a continuously-running decode
// pump with two modes (SPEC_FULL.md §4.3):
//
//   - Shadow: decodes a preview asset into a private queue, invisible to the
//     renderer, so it can pre-roll without affecting on-air output.
//   - Live: decodes into the channel's on-air queue, rewriting PTS so the
//     first frame continues exactly where the previous live producer left
//     off (the "PTS-contiguous" guarantee behind SwitchToLive, S4).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use retrovue_core::frame::TimestampUs;
use retrovue_core::metrics::MetricsStore;
use retrovue_core::queue::StagingQueue;
use retrovue_core::PlayoutError;

use crate::decoder::{DecodeOutcome, Decoder};

#[cfg(feature = "ffmpeg")]
use crate::decoder::FfmpegDecoder;
use crate::decoder::StubDecoder;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProducerMode {
    Shadow,
    /// `start_pts` is the PTS the first emitted frame must carry, so output
    /// stays contiguous across a channel switch.
    Live { start_pts: TimestampUs },
}

#[derive(Clone, Debug)]
pub struct ProducerConfig {
    pub asset_id: String,
    /// None selects StubDecoder regardless of the `ffmpeg` feature — used by
    /// `AIR_FAKE_VIDEO=1` and by every test.
    pub path: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub target_fps: f64,
    pub mode: ProducerMode,
}

/// Five consecutive recoverable decode errors escalate to a fatal
/// `DecodeFailed` and the producer thread exits (SPEC_FULL.md §4.3) — a
/// single bad frame is noise, a run of them means the source is unusable.
pub const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 5;

#[derive(Clone, Debug)]
pub enum ProducerEvent {
    FirstFrameReady { pts: TimestampUs },
    DecodeError { reason: String },
    /// Emitted once, immediately before the thread exits, after
    /// `MAX_CONSECUTIVE_DECODE_FAILURES` recoverable errors in a row.
    Fatal(PlayoutError),
    EndOfStream,
    Stopped,
}

pub struct Producer {
    handle: Option<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    pub events: Receiver<ProducerEvent>,
}

impl Producer {
    pub fn spawn(config: ProducerConfig, queue: Arc<StagingQueue>, metrics: Arc<MetricsStore>, channel_id: i32) -> Self {
        Self::spawn_with_tracker(config, queue, None, metrics, channel_id)
    }

    /// Same as `spawn`, but also publishes the PTS of every frame pushed
    /// into `tracker` — used by the channel to compute a contiguous
    /// start_pts across producer respawns (looping, SwitchToLive) without
    /// draining the queue to find out what was last produced.
    pub fn spawn_with_tracker(
        config: ProducerConfig,
        queue: Arc<StagingQueue>,
        tracker: Option<Arc<AtomicI64>>,
        metrics: Arc<MetricsStore>,
        channel_id: i32,
    ) -> Self {
        let decoder = build_decoder(&config);
        Self::spawn_with_decoder(config, decoder, queue, tracker, metrics, channel_id)
    }

    /// Test seam: runs the producer loop against a caller-supplied decoder
    /// instead of the one `build_decoder` would pick, so decode-failure
    /// escalation can be exercised without a real or stub codec path.
    fn spawn_with_decoder(
        config: ProducerConfig,
        decoder: Box<dyn Decoder>,
        queue: Arc<StagingQueue>,
        tracker: Option<Arc<AtomicI64>>,
        metrics: Arc<MetricsStore>,
        channel_id: i32,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = unbounded();
        let cancel_for_thread = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("producer-{}", config.asset_id))
            .spawn(move || run(config, decoder, queue, cancel_for_thread, tx, tracker, metrics, channel_id))
            .expect("spawn producer thread");
        Producer {
            handle: Some(handle),
            cancel,
            events: rx,
        }
    }

    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_decoder(config: &ProducerConfig) -> Box<dyn Decoder> {
    #[cfg(feature = "ffmpeg")]
    if let Some(path) = &config.path {
        match FfmpegDecoder::open(path, config.asset_id.clone(), config.width, config.height, config.target_fps) {
            Ok(dec) => return Box::new(dec),
            Err(reason) => {
                tracing::warn!(asset_id = %config.asset_id, %reason, "falling back to stub decoder");
            }
        }
    }
    #[cfg(not(feature = "ffmpeg"))]
    let _ = &config.path;
    Box::new(StubDecoder::new(
        config.asset_id.clone(),
        config.width,
        config.height,
        config.target_fps,
    ))
}

fn run(
    config: ProducerConfig,
    mut decoder: Box<dyn Decoder>,
    queue: Arc<StagingQueue>,
    cancel: Arc<AtomicBool>,
    events: Sender<ProducerEvent>,
    tracker: Option<Arc<AtomicI64>>,
    metrics: Arc<MetricsStore>,
    channel_id: i32,
) {
    let mut pts_offset: Option<i64> = None;
    let mut announced_first_frame = false;
    let mut consecutive_failures: u32 = 0;

    while !cancel.load(Ordering::Relaxed) {
        match decoder.next_frame() {
            DecodeOutcome::Frame(mut frame) => {
                consecutive_failures = 0;
                if let ProducerMode::Live { start_pts } = config.mode {
                    let offset = *pts_offset.get_or_insert_with(|| start_pts - frame.meta.pts);
                    frame.meta.pts += offset;
                    frame.meta.dts += offset;
                }
                if !announced_first_frame {
                    announced_first_frame = true;
                    let _ = events.send(ProducerEvent::FirstFrameReady { pts: frame.meta.pts });
                }
                if let Some(tracker) = &tracker {
                    tracker.store(frame.meta.pts, Ordering::Relaxed);
                }
                let mut to_push = frame;
                loop {
                    match queue.push(to_push) {
                        Ok(()) => break,
                        Err(returned) => {
                            to_push = returned;
                            metrics.update(channel_id, |m| m.buffer_full_count += 1);
                            if cancel.load(Ordering::Relaxed) {
                                return;
                            }
                            thread::sleep(std::time::Duration::from_millis(2));
                        }
                    }
                }
            }
            DecodeOutcome::RecoverableError(reason) => {
                consecutive_failures += 1;
                let _ = events.send(ProducerEvent::DecodeError { reason: reason.clone() });
                if consecutive_failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                    let _ = events.send(ProducerEvent::Fatal(PlayoutError::DecodeFailed {
                        asset_id: config.asset_id.clone(),
                        reason: format!("{MAX_CONSECUTIVE_DECODE_FAILURES} consecutive decode errors, last: {reason}"),
                    }));
                    return;
                }
            }
            DecodeOutcome::EndOfStream => {
                let _ = events.send(ProducerEvent::EndOfStream);
                return;
            }
        }
    }
    let _ = events.send(ProducerEvent::Stopped);
}
