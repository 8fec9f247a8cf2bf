// crates/retrovue-playout/src/channel.rs
//
// ChannelWorker: the state machine that owns one channel's on-air queue,
// renderer, and producer(s). SPEC_FULL.md's state machine (Idle, Buffering,
// Ready, Playing, Paused, Stopping, Error) is the control-plane-facing view;
// internally it maps onto retrovue_core::metrics::ChannelState (the smaller
// set the Prometheus exposition format reports) the same way the teacher's
// app.rs keeps a richer UI-facing state than the handful of gauges
// media_types exposes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use retrovue_core::clock::MasterClock;
use retrovue_core::frame::TimestampUs;
use retrovue_core::metrics::{ChannelState, MetricsStore};
use retrovue_core::queue::StagingQueue;
use retrovue_core::PlayoutError;

use crate::producer::{Producer, ProducerConfig, ProducerEvent, ProducerMode};
use crate::renderer::{Renderer, RendererWorker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelPhase {
    Idle,
    Buffering,
    Ready,
    Playing,
    Paused,
    Stopping,
    Error,
}

impl ChannelPhase {
    pub fn to_metrics_state(self) -> ChannelState {
        match self {
            ChannelPhase::Idle | ChannelPhase::Stopping => ChannelState::Stopped,
            ChannelPhase::Buffering => ChannelState::Buffering,
            ChannelPhase::Ready | ChannelPhase::Paused => ChannelState::Ready,
            ChannelPhase::Playing => ChannelState::Playing,
            ChannelPhase::Error => ChannelState::Error,
        }
    }
}

/// How long `load_preview` waits for the shadow producer to decode its
/// first frame (the "ShadowDecodeReady" signal, spec.md §4.3/§7) before
/// raising `DeadlineExceeded`.
const SHADOW_DECODE_READY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ChannelConfig {
    pub channel_id: i32,
    pub width: u32,
    pub height: u32,
    pub target_fps: f64,
    pub on_air_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            channel_id: 0,
            width: 1280,
            height: 720,
            target_fps: 29.97,
            on_air_capacity: StagingQueue::DEFAULT_CAPACITY,
        }
    }
}

/// One active channel: on-air queue, its renderer, and whichever
/// producer(s) are currently feeding it.
pub struct ChannelWorker {
    config: ChannelConfig,
    clock: Arc<dyn MasterClock>,
    metrics: Arc<MetricsStore>,
    on_air_queue: Arc<StagingQueue>,
    renderer: Option<RendererWorker>,
    live_producer: Option<Producer>,
    shadow: Option<ShadowPreview>,
    phase: ChannelPhase,
    /// PTS of the last frame any live producer has pushed to the on-air
    /// queue, kept up to date by the producer thread itself (see
    /// `Producer::spawn_with_tracker`) so a respawn after looping or an
    /// explicit switch always knows exactly where to resume.
    live_pts_tracker: Arc<AtomicI64>,
    /// Set only while no live producer has ever pushed a frame yet, so the
    /// very first SwitchToLive starts at pts 0 instead of inheriting the
    /// tracker's sentinel value.
    has_live_history: bool,
    nominal_duration_us: i64,
    /// The asset currently feeding the on-air queue, kept so a live producer
    /// that reaches EndOfStream can be seamlessly re-spawned to loop it
    /// rather than leaving the channel to starve.
    current_live_asset: Option<(String, Option<PathBuf>)>,
    /// Phase to restore once a backpressure episode clears (spec.md §4.7:
    /// `BackPressureCleared` returns to whatever was active before the
    /// `BackPressure` transition demoted the channel to Buffering).
    prior_phase: Option<ChannelPhase>,
}

/// Queue-depth edge events the orchestration tick derives by sampling each
/// channel's on-air queue (spec.md §4.6) and feeds into
/// `ChannelWorker::on_backpressure`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackpressureEvent {
    /// Queue depth dropped to zero.
    Underrun,
    /// Queue depth reached capacity.
    Overrun,
    /// Whichever of the above was active no longer holds.
    Cleared,
}

struct ShadowPreview {
    queue: Arc<StagingQueue>,
    producer: Producer,
    asset_id: String,
    path: Option<PathBuf>,
}

impl ChannelWorker {
    pub fn new(config: ChannelConfig, clock: Arc<dyn MasterClock>, metrics: Arc<MetricsStore>, renderer: Renderer) -> Self {
        let on_air_queue = Arc::new(StagingQueue::new(config.on_air_capacity));
        let nominal_duration_us = (1_000_000.0 / config.target_fps).round() as i64;
        let channel_id = config.channel_id;
        let renderer_worker = RendererWorker::spawn(renderer, on_air_queue.clone(), clock.clone(), metrics.clone(), channel_id);
        metrics.update(channel_id, |m| m.state = Some(ChannelState::Stopped));
        ChannelWorker {
            config,
            clock,
            metrics,
            on_air_queue,
            renderer: Some(renderer_worker),
            live_producer: None,
            shadow: None,
            phase: ChannelPhase::Idle,
            live_pts_tracker: Arc::new(AtomicI64::new(0)),
            has_live_history: false,
            nominal_duration_us,
            current_live_asset: None,
            prior_phase: None,
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: ChannelPhase) {
        self.phase = phase;
        self.metrics
            .update(self.config.channel_id, |m| m.state = Some(phase.to_metrics_state()));
    }

    /// Begins shadow-decoding `asset_id` into a private queue invisible to
    /// the renderer (SPEC_FULL.md §4.3).
    pub fn load_preview(&mut self, path: Option<PathBuf>, asset_id: String) -> Result<bool, PlayoutError> {
        if let Some(mut old) = self.shadow.take() {
            old.producer.stop();
        }
        let shadow_queue = Arc::new(StagingQueue::new(self.config.on_air_capacity));
        let producer = Producer::spawn(
            ProducerConfig {
                asset_id: asset_id.clone(),
                path: path.clone(),
                width: self.config.width,
                height: self.config.height,
                target_fps: self.config.target_fps,
                mode: ProducerMode::Shadow,
            },
            shadow_queue.clone(),
            self.metrics.clone(),
            self.config.channel_id,
        );

        let ready = wait_for_shadow_decode_ready(&producer, &asset_id)?;

        self.shadow = Some(ShadowPreview {
            queue: shadow_queue,
            producer,
            asset_id,
            path,
        });
        if self.phase == ChannelPhase::Idle {
            self.set_phase(ChannelPhase::Buffering);
        }
        Ok(ready)
    }

    /// Splices the shadow-decoded asset into the on-air queue, rewriting PTS
    /// so the first spliced frame continues exactly where the previous live
    /// stream left off, then keeps decoding the same asset directly into the
    /// on-air queue. Returns (pts_contiguous, live_start_pts).
    pub fn switch_to_live(&mut self, asset_id: &str) -> Result<(bool, TimestampUs), PlayoutError> {
        let shadow = self.shadow.take().ok_or_else(|| PlayoutError::FailedPrecondition {
            reason: format!("no preview loaded for asset '{asset_id}'"),
        })?;
        if shadow.asset_id != asset_id {
            self.shadow = Some(shadow);
            return Err(PlayoutError::FailedPrecondition {
                reason: format!("loaded preview asset does not match '{asset_id}'"),
            });
        }

        let start_pts = if self.has_live_history {
            self.live_pts_tracker.load(Ordering::Relaxed) + self.nominal_duration_us
        } else {
            0
        };

        let mut drained = Vec::new();
        while let Some(frame) = shadow.queue.pop() {
            drained.push(frame);
        }
        let mut shadow = shadow;
        shadow.producer.stop();

        let offset = drained.first().map(|f| start_pts - f.pts()).unwrap_or(0);
        let mut cursor = start_pts;
        for mut frame in drained {
            frame.meta.pts += offset;
            frame.meta.dts += offset;
            cursor = frame.pts();
            // On-air queue is sized to hold at least one full preview batch;
            // in steady state this never blocks the control-plane thread.
            let _ = self.on_air_queue.push(frame);
        }
        self.live_pts_tracker.store(cursor, Ordering::Relaxed);
        self.has_live_history = true;

        if let Some(mut old) = self.live_producer.take() {
            old.stop();
        }
        self.current_live_asset = Some((asset_id.to_string(), shadow.path.clone()));
        let next_start = cursor + self.nominal_duration_us;
        self.spawn_live_producer(next_start);
        self.set_phase(ChannelPhase::Playing);

        Ok((true, start_pts))
    }

    fn spawn_live_producer(&mut self, start_pts: TimestampUs) {
        let Some((asset_id, path)) = self.current_live_asset.clone() else {
            return;
        };
        let producer = Producer::spawn_with_tracker(
            ProducerConfig {
                asset_id,
                path,
                width: self.config.width,
                height: self.config.height,
                target_fps: self.config.target_fps,
                mode: ProducerMode::Live { start_pts },
            },
            self.on_air_queue.clone(),
            Some(self.live_pts_tracker.clone()),
            self.metrics.clone(),
            self.config.channel_id,
        );
        self.live_producer = Some(producer);
    }

    /// Drains pending producer events and reacts: counts decode errors, and
    /// seamlessly re-spawns the live producer on its own asset when it runs
    /// out of source material, so a channel never silently starves.
    pub fn handle_events(&mut self) {
        let mut should_loop = false;
        if let Some(producer) = &self.live_producer {
            for event in producer.events.try_iter().collect::<Vec<_>>() {
                match event {
                    ProducerEvent::DecodeError { reason } => {
                        tracing::warn!(channel_id = self.config.channel_id, %reason, "live decode error");
                        self.metrics.update(self.config.channel_id, |m| m.decode_failure_count += 1);
                    }
                    ProducerEvent::EndOfStream => should_loop = true,
                    ProducerEvent::Fatal(err) => {
                        tracing::error!(channel_id = self.config.channel_id, %err, "live producer escalated to fatal");
                        self.set_phase(ChannelPhase::Error);
                    }
                    ProducerEvent::FirstFrameReady { .. } | ProducerEvent::Stopped => {}
                }
            }
        }
        if should_loop && self.current_live_asset.is_some() && self.phase != ChannelPhase::Error {
            let next_start = self.live_pts_tracker.load(Ordering::Relaxed) + self.nominal_duration_us;
            self.spawn_live_producer(next_start);
        }

        if let Some(shadow) = &self.shadow {
            for event in shadow.producer.events.try_iter().collect::<Vec<_>>() {
                match event {
                    ProducerEvent::DecodeError { reason } => {
                        tracing::warn!(channel_id = self.config.channel_id, %reason, "preview decode error");
                    }
                    ProducerEvent::Fatal(err) => {
                        tracing::error!(channel_id = self.config.channel_id, %err, "shadow producer escalated to fatal");
                    }
                    _ => {}
                }
            }
        }
    }

    /// Applies a queue-depth edge event detected by the orchestration tick
    /// (spec.md §4.6/§4.7). `Underrun`/`Overrun` demote an active channel to
    /// Buffering; `Cleared` restores whatever phase was active before the
    /// episode started. A channel that was never actively playing (Idle,
    /// already Buffering, Stopping, Error) is left alone.
    pub fn on_backpressure(&mut self, event: BackpressureEvent) {
        match event {
            BackpressureEvent::Underrun | BackpressureEvent::Overrun => {
                if matches!(self.phase, ChannelPhase::Playing | ChannelPhase::Ready | ChannelPhase::Paused) {
                    self.prior_phase = Some(self.phase);
                    self.set_phase(ChannelPhase::Buffering);
                }
            }
            BackpressureEvent::Cleared => {
                if self.phase == ChannelPhase::Buffering {
                    let restore = self.prior_phase.take().unwrap_or(ChannelPhase::Ready);
                    self.set_phase(restore);
                }
            }
        }
    }

    pub fn stop(&mut self) {
        self.set_phase(ChannelPhase::Stopping);
        if let Some(mut shadow) = self.shadow.take() {
            shadow.producer.stop();
        }
        if let Some(mut producer) = self.live_producer.take() {
            producer.stop();
        }
        if let Some(mut renderer) = self.renderer.take() {
            renderer.stop();
        }
        self.on_air_queue.clear();
        self.metrics.remove(self.config.channel_id);
        self.set_phase(ChannelPhase::Idle);
    }

    pub fn on_air_queue(&self) -> Arc<StagingQueue> {
        self.on_air_queue.clone()
    }

    /// Test seam for exercising phase-dependent behavior (e.g. orchestration
    /// backpressure detection) without driving a full switch_to_live.
    #[cfg(test)]
    pub(crate) fn force_phase_for_test(&mut self, phase: ChannelPhase) {
        self.set_phase(phase);
    }
}

/// Blocks up to `SHADOW_DECODE_READY_TIMEOUT` for the shadow producer to
/// announce its first decoded frame. A `Fatal` event or a timeout both raise
/// an error instead of letting `load_preview` promote a channel that never
/// actually has preview content ready.
fn wait_for_shadow_decode_ready(producer: &Producer, asset_id: &str) -> Result<bool, PlayoutError> {
    let deadline = Instant::now() + SHADOW_DECODE_READY_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PlayoutError::DeadlineExceeded {
                reason: format!("shadow decode for asset '{asset_id}' did not become ready within 5s"),
            });
        }
        match producer.events.recv_timeout(remaining) {
            Ok(ProducerEvent::FirstFrameReady { .. }) => return Ok(true),
            Ok(ProducerEvent::Fatal(err)) => return Err(err),
            Ok(_) => continue,
            Err(_) => {
                return Err(PlayoutError::DeadlineExceeded {
                    reason: format!("shadow decode for asset '{asset_id}' did not become ready within 5s"),
                });
            }
        }
    }
}

impl Drop for ChannelWorker {
    fn drop(&mut self) {
        if self.phase != ChannelPhase::Idle {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrovue_core::clock::TestClock;
    use std::time::Duration;

    fn worker(channel_id: i32) -> (ChannelWorker, Arc<MetricsStore>) {
        let clock: Arc<dyn MasterClock> = TestClock::new(0);
        let metrics = Arc::new(MetricsStore::new());
        let config = ChannelConfig {
            channel_id,
            width: 8,
            height: 4,
            target_fps: 30.0,
            on_air_capacity: 16,
        };
        (
            ChannelWorker::new(config, clock, metrics.clone(), Renderer::Headless),
            metrics,
        )
    }

    /// S4 from SPEC_FULL.md §8: after SwitchToLive, the on-air queue carries
    /// frames whose PTS continues from the prior cursor with no gap.
    #[test]
    fn switch_to_live_splices_pts_contiguously_from_zero() {
        let (mut channel, _metrics) = worker(10);
        channel.load_preview(None, "asset-a".into()).unwrap();
        thread_sleep_until_frames(&channel, 3);

        let (contiguous, start_pts) = channel.switch_to_live("asset-a").unwrap();
        assert!(contiguous);
        assert_eq!(start_pts, 0);

        let first = channel.on_air_queue().pop().unwrap();
        assert_eq!(first.pts(), 0);
        channel.stop();
    }

    /// S4 from spec.md §8: a channel already live with last delivered
    /// pts=1,000,000 at 29.97fps splices the next asset in starting at
    /// exactly 1,033,366us (one nominal frame duration later), not at 0.
    #[test]
    fn switch_to_live_resumes_from_prior_live_history() {
        let (mut channel, _metrics) = worker(12);
        channel.nominal_duration_us = 33_366;
        channel.live_pts_tracker.store(1_000_000, Ordering::Relaxed);
        channel.has_live_history = true;

        channel.load_preview(None, "asset-b".into()).unwrap();
        thread_sleep_until_frames(&channel, 3);

        let (contiguous, start_pts) = channel.switch_to_live("asset-b").unwrap();
        assert!(contiguous);
        assert_eq!(start_pts, 1_033_366);

        let first = channel.on_air_queue().pop().unwrap();
        assert_eq!(first.pts(), 1_033_366);
        channel.stop();
    }

    #[test]
    fn switch_to_live_without_preview_fails_precondition() {
        let (mut channel, _metrics) = worker(11);
        let result = channel.switch_to_live("asset-z");
        assert!(matches!(result, Err(PlayoutError::FailedPrecondition { .. })));
        channel.stop();
    }

    /// spec.md §4.7: BackPressure(Underrun) demotes an active channel to
    /// Buffering, and BackPressureCleared restores what was active before.
    #[test]
    fn backpressure_underrun_then_cleared_round_trips_phase() {
        let (mut channel, _metrics) = worker(13);
        channel.set_phase(ChannelPhase::Playing);

        channel.on_backpressure(BackpressureEvent::Underrun);
        assert_eq!(channel.phase(), ChannelPhase::Buffering);

        channel.on_backpressure(BackpressureEvent::Cleared);
        assert_eq!(channel.phase(), ChannelPhase::Playing);

        channel.stop();
    }

    /// A channel that is not actively playing is unaffected by backpressure
    /// edges — there is no "prior phase" worth restoring.
    #[test]
    fn backpressure_on_idle_channel_is_a_no_op() {
        let (mut channel, _metrics) = worker(14);
        assert_eq!(channel.phase(), ChannelPhase::Idle);
        channel.on_backpressure(BackpressureEvent::Overrun);
        assert_eq!(channel.phase(), ChannelPhase::Idle);
        channel.stop();
    }

    fn thread_sleep_until_frames(channel: &ChannelWorker, min_frames: usize) {
        let shadow_queue = channel.shadow.as_ref().unwrap().queue.clone();
        for _ in 0..200 {
            if shadow_queue.size() >= min_frames {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
