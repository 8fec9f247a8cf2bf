// crates/retrovue-airsrv/src/engine.rs
//
// Engine: the process-wide table of active channels plus the shared
// MasterClock and MetricsStore every channel is built against. One Mutex
// guards the map (SPEC_FULL.md §5's shared-resource policy); each
// ChannelWorker inside it owns its own threads, so the lock is only ever
// held for the short bookkeeping calls in this file, never across a
// blocking decode or render step.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use retrovue_core::clock::MasterClock;
use retrovue_core::metrics::MetricsStore;
use retrovue_core::PlayoutError;
use retrovue_playout::{
    ChannelConfig, ChannelTable, ChannelWorker, OrchestrationLoop, Renderer, DEFAULT_TICK_INTERVAL,
};

/// How long `start_channel` waits for a freshly spliced on-air queue to
/// reach ready depth before tearing the channel back down (spec.md
/// §4.8/§6.5).
const CHANNEL_READY_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum on-air queue depth considered "ready" to hand the channel to
/// callers. Chosen as a small, fixed pre-roll rather than a fraction of
/// queue capacity, since capacity is sized for steady-state jitter
/// absorption, not startup readiness.
const READY_THRESHOLD_FRAMES: usize = 5;

pub struct Engine {
    channels: ChannelTable,
    clock: Arc<dyn MasterClock>,
    metrics: Arc<MetricsStore>,
    orchestration: OrchestrationLoop,
}

impl Engine {
    pub fn new(clock: Arc<dyn MasterClock>, metrics: Arc<MetricsStore>) -> Self {
        let channels: ChannelTable = Arc::new(Mutex::new(HashMap::new()));
        let orchestration = OrchestrationLoop::spawn(channels.clone(), DEFAULT_TICK_INTERVAL);
        Engine {
            channels,
            clock,
            metrics,
            orchestration,
        }
    }

    pub fn metrics(&self) -> Arc<MetricsStore> {
        self.metrics.clone()
    }

    pub fn start_channel(
        &self,
        channel_id: i32,
        renderer: Renderer,
        initial_asset: Option<(PathBuf, String)>,
    ) -> Result<(), PlayoutError> {
        let mut guard = self.channels.lock().unwrap();
        if guard.contains_key(&channel_id) {
            return Err(PlayoutError::AlreadyExists { channel_id });
        }
        let config = ChannelConfig {
            channel_id,
            ..ChannelConfig::default()
        };
        let mut worker = ChannelWorker::new(config, self.clock.clone(), self.metrics.clone(), renderer);
        if let Some((path, asset_id)) = initial_asset {
            worker.load_preview(Some(path), asset_id.clone())?;
            worker.switch_to_live(&asset_id)?;
            if let Err(err) = wait_for_ready_depth(&worker) {
                worker.stop();
                return Err(err);
            }
        }
        guard.insert(channel_id, worker);
        Ok(())
    }

    pub fn stop_channel(&self, channel_id: i32) -> Result<(), PlayoutError> {
        let mut guard = self.channels.lock().unwrap();
        let mut worker = guard
            .remove(&channel_id)
            .ok_or(PlayoutError::NotFound { channel_id })?;
        worker.stop();
        Ok(())
    }

    pub fn load_preview(&self, channel_id: i32, path: Option<PathBuf>, asset_id: String) -> Result<bool, PlayoutError> {
        let mut guard = self.channels.lock().unwrap();
        let worker = guard
            .get_mut(&channel_id)
            .ok_or(PlayoutError::NotFound { channel_id })?;
        worker.load_preview(path, asset_id)
    }

    pub fn switch_to_live(&self, channel_id: i32, asset_id: &str) -> Result<(bool, i64), PlayoutError> {
        let mut guard = self.channels.lock().unwrap();
        let worker = guard
            .get_mut(&channel_id)
            .ok_or(PlayoutError::NotFound { channel_id })?;
        worker.switch_to_live(asset_id)
    }

    pub fn channel_exists(&self, channel_id: i32) -> bool {
        self.channels.lock().unwrap().contains_key(&channel_id)
    }
}

/// Blocks up to `CHANNEL_READY_WAIT_TIMEOUT` for the channel's on-air queue
/// to reach `READY_THRESHOLD_FRAMES`. Polling rather than an event is fine
/// here: `start_channel` already holds the channel-table lock for the
/// duration, and the window is at most 2 seconds.
fn wait_for_ready_depth(worker: &ChannelWorker) -> Result<(), PlayoutError> {
    let queue = worker.on_air_queue();
    let target = READY_THRESHOLD_FRAMES.min(queue.capacity());
    let deadline = Instant::now() + CHANNEL_READY_WAIT_TIMEOUT;
    loop {
        if queue.size() >= target {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(PlayoutError::DeadlineExceeded {
                reason: format!("on-air queue did not reach ready depth ({target} frames) within 2s"),
            });
        }
        thread::sleep(Duration::from_millis(10));
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.orchestration.stop();
        let mut guard = self.channels.lock().unwrap();
        for (_, worker) in guard.drain() {
            let mut worker = worker;
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrovue_core::clock::TestClock;

    #[test]
    fn start_channel_twice_is_already_exists() {
        let clock: Arc<dyn MasterClock> = TestClock::new(0);
        let metrics = Arc::new(MetricsStore::new());
        let engine = Engine::new(clock, metrics);
        engine.start_channel(1, Renderer::Headless, None).unwrap();
        let result = engine.start_channel(1, Renderer::Headless, None);
        assert!(matches!(result, Err(PlayoutError::AlreadyExists { channel_id: 1 })));
        engine.stop_channel(1).unwrap();
    }

    #[test]
    fn stop_unknown_channel_is_not_found() {
        let clock: Arc<dyn MasterClock> = TestClock::new(0);
        let metrics = Arc::new(MetricsStore::new());
        let engine = Engine::new(clock, metrics);
        assert!(matches!(
            engine.stop_channel(99),
            Err(PlayoutError::NotFound { channel_id: 99 })
        ));
    }
}
