// crates/retrovue-core/src/metrics.rs
//
// MetricsStore: the process-wide (but explicitly injected, not global —
// SPEC_FULL.md §9) per-channel counter/gauge table. Guarded by a Mutex;
// writes are small and infrequent per SPEC_FULL.md §5's shared-resource
// policy, and callers submit whole snapshots rather than holding the lock
// across any blocking work.
//
// Counters are kept distinct per the Open Question in spec.md §9: a single
// source field conflated overflow-drops, intentional skips, and output-queue
// drops. Here `frames_dropped`, `frames_skipped`, and `packets_dropped` are
// three separate fields and must never be added together.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Stopped,
    Buffering,
    Ready,
    Playing,
    Error,
}

impl ChannelState {
    /// Gauge value per SPEC_FULL.md §6.2. `Ready` and `Playing` both report
    /// the "ready" gauge value since the exported series only distinguishes
    /// the four states listed there.
    fn gauge_value(self) -> i32 {
        match self {
            ChannelState::Stopped => 0,
            ChannelState::Buffering => 1,
            ChannelState::Ready | ChannelState::Playing => 2,
            ChannelState::Error => 3,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChannelMetrics {
    pub state: Option<ChannelState>,
    pub buffer_depth_frames: u64,
    pub frame_gap_seconds: f64,
    pub decode_failure_count: u64,
    pub corrections_total: u64,

    // Tracked but not part of the required §6.2 series — exported as extra
    // informational series by render_prometheus_text.
    pub frames_rendered: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub late_frames: u64,
    pub packets_dropped: u64,
    pub buffer_full_count: u64,
    pub encoding_errors: u64,
}

/// Mutex-guarded table of per-channel metrics, keyed by channel id.
#[derive(Default)]
pub struct MetricsStore {
    channels: Mutex<HashMap<i32, ChannelMetrics>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        MetricsStore {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn update<F: FnOnce(&mut ChannelMetrics)>(&self, channel_id: i32, f: F) {
        let mut guard = self.channels.lock().unwrap();
        let entry = guard.entry(channel_id).or_default();
        f(entry);
    }

    pub fn remove(&self, channel_id: i32) {
        self.channels.lock().unwrap().remove(&channel_id);
    }

    pub fn snapshot(&self, channel_id: i32) -> Option<ChannelMetrics> {
        self.channels.lock().unwrap().get(&channel_id).cloned()
    }

    /// Render the Prometheus text exposition format (SPEC_FULL.md §6.2 / §6.6).
    /// The socket-level HTTP listener that serves this text is an external
    /// collaborator (spec.md §1) — this function only produces the body.
    pub fn render_prometheus_text(&self) -> String {
        let guard = self.channels.lock().unwrap();
        let mut out = String::new();

        let required: &[(&str, &str, &str)] = &[
            (
                "retrovue_playout_channel_state",
                "gauge",
                "0=Stopped, 1=Buffering, 2=Ready, 3=Error",
            ),
            (
                "retrovue_playout_buffer_depth_frames",
                "gauge",
                "Current queue size",
            ),
            (
                "retrovue_playout_frame_gap_seconds",
                "gauge",
                "Last observed renderer drift (signed)",
            ),
            (
                "retrovue_playout_decode_failure_count",
                "counter",
                "Cumulative decode errors",
            ),
            (
                "retrovue_playout_corrections_total",
                "counter",
                "Cumulative pace corrections",
            ),
        ];

        for (name, kind, help) in required {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            for (channel_id, m) in guard.iter() {
                let value: f64 = match *name {
                    "retrovue_playout_channel_state" => {
                        m.state.map(|s| s.gauge_value()).unwrap_or(0) as f64
                    }
                    "retrovue_playout_buffer_depth_frames" => m.buffer_depth_frames as f64,
                    "retrovue_playout_frame_gap_seconds" => m.frame_gap_seconds,
                    "retrovue_playout_decode_failure_count" => m.decode_failure_count as f64,
                    "retrovue_playout_corrections_total" => m.corrections_total as f64,
                    _ => unreachable!(),
                };
                let _ = writeln!(out, "{name}{{channel=\"{channel_id}\"}} {value}");
            }
        }

        // Extra, non-required series — keeps the three loss counters visible
        // and distinct rather than folded into corrections_total.
        let extras: &[(&str, fn(&ChannelMetrics) -> f64)] = &[
            ("retrovue_playout_frames_rendered_total", |m| {
                m.frames_rendered as f64
            }),
            ("retrovue_playout_frames_skipped_total", |m| {
                m.frames_skipped as f64
            }),
            ("retrovue_playout_frames_dropped_total", |m| {
                m.frames_dropped as f64
            }),
            ("retrovue_playout_late_frames_total", |m| {
                m.late_frames as f64
            }),
            ("retrovue_playout_packets_dropped_total", |m| {
                m.packets_dropped as f64
            }),
            ("retrovue_playout_buffer_full_total", |m| {
                m.buffer_full_count as f64
            }),
            ("retrovue_playout_encoding_errors_total", |m| {
                m.encoding_errors as f64
            }),
        ];
        for (name, read) in extras {
            let _ = writeln!(out, "# TYPE {name} counter");
            for (channel_id, m) in guard.iter() {
                let _ = writeln!(out, "{name}{{channel=\"{channel_id}\"}} {}", read(m));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_required_series_per_channel() {
        let store = MetricsStore::new();
        store.update(7, |m| {
            m.state = Some(ChannelState::Playing);
            m.buffer_depth_frames = 12;
            m.frame_gap_seconds = -0.002;
            m.decode_failure_count = 1;
            m.corrections_total = 3;
        });
        let text = store.render_prometheus_text();
        assert!(text.contains("retrovue_playout_channel_state{channel=\"7\"} 2"));
        assert!(text.contains("retrovue_playout_buffer_depth_frames{channel=\"7\"} 12"));
        assert!(text.contains("retrovue_playout_corrections_total{channel=\"7\"} 3"));
    }

    #[test]
    fn remove_drops_channel_from_future_snapshots() {
        let store = MetricsStore::new();
        store.update(1, |m| m.buffer_depth_frames = 5);
        store.remove(1);
        assert!(store.snapshot(1).is_none());
    }

    #[test]
    fn distinct_loss_counters_stay_separate() {
        let store = MetricsStore::new();
        store.update(1, |m| {
            m.frames_dropped = 2;
            m.frames_skipped = 5;
            m.packets_dropped = 9;
        });
        let s = store.snapshot(1).unwrap();
        assert_eq!((s.frames_dropped, s.frames_skipped, s.packets_dropped), (2, 5, 9));
    }
}
