// crates/retrovue-core/src/lib.rs
//
// Leaf crate: types shared by every other crate in the workspace, with no
// dependency on threads, sockets, or the codec library. Plain data + traits,
// matching the teacher's velocut-core ("no egui, no ffmpeg, no runtime
// handles" — see media_types.rs).

pub mod clock;
pub mod commands;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod queue;

pub use clock::{MasterClock, RealClock, TestClock};
pub use commands::{Command, Response, API_VERSION};
pub use error::PlayoutError;
pub use frame::{Frame, FrameMeta, TimestampUs};
pub use metrics::{ChannelMetrics, ChannelState, MetricsStore};
pub use queue::StagingQueue;
