// crates/retrovue-playout/src/lib.rs
//
// Library crate: the playout engine itself. Built around four threads per
// channel (producer, shadow producer, renderer) plus one process-wide
// orchestration tick thread — no async runtime, matching the teacher's
// thread-per-worker design in velocut-media rather than introducing tokio.

pub mod channel;
pub mod decoder;
pub mod mpegts_sink;
pub mod orchestration;
pub mod producer;
pub mod renderer;
pub mod ts_mux;

pub use channel::{ChannelConfig, ChannelPhase, ChannelWorker};
pub use decoder::{DecodeOutcome, Decoder, StubDecoder};
pub use mpegts_sink::{Encoder, MpegTsSink, MpegTsSinkConfig, StubEncoder, TsTransport, UnderflowPolicy, DEFAULT_TCP_PORT};
pub use orchestration::{ChannelTable, OrchestrationLoop, DEFAULT_TICK_INTERVAL};
pub use producer::{Producer, ProducerConfig, ProducerEvent, ProducerMode};
pub use renderer::{Renderer, RendererStats, RendererWorker};

#[cfg(feature = "ffmpeg")]
pub use decoder::FfmpegDecoder;
#[cfg(feature = "ffmpeg")]
pub use mpegts_sink::FfmpegEncoder;
