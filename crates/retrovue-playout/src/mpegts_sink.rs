// crates/retrovue-playout/src/mpegts_sink.rs
//
// MpegTsSink: encodes each rendered Frame to an access unit, packetizes it
// with ts_mux::TsMuxer, and streams the resulting TS packets to whichever
// client is currently connected. The accept-thread / worker-thread /
// output-queue split mirrors the teacher's velocut_media::worker::MediaWorker
// (one thread owns the blocking I/O, the caller only ever touches a channel),
// adapted from a UI response channel to a byte-stream fan-out that tolerates
// the client reconnecting mid-stream. TCP is the default transport
// (127.0.0.1:9000); a Unix domain socket is the AIR_TS_SOCKET_PATH-selected
// alternative — both ends up behind the same `Box<dyn Write + Send>` client
// handle so the rest of the sink never cares which one is live.

use std::collections::VecDeque;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use retrovue_core::frame::Frame;

use crate::ts_mux::TsMuxer;

/// Default TCP bind port for the MPEG-TS transport (spec.md §4.5).
pub const DEFAULT_TCP_PORT: u16 = 9000;

/// Which listening transport a sink binds. TCP is the default; a Unix
/// domain socket is used instead when `AIR_TS_SOCKET_PATH` (or an explicit
/// `uds_path` on `StartChannel`) resolves to a path.
pub enum TsTransport {
    Tcp { bind_host: String, port: u16 },
    Uds { path: String },
}

impl Default for TsTransport {
    fn default() -> Self {
        TsTransport::Tcp {
            bind_host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
        }
    }
}

/// How the sink should behave when the producer side starves it of frames.
/// Spec.md §4.5 records this but specifies only passive handling today (the
/// worker sleeps briefly on underflow); the variants exist so a downstream
/// sink can interpret the policy once a real encoder backs `Encoder`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnderflowPolicy {
    FreezeLastFrame,
    BlackFrame,
    Skip,
}

impl Default for UnderflowPolicy {
    fn default() -> Self {
        UnderflowPolicy::Skip
    }
}

/// Per-channel MPEG-TS sink configuration (spec.md §4.5). `bitrate`/`gop_size`
/// are carried through to the real `FfmpegEncoder`; `StubEncoder` ignores
/// them since it has no rate control of its own.
#[derive(Clone, Debug)]
pub struct MpegTsSinkConfig {
    pub bind_host: String,
    pub port: u16,
    pub ts_socket_path: Option<String>,
    pub target_fps: f64,
    pub bitrate: u32,
    pub gop_size: u32,
    pub stub_mode: bool,
    pub underflow_policy: UnderflowPolicy,
    pub enable_audio: bool,
    /// Output queue capacity; the oldest entry is dropped on overflow
    /// (`packets_dropped` increments) rather than blocking the renderer.
    pub max_output_queue_packets: usize,
    /// Once the output queue reaches this depth, `encode_and_send` skips
    /// encoding for that frame instead of growing the backlog further.
    pub output_queue_high_water_mark: usize,
}

impl Default for MpegTsSinkConfig {
    fn default() -> Self {
        MpegTsSinkConfig {
            bind_host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
            ts_socket_path: None,
            target_fps: 29.97,
            bitrate: 3_000_000,
            gop_size: 50,
            stub_mode: true,
            underflow_policy: UnderflowPolicy::Skip,
            enable_audio: false,
            max_output_queue_packets: 100,
            output_queue_high_water_mark: 80,
        }
    }
}

impl MpegTsSinkConfig {
    fn transport(&self) -> TsTransport {
        match &self.ts_socket_path {
            Some(path) => TsTransport::Uds { path: path.clone() },
            None => TsTransport::Tcp {
                bind_host: self.bind_host.clone(),
                port: self.port,
            },
        }
    }
}

pub struct EncodedAccessUnit {
    pub data: Vec<u8>,
    pub is_key_frame: bool,
}

/// The seam to the external video encoder (spec.md §1). StubEncoder is
/// always available; a real H.264 encoder would implement this over
/// ffmpeg-the-third the same way FfmpegDecoder wraps decoding.
pub trait Encoder: Send {
    fn encode(&mut self, frame: &Frame) -> Result<EncodedAccessUnit, String>;
}

/// Emits the frame's luma plane as a stand-in access unit and marks every
/// 30th frame a key frame, so PCR insertion and GOP-boundary behavior stay
/// exercisable without a real codec.
pub struct StubEncoder {
    frame_index: u64,
}

impl StubEncoder {
    pub fn new() -> Self {
        StubEncoder { frame_index: 0 }
    }
}

impl Default for StubEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for StubEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<EncodedAccessUnit, String> {
        let luma_len = frame.width as usize * frame.height as usize;
        let is_key_frame = self.frame_index % 30 == 0;
        self.frame_index += 1;
        Ok(EncodedAccessUnit {
            data: frame.data[..luma_len.min(frame.data.len())].to_vec(),
            is_key_frame,
        })
    }
}

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_encoder {
    use super::{EncodedAccessUnit, Encoder};
    use ffmpeg_the_third as ffmpeg;
    use ffmpeg::codec::{self, encoder};
    use ffmpeg::format::Pixel;
    use ffmpeg::util::frame::video::Video as AvFrame;
    use retrovue_core::frame::Frame;

    /// Thin wrapper over ffmpeg-the-third's H.264 encoder context, grounded
    /// in the teacher's encode.rs encoder setup (codec lookup, context from
    /// codec, open with default options) minus its multi-clip timeline
    /// concatenation, since playout encodes one continuous frame stream.
    pub struct FfmpegEncoder {
        encoder: encoder::video::Encoder,
        width: u32,
        height: u32,
        frame_index: i64,
    }

    impl FfmpegEncoder {
        pub fn new(width: u32, height: u32, fps: f64) -> Result<Self, String> {
            let codec = encoder::find(codec::Id::H264).ok_or("h264 encoder not available")?;
            let mut ctx = codec::context::Context::new_with_codec(codec)
                .encoder()
                .video()
                .map_err(|e| format!("encoder context: {e}"))?;
            ctx.set_width(width);
            ctx.set_height(height);
            ctx.set_format(Pixel::YUV420P);
            ctx.set_time_base((1, fps.round() as i32));
            let encoder = ctx.open().map_err(|e| format!("open encoder: {e}"))?;
            Ok(FfmpegEncoder {
                encoder,
                width,
                height,
                frame_index: 0,
            })
        }
    }

    impl Encoder for FfmpegEncoder {
        fn encode(&mut self, frame: &Frame) -> Result<EncodedAccessUnit, String> {
            let mut av_frame = AvFrame::new(Pixel::YUV420P, self.width, self.height);
            let w = self.width as usize;
            let h = self.height as usize;
            let cw = w / 2;
            let ch = h / 2;
            copy_into_plane(&mut av_frame, 0, &frame.data[0..w * h], w);
            let u_off = w * h;
            copy_into_plane(&mut av_frame, 1, &frame.data[u_off..u_off + cw * ch], cw);
            let v_off = u_off + cw * ch;
            copy_into_plane(&mut av_frame, 2, &frame.data[v_off..v_off + cw * ch], cw);
            av_frame.set_pts(Some(self.frame_index));
            self.frame_index += 1;

            self.encoder
                .send_frame(&av_frame)
                .map_err(|e| format!("send_frame: {e}"))?;
            let mut packet = ffmpeg::Packet::empty();
            let mut data = Vec::new();
            let mut is_key_frame = false;
            while self.encoder.receive_packet(&mut packet).is_ok() {
                if let Some(bytes) = packet.data() {
                    data.extend_from_slice(bytes);
                }
                is_key_frame |= packet.is_key();
            }
            Ok(EncodedAccessUnit { data, is_key_frame })
        }
    }

    fn copy_into_plane(frame: &mut AvFrame, plane: usize, src: &[u8], width: usize) {
        let stride = frame.stride(plane);
        let dst = frame.data_mut(plane);
        for (row, chunk) in src.chunks(width).enumerate() {
            dst[row * stride..row * stride + width].copy_from_slice(chunk);
        }
    }
}

#[cfg(feature = "ffmpeg")]
pub use ffmpeg_encoder::FfmpegEncoder;

enum SinkListener {
    Tcp(TcpListener),
    Uds(UnixListener),
}

/// Bounded FIFO of encoded TS byte-blocks shared between the renderer thread
/// (push) and the writer thread (blocking pop). Overflow drops the oldest
/// entry rather than blocking the renderer on a stalled client (spec.md
/// §4.5 "output queue").
struct OutputQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    max_packets: usize,
    high_water_mark: usize,
    packets_dropped: AtomicU64,
}

impl OutputQueue {
    fn new(max_packets: usize, high_water_mark: usize) -> Self {
        OutputQueue {
            inner: Mutex::new(VecDeque::with_capacity(max_packets.min(256))),
            ready: Condvar::new(),
            max_packets: max_packets.max(1),
            high_water_mark,
            packets_dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, bytes: Vec<u8>) {
        let mut guard = self.inner.lock().unwrap();
        if guard.len() >= self.max_packets {
            guard.pop_front();
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(bytes);
        self.ready.notify_one();
    }

    fn is_at_high_water_mark(&self) -> bool {
        self.inner.lock().unwrap().len() >= self.high_water_mark
    }

    /// Blocks until a block is available or `shutdown` is observed with the
    /// queue drained.
    fn pop_blocking(&self, shutdown: &AtomicBool) -> Option<Vec<u8>> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(bytes) = guard.pop_front() {
                return Some(bytes);
            }
            if shutdown.load(Ordering::Relaxed) {
                return None;
            }
            let (next_guard, _timeout) = self.ready.wait_timeout(guard, Duration::from_millis(100)).unwrap();
            guard = next_guard;
        }
    }

    fn take_packets_dropped(&self) -> u64 {
        self.packets_dropped.swap(0, Ordering::Relaxed)
    }
}

/// Streams muxed TS bytes to whichever client is currently connected.
/// Encoding and muxing happen inline on the renderer thread (cheap,
/// deterministic work); only the blocking socket write is offloaded to a
/// worker thread so a slow/absent client never stalls playout pacing.
pub struct MpegTsSink {
    muxer: TsMuxer,
    encoder: Box<dyn Encoder>,
    queue: Arc<OutputQueue>,
    _accept_handle: Option<JoinHandle<()>>,
    _writer_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl MpegTsSink {
    /// Binds the transport named by `config` (TCP by default, or the Unix
    /// domain socket given in `config.ts_socket_path` — spec.md §4.5). Any
    /// stale UDS path is unlinked before binding.
    pub fn bind(config: MpegTsSinkConfig, encoder: Box<dyn Encoder>) -> std::io::Result<Self> {
        let listener = match config.transport() {
            TsTransport::Tcp { bind_host, port } => {
                let listener = TcpListener::bind((bind_host.as_str(), port))?;
                listener.set_nonblocking(true)?;
                SinkListener::Tcp(listener)
            }
            TsTransport::Uds { path } => {
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                listener.set_nonblocking(true)?;
                SinkListener::Uds(listener)
            }
        };
        Ok(Self::from_listener(listener, encoder, &config))
    }

    fn from_listener(listener: SinkListener, encoder: Box<dyn Encoder>, config: &MpegTsSinkConfig) -> Self {
        let current_client: Arc<Mutex<Option<Box<dyn Write + Send>>>> = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_client = current_client.clone();
        let accept_shutdown = shutdown.clone();
        let accept_handle = thread::Builder::new()
            .name("mpegts-accept".into())
            .spawn(move || accept_loop(listener, accept_client, accept_shutdown))
            .expect("spawn accept thread");

        let queue = Arc::new(OutputQueue::new(config.max_output_queue_packets, config.output_queue_high_water_mark));
        let writer_queue = queue.clone();
        let writer_client = current_client;
        let writer_shutdown = shutdown.clone();
        let writer_handle = thread::Builder::new()
            .name("mpegts-writer".into())
            .spawn(move || {
                while let Some(chunk) = writer_queue.pop_blocking(&writer_shutdown) {
                    let mut guard = writer_client.lock().unwrap();
                    if let Some(stream) = guard.as_mut() {
                        if stream.write_all(&chunk).is_err() {
                            *guard = None;
                        }
                    }
                }
            })
            .expect("spawn writer thread");

        MpegTsSink {
            muxer: TsMuxer::new(),
            encoder,
            queue,
            _accept_handle: Some(accept_handle),
            _writer_handle: Some(writer_handle),
            shutdown,
        }
    }

    /// Socket-less sink for tests and headless channels: encodes and muxes
    /// normally but discards the resulting bytes instead of writing them.
    pub fn sinkhole(encoder: Box<dyn Encoder>) -> Self {
        let config = MpegTsSinkConfig::default();
        let queue = Arc::new(OutputQueue::new(config.max_output_queue_packets, config.output_queue_high_water_mark));
        let shutdown = Arc::new(AtomicBool::new(false));
        let drain_queue = queue.clone();
        let drain_shutdown = shutdown.clone();
        thread::spawn(move || while drain_queue.pop_blocking(&drain_shutdown).is_some() {});
        MpegTsSink {
            muxer: TsMuxer::new(),
            encoder,
            queue,
            _accept_handle: None,
            _writer_handle: None,
            shutdown,
        }
    }

    /// Number of output packets dropped (oldest-entry eviction, §4.5's output
    /// queue overflow) since the last call. The renderer reports this into
    /// `ChannelMetrics::packets_dropped`.
    pub fn take_packets_dropped(&self) -> u64 {
        self.queue.take_packets_dropped()
    }

    pub fn encode_and_send(&mut self, frame: Frame) -> Result<(), String> {
        if self.queue.is_at_high_water_mark() {
            // Flow control (spec.md §4.5 step 4): skip encoding this frame
            // rather than growing the backlog past the high-water mark.
            return Ok(());
        }
        let pts_us = frame.pts();
        let unit = self.encoder.encode(&frame)?;
        let pts_90k = pts_us * 9 / 100;
        let packets = self.muxer.mux_access_unit(&unit.data, pts_90k, unit.is_key_frame);
        let mut bytes = Vec::with_capacity(packets.len() * crate::ts_mux::PACKET_SIZE);
        for p in &packets {
            bytes.extend_from_slice(p);
        }
        self.queue.push(bytes);
        Ok(())
    }
}

impl Drop for MpegTsSink {
    fn drop(&mut self) {
        // Append a null packet so a stopped stream's last 188 bytes are
        // always inspectable as end-of-stream padding (spec.md §4.5's
        // graceful-stop sequence), then close the channel so the writer
        // thread drains and exits instead of blocking forever.
        self.queue.push(TsMuxer::null_packet().to_vec());
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self._writer_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self._accept_handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: SinkListener, client: Arc<Mutex<Option<Box<dyn Write + Send>>>>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        let accepted: std::io::Result<Box<dyn Write + Send>> = match &listener {
            SinkListener::Tcp(l) => l.accept().map(|(stream, _addr)| {
                let _ = stream.set_nonblocking(false);
                Box::new(stream) as Box<dyn Write + Send>
            }),
            SinkListener::Uds(l) => l.accept().map(|(stream, _addr)| {
                let _ = stream.set_nonblocking(false);
                Box::new(stream) as Box<dyn Write + Send>
            }),
        };
        match accepted {
            Ok(stream) => *client.lock().unwrap() = Some(stream),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(_) => thread::sleep(Duration::from_millis(20)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrovue_core::frame::{yuv420_len, FrameMeta};
    use std::io::Read;

    fn frame(pts: i64) -> Frame {
        Frame::new(
            4,
            4,
            vec![1u8; yuv420_len(4, 4)],
            FrameMeta {
                pts,
                dts: pts,
                duration: 1.0 / 30.0,
                asset_id: "a".into(),
            },
        )
    }

    #[test]
    fn sinkhole_accepts_frames_without_panicking() {
        let mut sink = MpegTsSink::sinkhole(Box::new(StubEncoder::new()));
        for i in 0..3 {
            sink.encode_and_send(frame(i * 33_366)).unwrap();
        }
    }

    #[test]
    fn tcp_bound_socket_streams_ts_packets_to_connected_client() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut sink = MpegTsSink::from_listener(SinkListener::Tcp(listener), Box::new(StubEncoder::new()), &MpegTsSinkConfig::default());

        thread::sleep(Duration::from_millis(50));
        let mut client = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        sink.encode_and_send(frame(0)).unwrap();

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; crate::ts_mux::PACKET_SIZE];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], crate::ts_mux::SYNC_BYTE);
    }

    #[test]
    fn uds_bound_socket_streams_ts_packets_to_connected_client() {
        let dir = std::env::temp_dir().join(format!("retrovue-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sink.sock");
        let path_str = path.to_str().unwrap().to_string();

        let mut sink = MpegTsSink::bind(
            MpegTsSinkConfig {
                ts_socket_path: Some(path_str.clone()),
                ..MpegTsSinkConfig::default()
            },
            Box::new(StubEncoder::new()),
        )
        .unwrap();

        // Give the accept thread a moment to start listening before connecting.
        thread::sleep(Duration::from_millis(50));
        let mut client = UnixStream::connect(&path_str).unwrap();
        thread::sleep(Duration::from_millis(50));

        sink.encode_and_send(frame(0)).unwrap();

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; crate::ts_mux::PACKET_SIZE];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], crate::ts_mux::SYNC_BYTE);

        let _ = std::fs::remove_file(&path_str);
    }

    #[test]
    fn stopping_the_sink_appends_a_final_null_packet() {
        let dir = std::env::temp_dir().join(format!("retrovue-test-{}-s5", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sink.sock");
        let path_str = path.to_str().unwrap().to_string();

        let mut sink = MpegTsSink::bind(
            MpegTsSinkConfig {
                ts_socket_path: Some(path_str.clone()),
                ..MpegTsSinkConfig::default()
            },
            Box::new(StubEncoder::new()),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        let mut client = UnixStream::connect(&path_str).unwrap();
        thread::sleep(Duration::from_millis(50));

        for i in 0..10 {
            sink.encode_and_send(frame(i * 33_366)).unwrap();
        }
        drop(sink);

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut all = Vec::new();
        let _ = client.read_to_end(&mut all);
        assert_eq!(all.len() % crate::ts_mux::PACKET_SIZE, 0);
        let last = &all[all.len() - crate::ts_mux::PACKET_SIZE..];
        assert_eq!(last[0], crate::ts_mux::SYNC_BYTE);
        assert_eq!(last[1] & 0x1F, 0x1F);
        assert_eq!(last[2], 0xFF);

        let _ = std::fs::remove_file(&path_str);
    }

    /// spec.md §4.5 "output queue": on overflow the oldest entry is dropped
    /// and `packets_dropped` (via `take_packets_dropped`) accounts for it.
    #[test]
    fn output_queue_overflow_drops_oldest_and_counts_it() {
        let mut sink = MpegTsSink::bind(
            MpegTsSinkConfig {
                max_output_queue_packets: 2,
                output_queue_high_water_mark: 100,
                ..MpegTsSinkConfig::default()
            },
            Box::new(StubEncoder::new()),
        )
        .unwrap();
        // No client ever connects, so the writer thread has nothing to drain
        // and the queue backs up purely from pushes.
        for i in 0..5i64 {
            sink.encode_and_send(frame(i * 33_366)).unwrap();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(sink.take_packets_dropped() > 0, "expected overflow to drop at least one packet");
    }

    /// spec.md §4.5 step 4: once the output queue reaches the high-water
    /// mark, `encode_and_send` stops feeding it instead of growing further.
    #[test]
    fn high_water_mark_skips_further_encoding() {
        // Bind (rather than sinkhole) with no client ever connecting, so
        // nothing drains the queue and the gate is deterministic.
        let mut sink = MpegTsSink::bind(
            MpegTsSinkConfig {
                max_output_queue_packets: 100,
                output_queue_high_water_mark: 1,
                ts_socket_path: Some({
                    let dir = std::env::temp_dir().join(format!("retrovue-test-{}-hwm", std::process::id()));
                    std::fs::create_dir_all(&dir).unwrap();
                    dir.join("sink.sock").to_str().unwrap().to_string()
                }),
                ..MpegTsSinkConfig::default()
            },
            Box::new(StubEncoder::new()),
        )
        .unwrap();
        sink.encode_and_send(frame(0)).unwrap();
        thread::sleep(Duration::from_millis(20));
        // No client connected, so the first packet sits in the queue at/above
        // the high-water mark; the next encode call must be a no-op.
        let before = sink.queue.inner.lock().unwrap().len();
        sink.encode_and_send(frame(33_366)).unwrap();
        let after = sink.queue.inner.lock().unwrap().len();
        assert_eq!(before, after, "expected high-water mark to block further enqueues");
    }
}
