// crates/retrovue-playout/src/decoder.rs
//
// Decoder: the seam to the external media demux/decode library (spec.md §1
// lists this as an out-of-scope collaborator). StubDecoder generates
// synthetic frames and is always available; FfmpegDecoder (feature
// "ffmpeg") is a thin wrapper over ffmpeg-the-third, grounded in the
// teacher's velocut_media::decode::LiveDecoder (open + SwsContext + decode
// loop), adapted to decode sequentially into packed YUV420 rather than
// scrubbing an arbitrary timestamp.

use retrovue_core::frame::{yuv420_len, Frame, FrameMeta};

/// One decoded frame, or a recoverable/fatal signal.
pub enum DecodeOutcome {
    Frame(Frame),
    /// Corrupt packet, single-frame timeout, etc — the caller counts it and
    /// continues (spec.md §4.3 "recoverable decode errors").
    RecoverableError(String),
    EndOfStream,
}

/// Per-asset sequential decoder. One instance decodes exactly one asset,
/// start to EndOfStream; Producer re-opens a new Decoder to loop.
pub trait Decoder: Send {
    /// Decode and return the next frame in presentation order.
    fn next_frame(&mut self) -> DecodeOutcome;
}

/// Synthetic decoder used in stub_mode (spec.md §4.3) and whenever
/// `AIR_FAKE_VIDEO=1` forces it. Emits a moving vertical bar over a solid
/// color keyed off the asset id so motion is visually confirmable, at
/// `target_fps` with strictly increasing PTS.
pub struct StubDecoder {
    width: u32,
    height: u32,
    step_us: i64,
    asset_id: String,
    next_pts: i64,
    frame_index: u64,
    duration_s: f64,
    base_color: u8,
}

impl StubDecoder {
    pub fn new(asset_id: impl Into<String>, width: u32, height: u32, target_fps: f64) -> Self {
        let width = width & !1;
        let height = height & !1;
        let asset_id = asset_id.into();
        let base_color = asset_id.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        StubDecoder {
            width,
            height,
            step_us: (1_000_000.0 / target_fps).round() as i64,
            asset_id,
            next_pts: 0,
            frame_index: 0,
            duration_s: 1.0 / target_fps,
            base_color,
        }
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; yuv420_len(self.width, self.height)];
        let bar_x = (self.frame_index as usize * 4) % w.max(1);
        for y in 0..h {
            for x in 0..w {
                let lit = x.abs_diff(bar_x) < 4;
                data[y * w + x] = if lit { 235 } else { self.base_color.max(16) };
            }
        }
        let chroma_w = w / 2;
        let chroma_h = h / 2;
        let u_off = w * h;
        let v_off = u_off + chroma_w * chroma_h;
        for i in 0..chroma_w * chroma_h {
            data[u_off + i] = 128;
            data[v_off + i] = 128;
        }
        data
    }
}

impl Decoder for StubDecoder {
    fn next_frame(&mut self) -> DecodeOutcome {
        let data = self.render();
        let meta = FrameMeta {
            pts: self.next_pts,
            dts: self.next_pts,
            duration: self.duration_s,
            asset_id: self.asset_id.clone(),
        };
        let frame = Frame::new(self.width, self.height, data, meta);
        self.next_pts += self.step_us;
        self.frame_index += 1;
        DecodeOutcome::Frame(frame)
    }
}

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_decoder {
    use super::{DecodeOutcome, Decoder};
    use ffmpeg_the_third as ffmpeg;
    use ffmpeg::format::{input, Pixel};
    use ffmpeg::media::Type;
    use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
    use retrovue_core::frame::{Frame, FrameMeta};
    use std::path::PathBuf;

    /// Sequential decoder over a real media file, grounded in
    /// velocut_media::decode::LiveDecoder's open()/next_frame() pair — minus
    /// the scrub-seek machinery, since playout always reads forward from the
    /// start of the asset.
    pub struct FfmpegDecoder {
        ictx: ffmpeg::format::context::Input,
        decoder: ffmpeg::decoder::video::Video,
        video_idx: usize,
        scaler: SwsContext,
        out_w: u32,
        out_h: u32,
        tb_num: i32,
        tb_den: i32,
        asset_id: String,
        duration_s: f64,
        last_pts: i64,
        eof: bool,
    }

    impl FfmpegDecoder {
        pub fn open(
            path: &PathBuf,
            asset_id: impl Into<String>,
            target_width: u32,
            target_height: u32,
            target_fps: f64,
        ) -> Result<Self, String> {
            let ictx = input(path).map_err(|e| format!("open '{}': {e}", path.display()))?;
            let video_idx = ictx
                .streams()
                .best(Type::Video)
                .ok_or_else(|| "no video stream".to_string())?
                .index();

            let (tb_num, tb_den) = {
                let stream = ictx.stream(video_idx).unwrap();
                let tb = stream.time_base();
                (tb.numerator(), tb.denominator())
            };

            let ictx2 = input(path).map_err(|e| format!("reopen '{}': {e}", path.display()))?;
            let stream2 = ictx2.stream(video_idx).unwrap();
            let dec_ctx = ffmpeg::codec::context::Context::from_parameters(stream2.parameters())
                .map_err(|e| format!("decoder context: {e}"))?;
            let decoder = dec_ctx.decoder().video().map_err(|e| format!("open decoder: {e}"))?;

            let out_w = target_width & !1;
            let out_h = target_height & !1;

            let scaler = SwsContext::get(
                decoder.format(),
                decoder.width(),
                decoder.height(),
                Pixel::YUV420P,
                out_w,
                out_h,
                Flags::BILINEAR,
            )
            .map_err(|e| format!("create scaler: {e}"))?;

            Ok(FfmpegDecoder {
                ictx,
                decoder,
                video_idx,
                scaler,
                out_w,
                out_h,
                tb_num,
                tb_den,
                asset_id: asset_id.into(),
                duration_s: 1.0 / target_fps,
                last_pts: -1,
                eof: false,
            })
        }

        fn pts_to_us(&self, pts: i64) -> i64 {
            (pts as f64 * self.tb_num as f64 / self.tb_den as f64 * 1_000_000.0) as i64
        }

        fn extract_yuv420(&self, decoded: &ffmpeg::util::frame::video::Video) -> Vec<u8> {
            let mut out = vec![0u8; retrovue_core::frame::yuv420_len(self.out_w, self.out_h)];
            let w = self.out_w as usize;
            let h = self.out_h as usize;
            let cw = w / 2;
            let ch = h / 2;
            copy_plane(decoded, 0, w, h, &mut out[0..w * h]);
            let u_off = w * h;
            copy_plane(decoded, 1, cw, ch, &mut out[u_off..u_off + cw * ch]);
            let v_off = u_off + cw * ch;
            copy_plane(decoded, 2, cw, ch, &mut out[v_off..v_off + cw * ch]);
            out
        }
    }

    fn copy_plane(
        frame: &ffmpeg::util::frame::video::Video,
        plane: usize,
        w: usize,
        h: usize,
        dst: &mut [u8],
    ) {
        let stride = frame.stride(plane);
        let raw = frame.data(plane);
        for row in 0..h {
            let src = &raw[row * stride..row * stride + w];
            dst[row * w..row * w + w].copy_from_slice(src);
        }
    }

    impl Decoder for FfmpegDecoder {
        fn next_frame(&mut self) -> DecodeOutcome {
            if self.eof {
                return DecodeOutcome::EndOfStream;
            }
            for (stream, packet) in self.ictx.packets().flatten() {
                if stream.index() != self.video_idx {
                    continue;
                }
                if self.decoder.send_packet(&packet).is_err() {
                    return DecodeOutcome::RecoverableError("send_packet failed".into());
                }
                let mut decoded = ffmpeg::util::frame::video::Video::empty();
                while self.decoder.receive_frame(&mut decoded).is_ok() {
                    let pts = decoded.pts().unwrap_or(self.last_pts + 1);
                    self.last_pts = pts;
                    let mut scaled = ffmpeg::util::frame::video::Video::empty();
                    if self.scaler.run(&decoded, &mut scaled).is_err() {
                        return DecodeOutcome::RecoverableError("scale failed".into());
                    }
                    let data = self.extract_yuv420(&scaled);
                    let meta = FrameMeta {
                        pts: self.pts_to_us(pts),
                        dts: self.pts_to_us(pts),
                        duration: self.duration_s,
                        asset_id: self.asset_id.clone(),
                    };
                    let frame = Frame::new(self.out_w, self.out_h, data, meta);
                    return DecodeOutcome::Frame(frame);
                }
            }
            self.eof = true;
            DecodeOutcome::EndOfStream
        }
    }
}

#[cfg(feature = "ffmpeg")]
pub use ffmpeg_decoder::FfmpegDecoder;

#[cfg(test)]
mod tests {
    use super::*;

    /// Universal invariant 1 from SPEC_FULL.md §8.
    #[test]
    fn stub_decoder_pts_strictly_increasing_and_dts_le_pts() {
        let mut d = StubDecoder::new("asset-a", 16, 16, 29.97);
        let mut last_pts = None;
        for _ in 0..5 {
            match d.next_frame() {
                DecodeOutcome::Frame(f) => {
                    if let Some(prev) = last_pts {
                        assert!(f.pts() > prev);
                    }
                    assert!(f.dts() <= f.pts());
                    last_pts = Some(f.pts());
                }
                _ => panic!("expected a frame"),
            }
        }
    }

    #[test]
    fn stub_decoder_payload_matches_dimensions() {
        let mut d = StubDecoder::new("asset-b", 8, 6, 25.0);
        match d.next_frame() {
            DecodeOutcome::Frame(f) => {
                assert_eq!(f.data.len(), yuv420_len(8, 6));
            }
            _ => panic!("expected a frame"),
        }
    }
}
