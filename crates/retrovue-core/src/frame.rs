// crates/retrovue-core/src/frame.rs
//
// Frame: the value type that flows Producer -> StagingQueue -> Renderer.
// Immutable once produced. Payload is packed planar YUV420 with no stride
// padding: [Y: w*h] ++ [U: (w/2)*(h/2)] ++ [V: (w/2)*(h/2)] — the same layout
// velocut_core::transitions documents for its VideoTransition::apply buffers.

/// Presentation/decode timestamp, in microseconds. Always non-negative in
/// practice but kept signed to match the wire contract in SPEC_FULL.md §3.
pub type TimestampUs = i64;

/// Per-frame timing and provenance metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameMeta {
    pub pts: TimestampUs,
    pub dts: TimestampUs,
    /// Nominal frame duration in seconds (positive, ~= 1 / target_fps).
    pub duration: f64,
    /// Short identifier of the asset this frame was decoded from.
    pub asset_id: String,
}

/// One decoded picture plus its timing metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Packed planar YUV420 bytes, length == yuv420_len(width, height).
    pub data: Vec<u8>,
    pub meta: FrameMeta,
}

/// Byte length of a packed planar YUV420 buffer for `width` x `height`.
pub fn yuv420_len(width: u32, height: u32) -> usize {
    let luma = width as usize * height as usize;
    let chroma = (width as usize / 2) * (height as usize / 2);
    luma + 2 * chroma
}

impl Frame {
    /// Build a frame, rounding odd dimensions down to the nearest even value
    /// (4:2:0 requires whole-pixel chroma planes) — mirrors the `& !1` idiom
    /// used for aspect-derived dimensions in the teacher's decode path.
    pub fn new(width: u32, height: u32, data: Vec<u8>, meta: FrameMeta) -> Self {
        let width = width & !1;
        let height = height & !1;
        debug_assert_eq!(
            data.len(),
            yuv420_len(width, height),
            "frame payload length does not match {width}x{height} YUV420",
        );
        Frame {
            width,
            height,
            data,
            meta,
        }
    }

    pub fn pts(&self) -> TimestampUs {
        self.meta.pts
    }

    pub fn dts(&self) -> TimestampUs {
        self.meta.dts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420_len_matches_plane_layout() {
        assert_eq!(yuv420_len(4, 2), 4 * 2 + 2 * 2);
        assert_eq!(yuv420_len(64, 36), 64 * 36 + 2 * (32 * 18));
    }

    #[test]
    fn new_rounds_odd_dimensions_down() {
        let f = Frame::new(
            5,
            3,
            vec![0u8; yuv420_len(4, 2)],
            FrameMeta {
                pts: 0,
                dts: 0,
                duration: 1.0 / 30.0,
                asset_id: "a".into(),
            },
        );
        assert_eq!((f.width, f.height), (4, 2));
    }
}
