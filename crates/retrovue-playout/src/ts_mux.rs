// crates/retrovue-playout/src/ts_mux.rs
//
// Hand-built MPEG-TS packetizer: PAT/PMT PSI tables, PES packetization, a
// single video elementary stream, continuity counters, PCR insertion, and
// null-packet padding. Driven directly rather than through the codec
// library's AVIO/muxer path (SPEC_FULL.md §4.5) so continuity-counter
// bookkeeping and packet boundaries stay fully inspectable and testable
// without ffmpeg present — the same "own the wire format, borrow the codec"
// split the teacher draws between velocut_media::encode (owns the MP4
// container writer) and ffmpeg-the-third (only the AV codec work).

pub const PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const NULL_PID: u16 = 0x1FFF;
const PROGRAM_NUMBER: u16 = 1;
const STREAM_TYPE_H264: u8 = 0x1B;

/// PAT/PMT are re-sent every N frames so a receiver joining mid-stream can
/// acquire the program within one GOP's worth of packets.
pub const PSI_REPEAT_FRAMES: u32 = 25;

const CRC32_MPEG2_POLY: u32 = 0x04C11DB7;

fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ CRC32_MPEG2_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Builds one 188-byte TS packet. `payload` is written starting right after
/// the 4-byte header (and, if present, the adaptation field); unused
/// trailing space is padded with adaptation-field stuffing bytes (0xFF).
/// Returns the packet and the number of payload bytes actually consumed.
fn write_packet(
    pid: u16,
    continuity_counter: u8,
    payload_unit_start: bool,
    pcr_27mhz: Option<u64>,
    payload: &[u8],
) -> ([u8; PACKET_SIZE], usize) {
    let mut packet = [0xFFu8; PACKET_SIZE];
    packet[0] = SYNC_BYTE;
    packet[1] = (((payload_unit_start as u8) << 6) | ((pid >> 8) as u8 & 0x1F)) as u8;
    packet[2] = (pid & 0xFF) as u8;

    let header_len = 4;
    let has_pcr = pcr_27mhz.is_some();

    // Decide how much adaptation-field stuffing is needed: enough that
    // header + adaptation + payload == PACKET_SIZE exactly.
    let max_payload_no_af = PACKET_SIZE - header_len;
    let consumed_no_af = payload.len().min(max_payload_no_af);

    if !has_pcr && consumed_no_af == payload.len() && consumed_no_af == max_payload_no_af {
        // Exact fit, no adaptation field required.
        packet[3] = 0x10 | (continuity_counter & 0x0F); // payload only
        packet[header_len..header_len + consumed_no_af].copy_from_slice(payload);
        return (packet, consumed_no_af);
    }

    // Adaptation field needed either for PCR or to pad a short final packet
    // up to exactly PACKET_SIZE.
    let pcr_len = if has_pcr { 6 } else { 0 };
    let available_for_payload = max_payload_no_af.saturating_sub(1 + pcr_len);
    let consumed = payload.len().min(available_for_payload);
    let af_body_len = 1 + pcr_len + (available_for_payload - consumed);
    let af_len = af_body_len; // adaptation_field_length field itself is +1, counted below

    packet[3] = 0x30 | (continuity_counter & 0x0F); // adaptation + payload
    let mut idx = header_len;
    packet[idx] = af_len as u8;
    idx += 1;
    let flags_idx = idx;
    packet[flags_idx] = if has_pcr { 0x10 } else { 0x00 };
    idx += 1;
    if let Some(pcr) = pcr_27mhz {
        let base = (pcr / 300) & 0x1FFFFFFFF;
        let ext = (pcr % 300) as u16 & 0x1FF;
        packet[idx] = (base >> 25) as u8;
        packet[idx + 1] = (base >> 17) as u8;
        packet[idx + 2] = (base >> 9) as u8;
        packet[idx + 3] = (base >> 1) as u8;
        packet[idx + 4] = (((base & 0x1) as u8) << 7) | 0x7E | ((ext >> 8) as u8 & 0x1);
        packet[idx + 5] = (ext & 0xFF) as u8;
        idx += 6;
    }
    // Remaining adaptation bytes up to header_len + 1 + af_len are stuffing
    // (already pre-filled with 0xFF above).
    let payload_start = header_len + 1 + af_len;
    packet[payload_start..payload_start + consumed].copy_from_slice(&payload[..consumed]);
    (packet, consumed)
}

fn psi_section_to_packet(pid: u16, continuity_counter: u8, section: &[u8]) -> [u8; PACKET_SIZE] {
    // PSI packets carry a pointer_field of 0 before the section since they
    // always start a new section at the top of the payload.
    let mut payload = Vec::with_capacity(section.len() + 1);
    payload.push(0);
    payload.extend_from_slice(section);
    let (packet, _) = write_packet(pid, continuity_counter, true, None, &payload);
    packet
}

fn build_pat_section() -> Vec<u8> {
    let mut section = Vec::new();
    section.push(0x00); // table_id: program_association_section
    // section_length placeholder, filled below
    section.push(0x00);
    section.push(0x00);
    section.push(0x00); // transport_stream_id hi
    section.push(0x01); // transport_stream_id lo
    section.push(0xC1); // reserved(2) version(5) current_next(1)
    section.push(0x00); // section_number
    section.push(0x00); // last_section_number
    section.push((PROGRAM_NUMBER >> 8) as u8);
    section.push((PROGRAM_NUMBER & 0xFF) as u8);
    section.push(0xE0 | ((PMT_PID >> 8) as u8 & 0x1F));
    section.push((PMT_PID & 0xFF) as u8);

    finalize_psi_section(section)
}

fn build_pmt_section() -> Vec<u8> {
    let mut section = Vec::new();
    section.push(0x02); // table_id: TS_program_map_section
    section.push(0x00);
    section.push(0x00);
    section.push((PROGRAM_NUMBER >> 8) as u8);
    section.push((PROGRAM_NUMBER & 0xFF) as u8);
    section.push(0xC1);
    section.push(0x00);
    section.push(0x00);
    section.push(0xE0 | ((VIDEO_PID >> 8) as u8 & 0x1F)); // PCR_PID
    section.push((VIDEO_PID & 0xFF) as u8);
    section.push(0xF0); // program_info_length hi nibble (reserved bits)
    section.push(0x00); // program_info_length lo, 0 descriptors

    // One elementary stream descriptor loop entry: video.
    section.push(STREAM_TYPE_H264);
    section.push(0xE0 | ((VIDEO_PID >> 8) as u8 & 0x1F));
    section.push((VIDEO_PID & 0xFF) as u8);
    section.push(0xF0);
    section.push(0x00); // ES_info_length = 0

    finalize_psi_section(section)
}

fn finalize_psi_section(mut section: Vec<u8>) -> Vec<u8> {
    // section_length covers everything after the length field, plus the
    // trailing 4-byte CRC.
    let length_field_value = (section.len() - 3 + 4) as u16 & 0x0FFF;
    section[1] = 0xB0 | ((length_field_value >> 8) as u8);
    section[2] = (length_field_value & 0xFF) as u8;
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn pes_header(stream_id: u8, payload_len: usize, pts_90k: i64, dts_90k: Option<i64>) -> Vec<u8> {
    let mut pes = Vec::new();
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    let has_dts = dts_90k.is_some();
    let pts_dts_flags: u8 = if has_dts { 0b11 } else { 0b10 };
    let header_data_len = if has_dts { 10 } else { 5 };

    let pes_packet_len = if payload_len + header_data_len + 3 > 0xFFFF {
        0 // unbounded length, legal for video PES per the spec
    } else {
        (payload_len + header_data_len + 3) as u16
    };
    pes.extend_from_slice(&pes_packet_len.to_be_bytes());
    pes.push(0x80); // marker bits, no scrambling/priority
    pes.push((pts_dts_flags << 6) | 0x00);
    pes.push(header_data_len as u8);

    push_timestamp(&mut pes, 0b0010 | (pts_dts_flags >> 1), pts_90k);
    if let Some(dts) = dts_90k {
        push_timestamp(&mut pes, 0b0001, dts);
    }
    pes
}

fn push_timestamp(out: &mut Vec<u8>, marker_nibble: u8, value_90k: i64) {
    let v = value_90k as u64 & 0x1_FFFF_FFFF;
    let b0 = ((marker_nibble & 0x0F) << 4) | (((v >> 30) as u8 & 0x07) << 1) | 0x01;
    let b1 = (v >> 22) as u8;
    let b2 = ((((v >> 15) as u8) & 0xFE)) | 0x01;
    let b3 = (v >> 7) as u8;
    let b4 = (((v << 1) as u8) & 0xFE) | 0x01;
    out.extend_from_slice(&[b0, b1, b2, b3, b4]);
}

/// Stateful packetizer for one program: tracks per-PID continuity counters
/// and how many video access units have been muxed since the last PSI
/// repeat.
pub struct TsMuxer {
    continuity: [u8; 3], // indexed by Pid enum below
    frames_since_psi: u32,
}

#[derive(Clone, Copy)]
enum Pid {
    Pat = 0,
    Pmt = 1,
    Video = 2,
}

impl TsMuxer {
    pub fn new() -> Self {
        TsMuxer {
            continuity: [0; 3],
            frames_since_psi: PSI_REPEAT_FRAMES, // force PSI on the first call
        }
    }

    fn next_cc(&mut self, pid: Pid) -> u8 {
        let cc = self.continuity[pid as usize];
        self.continuity[pid as usize] = cc.wrapping_add(1) & 0x0F;
        cc
    }

    /// Packetizes one access unit (already-encoded elementary stream bytes,
    /// e.g. an Annex-B H.264 NAL run) into a sequence of TS packets, with a
    /// PAT/PMT pair prefixed whenever the repeat interval has elapsed.
    pub fn mux_access_unit(&mut self, payload: &[u8], pts_90k: i64, is_key_frame: bool) -> Vec<[u8; PACKET_SIZE]> {
        let mut out = Vec::new();

        if self.frames_since_psi >= PSI_REPEAT_FRAMES {
            out.push(psi_section_to_packet(PAT_PID, self.next_cc(Pid::Pat), &build_pat_section()));
            out.push(psi_section_to_packet(PMT_PID, self.next_cc(Pid::Pmt), &build_pmt_section()));
            self.frames_since_psi = 0;
        }
        self.frames_since_psi += 1;

        let mut pes = pes_header(0xE0, payload.len(), pts_90k, Some(pts_90k));
        pes.extend_from_slice(payload);

        let pcr = if is_key_frame { Some((pts_90k as u64) * 300) } else { None };
        let mut offset = 0;
        let mut first = true;
        while offset < pes.len() {
            let cc = self.next_cc(Pid::Video);
            let (packet, consumed) = write_packet(
                VIDEO_PID,
                cc,
                first,
                if first { pcr } else { None },
                &pes[offset..],
            );
            out.push(packet);
            offset += consumed;
            first = false;
        }
        out
    }

    /// A single MPEG-TS null packet (PID 0x1FFF) used for constant-bitrate
    /// padding between access units.
    pub fn null_packet() -> [u8; PACKET_SIZE] {
        let mut packet = [0xFFu8; PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = (NULL_PID >> 8) as u8 & 0x1F;
        packet[2] = (NULL_PID & 0xFF) as u8;
        packet[3] = 0x10;
        packet
    }
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_header(packet: &[u8; PACKET_SIZE]) -> (u16, u8, bool) {
        assert_eq!(packet[0], SYNC_BYTE);
        let pid = (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16;
        let cc = packet[3] & 0x0F;
        let payload_start = (packet[1] & 0x40) != 0;
        (pid, cc, payload_start)
    }

    #[test]
    fn every_packet_is_188_bytes_and_starts_with_sync() {
        let mut mux = TsMuxer::new();
        let packets = mux.mux_access_unit(&[0xAA; 10], 900_000, true);
        for p in &packets {
            assert_eq!(p.len(), PACKET_SIZE);
            assert_eq!(p[0], SYNC_BYTE);
        }
    }

    #[test]
    fn first_access_unit_carries_pat_and_pmt() {
        let mut mux = TsMuxer::new();
        let packets = mux.mux_access_unit(&[0xAA; 10], 0, true);
        let (pid0, _, _) = parse_header(&packets[0]);
        let (pid1, _, _) = parse_header(&packets[1]);
        assert_eq!(pid0, PAT_PID);
        assert_eq!(pid1, PMT_PID);
    }

    /// S5 from SPEC_FULL.md §8: null packets pad between access units and
    /// are always well-formed sync/PID/adaptation-control packets.
    #[test]
    fn null_packet_is_well_formed() {
        let p = TsMuxer::null_packet();
        let (pid, _, _) = parse_header(&p);
        assert_eq!(pid, NULL_PID);
        assert_eq!(p[3] & 0x30, 0x10);
    }

    #[test]
    fn continuity_counter_increments_per_pid_and_wraps() {
        let mut mux = TsMuxer::new();
        let mut prev_video_cc = None;
        for i in 0..40 {
            let packets = mux.mux_access_unit(&[0xBB; 4], i * 3000, false);
            for p in &packets {
                let (pid, cc, _) = parse_header(p);
                if pid == VIDEO_PID {
                    if let Some(prev) = prev_video_cc {
                        assert_eq!(cc, (prev + 1) & 0x0F);
                    }
                    prev_video_cc = Some(cc);
                }
            }
        }
    }

    #[test]
    fn psi_repeats_after_interval() {
        let mut mux = TsMuxer::new();
        let mut psi_pairs = 0;
        for i in 0..(PSI_REPEAT_FRAMES * 3) {
            let packets = mux.mux_access_unit(&[0xCC; 4], i as i64 * 3000, false);
            let (pid0, _, _) = parse_header(&packets[0]);
            if pid0 == PAT_PID {
                psi_pairs += 1;
            }
        }
        assert_eq!(psi_pairs, 3);
    }
}
