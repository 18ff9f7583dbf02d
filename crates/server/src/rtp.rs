//! Splits encoder frames into RTP packets per codec. One packetizer instance
//! is shared by every peer, so every peer's sequence numbers and timestamps
//! advance off the same counters instead of being computed per peer.
//!
//! The SSRC stamped here is the packetizer's own bookkeeping identity, not
//! the on-wire value: each peer's `TrackLocalStaticRTP::write_rtp` rewrites
//! the SSRC (and payload type) to whatever was actually negotiated for that
//! peer's connection before the packet leaves the process, since SSRC is
//! negotiated per `RTCPeerConnection`, not shared across them.

use std::sync::atomic::{AtomicU16, Ordering};

use bytes::Bytes;

use crate::collaborators::VideoCodec;

pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
pub const AUDIO_PAYLOAD_TYPE: u8 = 111;
pub const DEFAULT_MTU: usize = 1200;

const H264_FU_A: u8 = 28;
const HEVC_FU: u8 = 49;

/// Scans an Annex-B byte stream (`00 00 01` / `00 00 00 01` start codes) and
/// returns each NAL unit's bytes, including its own header byte.
fn scan_annexb_nals(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let raw_end = starts.get(idx + 1).map(|&next| next - 3).unwrap_or(data.len());
        let end = if raw_end > start && data[raw_end - 1] == 0 {
            raw_end - 1
        } else {
            raw_end
        };
        if end > start {
            nals.push(&data[start..end]);
        }
    }
    nals
}

/// A packetized RTP packet, ready for `PeerRegistry::broadcast_*`.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: rtp::header::Header,
    pub payload: Bytes,
}

impl RtpPacket {
    fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32, marker: bool, payload: Vec<u8>) -> Self {
        let header = rtp::header::Header {
            version: 2,
            padding: false,
            extension: false,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            ..Default::default()
        };
        Self {
            header,
            payload: Bytes::from(payload),
        }
    }

    pub fn to_rtp_packet(&self) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: self.header.clone(),
            payload: self.payload.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(seq: u32) -> Self {
        Self::new(VIDEO_PAYLOAD_TYPE, seq as u16, 0, 0, false, vec![0u8; 4])
    }
}

pub struct RtpPacketizer {
    video_codec: VideoCodec,
    video_ssrc: u32,
    audio_ssrc: u32,
    video_seq: AtomicU16,
    audio_seq: AtomicU16,
    mtu: usize,
}

impl RtpPacketizer {
    pub fn new(video_codec: VideoCodec, video_ssrc: u32, audio_ssrc: u32) -> Self {
        Self {
            video_codec,
            video_ssrc,
            audio_ssrc,
            video_seq: AtomicU16::new(0),
            audio_seq: AtomicU16::new(0),
            mtu: DEFAULT_MTU,
        }
    }

    #[cfg(test)]
    fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    fn next_video_seq(&self) -> u16 {
        self.video_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn next_audio_seq(&self) -> u16 {
        self.audio_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// `frame_index * (90000 / framerate_hint)`, or `frame_index * 3000` absent a hint.
    pub fn video_timestamp(frame_index: u64, framerate_hint: Option<u32>) -> u32 {
        let per_frame = match framerate_hint {
            Some(fps) if fps > 0 => 90_000 / u64::from(fps),
            _ => 3000,
        };
        frame_index.wrapping_mul(per_frame) as u32
    }

    /// Opus runs at 48kHz, 480 samples (10ms) per packet.
    pub fn audio_timestamp(packet_index: u64) -> u32 {
        packet_index.wrapping_mul(480) as u32
    }

    fn build_video_packet(&self, payload: Vec<u8>, timestamp: u32, marker: bool) -> RtpPacket {
        RtpPacket::new(
            VIDEO_PAYLOAD_TYPE,
            self.next_video_seq(),
            timestamp,
            self.video_ssrc,
            marker,
            payload,
        )
    }

    pub fn packetize_video(&self, frame: &[u8], timestamp: u32, is_idr: bool) -> Vec<RtpPacket> {
        match self.video_codec {
            VideoCodec::H264 => self.packetize_h264(frame, timestamp),
            VideoCodec::Hevc => self.packetize_hevc(frame, timestamp),
            VideoCodec::Av1 => self.packetize_av1(frame, timestamp, is_idr),
        }
    }

    fn packetize_h264(&self, frame: &[u8], timestamp: u32) -> Vec<RtpPacket> {
        let nals = scan_annexb_nals(frame);
        let num_nals = nals.len();
        let mut packets = Vec::new();
        for (idx, nal) in nals.into_iter().enumerate() {
            let is_last_nal = idx + 1 == num_nals;
            if nal.len() <= self.mtu {
                packets.push(self.build_video_packet(nal.to_vec(), timestamp, is_last_nal));
                continue;
            }
            let header_byte = nal[0];
            let nri = header_byte & 0x60;
            let nal_type = header_byte & 0x1F;
            let fu_indicator = nri | H264_FU_A;
            let payload = &nal[1..];
            let frag_size = self.mtu - 1;
            let mut offset = 0;
            while offset < payload.len() {
                let end = (offset + frag_size).min(payload.len());
                let is_first = offset == 0;
                let is_final = end == payload.len();
                let mut fu_header = nal_type;
                if is_first {
                    fu_header |= 0x80;
                }
                if is_final {
                    fu_header |= 0x40;
                }
                let mut buf = Vec::with_capacity(2 + end - offset);
                buf.push(fu_indicator);
                buf.push(fu_header);
                buf.extend_from_slice(&payload[offset..end]);
                let marker = is_final && is_last_nal;
                packets.push(self.build_video_packet(buf, timestamp, marker));
                offset = end;
            }
        }
        packets
    }

    fn packetize_hevc(&self, frame: &[u8], timestamp: u32) -> Vec<RtpPacket> {
        let nals = scan_annexb_nals(frame);
        let num_nals = nals.len();
        let mut packets = Vec::new();
        for (idx, nal) in nals.into_iter().enumerate() {
            let is_last_nal = idx + 1 == num_nals;
            if nal.len() <= self.mtu || nal.len() < 2 {
                packets.push(self.build_video_packet(nal.to_vec(), timestamp, is_last_nal));
                continue;
            }
            let b0 = nal[0];
            let b1 = nal[1];
            let nal_type = (b0 >> 1) & 0x3F;
            let layer_id = ((b0 & 0x01) << 5) | (b1 >> 3);
            let tid = b1 & 0x07;
            let fu_b0 = (b0 & 0x80) | (HEVC_FU << 1) | (layer_id >> 5);
            let fu_b1 = ((layer_id & 0x1F) << 3) | tid;
            let payload = &nal[2..];
            let frag_size = self.mtu.saturating_sub(3).max(1);
            let mut offset = 0;
            while offset < payload.len() {
                let end = (offset + frag_size).min(payload.len());
                let is_first = offset == 0;
                let is_final = end == payload.len();
                let mut fu_header = nal_type;
                if is_first {
                    fu_header |= 0x80;
                }
                if is_final {
                    fu_header |= 0x40;
                }
                let mut buf = Vec::with_capacity(3 + end - offset);
                buf.push(fu_b0);
                buf.push(fu_b1);
                buf.push(fu_header);
                buf.extend_from_slice(&payload[offset..end]);
                let marker = is_final && is_last_nal;
                packets.push(self.build_video_packet(buf, timestamp, marker));
                offset = end;
            }
        }
        packets
    }

    fn packetize_av1(&self, frame: &[u8], timestamp: u32, _is_idr: bool) -> Vec<RtpPacket> {
        let budget = self.mtu.saturating_sub(1).max(1);
        if frame.len() <= budget {
            // W=1, N=1: a single aggregation unit starting a new temporal unit.
            let header = 0b0001_1000u8;
            let mut buf = Vec::with_capacity(1 + frame.len());
            buf.push(header);
            buf.extend_from_slice(frame);
            return vec![self.build_video_packet(buf, timestamp, true)];
        }
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < frame.len() {
            let end = (offset + budget).min(frame.len());
            let is_first = offset == 0;
            let is_last = end == frame.len();
            let z = !is_first as u8;
            let y = !is_last as u8;
            let header = (z << 7) | (y << 6);
            let mut buf = Vec::with_capacity(1 + end - offset);
            buf.push(header);
            buf.extend_from_slice(&frame[offset..end]);
            packets.push(self.build_video_packet(buf, timestamp, is_last));
            offset = end;
        }
        packets
    }

    /// Opus: whole frame is one RTP payload, marker set per spec ("set per frame").
    pub fn packetize_audio(&self, frame: &[u8], timestamp: u32) -> RtpPacket {
        RtpPacket::new(
            AUDIO_PAYLOAD_TYPE,
            self.next_audio_seq(),
            timestamp,
            self.audio_ssrc,
            true,
            frame.to_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for nal in nals {
            buf.extend_from_slice(&[0, 0, 0, 1]);
            buf.extend_from_slice(nal);
        }
        buf
    }

    #[test]
    fn scans_single_nal_with_four_byte_start_code() {
        let frame = annexb(&[&[0x67, 1, 2, 3]]);
        let nals = scan_annexb_nals(&frame);
        assert_eq!(nals, vec![&[0x67u8, 1, 2, 3][..]]);
    }

    #[test]
    fn scans_multiple_nals() {
        let frame = annexb(&[&[0x67, 1, 2], &[0x68, 3, 4], &[0x65, 5, 6, 7]]);
        let nals = scan_annexb_nals(&frame);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[2], &[0x65u8, 5, 6, 7][..]);
    }

    #[test]
    fn small_nal_is_a_single_packet_with_identical_payload() {
        let packetizer = RtpPacketizer::new(VideoCodec::H264, 111, 222);
        let nal = vec![0x67, 1, 2, 3, 4];
        let frame = annexb(&[&nal]);
        let packets = packetizer.packetize_video(&frame, 1000, false);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload.as_ref(), nal.as_slice());
        assert!(packets[0].header.marker);
        assert_eq!(packets[0].header.payload_type, VIDEO_PAYLOAD_TYPE);
        assert_eq!(packets[0].header.ssrc, 111);
    }

    /// The literal H.264 FU-A scenario: one 1800-byte IDR NAL (header 0x65),
    /// MTU 1200, expects exactly two FU-A packets with the documented
    /// indicator/header bytes and marker only on the second.
    #[test]
    fn literal_h264_fua_scenario() {
        let mut nal = vec![0x65u8];
        nal.extend((0..1799).map(|i| (i % 256) as u8));
        assert_eq!(nal.len(), 1800);
        let frame = annexb(&[&nal]);

        let packetizer = RtpPacketizer::new(VideoCodec::H264, 1, 2).with_mtu(1200);
        let packets = packetizer.packetize_video(&frame, 9000, true);

        assert_eq!(packets.len(), 2);

        assert_eq!(packets[0].payload[0], 0x7C);
        assert_eq!(packets[0].payload[1], 0x85);
        assert_eq!(&packets[0].payload[2..], &nal[1..1200]);
        assert!(!packets[0].header.marker);

        assert_eq!(packets[1].payload[0], 0x7C);
        assert_eq!(packets[1].payload[1], 0x45);
        assert_eq!(&packets[1].payload[2..], &nal[1200..]);
        assert!(packets[1].header.marker);
    }

    #[test]
    fn sequence_numbers_are_contiguous_and_wrap() {
        let packetizer = RtpPacketizer::new(VideoCodec::H264, 1, 2);
        let nal = vec![0x67, 1, 2];
        let frame = annexb(&[&nal]);
        let mut last = None;
        for _ in 0..5 {
            let packets = packetizer.packetize_video(&frame, 0, false);
            let seq = packets[0].header.sequence_number;
            if let Some(prev) = last {
                assert_eq!(seq, prev + 1);
            }
            last = Some(seq);
        }
    }

    #[test]
    fn marker_set_only_on_last_packet_of_a_frame() {
        let mut nal = vec![0x65u8];
        nal.extend(vec![0xAB; 3000]);
        let frame = annexb(&[&nal]);
        let packetizer = RtpPacketizer::new(VideoCodec::H264, 1, 2);
        let packets = packetizer.packetize_video(&frame, 0, true);
        assert!(packets.len() > 1);
        for packet in &packets[..packets.len() - 1] {
            assert!(!packet.header.marker);
        }
        assert!(packets.last().unwrap().header.marker);
    }

    #[test]
    fn video_timestamp_defaults_to_thirty_fps_cadence() {
        assert_eq!(RtpPacketizer::video_timestamp(1, None), 3000);
        assert_eq!(RtpPacketizer::video_timestamp(2, None), 6000);
        assert_eq!(RtpPacketizer::video_timestamp(1, Some(60)), 1500);
    }

    #[test]
    fn audio_timestamp_increments_by_480_per_packet() {
        assert_eq!(RtpPacketizer::audio_timestamp(0), 0);
        assert_eq!(RtpPacketizer::audio_timestamp(1), 480);
        assert_eq!(RtpPacketizer::audio_timestamp(10), 4800);
    }

    #[test]
    fn opus_packet_always_sets_marker() {
        let packetizer = RtpPacketizer::new(VideoCodec::H264, 1, 9);
        let packet = packetizer.packetize_audio(&[1, 2, 3], 480);
        assert!(packet.header.marker);
        assert_eq!(packet.header.payload_type, AUDIO_PAYLOAD_TYPE);
        assert_eq!(packet.header.ssrc, 9);
        assert_eq!(packet.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn av1_small_frame_is_single_aggregation_unit() {
        let packetizer = RtpPacketizer::new(VideoCodec::Av1, 1, 2);
        let frame = vec![0xAA; 50];
        let packets = packetizer.packetize_video(&frame, 0, true);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload[0], 0b0001_1000);
        assert_eq!(&packets[0].payload[1..], frame.as_slice());
        assert!(packets[0].header.marker);
    }

    #[test]
    fn av1_large_frame_fragments_with_z_y_bits() {
        let packetizer = RtpPacketizer::new(VideoCodec::Av1, 1, 2).with_mtu(100);
        let frame = vec![0xBBu8; 250];
        let packets = packetizer.packetize_video(&frame, 0, true);
        assert!(packets.len() >= 2);
        assert_eq!(packets[0].payload[0] & 0x80, 0); // Z=0 on first
        assert_eq!(packets[0].payload[0] & 0x40, 0x40); // Y=1 on first
        let last = packets.last().unwrap();
        assert_eq!(last.payload[0] & 0x80, 0x80); // Z=1 on last
        assert_eq!(last.payload[0] & 0x40, 0); // Y=0 on last
        assert!(last.header.marker);
    }
}
