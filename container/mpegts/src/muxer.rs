use {
    crate::{define::*, errors::MpegTsError, pes::write_pes_header, psi},
    bytes::{BufMut, BytesMut},
};

struct TsStream {
    stream_type: u8,
    pid: u16,
    sid: u8,
    continuity_counter: u8,
}

/// MPEG-TS packetizer for the HLS muxer: fixed PID layout (PMT 4096,
/// video 256, audio 257), PSI written at the start of every segment, PCR
/// on the video PID every [`PCR_PES_PERIOD`] PES packets, offset back by
/// [`PCR_OFFSET`]. When the program has no video track the audio PID
/// carries the PCR.
pub struct TsMuxer {
    streams: Vec<TsStream>,
    pcr_pid: u16,
    pat_continuity_counter: u8,
    pmt_continuity_counter: u8,
    pes_since_pcr: u32,
    out: BytesMut,
}

impl TsMuxer {
    pub fn new(video_stream_type: Option<u8>, audio_stream_type: Option<u8>) -> Self {
        let mut streams = Vec::new();
        if let Some(st) = video_stream_type {
            streams.push(TsStream {
                stream_type: st,
                pid: VIDEO_PID,
                sid: stream_id::VIDEO,
                continuity_counter: 0,
            });
        }
        if let Some(st) = audio_stream_type {
            streams.push(TsStream {
                stream_type: st,
                pid: AUDIO_PID,
                sid: stream_id::AUDIO,
                continuity_counter: 0,
            });
        }

        let pcr_pid = if video_stream_type.is_some() {
            VIDEO_PID
        } else {
            AUDIO_PID
        };

        Self {
            streams,
            pcr_pid,
            pat_continuity_counter: 0,
            pmt_continuity_counter: 0,
            pes_since_pcr: 0,
            out: BytesMut::new(),
        }
    }

    pub fn pcr_pid(&self) -> u16 {
        self.pcr_pid
    }

    /// Drain everything muxed so far; the HLS layer cuts segments by
    /// calling this at IDR boundaries.
    pub fn take_data(&mut self) -> BytesMut {
        self.out.split_to(self.out.len())
    }

    pub fn pending_len(&self) -> usize {
        self.out.len()
    }

    /// PSI packets open every segment so each .ts file is self-contained.
    pub fn write_tables(&mut self) {
        let pat = psi::write_pat();
        let cc = self.pat_continuity_counter;
        self.write_section_packet(PAT_PID, &pat, cc);
        self.pat_continuity_counter = (self.pat_continuity_counter + 1) % 16;

        let entries: Vec<(u8, u16)> = self
            .streams
            .iter()
            .map(|s| (s.stream_type, s.pid))
            .collect();
        let pmt = psi::write_pmt(&entries, self.pcr_pid);
        let cc = self.pmt_continuity_counter;
        self.write_section_packet(PMT_PID, &pmt, cc);
        self.pmt_continuity_counter = (self.pmt_continuity_counter + 1) % 16;
    }

    fn write_section_packet(&mut self, pid: u16, section: &[u8], continuity_counter: u8) {
        self.out.put_u8(SYNC_BYTE);
        self.out
            .put_u8(PAYLOAD_UNIT_START | (pid >> 8) as u8 & 0x1F);
        self.out.put_u8(pid as u8);
        self.out.put_u8(0x10 | continuity_counter);
        self.out.put_u8(0x00); // pointer_field
        self.out.extend_from_slice(section);
        for _ in 0..TS_PACKET_SIZE - 5 - section.len() {
            self.out.put_u8(0xFF);
        }
    }

    /// Packetize one PES (a whole access unit) onto the given PID.
    pub fn write(
        &mut self,
        pid: u16,
        pts: u64,
        dts: u64,
        random_access: bool,
        payload: &[u8],
    ) -> Result<(), MpegTsError> {
        let stream_idx = self
            .streams
            .iter()
            .position(|s| s.pid == pid)
            .ok_or(MpegTsError {
                value: crate::errors::MpegTsErrorValue::StreamNotFound(pid),
            })?;

        let with_pcr = pid == self.pcr_pid && self.pes_since_pcr % PCR_PES_PERIOD == 0;
        if pid == self.pcr_pid {
            self.pes_since_pcr = self.pes_since_pcr.wrapping_add(1);
        }

        let sid = self.streams[stream_idx].sid;
        let pes_header = write_pes_header(sid, pts, dts, random_access, payload.len());

        let mut rest: &[u8] = payload;
        let mut first = true;

        while !rest.is_empty() || first {
            let mut header = BytesMut::with_capacity(TS_PACKET_SIZE);
            header.put_u8(SYNC_BYTE);
            let mut b1 = (pid >> 8) as u8 & 0x1F;
            if first {
                b1 |= PAYLOAD_UNIT_START;
            }
            header.put_u8(b1);
            header.put_u8(pid as u8);

            let cc = self.streams[stream_idx].continuity_counter;
            self.streams[stream_idx].continuity_counter = (cc + 1) % 16;

            // adaptation field: PCR and random-access flags on the first
            // packet, stuffing whenever the payload cannot fill 188 bytes
            let mut adaptation: Option<BytesMut> = None;
            if first && (with_pcr || random_access) {
                let mut af = BytesMut::new();
                af.put_u8(0x00); // flags, patched below
                if with_pcr {
                    af[0] |= 0x10; // PCR flag
                    let pcr_base = dts.saturating_sub(PCR_OFFSET);
                    af.put_u8((pcr_base >> 25) as u8);
                    af.put_u8((pcr_base >> 17) as u8);
                    af.put_u8((pcr_base >> 9) as u8);
                    af.put_u8((pcr_base >> 1) as u8);
                    af.put_u8(((pcr_base & 0x01) as u8) << 7 | 0x7E);
                    af.put_u8(0x00); // PCR extension
                }
                if random_access {
                    af[0] |= 0x40; // random_access_indicator
                }
                adaptation = Some(af);
            }

            let pes_part: &[u8] = if first { &pes_header } else { &[] };
            let af_overhead = adaptation.as_ref().map_or(0, |a| 1 + a.len());
            let mut space = TS_PACKET_SIZE - 4 - af_overhead - pes_part.len();

            if rest.len() < space {
                let deficit = space - rest.len();
                match &mut adaptation {
                    Some(af) => {
                        for _ in 0..deficit {
                            af.put_u8(0xFF);
                        }
                    }
                    None if deficit == 1 => {
                        // a 1-byte adaptation field is just its length byte
                        adaptation = Some(BytesMut::new());
                    }
                    None => {
                        let mut af = BytesMut::new();
                        af.put_u8(0x00); // flags
                        for _ in 0..deficit - 2 {
                            af.put_u8(0xFF);
                        }
                        adaptation = Some(af);
                    }
                }
                space = rest.len();
            }

            let take = rest.len().min(space);

            let adaptation_control: u8 = if adaptation.is_some() { 0x30 } else { 0x10 };
            header.put_u8(adaptation_control | cc);
            if let Some(af) = adaptation {
                header.put_u8(af.len() as u8);
                header.extend_from_slice(&af);
            }

            self.out.extend_from_slice(&header);
            self.out.extend_from_slice(pes_part);
            self.out.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            first = false;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demuxer::TsDemuxer;

    #[test]
    fn packets_are_188_bytes() {
        let mut muxer = TsMuxer::new(Some(stream_type::H264), Some(stream_type::AAC));
        muxer.write_tables();
        muxer
            .write(VIDEO_PID, 90_000, 87_000, true, &[0xAB; 1000])
            .unwrap();
        let data = muxer.take_data();
        assert!(!data.is_empty());
        assert_eq!(data.len() % TS_PACKET_SIZE, 0);
        for chunk in data.chunks(TS_PACKET_SIZE) {
            assert_eq!(chunk[0], SYNC_BYTE);
        }
    }

    #[test]
    fn video_pid_carries_pcr() {
        let mut muxer = TsMuxer::new(Some(stream_type::H264), Some(stream_type::AAC));
        assert_eq!(muxer.pcr_pid(), VIDEO_PID);
    }

    #[test]
    fn audio_only_program_uses_audio_pcr() {
        let muxer = TsMuxer::new(None, Some(stream_type::AAC));
        assert_eq!(muxer.pcr_pid(), AUDIO_PID);
    }

    #[test]
    fn mux_demux_round_trip() {
        let mut muxer = TsMuxer::new(Some(stream_type::H264), Some(stream_type::AAC));
        muxer.write_tables();

        let video_payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        muxer
            .write(VIDEO_PID, 90_000, 87_000, true, &video_payload)
            .unwrap();
        let audio_payload = [0x55u8; 300];
        muxer
            .write(AUDIO_PID, 90_000, 90_000, false, &audio_payload)
            .unwrap();
        // a trailing frame forces the demuxer to flush the previous ones
        muxer
            .write(VIDEO_PID, 93_000, 90_000, false, &[0x11; 10])
            .unwrap();

        let data = muxer.take_data();
        let mut demuxer = TsDemuxer::new();
        let mut frames = demuxer.push(&data).unwrap();
        frames.extend(demuxer.flush());

        let video: Vec<_> = frames.iter().filter(|f| f.pid == VIDEO_PID).collect();
        let audio: Vec<_> = frames.iter().filter(|f| f.pid == AUDIO_PID).collect();

        assert_eq!(video.len(), 2);
        assert_eq!(&video[0].data[..], &video_payload[..]);
        assert_eq!(video[0].pts, 90_000);
        assert_eq!(video[0].dts, 87_000);
        assert_eq!(video[0].stream_type, stream_type::H264);

        assert_eq!(audio.len(), 1);
        assert_eq!(&audio[0].data[..], &audio_payload[..]);
        assert_eq!(audio[0].pts, 90_000);
    }
}
