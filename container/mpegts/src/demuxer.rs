use {
    crate::{
        define::*,
        errors::MpegTsError,
        pes::{parse_pes_header, PesHeader},
    },
    bytes::BytesMut,
    std::collections::HashMap,
};

/// One reassembled PES payload (a whole access unit for the codecs this
/// server pulls).
#[derive(Debug, Clone)]
pub struct DemuxedFrame {
    pub pid: u16,
    pub stream_type: u8,
    pub pts: u64,
    pub dts: u64,
    pub data: BytesMut,
}

struct PesAccumulator {
    header: PesHeader,
    data: BytesMut,
}

/// Transport-stream demuxer used by the HLS and UDP static sources:
/// discovers the program through PAT/PMT, then reassembles PES payloads
/// per elementary PID. A frame is emitted when the next
/// payload-unit-start arrives on its PID (or on `flush`).
pub struct TsDemuxer {
    buf: BytesMut,
    pmt_pids: Vec<u16>,
    streams: HashMap<u16, u8>,
    accumulators: HashMap<u16, PesAccumulator>,
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            pmt_pids: Vec::new(),
            streams: HashMap::new(),
            accumulators: HashMap::new(),
        }
    }

    pub fn stream_type(&self, pid: u16) -> Option<u8> {
        self.streams.get(&pid).copied()
    }

    /// Feed arbitrary byte chunks; complete frames come back as they are
    /// cut. Input is resynchronized on the 0x47 sync byte after garbage.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<DemuxedFrame>, MpegTsError> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            // resync
            while !self.buf.is_empty() && self.buf[0] != SYNC_BYTE {
                let _ = self.buf.split_to(1);
            }
            if self.buf.len() < TS_PACKET_SIZE {
                break;
            }
            let packet = self.buf.split_to(TS_PACKET_SIZE);
            self.on_packet(&packet, &mut frames)?;
        }

        Ok(frames)
    }

    /// Emit whatever is still buffered; used at end of a segment.
    pub fn flush(&mut self) -> Vec<DemuxedFrame> {
        let mut frames = Vec::new();
        let pids: Vec<u16> = self.accumulators.keys().copied().collect();
        for pid in pids {
            self.finish_pes(pid, &mut frames);
        }
        frames
    }

    fn on_packet(
        &mut self,
        packet: &[u8],
        frames: &mut Vec<DemuxedFrame>,
    ) -> Result<(), MpegTsError> {
        let transport_error = packet[1] & 0x80 != 0;
        if transport_error {
            return Ok(());
        }

        let unit_start = packet[1] & PAYLOAD_UNIT_START != 0;
        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let adaptation_control = (packet[3] >> 4) & 0x03;

        let mut pos = 4;
        if adaptation_control == 0x02 || adaptation_control == 0x03 {
            let af_len = packet[4] as usize;
            pos += 1 + af_len;
        }
        if adaptation_control == 0x02 || pos >= packet.len() {
            return Ok(());
        }

        let payload = &packet[pos..];

        if pid == PAT_PID {
            self.on_section(payload, unit_start, true);
            return Ok(());
        }
        if self.pmt_pids.contains(&pid) {
            self.on_section(payload, unit_start, false);
            return Ok(());
        }

        if let Some(&stream_type) = self.streams.get(&pid) {
            if unit_start {
                self.finish_pes(pid, frames);
                if let Some(header) = parse_pes_header(payload) {
                    let data = BytesMut::from(&payload[header.payload_offset.min(payload.len())..]);
                    self.accumulators
                        .insert(pid, PesAccumulator { header, data });
                } else {
                    log::warn!("dropping pes with malformed header on pid {}", pid);
                }
            } else if let Some(acc) = self.accumulators.get_mut(&pid) {
                acc.data.extend_from_slice(payload);
            }
            let _ = stream_type;
        }

        Ok(())
    }

    fn on_section(&mut self, payload: &[u8], unit_start: bool, is_pat: bool) {
        if !unit_start || payload.is_empty() {
            // multi-packet sections don't occur at the program sizes this
            // server consumes
            return;
        }
        let pointer = payload[0] as usize;
        if 1 + pointer >= payload.len() {
            return;
        }
        let section = &payload[1 + pointer..];

        if is_pat {
            for (_, pmt_pid) in crate::psi::parse_pat(section) {
                if !self.pmt_pids.contains(&pmt_pid) {
                    self.pmt_pids.push(pmt_pid);
                }
            }
        } else {
            for (stream_type, es_pid) in crate::psi::parse_pmt(section) {
                self.streams.insert(es_pid, stream_type);
            }
        }
    }

    fn finish_pes(&mut self, pid: u16, frames: &mut Vec<DemuxedFrame>) {
        if let Some(acc) = self.accumulators.remove(&pid) {
            if acc.data.is_empty() {
                return;
            }
            let stream_type = self.streams.get(&pid).copied().unwrap_or(0);
            frames.push(DemuxedFrame {
                pid,
                stream_type,
                pts: acc.header.pts,
                dts: acc.header.dts,
                data: acc.data,
            });
        }
    }
}
