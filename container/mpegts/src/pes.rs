use {
    crate::define::{stream_id, PTS_NO_VALUE},
    bytes::{BufMut, BytesMut},
};

fn put_timestamp(out: &mut BytesMut, prefix: u8, value: u64) {
    out.put_u8(prefix << 4 | ((value >> 29) & 0x0E) as u8 | 0x01);
    out.put_u16((((value >> 14) & 0x7FFE) | 0x0001) as u16);
    out.put_u16((((value << 1) & 0x7FFE) | 0x0001) as u16);
}

/// Marshal a PES header. Video streams use an unbounded packet length
/// (zero), audio carries the real length when it fits 16 bits.
pub fn write_pes_header(
    sid: u8,
    pts: u64,
    dts: u64,
    data_alignment: bool,
    payload_len: usize,
) -> BytesMut {
    let has_dts = dts != PTS_NO_VALUE && dts != pts;
    let header_data_len: u8 = if has_dts { 10 } else { 5 };

    let mut out = BytesMut::new();
    out.put_u8(0x00);
    out.put_u8(0x00);
    out.put_u8(0x01);
    out.put_u8(sid);

    let tail_len = 3 + header_data_len as usize + payload_len;
    if sid == stream_id::VIDEO || tail_len > 0xFFFF {
        out.put_u16(0);
    } else {
        out.put_u16(tail_len as u16);
    }

    out.put_u8(0x80 | if data_alignment { 0x04 } else { 0x00 });
    out.put_u8(if has_dts { 0xC0 } else { 0x80 });
    out.put_u8(header_data_len);

    if has_dts {
        put_timestamp(&mut out, 0x03, pts);
        put_timestamp(&mut out, 0x01, dts);
    } else {
        put_timestamp(&mut out, 0x02, pts);
    }

    out
}

/// Parsed PES header fields, plus the offset where the payload starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesHeader {
    pub sid: u8,
    pub pts: u64,
    pub dts: u64,
    pub payload_offset: usize,
}

fn read_timestamp(data: &[u8]) -> u64 {
    ((data[0] as u64 & 0x0E) << 29)
        | ((data[1] as u64) << 22)
        | ((data[2] as u64 & 0xFE) << 14)
        | ((data[3] as u64) << 7)
        | ((data[4] as u64) >> 1)
}

pub fn parse_pes_header(data: &[u8]) -> Option<PesHeader> {
    if data.len() < 9 || data[0] != 0 || data[1] != 0 || data[2] != 1 {
        return None;
    }
    let sid = data[3];
    let flags = data[7];
    let header_data_len = data[8] as usize;
    if data.len() < 9 + header_data_len {
        return None;
    }

    let mut pts = PTS_NO_VALUE;
    let mut dts = PTS_NO_VALUE;
    if flags & 0x80 != 0 && header_data_len >= 5 {
        pts = read_timestamp(&data[9..]);
        dts = pts;
    }
    if flags & 0xC0 == 0xC0 && header_data_len >= 10 {
        dts = read_timestamp(&data[14..]);
    }

    Some(PesHeader {
        sid,
        pts,
        dts,
        payload_offset: 9 + header_data_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::define::stream_id;

    #[test]
    fn pts_only_round_trip() {
        let header = write_pes_header(stream_id::AUDIO, 90_000, 90_000, false, 100);
        let parsed = parse_pes_header(&header).unwrap();
        assert_eq!(parsed.sid, stream_id::AUDIO);
        assert_eq!(parsed.pts, 90_000);
        assert_eq!(parsed.dts, 90_000);
        assert_eq!(parsed.payload_offset, header.len());
    }

    #[test]
    fn pts_dts_round_trip() {
        let header = write_pes_header(stream_id::VIDEO, 135_000, 90_000, true, 0);
        let parsed = parse_pes_header(&header).unwrap();
        assert_eq!(parsed.pts, 135_000);
        assert_eq!(parsed.dts, 90_000);
    }

    #[test]
    fn large_timestamps_survive_33_bits() {
        let ts = (1u64 << 33) - 1;
        let header = write_pes_header(stream_id::VIDEO, ts, ts - 3000, false, 0);
        let parsed = parse_pes_header(&header).unwrap();
        assert_eq!(parsed.pts, ts);
        assert_eq!(parsed.dts, ts - 3000);
    }
}
