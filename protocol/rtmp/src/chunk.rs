use {
    crate::errors::RtmpError,
    bytes::{BufMut, BytesMut},
    std::collections::HashMap,
};

pub const INIT_CHUNK_SIZE: usize = 128;
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 4096;
const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;

pub mod csid {
    pub const PROTOCOL_CONTROL: u32 = 2;
    pub const COMMAND: u32 = 3;
    pub const AUDIO: u32 = 4;
    pub const VIDEO: u32 = 5;
    pub const DATA: u32 = 6;
}

/// One reassembled RTMP message.
#[derive(Debug, Clone)]
pub struct ChunkMessage {
    pub csid: u32,
    pub msg_type: u8,
    pub msg_stream_id: u32,
    pub timestamp: u32,
    pub payload: BytesMut,
}

#[derive(Debug, Clone, Default)]
struct CsidState {
    timestamp: u32,
    timestamp_delta: u32,
    msg_length: usize,
    msg_type: u8,
    msg_stream_id: u32,
    extended: bool,
}

/// Chunk-stream decoder: feeds of raw bytes come in, whole messages come
/// out once all their chunks arrived. The inbound chunk size follows the
/// peer's SetChunkSize.
pub struct ChunkUnpacketizer {
    buf: BytesMut,
    chunk_size: usize,
    states: HashMap<u32, CsidState>,
    partial: HashMap<u32, BytesMut>,
}

impl Default for ChunkUnpacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkUnpacketizer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            chunk_size: INIT_CHUNK_SIZE,
            states: HashMap::new(),
            partial: HashMap::new(),
        }
    }

    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.clamp(1, 0xFFFFFF);
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn read_messages(&mut self) -> Result<Vec<ChunkMessage>, RtmpError> {
        let mut messages = Vec::new();
        while let Some(message) = self.try_read_chunk()? {
            if let Some(message) = message {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// `None`: need more bytes. `Some(None)`: consumed a chunk that did not
    /// complete a message. `Some(Some(_))`: a message completed.
    fn try_read_chunk(&mut self) -> Result<Option<Option<ChunkMessage>>, RtmpError> {
        let data = &self.buf[..];
        if data.is_empty() {
            return Ok(None);
        }

        let mut pos = 0usize;
        let need = |pos: usize, n: usize| pos + n <= data.len();

        if !need(pos, 1) {
            return Ok(None);
        }
        let fmt = data[pos] >> 6;
        let mut csid = (data[pos] & 0x3F) as u32;
        pos += 1;

        if csid == 0 {
            if !need(pos, 1) {
                return Ok(None);
            }
            csid = 64 + data[pos] as u32;
            pos += 1;
        } else if csid == 1 {
            if !need(pos, 2) {
                return Ok(None);
            }
            csid = 64 + data[pos] as u32 + data[pos + 1] as u32 * 256;
            pos += 2;
        }

        let mut state = self.states.get(&csid).cloned().unwrap_or_else(|| {
            if fmt != 0 {
                log::debug!("chunk stream {} starts with fmt {}", csid, fmt);
            }
            CsidState::default()
        });

        match fmt {
            0 => {
                if !need(pos, 11) {
                    return Ok(None);
                }
                let ts = u32::from_be_bytes([0, data[pos], data[pos + 1], data[pos + 2]]);
                state.msg_length = ((data[pos + 3] as usize) << 16)
                    | ((data[pos + 4] as usize) << 8)
                    | data[pos + 5] as usize;
                state.msg_type = data[pos + 6];
                state.msg_stream_id = u32::from_le_bytes([
                    data[pos + 7],
                    data[pos + 8],
                    data[pos + 9],
                    data[pos + 10],
                ]);
                pos += 11;
                state.extended = ts == EXTENDED_TIMESTAMP;
                state.timestamp = if state.extended {
                    if !need(pos, 4) {
                        return Ok(None);
                    }
                    let ext = u32::from_be_bytes([
                        data[pos],
                        data[pos + 1],
                        data[pos + 2],
                        data[pos + 3],
                    ]);
                    pos += 4;
                    ext
                } else {
                    ts
                };
                state.timestamp_delta = 0;
            }
            1 => {
                if !need(pos, 7) {
                    return Ok(None);
                }
                let delta = u32::from_be_bytes([0, data[pos], data[pos + 1], data[pos + 2]]);
                state.msg_length = ((data[pos + 3] as usize) << 16)
                    | ((data[pos + 4] as usize) << 8)
                    | data[pos + 5] as usize;
                state.msg_type = data[pos + 6];
                pos += 7;
                state.extended = delta == EXTENDED_TIMESTAMP;
                let delta = if state.extended {
                    if !need(pos, 4) {
                        return Ok(None);
                    }
                    let ext = u32::from_be_bytes([
                        data[pos],
                        data[pos + 1],
                        data[pos + 2],
                        data[pos + 3],
                    ]);
                    pos += 4;
                    ext
                } else {
                    delta
                };
                state.timestamp_delta = delta;
                state.timestamp = state.timestamp.wrapping_add(delta);
            }
            2 => {
                if !need(pos, 3) {
                    return Ok(None);
                }
                let delta = u32::from_be_bytes([0, data[pos], data[pos + 1], data[pos + 2]]);
                pos += 3;
                state.extended = delta == EXTENDED_TIMESTAMP;
                let delta = if state.extended {
                    if !need(pos, 4) {
                        return Ok(None);
                    }
                    let ext = u32::from_be_bytes([
                        data[pos],
                        data[pos + 1],
                        data[pos + 2],
                        data[pos + 3],
                    ]);
                    pos += 4;
                    ext
                } else {
                    delta
                };
                state.timestamp_delta = delta;
                state.timestamp = state.timestamp.wrapping_add(delta);
            }
            _ => {
                // type 3: everything from the previous header; a fresh
                // chunk (not a continuation) also advances the timestamp
                if state.extended {
                    if !need(pos, 4) {
                        return Ok(None);
                    }
                    pos += 4;
                }
                if !self.partial.contains_key(&csid) {
                    state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
                }
            }
        }

        if state.msg_length > 0xFF_FFFF {
            return Err(RtmpError::chunk("message length overflow"));
        }

        let assembled = self.partial.get(&csid).map(|p| p.len()).unwrap_or(0);
        let remaining = state.msg_length.saturating_sub(assembled);
        let take = remaining.min(self.chunk_size);
        if !need(pos, take) {
            return Ok(None);
        }

        // the whole chunk is buffered: consume it
        let _ = self.buf.split_to(pos);
        let payload = self.buf.split_to(take);
        self.states.insert(csid, state.clone());

        let mut partial = self.partial.remove(&csid).unwrap_or_default();
        partial.extend_from_slice(&payload);

        if partial.len() >= state.msg_length {
            Ok(Some(Some(ChunkMessage {
                csid,
                msg_type: state.msg_type,
                msg_stream_id: state.msg_stream_id,
                timestamp: state.timestamp,
                payload: partial,
            })))
        } else {
            self.partial.insert(csid, partial);
            Ok(Some(None))
        }
    }
}

/// Chunk-stream encoder: one type-0 header, type-3 continuations every
/// `chunk_size` bytes.
pub struct ChunkPacketizer {
    pub chunk_size: usize,
}

impl Default for ChunkPacketizer {
    fn default() -> Self {
        Self {
            chunk_size: INIT_CHUNK_SIZE,
        }
    }
}

impl ChunkPacketizer {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn packetize(
        &self,
        csid: u32,
        msg_type: u8,
        msg_stream_id: u32,
        timestamp: u32,
        payload: &[u8],
    ) -> BytesMut {
        let mut out = BytesMut::with_capacity(payload.len() + 32);
        let extended = timestamp >= EXTENDED_TIMESTAMP;
        let header_ts = if extended { EXTENDED_TIMESTAMP } else { timestamp };

        let put_basic = |out: &mut BytesMut, fmt: u8| {
            if csid < 64 {
                out.put_u8(fmt << 6 | csid as u8);
            } else if csid < 320 {
                out.put_u8(fmt << 6);
                out.put_u8((csid - 64) as u8);
            } else {
                out.put_u8(fmt << 6 | 0x01);
                out.put_u16_le((csid - 64) as u16);
            }
        };

        put_basic(&mut out, 0);
        out.put_u8((header_ts >> 16) as u8);
        out.put_u8((header_ts >> 8) as u8);
        out.put_u8(header_ts as u8);
        out.put_u8((payload.len() >> 16) as u8);
        out.put_u8((payload.len() >> 8) as u8);
        out.put_u8(payload.len() as u8);
        out.put_u8(msg_type);
        out.put_u32_le(msg_stream_id);
        if extended {
            out.put_u32(timestamp);
        }

        let mut rest = payload;
        let mut first = true;
        while !rest.is_empty() || first {
            if !first {
                put_basic(&mut out, 3);
                if extended {
                    out.put_u32(timestamp);
                }
            }
            let take = rest.len().min(self.chunk_size);
            out.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            first = false;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_round_trip() {
        let packetizer = ChunkPacketizer::new(128);
        let payload = vec![0xAB; 100];
        let data = packetizer.packetize(csid::COMMAND, 20, 0, 1000, &payload);

        let mut unpacketizer = ChunkUnpacketizer::new();
        unpacketizer.feed(&data);
        let messages = unpacketizer.read_messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].msg_type, 20);
        assert_eq!(messages[0].timestamp, 1000);
        assert_eq!(&messages[0].payload[..], &payload[..]);
    }

    #[test]
    fn multi_chunk_message_is_reassembled() {
        let packetizer = ChunkPacketizer::new(128);
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let data = packetizer.packetize(csid::VIDEO, 9, 1, 40, &payload);

        let mut unpacketizer = ChunkUnpacketizer::new();
        // drip-feed in odd sized pieces
        let mut messages = Vec::new();
        for piece in data.chunks(37) {
            unpacketizer.feed(piece);
            messages.extend(unpacketizer.read_messages().unwrap());
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0].payload[..], &payload[..]);
        assert_eq!(messages[0].msg_stream_id, 1);
    }

    #[test]
    fn negotiated_chunk_size_is_honored() {
        let packetizer = ChunkPacketizer::new(65536);
        let payload = vec![0x11; 5000];
        let data = packetizer.packetize(csid::VIDEO, 9, 1, 0, &payload);

        let mut unpacketizer = ChunkUnpacketizer::new();
        unpacketizer.set_chunk_size(65536);
        unpacketizer.feed(&data);
        let messages = unpacketizer.read_messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.len(), 5000);
    }

    #[test]
    fn type3_continuation_advances_timestamp() {
        // two audio messages, second sent as fmt-3 chunk reusing the delta
        let mut data = BytesMut::new();
        // fmt0 csid4 ts=0 len=2 type=8 sid=1
        data.extend_from_slice(&[0x04, 0, 0, 0, 0, 0, 2, 8, 1, 0, 0, 0, 0xAA, 0xBB]);
        // fmt2 delta=20 payload 2 bytes
        data.extend_from_slice(&[0x84, 0, 0, 20, 0xCC, 0xDD]);
        // fmt3, another message on same csid: delta re-applied
        data.extend_from_slice(&[0xC4, 0xEE, 0xFF]);

        let mut unpacketizer = ChunkUnpacketizer::new();
        unpacketizer.feed(&data);
        let messages = unpacketizer.read_messages().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].timestamp, 0);
        assert_eq!(messages[1].timestamp, 20);
        assert_eq!(messages[2].timestamp, 40);
    }

    #[test]
    fn extended_timestamp_round_trip() {
        let packetizer = ChunkPacketizer::new(4096);
        let big_ts = 0x0100_0000u32;
        let data = packetizer.packetize(csid::VIDEO, 9, 1, big_ts, &[0x01, 0x02]);

        let mut unpacketizer = ChunkUnpacketizer::new();
        unpacketizer.feed(&data);
        let messages = unpacketizer.read_messages().unwrap();
        assert_eq!(messages[0].timestamp, big_ts);
    }
}
