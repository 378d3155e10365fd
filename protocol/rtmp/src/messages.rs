use {
    crate::{
        amf0::{Amf0Reader, Amf0Value},
        chunk::ChunkMessage,
        errors::RtmpError,
    },
    bytes::{BufMut, BytesMut},
    netio::cursor::ByteCursor,
};

pub mod msg_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACKNOWLEDGEMENT: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF3: u8 = 15;
    pub const COMMAND_AMF3: u8 = 17;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
}

pub mod user_control_event {
    pub const STREAM_BEGIN: u16 = 0;
    pub const STREAM_EOF: u16 = 1;
    pub const PING_REQUEST: u16 = 6;
    pub const PING_RESPONSE: u16 = 7;
}

/// A decoded RTMP message, one level above the chunk stream.
#[derive(Debug)]
pub enum RtmpMessage {
    SetChunkSize(u32),
    Acknowledgement(u32),
    WindowAckSize(u32),
    SetPeerBandwidth(u32, u8),
    UserControl {
        event: u16,
        data: u32,
    },
    Command {
        name: String,
        transaction_id: f64,
        values: Vec<Amf0Value>,
    },
    Data {
        values: Vec<Amf0Value>,
    },
    Audio {
        timestamp: u32,
        payload: BytesMut,
    },
    Video {
        timestamp: u32,
        payload: BytesMut,
    },
    Unhandled(u8),
}

pub fn parse(message: ChunkMessage) -> Result<RtmpMessage, RtmpError> {
    let payload = message.payload;
    match message.msg_type {
        msg_type::SET_CHUNK_SIZE => Ok(RtmpMessage::SetChunkSize(read_u32(&payload)?)),
        msg_type::ACKNOWLEDGEMENT => Ok(RtmpMessage::Acknowledgement(read_u32(&payload)?)),
        msg_type::WINDOW_ACK_SIZE => Ok(RtmpMessage::WindowAckSize(read_u32(&payload)?)),
        msg_type::SET_PEER_BANDWIDTH => {
            if payload.len() < 5 {
                return Err(RtmpError::chunk("truncated set peer bandwidth"));
            }
            Ok(RtmpMessage::SetPeerBandwidth(
                u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                payload[4],
            ))
        }
        msg_type::USER_CONTROL => {
            if payload.len() < 2 {
                return Err(RtmpError::chunk("truncated user control"));
            }
            let event = u16::from_be_bytes([payload[0], payload[1]]);
            let data = if payload.len() >= 6 {
                u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]])
            } else {
                0
            };
            Ok(RtmpMessage::UserControl { event, data })
        }
        msg_type::COMMAND_AMF0 => {
            let mut cursor = ByteCursor::new(payload);
            let values = Amf0Reader::new(&mut cursor).read_all()?;
            let mut iter = values.into_iter();
            let name = match iter.next() {
                Some(Amf0Value::Utf8String(name)) => name,
                _ => return Err(RtmpError::amf0("command without a name")),
            };
            let transaction_id = match iter.next() {
                Some(Amf0Value::Number(id)) => id,
                _ => 0.0,
            };
            Ok(RtmpMessage::Command {
                name,
                transaction_id,
                values: iter.collect(),
            })
        }
        msg_type::DATA_AMF0 => {
            let mut cursor = ByteCursor::new(payload);
            let values = Amf0Reader::new(&mut cursor).read_all()?;
            Ok(RtmpMessage::Data { values })
        }
        msg_type::AUDIO => Ok(RtmpMessage::Audio {
            timestamp: message.timestamp,
            payload,
        }),
        msg_type::VIDEO => Ok(RtmpMessage::Video {
            timestamp: message.timestamp,
            payload,
        }),
        other => Ok(RtmpMessage::Unhandled(other)),
    }
}

fn read_u32(payload: &[u8]) -> Result<u32, RtmpError> {
    if payload.len() < 4 {
        return Err(RtmpError::chunk("truncated control message"));
    }
    Ok(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

// ---- marshalling helpers for the write side ----

pub fn set_chunk_size(size: u32) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u32(size);
    out
}

pub fn window_ack_size(size: u32) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u32(size);
    out
}

pub fn set_peer_bandwidth(size: u32, limit_type: u8) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u32(size);
    out.put_u8(limit_type);
    out
}

pub fn acknowledgement(sequence: u32) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u32(sequence);
    out
}

pub fn user_control(event: u16, data: u32) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u16(event);
    out.put_u32(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf0;

    fn chunk(msg_type: u8, payload: BytesMut) -> ChunkMessage {
        ChunkMessage {
            csid: 3,
            msg_type,
            msg_stream_id: 0,
            timestamp: 0,
            payload,
        }
    }

    #[test]
    fn connect_command_parses() {
        let mut object = indexmap::IndexMap::new();
        object.insert(
            "app".to_string(),
            Amf0Value::Utf8String("live".to_string()),
        );
        let payload = amf0::write_all(&[
            Amf0Value::Utf8String("connect".to_string()),
            Amf0Value::Number(1.0),
            Amf0Value::Object(object),
        ]);

        match parse(chunk(msg_type::COMMAND_AMF0, payload)).unwrap() {
            RtmpMessage::Command {
                name,
                transaction_id,
                values,
            } => {
                assert_eq!(name, "connect");
                assert_eq!(transaction_id, 1.0);
                assert_eq!(
                    values[0].as_map().unwrap().get("app").unwrap().as_str(),
                    Some("live")
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn control_messages_parse() {
        match parse(chunk(msg_type::SET_CHUNK_SIZE, set_chunk_size(65536))).unwrap() {
            RtmpMessage::SetChunkSize(65536) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match parse(chunk(msg_type::WINDOW_ACK_SIZE, window_ack_size(2500000))).unwrap() {
            RtmpMessage::WindowAckSize(2500000) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match parse(chunk(
            msg_type::USER_CONTROL,
            user_control(user_control_event::PING_REQUEST, 42),
        ))
        .unwrap()
        {
            RtmpMessage::UserControl { event, data } => {
                assert_eq!(event, user_control_event::PING_REQUEST);
                assert_eq!(data, 42);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
