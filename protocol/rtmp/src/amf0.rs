use {
    crate::errors::RtmpError,
    bytes::{BufMut, BytesMut},
    indexmap::IndexMap,
    netio::cursor::ByteCursor,
};

pub mod markers {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const OBJECT: u8 = 0x03;
    pub const NULL: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const ECMA_ARRAY: u8 = 0x08;
    pub const OBJECT_END: u8 = 0x09;
    pub const STRICT_ARRAY: u8 = 0x0A;
    pub const LONG_STRING: u8 = 0x0C;
}

/// AMF0 value; objects keep insertion order so re-marshalled metadata
/// round-trips byte-identically.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    Utf8String(String),
    Object(IndexMap<String, Amf0Value>),
    EcmaArray(IndexMap<String, Amf0Value>),
    Null,
}

impl Amf0Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::Utf8String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Amf0Value>> {
        match self {
            Amf0Value::Object(m) | Amf0Value::EcmaArray(m) => Some(m),
            _ => None,
        }
    }
}

pub struct Amf0Reader<'a> {
    cursor: &'a mut ByteCursor,
}

impl<'a> Amf0Reader<'a> {
    pub fn new(cursor: &'a mut ByteCursor) -> Self {
        Self { cursor }
    }

    pub fn read_all(&mut self) -> Result<Vec<Amf0Value>, RtmpError> {
        let mut values = Vec::new();
        while !self.cursor.is_empty() {
            values.push(self.read_any()?);
        }
        Ok(values)
    }

    pub fn read_any(&mut self) -> Result<Amf0Value, RtmpError> {
        let marker = self
            .cursor
            .read_u8()
            .map_err(|_| RtmpError::amf0("truncated value"))?;

        match marker {
            markers::NUMBER => {
                let v = self
                    .cursor
                    .read_f64_be()
                    .map_err(|_| RtmpError::amf0("truncated number"))?;
                Ok(Amf0Value::Number(v))
            }
            markers::BOOLEAN => {
                let v = self
                    .cursor
                    .read_u8()
                    .map_err(|_| RtmpError::amf0("truncated boolean"))?;
                Ok(Amf0Value::Boolean(v != 0))
            }
            markers::STRING => Ok(Amf0Value::Utf8String(self.read_short_string()?)),
            markers::LONG_STRING => {
                let len = self
                    .cursor
                    .read_u32_be()
                    .map_err(|_| RtmpError::amf0("truncated long string"))?
                    as usize;
                let data = self
                    .cursor
                    .read_bytes(len)
                    .map_err(|_| RtmpError::amf0("truncated long string"))?;
                String::from_utf8(data.to_vec())
                    .map(Amf0Value::Utf8String)
                    .map_err(|_| RtmpError::amf0("invalid utf8 string"))
            }
            markers::OBJECT => Ok(Amf0Value::Object(self.read_properties()?)),
            markers::ECMA_ARRAY => {
                // the declared count is advisory; entries end with the
                // usual object-end marker
                let _count = self
                    .cursor
                    .read_u32_be()
                    .map_err(|_| RtmpError::amf0("truncated ecma array"))?;
                Ok(Amf0Value::EcmaArray(self.read_properties()?))
            }
            markers::NULL | markers::UNDEFINED => Ok(Amf0Value::Null),
            other => Err(RtmpError::amf0(&format!("unknown marker 0x{other:02x}"))),
        }
    }

    fn read_short_string(&mut self) -> Result<String, RtmpError> {
        let len = self
            .cursor
            .read_u16_be()
            .map_err(|_| RtmpError::amf0("truncated string"))? as usize;
        let data = self
            .cursor
            .read_bytes(len)
            .map_err(|_| RtmpError::amf0("truncated string"))?;
        String::from_utf8(data.to_vec()).map_err(|_| RtmpError::amf0("invalid utf8 string"))
    }

    fn read_properties(&mut self) -> Result<IndexMap<String, Amf0Value>, RtmpError> {
        let mut properties = IndexMap::new();
        loop {
            // object end: empty key followed by the end marker
            if self.cursor.len() >= 3 && self.cursor.peek_bytes(3).unwrap() == [0, 0, 9] {
                self.cursor.skip(3).unwrap();
                break;
            }
            let key = self.read_short_string()?;
            let value = self.read_any()?;
            properties.insert(key, value);
        }
        Ok(properties)
    }
}

pub fn write_value(out: &mut BytesMut, value: &Amf0Value) {
    match value {
        Amf0Value::Number(v) => {
            out.put_u8(markers::NUMBER);
            out.put_f64(*v);
        }
        Amf0Value::Boolean(v) => {
            out.put_u8(markers::BOOLEAN);
            out.put_u8(*v as u8);
        }
        Amf0Value::Utf8String(v) => {
            out.put_u8(markers::STRING);
            out.put_u16(v.len() as u16);
            out.extend_from_slice(v.as_bytes());
        }
        Amf0Value::Object(map) => {
            out.put_u8(markers::OBJECT);
            write_properties(out, map);
        }
        Amf0Value::EcmaArray(map) => {
            out.put_u8(markers::ECMA_ARRAY);
            out.put_u32(map.len() as u32);
            write_properties(out, map);
        }
        Amf0Value::Null => {
            out.put_u8(markers::NULL);
        }
    }
}

fn write_properties(out: &mut BytesMut, map: &IndexMap<String, Amf0Value>) {
    for (key, value) in map {
        out.put_u16(key.len() as u16);
        out.extend_from_slice(key.as_bytes());
        write_value(out, value);
    }
    out.put_u8(0);
    out.put_u8(0);
    out.put_u8(markers::OBJECT_END);
}

pub fn write_all(values: &[Amf0Value]) -> BytesMut {
    let mut out = BytesMut::new();
    for value in values {
        write_value(&mut out, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let values = vec![
            Amf0Value::Utf8String("connect".to_string()),
            Amf0Value::Number(1.0),
            Amf0Value::Boolean(true),
            Amf0Value::Null,
        ];
        let data = write_all(&values);
        let mut cursor = ByteCursor::new(data);
        let parsed = Amf0Reader::new(&mut cursor).read_all().unwrap();
        assert_eq!(parsed, values);
    }

    #[test]
    fn object_round_trip_preserves_order() {
        let mut map = IndexMap::new();
        map.insert("app".to_string(), Amf0Value::Utf8String("live".to_string()));
        map.insert(
            "tcUrl".to_string(),
            Amf0Value::Utf8String("rtmp://host:1935/live".to_string()),
        );
        map.insert("fpad".to_string(), Amf0Value::Boolean(false));

        let values = vec![Amf0Value::Object(map)];
        let data = write_all(&values);
        let mut cursor = ByteCursor::new(data);
        let parsed = Amf0Reader::new(&mut cursor).read_all().unwrap();
        assert_eq!(parsed, values);

        let keys: Vec<&String> = parsed[0].as_map().unwrap().keys().collect();
        assert_eq!(keys, ["app", "tcUrl", "fpad"]);
    }

    #[test]
    fn ecma_array_round_trip() {
        let mut map = IndexMap::new();
        map.insert("videocodecid".to_string(), Amf0Value::Number(7.0));
        map.insert("audiocodecid".to_string(), Amf0Value::Number(10.0));

        let values = vec![
            Amf0Value::Utf8String("onMetaData".to_string()),
            Amf0Value::EcmaArray(map),
        ];
        let data = write_all(&values);
        let mut cursor = ByteCursor::new(data);
        let parsed = Amf0Reader::new(&mut cursor).read_all().unwrap();
        assert_eq!(parsed, values);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let data = write_all(&[Amf0Value::Utf8String("abcdef".to_string())]);
        let mut cursor = ByteCursor::new(BytesMut::from(&data[..4]));
        assert!(Amf0Reader::new(&mut cursor).read_all().is_err());
    }
}
