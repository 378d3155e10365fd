use {
    super::{
        errors::{CursorError, CursorErrorValue, NetIOError},
        net::TNetIO,
    },
    bytes::{Bytes, BytesMut},
    rand::Rng,
    std::sync::Arc,
    tokio::sync::Mutex,
};

/// Growable marshalling buffer.
///
/// Counterpart of [`super::cursor::ByteCursor`]: protocol writers assemble a
/// message field by field, then hand the finished bytes to the network.
pub struct ByteSink {
    buf: Vec<u8>,
}

impl Default for ByteSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteSink {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16_be(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u24_be(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes()[1..]);
    }

    pub fn put_u32_be(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64_be(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_f64_be(&mut self, v: f64) {
        self.put_u64_be(v.to_bits());
    }

    pub fn put(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn put_random(&mut self, len: usize) {
        let mut rng = rand::thread_rng();
        for _ in 0..len {
            self.buf.push(rng.gen());
        }
    }

    /// Overwrite a byte written earlier, used for length back-patching.
    pub fn set_u8_at(&mut self, position: usize, v: u8) -> Result<(), CursorError> {
        if position >= self.buf.len() {
            return Err(CursorError {
                value: CursorErrorValue::IndexOutOfRange,
            });
        }
        self.buf[position] = v;
        Ok(())
    }

    pub fn or_u8_at(&mut self, position: usize, v: u8) -> Result<(), CursorError> {
        if position >= self.buf.len() {
            return Err(CursorError {
                value: CursorErrorValue::IndexOutOfRange,
            });
        }
        self.buf[position] |= v;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Return accumulated bytes and reset the sink.
    pub fn take(&mut self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.buf.len());
        out.extend_from_slice(&self.buf[..]);
        self.buf.clear();
        out
    }
}

/// A [`ByteSink`] bound to a shared network endpoint; `flush` pushes the
/// accumulated bytes onto the wire.
pub struct AsyncByteSink {
    pub sink: ByteSink,
    io: Arc<Mutex<Box<dyn TNetIO + Send + Sync>>>,
}

impl AsyncByteSink {
    pub fn new(io: Arc<Mutex<Box<dyn TNetIO + Send + Sync>>>) -> Self {
        Self {
            sink: ByteSink::new(),
            io,
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.sink.put_u8(v);
    }

    pub fn put_u16_be(&mut self, v: u16) {
        self.sink.put_u16_be(v);
    }

    pub fn put_u24_be(&mut self, v: u32) {
        self.sink.put_u24_be(v);
    }

    pub fn put_u32_be(&mut self, v: u32) {
        self.sink.put_u32_be(v);
    }

    pub fn put(&mut self, data: &[u8]) {
        self.sink.put(data);
    }

    pub async fn flush(&mut self) -> Result<(), NetIOError> {
        let data: Bytes = self.sink.take().freeze();
        self.io.lock().await.write(data).await
    }
}

#[cfg(test)]
mod tests {
    use super::ByteSink;

    #[test]
    fn marshalled_fields_are_big_endian() {
        let mut sink = ByteSink::new();
        sink.put_u8(0x01);
        sink.put_u16_be(0x0203);
        sink.put_u24_be(0x040506);
        sink.put_u32_be(0x0708090A);
        assert_eq!(
            sink.as_slice(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]
        );
    }

    #[test]
    fn take_resets_the_sink() {
        let mut sink = ByteSink::new();
        sink.put(b"abc");
        let first = sink.take();
        assert_eq!(&first[..], b"abc");
        assert!(sink.is_empty());
    }

    #[test]
    fn backpatching_length_fields() {
        let mut sink = ByteSink::new();
        sink.put_u8(0x00);
        sink.put(b"xyz");
        sink.set_u8_at(0, 3).unwrap();
        assert_eq!(sink.as_slice(), &[0x03, b'x', b'y', b'z']);
        assert!(sink.set_u8_at(9, 0).is_err());
    }
}
