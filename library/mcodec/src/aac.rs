use {
    crate::{
        bits::BitReader,
        errors::{CodecError, CodecErrorValue},
    },
    bytes::{BufMut, BytesMut},
};

pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// MPEG-4 AudioSpecificConfig: the two-byte (for the common AOTs) header
/// exchanged in FLV sequence headers and SDP `config=` attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channels: u8,
}

impl AudioSpecificConfig {
    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES
            .get(self.sample_rate_index as usize)
            .copied()
            .unwrap_or(44100)
    }

    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = BitReader::new(data);
        let object_type = r.read_bits(5)? as u8;
        if object_type == 31 {
            return Err(CodecError {
                value: CodecErrorValue::Unsupported("extended audio object type".to_string()),
            });
        }
        let sample_rate_index = r.read_bits(4)? as u8;
        if sample_rate_index == 0x0F {
            return Err(CodecError {
                value: CodecErrorValue::Unsupported("explicit sample rate".to_string()),
            });
        }
        let channels = r.read_bits(4)? as u8;

        Ok(Self {
            object_type,
            sample_rate_index,
            channels,
        })
    }

    pub fn marshal(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(2);
        out.put_u8(self.object_type << 3 | self.sample_rate_index >> 1);
        out.put_u8((self.sample_rate_index & 0x01) << 7 | self.channels << 3);
        out
    }

    /// The 7-byte ADTS header wrapping one raw AAC frame, as MPEG-TS
    /// payloads require.
    pub fn adts_header(&self, frame_len: usize) -> [u8; 7] {
        let full_len = (frame_len + 7) as u32;
        let profile = self.object_type.saturating_sub(1);

        let mut h = [0u8; 7];
        h[0] = 0xFF;
        h[1] = 0xF1; // MPEG-4, no CRC
        h[2] = profile << 6 | (self.sample_rate_index & 0x0F) << 2 | (self.channels >> 2) & 0x01;
        h[3] = (self.channels & 0x03) << 6 | ((full_len >> 11) & 0x03) as u8;
        h[4] = ((full_len >> 3) & 0xFF) as u8;
        h[5] = ((full_len & 0x07) as u8) << 5 | 0x1F;
        h[6] = 0xFC;
        h
    }
}

/// Parse one ADTS-framed unit, returning the config implied by its header
/// and the raw frame bytes.
pub fn parse_adts(data: &[u8]) -> Result<(AudioSpecificConfig, &[u8]), CodecError> {
    if data.len() < 7 {
        return Err(CodecError {
            value: CodecErrorValue::NotEnoughBytes,
        });
    }
    if data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
        return Err(CodecError::invalid("bad adts syncword"));
    }

    let protection_absent = data[1] & 0x01 == 1;
    let profile = (data[2] >> 6) & 0x03;
    let sample_rate_index = (data[2] >> 2) & 0x0F;
    let channels = (data[2] & 0x01) << 2 | (data[3] >> 6) & 0x03;
    let frame_len =
        ((data[3] as usize & 0x03) << 11) | (data[4] as usize) << 3 | (data[5] as usize) >> 5;

    let header_len = if protection_absent { 7 } else { 9 };
    if frame_len < header_len || frame_len > data.len() {
        return Err(CodecError::invalid("bad adts frame length"));
    }

    Ok((
        AudioSpecificConfig {
            object_type: profile + 1,
            sample_rate_index,
            channels,
        },
        &data[header_len..frame_len],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip() {
        // AAC-LC 44100 stereo; the classic 0x12 0x10
        let config = AudioSpecificConfig {
            object_type: 2,
            sample_rate_index: 4,
            channels: 2,
        };
        let data = config.marshal();
        assert_eq!(&data[..], &[0x12, 0x10]);
        assert_eq!(AudioSpecificConfig::parse(&data).unwrap(), config);
        assert_eq!(config.sample_rate(), 44100);
    }

    #[test]
    fn adts_round_trip() {
        let config = AudioSpecificConfig {
            object_type: 2,
            sample_rate_index: 3,
            channels: 2,
        };
        let frame = [0xAAu8; 32];
        let mut unit = config.adts_header(frame.len()).to_vec();
        unit.extend_from_slice(&frame);

        let (parsed, raw) = parse_adts(&unit).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(raw, &frame[..]);
    }

    #[test]
    fn bad_syncword_is_rejected() {
        assert!(parse_adts(&[0x00u8; 16]).is_err());
    }
}
