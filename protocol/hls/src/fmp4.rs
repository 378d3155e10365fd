use {
    bytes::{BufMut, BytesMut},
    mcodec::{aac::AudioSpecificConfig, h264::AvcDecoderConfig},
};

/// Minimal fragmented-MP4 writer for the low-latency variant: an init
/// section with `moov`, then `moof`+`mdat` fragments. H.264 + AAC only.

fn boxed(kind: &[u8; 4], body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(8 + body.len());
    out.put_u32((8 + body.len()) as u32);
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

fn full_box(kind: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> BytesMut {
    let mut inner = BytesMut::with_capacity(4 + body.len());
    inner.put_u8(version);
    inner.put_u8((flags >> 16) as u8);
    inner.put_u8((flags >> 8) as u8);
    inner.put_u8(flags as u8);
    inner.extend_from_slice(body);
    boxed(kind, &inner)
}

pub struct VideoInit {
    pub config: AvcDecoderConfig,
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
}

pub struct AudioInit {
    pub config: AudioSpecificConfig,
    pub timescale: u32,
}

/// `ftyp` + `moov` describing the declared tracks. Track 1 is video when
/// present, audio follows.
pub fn write_init(video: Option<&VideoInit>, audio: Option<&AudioInit>) -> BytesMut {
    let mut out = BytesMut::new();

    let mut ftyp_body = BytesMut::new();
    ftyp_body.extend_from_slice(b"iso4");
    ftyp_body.put_u32(512);
    ftyp_body.extend_from_slice(b"iso4");
    ftyp_body.extend_from_slice(b"iso6");
    ftyp_body.extend_from_slice(b"mp41");
    out.extend_from_slice(&boxed(b"ftyp", &ftyp_body));

    let mut moov = BytesMut::new();

    // mvhd, overall timescale 1000
    let mut mvhd = BytesMut::new();
    mvhd.put_u32(0); // creation
    mvhd.put_u32(0); // modification
    mvhd.put_u32(1000);
    mvhd.put_u32(0); // duration unknown
    mvhd.put_u32(0x0001_0000); // rate 1.0
    mvhd.put_u16(0x0100); // volume
    mvhd.put_u16(0);
    mvhd.put_u64(0);
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        mvhd.put_u32(v);
    }
    for _ in 0..6 {
        mvhd.put_u32(0);
    }
    let next_track = 1 + video.is_some() as u32 + audio.is_some() as u32;
    mvhd.put_u32(next_track);
    moov.extend_from_slice(&full_box(b"mvhd", 0, 0, &mvhd));

    let mut track_id = 1u32;
    let mut trex_boxes = BytesMut::new();

    if let Some(video) = video {
        moov.extend_from_slice(&video_trak(video, track_id));
        trex_boxes.extend_from_slice(&trex(track_id));
        track_id += 1;
    }
    if let Some(audio) = audio {
        moov.extend_from_slice(&audio_trak(audio, track_id));
        trex_boxes.extend_from_slice(&trex(track_id));
    }

    moov.extend_from_slice(&boxed(b"mvex", &trex_boxes));
    out.extend_from_slice(&boxed(b"moov", &moov));
    out
}

fn trex(track_id: u32) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(track_id);
    body.put_u32(1); // default sample description index
    body.put_u32(0);
    body.put_u32(0);
    body.put_u32(0);
    full_box(b"trex", 0, 0, &body)
}

fn tkhd(track_id: u32, width: u32, height: u32) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(0);
    body.put_u32(track_id);
    body.put_u32(0); // reserved
    body.put_u32(0); // duration
    body.put_u64(0);
    body.put_u16(0); // layer
    body.put_u16(0); // alternate group
    body.put_u16(if width == 0 { 0x0100 } else { 0 }); // volume: audio only
    body.put_u16(0);
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        body.put_u32(v);
    }
    body.put_u32(width << 16);
    body.put_u32(height << 16);
    full_box(b"tkhd", 0, 3, &body)
}

fn mdhd(timescale: u32) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.put_u32(0);
    body.put_u32(timescale);
    body.put_u32(0);
    body.put_u16(0x55C4); // language "und"
    body.put_u16(0);
    full_box(b"mdhd", 0, 0, &body)
}

fn hdlr(handler: &[u8; 4], name: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(0);
    body.extend_from_slice(handler);
    body.put_u32(0);
    body.put_u32(0);
    body.put_u32(0);
    body.extend_from_slice(name.as_bytes());
    body.put_u8(0);
    full_box(b"hdlr", 0, 0, &body)
}

fn dinf() -> BytesMut {
    let url = full_box(b"url ", 0, 1, &[]);
    let mut dref_body = BytesMut::new();
    dref_body.put_u32(1);
    dref_body.extend_from_slice(&url);
    let dref = full_box(b"dref", 0, 0, &dref_body);
    boxed(b"dinf", &dref)
}

fn empty_stbl_tail() -> BytesMut {
    let mut out = BytesMut::new();
    let mut zero_entries = BytesMut::new();
    zero_entries.put_u32(0);
    out.extend_from_slice(&full_box(b"stts", 0, 0, &zero_entries));
    out.extend_from_slice(&full_box(b"stsc", 0, 0, &zero_entries));
    let mut stsz = BytesMut::new();
    stsz.put_u32(0);
    stsz.put_u32(0);
    out.extend_from_slice(&full_box(b"stsz", 0, 0, &stsz));
    out.extend_from_slice(&full_box(b"stco", 0, 0, &zero_entries));
    out
}

fn video_trak(video: &VideoInit, track_id: u32) -> BytesMut {
    let mut avc1 = BytesMut::new();
    avc1.put_u32(0); // reserved
    avc1.put_u16(0);
    avc1.put_u16(1); // data reference index
    for _ in 0..4 {
        avc1.put_u32(0);
    }
    avc1.put_u16(video.width as u16);
    avc1.put_u16(video.height as u16);
    avc1.put_u32(0x0048_0000); // 72 dpi
    avc1.put_u32(0x0048_0000);
    avc1.put_u32(0);
    avc1.put_u16(1); // frame count
    for _ in 0..32 {
        avc1.put_u8(0); // compressor name
    }
    avc1.put_u16(0x0018); // depth
    avc1.put_u16(0xFFFF); // pre-defined
    let avcc_data = video.config.marshal().unwrap_or_default();
    avc1.extend_from_slice(&boxed(b"avcC", &avcc_data));
    let avc1 = boxed(b"avc1", &avc1);

    let mut stsd = BytesMut::new();
    stsd.put_u32(1);
    stsd.extend_from_slice(&avc1);
    let stsd = full_box(b"stsd", 0, 0, &stsd);

    let mut stbl = BytesMut::new();
    stbl.extend_from_slice(&stsd);
    stbl.extend_from_slice(&empty_stbl_tail());
    let stbl = boxed(b"stbl", &stbl);

    let mut vmhd_body = BytesMut::new();
    vmhd_body.put_u64(0);
    let vmhd = full_box(b"vmhd", 0, 1, &vmhd_body);

    let mut minf = BytesMut::new();
    minf.extend_from_slice(&vmhd);
    minf.extend_from_slice(&dinf());
    minf.extend_from_slice(&stbl);
    let minf = boxed(b"minf", &minf);

    let mut mdia = BytesMut::new();
    mdia.extend_from_slice(&mdhd(video.timescale));
    mdia.extend_from_slice(&hdlr(b"vide", "VideoHandler"));
    mdia.extend_from_slice(&minf);
    let mdia = boxed(b"mdia", &mdia);

    let mut trak = BytesMut::new();
    trak.extend_from_slice(&tkhd(track_id, video.width, video.height));
    trak.extend_from_slice(&mdia);
    boxed(b"trak", &trak)
}

fn esds(config: &AudioSpecificConfig) -> BytesMut {
    let asc = config.marshal();

    let mut dsi = BytesMut::new(); // DecoderSpecificInfo, tag 5
    dsi.put_u8(0x05);
    dsi.put_u8(asc.len() as u8);
    dsi.extend_from_slice(&asc);

    let mut dcd = BytesMut::new(); // DecoderConfigDescriptor, tag 4
    dcd.put_u8(0x04);
    dcd.put_u8((13 + dsi.len()) as u8);
    dcd.put_u8(0x40); // object type: audio ISO/IEC 14496-3
    dcd.put_u8(0x15); // stream type: audio
    dcd.put_u8(0);
    dcd.put_u16(0); // buffer size
    dcd.put_u32(128_000); // max bitrate
    dcd.put_u32(128_000); // avg bitrate
    dcd.extend_from_slice(&dsi);

    let mut es = BytesMut::new(); // ES_Descriptor, tag 3
    es.put_u8(0x03);
    es.put_u8((3 + dcd.len() + 3) as u8);
    es.put_u16(0); // ES id
    es.put_u8(0);
    es.extend_from_slice(&dcd);
    es.put_u8(0x06); // SLConfigDescriptor
    es.put_u8(0x01);
    es.put_u8(0x02);

    full_box(b"esds", 0, 0, &es)
}

fn audio_trak(audio: &AudioInit, track_id: u32) -> BytesMut {
    let mut mp4a = BytesMut::new();
    mp4a.put_u32(0);
    mp4a.put_u16(0);
    mp4a.put_u16(1); // data reference index
    mp4a.put_u64(0);
    mp4a.put_u16(audio.config.channels as u16);
    mp4a.put_u16(16); // sample size
    mp4a.put_u32(0);
    mp4a.put_u32((audio.config.sample_rate()) << 16);
    mp4a.extend_from_slice(&esds(&audio.config));
    let mp4a = boxed(b"mp4a", &mp4a);

    let mut stsd = BytesMut::new();
    stsd.put_u32(1);
    stsd.extend_from_slice(&mp4a);
    let stsd = full_box(b"stsd", 0, 0, &stsd);

    let mut stbl = BytesMut::new();
    stbl.extend_from_slice(&stsd);
    stbl.extend_from_slice(&empty_stbl_tail());
    let stbl = boxed(b"stbl", &stbl);

    let smhd = full_box(b"smhd", 0, 0, &[0, 0, 0, 0]);

    let mut minf = BytesMut::new();
    minf.extend_from_slice(&smhd);
    minf.extend_from_slice(&dinf());
    minf.extend_from_slice(&stbl);
    let minf = boxed(b"minf", &minf);

    let mut mdia = BytesMut::new();
    mdia.extend_from_slice(&mdhd(audio.timescale));
    mdia.extend_from_slice(&hdlr(b"soun", "SoundHandler"));
    mdia.extend_from_slice(&minf);
    let mdia = boxed(b"mdia", &mdia);

    let mut trak = BytesMut::new();
    trak.extend_from_slice(&tkhd(track_id, 0, 0));
    trak.extend_from_slice(&mdia);
    boxed(b"trak", &trak)
}

/// One sample of a fragment run.
#[derive(Debug, Clone)]
pub struct FragmentSample {
    pub duration: u32,
    pub composition_offset: i32,
    pub is_key: bool,
    pub data: BytesMut,
}

pub struct TrackFragment {
    pub track_id: u32,
    pub base_decode_time: u64,
    pub samples: Vec<FragmentSample>,
}

/// `moof` + `mdat` for one part. Data offsets are patched after the moof
/// size is known.
pub fn write_fragment(sequence_number: u32, tracks: &[TrackFragment]) -> BytesMut {
    // pass 1: build moof with zero data offsets to learn its size
    let build = |data_offsets: &[u32]| -> BytesMut {
        let mut moof = BytesMut::new();

        let mut mfhd = BytesMut::new();
        mfhd.put_u32(sequence_number);
        moof.extend_from_slice(&full_box(b"mfhd", 0, 0, &mfhd));

        for (idx, track) in tracks.iter().enumerate() {
            let mut traf = BytesMut::new();

            // tfhd: default-base-is-moof
            let mut tfhd = BytesMut::new();
            tfhd.put_u32(track.track_id);
            traf.extend_from_slice(&full_box(b"tfhd", 0, 0x020000, &tfhd));

            let mut tfdt = BytesMut::new();
            tfdt.put_u64(track.base_decode_time);
            traf.extend_from_slice(&full_box(b"tfdt", 1, 0, &tfdt));

            // trun v1: duration + size + flags + composition offset
            let mut trun = BytesMut::new();
            trun.put_u32(track.samples.len() as u32);
            trun.put_u32(data_offsets[idx]);
            for sample in &track.samples {
                trun.put_u32(sample.duration);
                trun.put_u32(sample.data.len() as u32);
                trun.put_u32(if sample.is_key { 0x0200_0000 } else { 0x0101_0000 });
                trun.put_i32(sample.composition_offset);
            }
            traf.extend_from_slice(&full_box(b"trun", 1, 0x000F01, &trun));

            moof.extend_from_slice(&boxed(b"traf", &traf));
        }

        boxed(b"moof", &moof)
    };

    let zero_offsets = vec![0u32; tracks.len()];
    let moof_probe = build(&zero_offsets);

    // data offsets count from the start of moof
    let mut offsets = Vec::with_capacity(tracks.len());
    let mut running = moof_probe.len() as u32 + 8; // + mdat header
    for track in tracks {
        offsets.push(running);
        running += track
            .samples
            .iter()
            .map(|s| s.data.len() as u32)
            .sum::<u32>();
    }

    let moof = build(&offsets);

    let mut mdat = BytesMut::new();
    for track in tracks {
        for sample in &track.samples {
            mdat.extend_from_slice(&sample.data);
        }
    }

    let mut out = BytesMut::with_capacity(moof.len() + mdat.len() + 8);
    out.extend_from_slice(&moof);
    out.extend_from_slice(&boxed(b"mdat", &mdat));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn walk_boxes(data: &[u8]) -> Vec<(String, usize)> {
        let mut boxes = Vec::new();
        let mut pos = 0;
        while pos + 8 <= data.len() {
            let size =
                u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                    as usize;
            let kind = String::from_utf8_lossy(&data[pos + 4..pos + 8]).to_string();
            boxes.push((kind, size));
            if size < 8 {
                break;
            }
            pos += size;
        }
        boxes
    }

    #[test]
    fn init_has_ftyp_and_moov() {
        let video = VideoInit {
            config: AvcDecoderConfig {
                sps: BytesMut::from(&[0x67, 0x64, 0x00, 0x0C][..]),
                pps: BytesMut::from(&[0x68, 0xEE][..]),
            },
            width: 1280,
            height: 720,
            timescale: 90000,
        };
        let audio = AudioInit {
            config: AudioSpecificConfig {
                object_type: 2,
                sample_rate_index: 4,
                channels: 2,
            },
            timescale: 44100,
        };

        let init = write_init(Some(&video), Some(&audio));
        let boxes = walk_boxes(&init);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].0, "ftyp");
        assert_eq!(boxes[1].0, "moov");
        // box sizes must cover the buffer exactly
        assert_eq!(boxes.iter().map(|(_, s)| s).sum::<usize>(), init.len());
    }

    #[test]
    fn fragment_layout_and_offsets() {
        let fragment = write_fragment(
            7,
            &[TrackFragment {
                track_id: 1,
                base_decode_time: 90000,
                samples: vec![
                    FragmentSample {
                        duration: 3000,
                        composition_offset: 0,
                        is_key: true,
                        data: BytesMut::from(&[0xAA; 10][..]),
                    },
                    FragmentSample {
                        duration: 3000,
                        composition_offset: 3000,
                        is_key: false,
                        data: BytesMut::from(&[0xBB; 5][..]),
                    },
                ],
            }],
        );

        let boxes = walk_boxes(&fragment);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].0, "moof");
        assert_eq!(boxes[1].0, "mdat");
        assert_eq!(boxes[1].1, 8 + 15);

        // the first sample's data offset points at the mdat payload
        let moof_len = boxes[0].1;
        assert_eq!(&fragment[moof_len + 8..moof_len + 8 + 10], &[0xAA; 10]);
    }
}
