use std::collections::VecDeque;

/// One partial segment of the low-latency variant.
#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub duration: f64,
    pub independent: bool,
}

/// One addressable media segment held in memory.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub duration: f64,
    pub data: bytes::Bytes,
    pub parts: Vec<Part>,
}

/// Rolling playlist window: at most `segment_count` whole segments plus
/// the parts of the one being filled.
#[derive(Debug)]
pub struct Playlist {
    pub segment_count: usize,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub segments: VecDeque<Segment>,
    /// Parts of the in-progress segment (low-latency only).
    pub open_parts: Vec<Part>,
    pub low_latency: bool,
    pub part_target: f64,
}

impl Playlist {
    pub fn new(segment_count: usize, target_duration: f64, low_latency: bool, part_target: f64) -> Self {
        Self {
            segment_count,
            target_duration,
            media_sequence: 0,
            segments: VecDeque::new(),
            open_parts: Vec::new(),
            low_latency,
            part_target,
        }
    }

    pub fn push_segment(&mut self, segment: Segment) {
        self.segments.push_back(segment);
        self.open_parts.clear();
        while self.segments.len() > self.segment_count {
            self.segments.pop_front();
            self.media_sequence += 1;
        }
    }

    /// Highest media sequence number present, used by `_HLS_msn` blocking.
    pub fn last_msn(&self) -> u64 {
        self.media_sequence + self.segments.len() as u64
    }

    pub fn open_part_count(&self) -> usize {
        self.open_parts.len()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out += "#EXTM3U\r\n";
        out += "#EXT-X-VERSION:";
        out += if self.low_latency { "9" } else { "3" };
        out += "\r\n";
        out += &format!(
            "#EXT-X-TARGETDURATION:{}\r\n",
            self.target_duration.ceil() as u64
        );
        if self.low_latency {
            out += &format!(
                "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK={:.3}\r\n",
                self.part_target * 3.0
            );
            out += &format!("#EXT-X-PART-INF:PART-TARGET={:.3}\r\n", self.part_target);
        }
        out += &format!("#EXT-X-MEDIA-SEQUENCE:{}\r\n", self.media_sequence);
        if self.low_latency {
            out += "#EXT-X-MAP:URI=\"init.mp4\"\r\n";
        }

        for segment in &self.segments {
            for part in &segment.parts {
                out += &format!(
                    "#EXT-X-PART:DURATION={:.3},URI=\"{}\"{}\r\n",
                    part.duration,
                    part.name,
                    if part.independent {
                        ",INDEPENDENT=YES"
                    } else {
                        ""
                    }
                );
            }
            out += &format!("#EXTINF:{:.3},\r\n", segment.duration);
            out += &segment.name;
            out += "\r\n";
        }

        for part in &self.open_parts {
            out += &format!(
                "#EXT-X-PART:DURATION={:.3},URI=\"{}\"{}\r\n",
                part.duration,
                part.name,
                if part.independent {
                    ",INDEPENDENT=YES"
                } else {
                    ""
                }
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(name: &str, duration: f64) -> Segment {
        Segment {
            name: name.to_string(),
            duration,
            data: bytes::Bytes::new(),
            parts: Vec::new(),
        }
    }

    #[test]
    fn rolling_window_discards_old_segments() {
        let mut playlist = Playlist::new(3, 4.0, false, 0.0);
        for i in 0..5 {
            playlist.push_segment(segment(&format!("seg{i}.ts"), 4.0));
        }
        assert_eq!(playlist.segments.len(), 3);
        assert_eq!(playlist.media_sequence, 2);

        let text = playlist.render();
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:2"));
        assert!(!text.contains("seg0.ts"));
        assert!(!text.contains("seg1.ts"));
        assert!(text.contains("seg2.ts"));
        assert!(text.contains("seg4.ts"));
        assert!(text.contains("#EXT-X-TARGETDURATION:4"));
    }

    #[test]
    fn low_latency_playlist_has_parts() {
        let mut playlist = Playlist::new(7, 4.0, true, 0.2);
        playlist.push_segment(Segment {
            name: "seg0.mp4".to_string(),
            duration: 4.0,
            data: bytes::Bytes::new(),
            parts: vec![Part {
                name: "part0.0.mp4".to_string(),
                duration: 0.2,
                independent: true,
            }],
        });
        playlist.open_parts.push(Part {
            name: "part1.0.mp4".to_string(),
            duration: 0.2,
            independent: false,
        });

        let text = playlist.render();
        assert!(text.contains("#EXT-X-MAP:URI=\"init.mp4\""));
        assert!(text.contains("#EXT-X-PART-INF:PART-TARGET=0.200"));
        assert!(text.contains("#EXT-X-PART:DURATION=0.200,URI=\"part0.0.mp4\",INDEPENDENT=YES"));
        assert!(text.contains("#EXT-X-PART:DURATION=0.200,URI=\"part1.0.mp4\""));
        assert!(text.contains("CAN-BLOCK-RELOAD=YES"));
    }

    #[test]
    fn msn_accounting() {
        let mut playlist = Playlist::new(2, 4.0, false, 0.0);
        assert_eq!(playlist.last_msn(), 0);
        playlist.push_segment(segment("a.ts", 4.0));
        playlist.push_segment(segment("b.ts", 4.0));
        playlist.push_segment(segment("c.ts", 4.0));
        // window slid by one
        assert_eq!(playlist.media_sequence, 1);
        assert_eq!(playlist.last_msn(), 3);
    }
}
