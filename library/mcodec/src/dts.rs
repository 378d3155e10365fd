/// DTS estimation for streams that only carry PTS (H.264 over RTP).
///
/// MPEG-TS requires a monotonic DTS; with B-frames the PTS sequence reorders,
/// so the estimator keeps a lower bound that never decreases and never
/// overtakes the presentation time.
#[derive(Debug, Default)]
pub struct DtsEstimator {
    initialized: bool,
    prev_dts: i64,
    prev_pts: i64,
    reordered: bool,
}

impl DtsEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next frame's PTS (and whether it is a random-access point)
    /// and get the estimated DTS.
    pub fn feed(&mut self, pts: i64, is_key: bool) -> i64 {
        if !self.initialized {
            self.initialized = true;
            self.prev_pts = pts;
            self.prev_dts = pts;
            return pts;
        }

        // a PTS going backwards reveals B-frame reordering; from then on
        // DTS trails PTS by one frame interval
        if pts < self.prev_pts {
            self.reordered = true;
        }

        let dts = if !self.reordered {
            pts
        } else if is_key {
            // key frames reset the reorder window: step forward but stay
            // behind the new PTS
            (self.prev_dts + 1).min(pts)
        } else {
            let interval = (pts - self.prev_pts).abs().max(1);
            (self.prev_dts + interval).min(pts)
        };

        // monotonic lower bound, DTS <= PTS
        let dts = dts.max(self.prev_dts).min(pts.max(self.prev_dts));

        self.prev_pts = pts;
        self.prev_dts = dts;
        dts
    }
}

#[cfg(test)]
mod tests {
    use super::DtsEstimator;

    #[test]
    fn monotonic_input_passes_through() {
        let mut est = DtsEstimator::new();
        assert_eq!(est.feed(0, true), 0);
        assert_eq!(est.feed(3000, false), 3000);
        assert_eq!(est.feed(6000, false), 6000);
    }

    #[test]
    fn reordered_input_keeps_dts_monotonic() {
        let mut est = DtsEstimator::new();
        let mut prev = est.feed(0, true);
        for &pts in &[6000i64, 3000, 12000, 9000, 18000, 15000] {
            let dts = est.feed(pts, false);
            assert!(dts >= prev, "dts went backwards: {dts} < {prev}");
            assert!(dts <= pts.max(prev), "dts overtook pts");
            prev = dts;
        }
    }
}
