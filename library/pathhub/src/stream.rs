use {
    crate::{
        define::{
            CloseReason, CloseSignalSender, FrameData, PacketData, ReaderDataSender, StreamInput,
        },
        formatprocessor::FormatProcessor,
        track::Track,
        utils::HandleId,
    },
    std::{collections::HashMap, sync::Arc},
    tokio::sync::mpsc,
};

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Capacity of every per-reader queue; overflow drops the reader.
    pub read_buffer_count: usize,
    /// Packets above this size are re-packetized.
    pub udp_max_payload_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_buffer_count: 512,
            udp_max_payload_size: 1472,
        }
    }
}

enum StreamEvent {
    ReaderAdd {
        id: HandleId,
        sender: ReaderDataSender,
        close: CloseSignalSender,
    },
    ReaderRemove {
        id: HandleId,
    },
    Close,
}

/// One live stream: created when the path's publisher goes ready,
/// destroyed when it goes not-ready; never survives its publisher.
///
/// All writes funnel through the owning task so the fan-out needs no lock:
/// the publisher pushes into `input`, readers are registered through
/// `events`, and each reader drains its own bounded queue.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    tracks: Arc<Vec<Track>>,
    config: StreamConfig,
    input_tx: mpsc::UnboundedSender<StreamInput>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamHandle {
    pub fn new(tracks: Vec<Track>, config: StreamConfig) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let tracks = Arc::new(tracks);

        let worker = StreamWorker {
            processors: tracks
                .iter()
                .map(|t| FormatProcessor::new(t.clone(), config.udp_max_payload_size))
                .collect(),
            packet_readers: HashMap::new(),
            frame_readers: HashMap::new(),
        };
        tokio::spawn(worker.run(input_rx, event_rx));

        Self {
            tracks,
            config,
            input_tx,
            event_tx,
        }
    }

    pub fn tracks(&self) -> &Arc<Vec<Track>> {
        &self.tracks
    }

    pub fn track(&self, track_id: usize) -> Option<&Track> {
        self.tracks.get(track_id)
    }

    /// Bounded channel pair sized for this stream; the receiver half stays
    /// with the session, the sender half goes into `reader_add`.
    pub fn packet_channel(&self) -> (mpsc::Sender<PacketData>, mpsc::Receiver<PacketData>) {
        mpsc::channel(self.config.read_buffer_count)
    }

    pub fn frame_channel(&self) -> (mpsc::Sender<FrameData>, mpsc::Receiver<FrameData>) {
        mpsc::channel(self.config.read_buffer_count)
    }

    pub fn write(&self, input: StreamInput) {
        if self.input_tx.send(input).is_err() {
            log::debug!("write to a closed stream");
        }
    }

    pub fn reader_add(&self, id: HandleId, sender: ReaderDataSender, close: CloseSignalSender) {
        let _ = self.event_tx.send(StreamEvent::ReaderAdd { id, sender, close });
    }

    pub fn reader_remove(&self, id: HandleId) {
        let _ = self.event_tx.send(StreamEvent::ReaderRemove { id });
    }

    pub fn close(&self) {
        let _ = self.event_tx.send(StreamEvent::Close);
    }
}

struct StreamWorker {
    processors: Vec<FormatProcessor>,
    packet_readers: HashMap<HandleId, (mpsc::Sender<PacketData>, CloseSignalSender)>,
    frame_readers: HashMap<HandleId, (mpsc::Sender<FrameData>, CloseSignalSender)>,
}

impl StreamWorker {
    async fn run(
        mut self,
        mut input_rx: mpsc::UnboundedReceiver<StreamInput>,
        mut event_rx: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        loop {
            tokio::select! {
                input = input_rx.recv() => {
                    match input {
                        Some(input) => self.on_input(input),
                        None => break,
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Some(StreamEvent::ReaderAdd { id, sender, close }) => {
                            match sender {
                                ReaderDataSender::Packet(tx) => {
                                    self.packet_readers.insert(id, (tx, close));
                                }
                                ReaderDataSender::Frame(tx) => {
                                    self.frame_readers.insert(id, (tx, close));
                                }
                            }
                        }
                        Some(StreamEvent::ReaderRemove { id }) => {
                            self.packet_readers.remove(&id);
                            self.frame_readers.remove(&id);
                        }
                        Some(StreamEvent::Close) | None => break,
                    }
                }
            }
        }
    }

    fn on_input(&mut self, input: StreamInput) {
        let want_frames = !self.frame_readers.is_empty();

        let (track_id, result) = match input {
            StreamInput::Rtp { track_id, packet } => {
                let Some(processor) = self.processors.get_mut(track_id) else {
                    log::warn!("rtp packet for unknown track {}", track_id);
                    return;
                };
                (track_id, processor.process_rtp(packet, want_frames))
            }
            StreamInput::Frame {
                track_id,
                timestamp,
                units,
            } => {
                let Some(processor) = self.processors.get_mut(track_id) else {
                    log::warn!("frame for unknown track {}", track_id);
                    return;
                };
                (track_id, processor.process_units(timestamp, units))
            }
        };

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                // malformed input drops the datum, never the stream
                log::warn!("unable to process track {} data: {}", track_id, err);
                return;
            }
        };

        if !self.packet_readers.is_empty() {
            for packet in output.packets {
                let data = PacketData { track_id, packet };
                Self::fan_out(&mut self.packet_readers, &data, |tx, d| {
                    tx.try_send(d.clone())
                });
            }
        }

        if let Some(frame) = output.frame {
            Self::fan_out(&mut self.frame_readers, &frame, |tx, d| {
                tx.try_send(d.clone())
            });
        }
    }

    /// Non-blocking broadcast: a full queue means the reader cannot keep
    /// up, so the reader is dropped instead of stalling the publisher.
    fn fan_out<T>(
        readers: &mut HashMap<HandleId, (mpsc::Sender<T>, CloseSignalSender)>,
        data: &T,
        send: impl Fn(&mpsc::Sender<T>, &T) -> Result<(), mpsc::error::TrySendError<T>>,
    ) {
        let mut dropped: Vec<HandleId> = Vec::new();

        for (id, (tx, close)) in readers.iter() {
            match send(tx, data) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("reader {:x} queue is full, closing it", id);
                    let _ = close.send(CloseReason::QueueFull);
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*id);
                }
            }
        }

        for id in dropped {
            readers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::define::close_signal;
    use crate::track::{MediaKind, TrackParams};
    use bytes::BytesMut;
    use rtp::{RtpHeader, RtpPacket};

    fn h264_stream(read_buffer_count: usize) -> StreamHandle {
        let track = Track::new(
            0,
            MediaKind::Video,
            96,
            90000,
            TrackParams::H264 {
                sps: BytesMut::from(&[0x67, 0x64, 0x00, 0x0C][..]),
                pps: BytesMut::from(&[0x68, 0xEE, 0x3C, 0x80][..]),
            },
        );
        StreamHandle::new(
            vec![track],
            StreamConfig {
                read_buffer_count,
                udp_max_payload_size: 1472,
            },
        )
    }

    fn test_packet(seq: u16) -> RtpPacket {
        let mut pkt = RtpPacket::new(RtpHeader {
            version: 2,
            marker: true,
            payload_type: 96,
            seq_number: seq,
            timestamp: 345234345,
            ssrc: 978651231,
            ..Default::default()
        });
        pkt.payload.extend_from_slice(&[0x65, 0x01, 0x02, 0x03, 0x04]);
        pkt
    }

    #[tokio::test]
    async fn rtsp_readers_get_identical_packets() {
        let stream = h264_stream(16);
        let (tx, mut rx) = stream.packet_channel();
        let (close_tx, _close_rx) = close_signal();
        stream.reader_add(1, ReaderDataSender::Packet(tx), close_tx);

        // let the worker register the reader before writing
        tokio::task::yield_now().await;

        let pkt = test_packet(57899);
        stream.write(StreamInput::Rtp {
            track_id: 0,
            packet: pkt.clone(),
        });

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.track_id, 0);
        assert_eq!(got.packet.header.ssrc, pkt.header.ssrc);
        assert_eq!(got.packet.header.seq_number, pkt.header.seq_number);
        assert_eq!(got.packet.payload, pkt.payload);
    }

    #[tokio::test]
    async fn slow_reader_is_dropped_with_queue_full() {
        let stream = h264_stream(1);
        let (tx, _rx) = stream.packet_channel();
        let (close_tx, mut close_rx) = close_signal();
        stream.reader_add(7, ReaderDataSender::Packet(tx), close_tx);
        tokio::task::yield_now().await;

        // never drained: second write overflows the capacity-1 queue
        for seq in 0..3u16 {
            stream.write(StreamInput::Rtp {
                track_id: 0,
                packet: test_packet(seq),
            });
        }

        let reason = tokio::time::timeout(std::time::Duration::from_secs(1), close_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::QueueFull);
    }

    #[tokio::test]
    async fn frame_readers_receive_access_units() {
        let stream = h264_stream(16);
        let (tx, mut rx) = stream.frame_channel();
        let (close_tx, _close_rx) = close_signal();
        stream.reader_add(2, ReaderDataSender::Frame(tx), close_tx);
        tokio::task::yield_now().await;

        stream.write(StreamInput::Frame {
            track_id: 0,
            timestamp: 9000,
            units: vec![BytesMut::from(&[0x65, 0xAA][..])],
        });

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            FrameData::Video {
                timestamp,
                key_frame,
                nalus,
                ..
            } => {
                assert_eq!(timestamp, 9000);
                assert!(key_frame);
                // SPS + PPS prepended before the IDR
                assert_eq!(nalus.len(), 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
