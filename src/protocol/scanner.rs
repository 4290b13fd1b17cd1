//! Streaming frame scanner.

use bytes::{Buf, BytesMut};

use super::{frame_length, MavFrame, MAV_STX_V1, MAV_STX_V2, MAX_FRAME_LEN};

/// Scanner counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScannerStats {
    pub frames: u64,
    pub bytes_discarded: u64,
    pub invalid_frames: u64,
}

/// Splits an arbitrary chunked byte stream into validated MAVLink frames.
///
/// Keeps at most one partial frame between calls to [`FrameScanner::push`].
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: BytesMut,
    stats: ScannerStats,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_FRAME_LEN * 2),
            stats: ScannerStats::default(),
        }
    }

    pub fn stats(&self) -> ScannerStats {
        self.stats
    }

    /// Bytes buffered waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk and return every complete, valid frame it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<MavFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            // Resync on the next start marker
            match self.buf.iter().position(|&b| b == MAV_STX_V1 || b == MAV_STX_V2) {
                Some(0) => {}
                Some(skip) => {
                    self.discard(skip);
                }
                None => {
                    let skip = self.buf.len();
                    self.discard(skip);
                    break;
                }
            }

            let Some((len, version)) = frame_length(&self.buf) else {
                break;
            };
            if self.buf.len() < len {
                break;
            }

            let candidate = self.buf.split_to(len).freeze();
            if let Some(frame) = MavFrame::parse(candidate.clone(), version) {
                self.stats.frames += 1;
                frames.push(frame);
            } else {
                // Not a frame after all; the marker byte was payload noise.
                self.stats.invalid_frames += 1;
                let mut rest = BytesMut::from(&candidate[1..]);
                rest.extend_from_slice(&self.buf);
                self.buf = rest;
                self.stats.bytes_discarded += 1;
            }
        }

        frames
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        let len = self.buf.len();
        self.discard(len);
    }

    fn discard(&mut self, count: usize) {
        self.buf.advance(count);
        self.stats.bytes_discarded += count as u64;
    }
}
