//! Telemetry log replay.
//!
//! A log is a sequence of records, each an 8-byte big-endian timestamp in
//! microseconds followed by exactly one MAVLink frame. Frames are released
//! with their recorded spacing scaled by the playback speed. Replay links
//! are read-only.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::Transport;
use crate::error::{Error, Result, TransportError};
use crate::protocol::frame_length;

const TIMESTAMP_LEN: usize = 8;

/// Slowest accepted playback speed.
pub const MIN_PLAYBACK_SPEED: f64 = 0.01;
/// Fastest accepted playback speed.
pub const MAX_PLAYBACK_SPEED: f64 = 1000.0;

/// Log replay parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogReplayConfig {
    /// Path to the recorded log.
    pub path: PathBuf,
    /// Playback speed multiplier (2.0 plays twice as fast).
    #[serde(default = "default_playback_speed")]
    pub playback_speed: f64,
}

fn default_playback_speed() -> f64 {
    1.0
}

impl LogReplayConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            playback_speed: default_playback_speed(),
        }
    }

    /// Check the playback speed is within
    /// [`MIN_PLAYBACK_SPEED`, `MAX_PLAYBACK_SPEED`].
    pub fn validate(&self) -> Result<()> {
        if (MIN_PLAYBACK_SPEED..=MAX_PLAYBACK_SPEED).contains(&self.playback_speed) {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!(
                "playback_speed must be between {MIN_PLAYBACK_SPEED} and {MAX_PLAYBACK_SPEED}, got {}",
                self.playback_speed
            )))
        }
    }
}

/// Encode one log record.
pub fn encode_record(timestamp_us: u64, frame: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(TIMESTAMP_LEN + frame.len());
    record.extend_from_slice(&timestamp_us.to_be_bytes());
    record.extend_from_slice(frame);
    record
}

struct PendingFrame {
    due: Instant,
    frame: Bytes,
}

/// Read-only transport that plays back a recorded log.
pub struct LogReplayTransport {
    path: PathBuf,
    data: Bytes,
    speed: f64,
    started: Instant,
    first_timestamp: Option<u64>,
    pending: Option<PendingFrame>,
    frames_played: u64,
}

impl LogReplayTransport {
    /// Load the log into memory.
    pub async fn open(config: &LogReplayConfig) -> Result<Self> {
        config.validate()?;

        let data = tokio::fs::read(&config.path).await.map_err(|e| {
            TransportError::Replay(format!("{}: {e}", config.path.display()))
        })?;

        tracing::info!(
            path = %config.path.display(),
            bytes = data.len(),
            speed = config.playback_speed,
            "Opened telemetry log"
        );

        Ok(Self {
            path: config.path.clone(),
            data: Bytes::from(data),
            speed: config.playback_speed,
            started: Instant::now(),
            first_timestamp: None,
            pending: None,
            frames_played: 0,
        })
    }

    pub fn frames_played(&self) -> u64 {
        self.frames_played
    }

    fn next_record(&mut self) -> Result<Option<PendingFrame>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        if self.data.len() < TIMESTAMP_LEN {
            return Err(self.malformed("truncated timestamp"));
        }

        let timestamp = (&self.data[..TIMESTAMP_LEN]).get_u64();
        let (len, _) = frame_length(&self.data[TIMESTAMP_LEN..])
            .ok_or_else(|| self.malformed("record does not start with a frame"))?;
        if self.data.len() < TIMESTAMP_LEN + len {
            return Err(self.malformed("truncated frame"));
        }

        self.data.advance(TIMESTAMP_LEN);
        let frame = self.data.split_to(len);

        let first = *self.first_timestamp.get_or_insert(timestamp);
        let recorded = Duration::from_micros(timestamp.saturating_sub(first));
        let due = Duration::try_from_secs_f64(recorded.as_secs_f64() / self.speed)
            .ok()
            .and_then(|offset| self.started.checked_add(offset))
            .ok_or_else(|| self.malformed("timestamp out of range"))?;

        Ok(Some(PendingFrame { due, frame }))
    }

    fn malformed(&self, what: &str) -> Error {
        TransportError::Replay(format!(
            "{}: {what} after {} frame(s)",
            self.path.display(),
            self.frames_played
        ))
        .into()
    }
}

#[async_trait]
impl Transport for LogReplayTransport {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.pending.is_none() {
            self.pending = self.next_record()?;
        }
        let Some(due) = self.pending.as_ref().map(|p| p.due) else {
            tracing::debug!(path = %self.path.display(), frames = self.frames_played, "Log replay finished");
            return Ok(None);
        };

        // The frame stays pending until the sleep completes.
        tokio::time::sleep_until(due).await;

        match self.pending.take() {
            Some(pending) => {
                self.frames_played += 1;
                Ok(Some(pending.frame))
            }
            None => Ok(None),
        }
    }

    async fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Ok(0)
    }

    async fn close(&mut self) -> Result<()> {
        self.pending = None;
        self.data.clear();
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "log_replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_heartbeat;
    use std::io::Write;

    fn write_log(records: &[(u64, Vec<u8>)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (ts, frame) in records {
            file.write_all(&encode_record(*ts, frame)).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_plays_frames_in_order() {
        let first = encode_heartbeat(1, 0).unwrap();
        let second = encode_heartbeat(1, 1).unwrap();
        let file = write_log(&[(1_000, first.clone()), (1_500, second.clone())]);

        let mut replay = LogReplayTransport::open(&LogReplayConfig::new(file.path()))
            .await
            .unwrap();

        assert_eq!(&replay.read_chunk().await.unwrap().unwrap()[..], &first[..]);
        assert_eq!(&replay.read_chunk().await.unwrap().unwrap()[..], &second[..]);
        assert!(replay.read_chunk().await.unwrap().is_none());
        assert_eq!(replay.frames_played(), 2);
        assert_eq!(replay.write(b"ignored").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_recorded_spacing() {
        let file = write_log(&[
            (0, encode_heartbeat(1, 0).unwrap()),
            (2_000_000, encode_heartbeat(1, 1).unwrap()),
        ]);
        let mut config = LogReplayConfig::new(file.path());
        config.playback_speed = 2.0;
        let mut replay = LogReplayTransport::open(&config).await.unwrap();

        let start = Instant::now();
        replay.read_chunk().await.unwrap().unwrap();
        replay.read_chunk().await.unwrap().unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_truncated_log_is_an_error() {
        let mut record = encode_record(0, &encode_heartbeat(1, 0).unwrap());
        record.truncate(record.len() - 3);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&record).unwrap();

        let mut replay = LogReplayTransport::open(&LogReplayConfig::new(file.path()))
            .await
            .unwrap();
        let err = replay.read_chunk().await.unwrap_err();
        assert!(err.to_string().contains("truncated frame"));
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let config = LogReplayConfig::new("/nonexistent/flight.tlog");
        assert!(LogReplayTransport::open(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_zero_speed() {
        let file = write_log(&[]);
        let mut config = LogReplayConfig::new(file.path());
        config.playback_speed = 0.0;
        assert!(matches!(
            LogReplayTransport::open(&config).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_extreme_speed() {
        let file = write_log(&[]);
        for speed in [1e-300, 1e300, f64::INFINITY, f64::NAN] {
            let mut config = LogReplayConfig::new(file.path());
            config.playback_speed = speed;
            assert!(
                matches!(LogReplayTransport::open(&config).await, Err(Error::InvalidConfig(_))),
                "speed {speed} accepted"
            );
        }

        let mut config = LogReplayConfig::new(file.path());
        config.playback_speed = MAX_PLAYBACK_SPEED;
        assert!(LogReplayTransport::open(&config).await.is_ok());
    }
}
