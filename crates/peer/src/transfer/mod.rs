//! File transfer state.
//!
//! This module provides:
//! - [`Transfer`]: the observable record of one file moving in either direction
//! - [`TransferEngine`]: the state machine streaming chunks over a data channel
//! - [`storage`]: reading source files and writing received ones

pub mod engine;
pub mod storage;

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::distributions::Alphanumeric;
use rand::Rng;

pub use engine::{EngineSettings, FileSource, OutgoingFile, TransferEngine};

/// Length of the random suffix of a transfer id.
const ID_SUFFIX_LENGTH: usize = 9;

/// Lifecycle of a transfer.
///
/// `pending → transferring ⇄ paused → completed`, with `error` reachable
/// from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Paused,
    Completed,
    Error,
}

impl TransferStatus {
    /// Returns true for `completed` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Error)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Incoming => f.write_str("incoming"),
            TransferDirection::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// Snapshot of one file transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub direction: TransferDirection,
    pub peer_id: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub chunks_done: u32,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    /// Fraction done in `[0, 1]`.
    pub progress: f64,
    /// Bytes per second since the transfer started.
    pub speed: f64,
    pub eta: Option<Duration>,
    pub error: Option<String>,
    pub started_at: Option<Instant>,
    pub use_compression: bool,
}

impl Transfer {
    /// Creates a `pending` transfer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        file_type: impl Into<String>,
        direction: TransferDirection,
        peer_id: impl Into<String>,
        chunk_size: u32,
        use_compression: bool,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            file_size,
            file_type: file_type.into(),
            direction,
            peer_id: peer_id.into(),
            chunk_size,
            total_chunks: protocol::chunk_count(file_size, chunk_size),
            chunks_done: 0,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            progress: 0.0,
            speed: 0.0,
            eta: None,
            error: None,
            started_at: None,
            use_compression,
        }
    }

    /// Moves to `transferring` and starts the clock.
    pub fn start(&mut self, now: Instant) {
        self.status = TransferStatus::Transferring;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Records `chunks_done` chunks covering `bytes` bytes.
    ///
    /// Progress never moves backwards. Speed is measured from the start
    /// time; the ETA is unknown while the speed is zero.
    pub fn record_progress(&mut self, chunks_done: u32, bytes: u64, now: Instant) {
        self.chunks_done = chunks_done.min(self.total_chunks);
        self.bytes_transferred = bytes.min(self.file_size);

        let fraction = if self.total_chunks == 0 {
            1.0
        } else {
            f64::from(self.chunks_done) / f64::from(self.total_chunks)
        };
        self.progress = self.progress.max(fraction).min(1.0);

        let elapsed = self
            .started_at
            .map(|start| now.saturating_duration_since(start).as_secs_f64())
            .unwrap_or(0.0);
        if elapsed > 0.0 {
            self.speed = self.bytes_transferred as f64 / elapsed;
        }

        let remaining = self.file_size.saturating_sub(self.bytes_transferred) as f64;
        self.eta = if self.speed > 0.0 {
            Some(Duration::from_secs_f64(remaining / self.speed))
        } else {
            None
        };
    }

    /// Marks the transfer completed.
    pub fn complete(&mut self) {
        self.status = TransferStatus::Completed;
        self.chunks_done = self.total_chunks;
        self.bytes_transferred = self.file_size;
        self.progress = 1.0;
        self.eta = None;
    }

    /// Moves the transfer to `error` with `message`.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = TransferStatus::Error;
        self.error = Some(message.into());
        self.eta = None;
    }

    /// Returns true if the transfer failed because the connection went away.
    pub fn is_connectivity_error(&self) -> bool {
        self.status == TransferStatus::Error
            && self.error.as_deref().is_some_and(is_connectivity_message)
    }
}

/// Returns true if `message` describes connection loss, a disconnect, a
/// timeout or an unavailable channel.
pub fn is_connectivity_message(message: &str) -> bool {
    const MARKERS: [&str; 5] = ["connection", "disconnect", "timeout", "timed out", "channel"];
    let lower = message.to_lowercase();
    MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Generates a transfer id: millisecond timestamp plus a random suffix.
pub fn generate_transfer_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LENGTH)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{}", millis, suffix)
}
