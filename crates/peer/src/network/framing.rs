//! Fragmentation of long text messages on a WebRTC data channel.
//!
//! webrtc-rs reads every SCTP message into a 65,535-byte buffer and closes
//! the channel when a message does not fit, while a 64 KiB `file-chunk`
//! is roughly 230 KB of JSON. Messages up to [`MAX_FRAGMENT_PAYLOAD`] go
//! out as one text message. Longer ones are split into binary frames:
//!
//! ```text
//! [0]      version (1)
//! [1..5)   total message length, u32 LE
//! [5..9)   offset of this fragment, u32 LE
//! [9..]    payload
//! ```
//!
//! The channel is ordered and reliable and the sender writes one message's
//! frames back to back, so the receiver only tracks one message at a time.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use protocol::error::{ProtocolError, Result};

const FRAME_VERSION: u8 = 1;
const HEADER_LEN: usize = 9;

/// Largest payload carried by a single SCTP message.
pub const MAX_FRAGMENT_PAYLOAD: usize = 60 * 1024;

/// Largest message accepted for reassembly.
pub const MAX_MESSAGE_LEN: usize = 8 * 1024 * 1024;

/// Returns true if `text` is too long to send as one message.
pub fn needs_fragmenting(text: &str) -> bool {
    text.len() > MAX_FRAGMENT_PAYLOAD
}

/// Splits `payload` into binary frames.
pub fn fragment(payload: &[u8]) -> Result<Vec<Bytes>> {
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(ProtocolError::Encode(format!(
            "message of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_MESSAGE_LEN
        )));
    }

    let total = payload.len() as u32;
    let mut frames = Vec::with_capacity(payload.len().div_ceil(MAX_FRAGMENT_PAYLOAD));
    for (i, part) in payload.chunks(MAX_FRAGMENT_PAYLOAD).enumerate() {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + part.len());
        frame.put_u8(FRAME_VERSION);
        frame.put_u32_le(total);
        frame.put_u32_le((i * MAX_FRAGMENT_PAYLOAD) as u32);
        frame.put_slice(part);
        frames.push(frame.freeze());
    }
    Ok(frames)
}

#[derive(Debug)]
struct Partial {
    total: usize,
    buf: Vec<u8>,
}

/// Rebuilds messages from binary frames.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: Option<Partial>,
}

impl Reassembler {
    /// Feeds one frame and returns the message once its last frame arrived.
    ///
    /// A frame out of sequence drops the message in progress.
    pub fn ingest(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>> {
        if frame.len() < HEADER_LEN || frame[0] != FRAME_VERSION {
            self.partial = None;
            return Err(ProtocolError::Malformed(
                "unrecognized fragment header".to_string(),
            ));
        }

        let mut header = &frame[1..HEADER_LEN];
        let total = header.get_u32_le() as usize;
        let offset = header.get_u32_le() as usize;
        let payload = &frame[HEADER_LEN..];

        if total == 0 || total > MAX_MESSAGE_LEN {
            self.partial = None;
            return Err(ProtocolError::Malformed(format!(
                "fragmented message length {} out of range",
                total
            )));
        }

        let mut partial = match self.partial.take() {
            Some(p) if offset > 0 && p.total == total && p.buf.len() == offset => p,
            _ if offset == 0 => Partial {
                total,
                buf: Vec::new(),
            },
            _ => {
                return Err(ProtocolError::Malformed(format!(
                    "fragment at offset {} of {} out of sequence",
                    offset, total
                )))
            }
        };

        if partial.buf.len() + payload.len() > total {
            return Err(ProtocolError::Malformed(format!(
                "fragment overruns message length {}",
                total
            )));
        }
        partial.buf.extend_from_slice(payload);

        if partial.buf.len() == total {
            return Ok(Some(partial.buf));
        }
        self.partial = Some(partial);
        Ok(None)
    }
}
