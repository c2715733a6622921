//! Wire format of the exchange relay.
//!
//! Every message is one frame: a big-endian `u32` byte length followed by a
//! bincode-encoded [`Request`] or [`Response`]. Each request gets exactly one
//! response on the same connection.
//!
//! ```text
//! worker  ── PushSamples(batch) ──────────────> relay ── Ack
//! trainer ── PullSamples { max } ─────────────> relay ── Samples(batch)
//! trainer ── PushWeights(snapshot) ───────────> relay ── WeightsAck { installed, version }
//! worker  ── PullWeights { known_version } ───> relay ── Weights(Some | None)
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

use crate::core::transition::Transition;
use crate::core::weight_slot::WeightSnapshot;

/// Client to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Worker delivers a batch of transitions.
    PushSamples(Vec<Transition>),
    /// Trainer takes up to `max` pending transitions.
    PullSamples { max: usize },
    /// Trainer publishes a whole actor snapshot.
    PushWeights(WeightSnapshot),
    /// Worker asks for a snapshot newer than the one it has.
    PullWeights { known_version: u64 },
}

/// Relay to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Number of transitions stored.
    Ack { accepted: usize },
    /// Whether a pushed snapshot was installed, and the version the relay
    /// holds afterwards.
    WeightsAck { installed: bool, version: u64 },
    Samples(Vec<Transition>),
    /// `None` when the caller is already up to date.
    Weights(Option<WeightSnapshot>),
    /// The relay could not serve the request.
    Error(String),
}

/// Transport failure.
#[derive(Debug)]
pub enum ExchangeError {
    Io(io::Error),
    /// bincode encode/decode failure.
    Codec(String),
    /// A frame exceeds the configured limit.
    FrameTooLarge { size: usize, max: usize },
    /// The peer answered with something that does not match the request.
    Protocol(String),
    /// The peer closed the connection.
    Disconnected,
    /// Shutdown was requested while waiting to retry.
    Cancelled,
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeError::Io(e) => write!(f, "IO error: {}", e),
            ExchangeError::Codec(e) => write!(f, "Codec error: {}", e),
            ExchangeError::FrameTooLarge { size, max } => {
                write!(f, "Frame of {} bytes exceeds limit of {} bytes", size, max)
            }
            ExchangeError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ExchangeError::Disconnected => write!(f, "Peer disconnected"),
            ExchangeError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl From<io::Error> for ExchangeError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ExchangeError::Disconnected,
            _ => ExchangeError::Io(e),
        }
    }
}

impl From<bincode::Error> for ExchangeError {
    fn from(e: bincode::Error) -> Self {
        ExchangeError::Codec(e.to_string())
    }
}

/// True for the error kinds a socket read timeout produces.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Encode and write one frame.
pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
    max_frame_bytes: usize,
) -> Result<(), ExchangeError> {
    let body = bincode::serialize(message)?;
    if body.len() > max_frame_bytes || body.len() > u32::MAX as usize {
        return Err(ExchangeError::FrameTooLarge {
            size: body.len(),
            max: max_frame_bytes,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read a frame's length prefix.
///
/// Returns `Ok(None)` when the read times out before the first byte arrives,
/// so a serving loop can check for shutdown between requests. Once a byte has
/// arrived the prefix is read to completion.
pub fn read_frame_len<R: Read>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<usize>, ExchangeError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) => return Err(ExchangeError::Disconnected),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_timeout(&e) && filled == 0 => return Ok(None),
            Err(e) if is_timeout(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_bytes {
        return Err(ExchangeError::FrameTooLarge {
            size: len,
            max: max_frame_bytes,
        });
    }
    Ok(Some(len))
}

/// Read and decode a frame body of `len` bytes.
pub fn read_frame_body<R: Read, T: DeserializeOwned>(reader: &mut R, len: usize) -> Result<T, ExchangeError> {
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(bincode::deserialize(&body)?)
}

/// Read one whole frame, blocking (subject to the reader's own timeout).
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R, max_frame_bytes: usize) -> Result<T, ExchangeError> {
    match read_frame_len(reader, max_frame_bytes)? {
        Some(len) => read_frame_body(reader, len),
        None => Err(ExchangeError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out waiting for a frame",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observation::Observation;
    use std::io::Cursor;

    fn transition(r: f32) -> Transition {
        Transition::new(
            Observation::vector(vec![r, 0.0]),
            vec![0.5],
            r,
            Observation::vector(vec![r, 1.0]),
            r > 1.0,
        )
    }

    #[test]
    fn test_request_frame_round_trip() {
        let request = Request::PushSamples(vec![transition(0.5), transition(2.0)]);
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &request, 1 << 20).unwrap();

        let decoded: Request = read_frame(&mut Cursor::new(buffer), 1 << 20).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &Response::Ack { accepted: 3 }, 1024).unwrap();
        write_frame(&mut buffer, &Response::Weights(None), 1024).unwrap();

        let mut cursor = Cursor::new(buffer);
        let first: Response = read_frame(&mut cursor, 1024).unwrap();
        let second: Response = read_frame(&mut cursor, 1024).unwrap();
        assert_eq!(first, Response::Ack { accepted: 3 });
        assert_eq!(second, Response::Weights(None));
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let request = Request::PushWeights(WeightSnapshot {
            version: 1,
            actor: vec![0u8; 100],
        });
        let mut buffer = Vec::new();
        assert!(matches!(
            write_frame(&mut buffer, &request, 16),
            Err(ExchangeError::FrameTooLarge { max: 16, .. })
        ));

        // a hostile length prefix is refused before allocating
        let mut cursor = Cursor::new(u32::MAX.to_be_bytes().to_vec());
        assert!(matches!(
            read_frame::<_, Request>(&mut cursor, 1024),
            Err(ExchangeError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_truncated_stream_is_disconnect() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &Request::PullSamples { max: 10 }, 1024).unwrap();
        buffer.truncate(buffer.len() - 1);
        assert!(matches!(
            read_frame::<_, Request>(&mut Cursor::new(buffer), 1024),
            Err(ExchangeError::Disconnected)
        ));

        assert!(matches!(
            read_frame::<_, Request>(&mut Cursor::new(Vec::new()), 1024),
            Err(ExchangeError::Disconnected)
        ));
    }

    #[test]
    fn test_garbage_body_is_codec_error() {
        let mut buffer = 3u32.to_be_bytes().to_vec();
        buffer.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(
            read_frame::<_, Request>(&mut Cursor::new(buffer), 1024),
            Err(ExchangeError::Codec(_))
        ));
    }
}
