//! Length-framed messages.
//!
//! Each frame is an 8-digit decimal length and a newline, followed by
//! exactly that many payload bytes, the last of which is a NUL.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum accepted payload size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Per-read/write timeout on the server side.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Malformed frame header {0:?}")]
    BadHeader(String),
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Message is not NUL terminated")]
    Unterminated,
}

/// Encode a payload into a complete frame, appending the trailing NUL.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = payload.len() + 1;
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + len);
    frame.extend_from_slice(format!("{:08}\n", len).as_bytes());
    frame.extend_from_slice(payload);
    frame.push(0);
    Ok(frame)
}

/// Decode a frame header into the payload length.
pub fn decode_header(header: &[u8; FRAME_HEADER_SIZE]) -> Result<usize, WireError> {
    let bad = || WireError::BadHeader(String::from_utf8_lossy(header).into_owned());
    if header[8] != b'\n' || !header[..8].iter().all(u8::is_ascii_digit) {
        return Err(bad());
    }
    let digits = std::str::from_utf8(&header[..8]).map_err(|_| bad())?;
    let len: usize = digits.parse().map_err(|_| bad())?;
    if len == 0 {
        return Err(bad());
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(len)
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, WireError> {
    timeout(limit, fut)
        .await
        .map_err(|_| WireError::Timeout(limit))?
        .map_err(WireError::from)
}

/// Read one frame and return its payload without the trailing NUL.
pub async fn read_frame<R>(stream: &mut R, limit: Duration) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    with_timeout(limit, stream.read_exact(&mut header)).await?;
    let len = decode_header(&header)?;

    let mut payload = vec![0u8; len];
    with_timeout(limit, stream.read_exact(&mut payload)).await?;
    if payload.pop() != Some(0) {
        return Err(WireError::Unterminated);
    }
    Ok(payload)
}

/// Write one frame carrying `payload`.
pub async fn write_frame<W>(
    stream: &mut W,
    payload: &[u8],
    limit: Duration,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    with_timeout(limit, stream.write_all(&frame)).await?;
    with_timeout(limit, stream.flush()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(b"NONSTOP_1:SHOW_CONFIG").unwrap();
        assert_eq!(&frame[..9], b"00000022\n");
        assert_eq!(frame.last(), Some(&0));
        assert_eq!(frame.len(), 9 + 22);
    }

    #[test]
    fn test_decode_header() {
        assert_eq!(decode_header(b"00000022\n").unwrap(), 22);
        assert!(matches!(
            decode_header(b"0000002x\n"),
            Err(WireError::BadHeader(_))
        ));
        assert!(matches!(
            decode_header(b"00000022 "),
            Err(WireError::BadHeader(_))
        ));
        assert!(matches!(
            decode_header(b"99999999\n"),
            Err(WireError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"hello", IO_TIMEOUT).await.unwrap();
        let payload = read_frame(&mut b, IO_TIMEOUT).await.unwrap();
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn test_read_frame_times_out() {
        let (_a, mut b) = tokio::io::duplex(64);
        let err = read_frame(&mut b, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_read_frame_unterminated() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"00000003\nabc").await.unwrap();
        assert!(matches!(
            read_frame(&mut b, IO_TIMEOUT).await,
            Err(WireError::Unterminated)
        ));
    }
}
