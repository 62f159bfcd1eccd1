//! Wire framing shared by the server and the client.
//!
//! Strings travel as a 2-byte big-endian length followed by that many UTF-8
//! bytes. Lengths are 8-byte big-endian integers. File payloads are raw spans
//! whose size was sent as a length just before them, moved in bounded chunks.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the intermediate buffer used when streaming raw spans.
pub const CHUNK_SIZE: usize = 4 * 1024;

/// Largest string a single frame can carry.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream cleanly between frames.
    #[error("connection closed")]
    Closed,
    /// The peer closed the stream part way through a frame or a span.
    #[error("connection closed mid-frame")]
    Truncated,
    #[error("string frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("string of {0} bytes does not fit in a frame")]
    TooLong(usize),
    #[error(transparent)]
    Io(io::Error),
}

impl FrameError {
    /// Whether the error means the peer went away rather than sent garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Closed | FrameError::Truncated => true,
            FrameError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            FrameError::InvalidUtf8(_) | FrameError::TooLong(_) => false,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(err)
        }
    }
}

pub async fn write_string<W>(writer: &mut W, value: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = value.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(FrameError::TooLong(bytes.len()));
    }

    let mut encoded = Vec::with_capacity(2 + bytes.len());
    encoded.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    encoded.extend_from_slice(bytes);
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one string frame.
///
/// End of stream before the first byte of the frame is reported as
/// [`FrameError::Closed`]; anywhere later it is [`FrameError::Truncated`].
pub async fn read_string<R>(reader: &mut R) -> Result<String, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    if reader.read(&mut prefix[..1]).await? == 0 {
        return Err(FrameError::Closed);
    }
    reader.read_exact(&mut prefix[1..]).await?;

    let mut buf = vec![0u8; u16::from_be_bytes(prefix) as usize];
    reader.read_exact(&mut buf).await?;
    Ok(String::from_utf8(buf)?)
}

pub async fn write_length<W>(writer: &mut W, len: u64) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u64(len).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_length<R>(reader: &mut R) -> Result<u64, FrameError>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_u64().await?)
}

/// Reads the next piece of a raw span into `buf`, never past `remaining`.
///
/// Returns the number of bytes read, which is always at least one.
pub async fn read_chunk<R>(reader: &mut R, buf: &mut [u8], remaining: u64) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
    let read = reader.read(&mut buf[..want]).await?;
    if read == 0 && want > 0 {
        return Err(FrameError::Truncated);
    }
    Ok(read)
}

/// Sends exactly `len` bytes taken from `source`.
///
/// A source that runs dry early fails with [`FrameError::Truncated`]; the
/// peer is then owed bytes and the stream can no longer be trusted.
pub async fn write_bytes<W, R>(writer: &mut W, source: &mut R, len: u64) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let read = read_chunk(source, &mut buf, remaining).await?;
        writer.write_all(&buf[..read]).await?;
        remaining -= read as u64;
    }
    writer.flush().await?;
    Ok(())
}

/// Reads exactly `len` bytes from `reader` into `sink`.
pub async fn read_bytes<R, W>(reader: &mut R, sink: &mut W, len: u64) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    receive_bytes(reader, sink, len).await?.map_err(FrameError::Io)
}

/// Consumes exactly `len` bytes from `reader`, copying them into `sink`.
///
/// The outer result reports the stream; the inner one reports the sink. Once
/// the sink fails the rest of the span is still read and discarded, so the
/// next frame on `reader` starts where the peer expects it to.
pub async fn receive_bytes<R, W>(
    reader: &mut R,
    sink: &mut W,
    len: u64,
) -> Result<io::Result<()>, FrameError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = len;
    let mut sink_result = Ok(());

    while remaining > 0 {
        let read = read_chunk(reader, &mut buf, remaining).await?;
        if sink_result.is_ok() {
            sink_result = sink.write_all(&buf[..read]).await;
        }
        remaining -= read as u64;
    }

    if sink_result.is_ok() {
        sink_result = sink.flush().await;
    }
    Ok(sink_result)
}

/// Reads and drops exactly `len` bytes.
pub async fn discard_bytes<R>(reader: &mut R, len: u64) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    read_bytes(reader, &mut tokio::io::sink(), len).await
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use super::*;

    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("disk full")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn strings_use_two_byte_big_endian_prefix() {
        let mut encoded = Vec::new();
        write_string(&mut encoded, "DIR").await.expect("write");
        assert_eq!(encoded, [0, 3, b'D', b'I', b'R']);

        let mut reader = encoded.as_slice();
        assert_eq!(read_string(&mut reader).await.expect("read"), "DIR");
    }

    #[tokio::test]
    async fn frames_survive_a_pipe_with_a_tiny_buffer() {
        let (mut writer, mut reader) = tokio::io::duplex(3);
        let send = tokio::spawn(async move {
            write_string(&mut writer, "héllo wörld").await.expect("write string");
            write_length(&mut writer, 9_000).await.expect("write length");
        });

        assert_eq!(read_string(&mut reader).await.expect("string"), "héllo wörld");
        assert_eq!(read_length(&mut reader).await.expect("length"), 9_000);
        send.await.expect("sender task");
    }

    #[tokio::test]
    async fn clean_close_differs_from_truncation() {
        let mut empty: &[u8] = &[];
        assert!(matches!(read_string(&mut empty).await, Err(FrameError::Closed)));

        let mut partial: &[u8] = &[0, 5, b'a', b'b'];
        assert!(matches!(read_string(&mut partial).await, Err(FrameError::Truncated)));

        let mut half_length: &[u8] = &[0, 0, 0, 1];
        assert!(matches!(read_length(&mut half_length).await, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn rejects_invalid_utf8_and_oversized_strings() {
        let mut invalid: &[u8] = &[0, 2, 0xff, 0xfe];
        assert!(matches!(read_string(&mut invalid).await, Err(FrameError::InvalidUtf8(_))));

        let huge = "x".repeat(MAX_STRING_LEN + 1);
        let mut out = Vec::new();
        assert!(matches!(write_string(&mut out, &huge).await, Err(FrameError::TooLong(_))));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn raw_spans_move_exact_byte_counts() {
        for len in [0usize, 1, CHUNK_SIZE, CHUNK_SIZE + 1, 5 * CHUNK_SIZE + 123] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut wire = Vec::new();
            write_bytes(&mut wire, &mut payload.as_slice(), len as u64)
                .await
                .expect("write bytes");
            write_string(&mut wire, "NEXT").await.expect("trailer");

            let mut reader = wire.as_slice();
            let mut received = Vec::new();
            read_bytes(&mut reader, &mut received, len as u64)
                .await
                .expect("read bytes");
            assert_eq!(received, payload, "payload of {len} bytes");
            assert_eq!(read_string(&mut reader).await.expect("trailer"), "NEXT");
        }
    }

    #[tokio::test]
    async fn short_source_is_truncation() {
        let mut wire = Vec::new();
        let result = write_bytes(&mut wire, &mut &b"abc"[..], 10).await;
        assert!(matches!(result, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn failing_sink_still_consumes_the_whole_span() {
        let mut wire = vec![7u8; 3 * CHUNK_SIZE];
        write_string(&mut wire, "DIR").await.expect("trailer");

        let mut reader = wire.as_slice();
        let sink_result = receive_bytes(&mut reader, &mut BrokenSink, 3 * CHUNK_SIZE as u64)
            .await
            .expect("stream stays healthy");
        assert!(sink_result.is_err());
        assert_eq!(read_string(&mut reader).await.expect("aligned"), "DIR");
    }

    #[tokio::test]
    async fn discard_skips_payload() {
        let mut wire = vec![1u8; 10];
        write_string(&mut wire, "GET").await.expect("trailer");
        let mut reader = wire.as_slice();
        discard_bytes(&mut reader, 10).await.expect("discard");
        assert_eq!(read_string(&mut reader).await.expect("next"), "GET");
    }
}
